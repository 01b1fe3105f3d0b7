//! Command-line surface.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use crate::config::{BridgeDirectory, Config, NodeDirectory};
use crate::engine::{BridgeStatus, Engine, JobFilter, Selection, SortKey};
use crate::error::Result;
use crate::node::{NodeApi, NodeClient};
use crate::notify::Dispatcher;
use crate::report::{Outcome, PassReport};
use crate::scheduler::Scheduler;
use crate::types::{BridgeTerms, Job, Mode, Node};

/// Keeps oracle node jobs and bridges in their desired state
#[derive(Debug, Parser)]
#[command(name = "jobkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Extra configuration file (TOML or JSON)
    #[arg(long, global = true, env = "JOBKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node directory; overrides `hosts_file`
    #[arg(long, global = true)]
    pub hosts: Option<PathBuf>,

    /// Bridge group directory; overrides `bridges_file`
    #[arg(long, global = true)]
    pub bridges: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one approve pass over every configured node
    Run(TickArgs),

    /// Run an approve pass over every node at each quarter hour
    Daemon(TickArgs),

    /// List job proposals on one node
    List(ListArgs),

    /// Cancel matched jobs on one node
    Cancel(SelectArgs),

    /// Force-approve matched jobs on one node
    Reapprove(SelectArgs),

    /// Inspect and manage bridges
    #[command(subcommand)]
    Bridge(BridgeCommand),
}

#[derive(Debug, Args)]
pub struct TickArgs {
    /// Approve jobs instead of only reporting them
    #[arg(long)]
    pub execute: bool,

    /// Send events to the log only
    #[arg(long)]
    pub suppress_notifications: bool,
}

#[derive(Debug, Clone, Args)]
pub struct Target {
    /// Service name, e.g. `ocr`
    pub service: String,
    /// Network name, e.g. `ethereum`
    pub network: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub target: Target,

    /// Only jobs with this status (case-insensitive)
    #[arg(long)]
    pub status: Option<String>,

    /// Only jobs with a pending update
    #[arg(long)]
    pub updates: bool,

    #[arg(long, value_enum, default_value_t = SortKey::Name)]
    pub sort: SortKey,

    #[arg(long)]
    pub reverse: bool,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Write the output to a file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SelectArgs {
    #[command(flatten)]
    pub target: Target,

    /// Identifier file: one address or name pattern per line
    #[arg(long, short)]
    pub file: Option<PathBuf>,

    /// Name substring to match
    #[arg(long, short)]
    pub name: Option<String>,

    /// Exact job id
    #[arg(long)]
    pub job_id: Option<String>,

    #[arg(long)]
    pub execute: bool,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    pub format: Format,
}

#[derive(Debug, Subcommand)]
pub enum BridgeCommand {
    /// Show bridges on a node and how they differ from its groups
    List(BridgeGroupArgs),

    /// Create a bridge, or repoint an existing one
    Create(BridgeCreateArgs),

    /// Delete one bridge
    Delete(BridgeDeleteArgs),

    /// Create missing and repoint drifted bridges
    Batch(BridgeGroupArgs),

    /// Delete bridges not required by the node's groups
    BatchDelete(BridgeGroupArgs),
}

#[derive(Debug, Args)]
pub struct BridgeGroupArgs {
    #[command(flatten)]
    pub target: Target,

    /// Bridge groups to resolve instead of the node's configured groups
    #[arg(long = "group", short)]
    pub groups: Vec<String>,

    #[arg(long)]
    pub execute: bool,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    pub format: Format,
}

#[derive(Debug, Args)]
pub struct BridgeCreateArgs {
    #[command(flatten)]
    pub target: Target,
    pub name: String,
    pub url: String,

    /// Minimum contract payment
    #[arg(long, default_value = "0")]
    pub payment: String,

    #[arg(long, default_value_t = 0)]
    pub confirmations: u32,

    #[arg(long)]
    pub execute: bool,
}

impl BridgeCreateArgs {
    fn terms(&self) -> BridgeTerms {
        BridgeTerms {
            confirmations: self.confirmations,
            minimum_payment: self.payment.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct BridgeDeleteArgs {
    #[command(flatten)]
    pub target: Target,
    pub name: String,
    #[arg(long)]
    pub execute: bool,
}

/// Everything a command needs, loaded once.
struct AppContext {
    config: Config,
    nodes: NodeDirectory,
    bridges: BridgeDirectory,
}

impl AppContext {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = Config::load(cli.config.as_deref())?;
        if let Some(hosts) = &cli.hosts {
            config.hosts_file = hosts.clone();
        }
        if let Some(bridges) = &cli.bridges {
            config.bridges_file = bridges.clone();
        }
        info!("Loaded configuration: {:?}", config);

        let nodes = NodeDirectory::load(&config.hosts_file)?;
        let bridges = match BridgeDirectory::load(&config.bridges_file) {
            Ok(bridges) => bridges,
            Err(e) if !config.bridges_file.exists() => {
                log::debug!("No bridge directory: {}", e);
                BridgeDirectory::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            config,
            nodes,
            bridges,
        })
    }

    fn connect(&self, node: &Node) -> Result<Box<dyn NodeApi>> {
        let credentials = self.config.credentials(node)?;
        let client = NodeClient::new(node.clone(), credentials, &self.config.client_options())?;
        Ok(Box::new(client))
    }

    fn client(&self, target: &Target) -> anyhow::Result<Box<dyn NodeApi>> {
        let node = self.nodes.find(&target.service, &target.network)?;
        Ok(self.connect(node)?)
    }
}

pub async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let ctx = AppContext::load(&cli)?;
    let engine = Engine::new(&ctx.bridges);

    match cli.command {
        Command::Run(args) => {
            let dispatcher = Dispatcher::from_config(&ctx.config, args.suppress_notifications)?;
            let mode = Mode::from_execute(args.execute || ctx.config.execute);
            let scheduler = Scheduler::new(
                ctx.nodes.nodes(),
                engine,
                &dispatcher,
                ctx.config.incidents_file.clone(),
                mode,
            );
            let summary = scheduler.tick(&mut |node: &Node| ctx.connect(node)).await?;
            Ok(exit_code(summary.reports.iter()))
        }
        Command::Daemon(args) => {
            let dispatcher = Dispatcher::from_config(&ctx.config, args.suppress_notifications)?;
            let mode = Mode::from_execute(args.execute || ctx.config.execute);
            info!(
                "Starting daemon over {} node(s), notifying via {}",
                ctx.nodes.nodes().len(),
                dispatcher.sink_names().join(", ")
            );
            let scheduler = Scheduler::new(
                ctx.nodes.nodes(),
                engine,
                &dispatcher,
                ctx.config.incidents_file.clone(),
                mode,
            );
            scheduler.run_forever(&mut |node: &Node| ctx.connect(node)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List(args) => {
            let mut api = ctx.client(&args.target)?;
            let filter = JobFilter {
                status: args.status,
                updates_only: args.updates,
                sort: args.sort,
                reverse: args.reverse,
            };
            let listing = engine.list_jobs(api.as_mut(), &filter).await?;
            let rendered = match args.format {
                Format::Json => serde_json::to_string_pretty(&listing.jobs)?,
                Format::Table => render_jobs(&listing.jobs, &listing.undetermined),
            };
            emit(&rendered, args.output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel(args) => {
            let selection = selection(&args)?;
            let mut api = ctx.client(&args.target)?;
            let report = engine
                .cancel(api.as_mut(), &selection, Mode::from_execute(args.execute))
                .await;
            print_report(&report, args.format)?;
            Ok(exit_code([&report]))
        }
        Command::Reapprove(args) => {
            let selection = selection(&args)?;
            let mut api = ctx.client(&args.target)?;
            let report = engine
                .reapprove(api.as_mut(), &selection, Mode::from_execute(args.execute))
                .await;
            print_report(&report, args.format)?;
            Ok(exit_code([&report]))
        }
        Command::Bridge(command) => bridge(&ctx, &engine, command).await,
    }
}

async fn bridge(
    ctx: &AppContext,
    engine: &Engine<'_>,
    command: BridgeCommand,
) -> anyhow::Result<ExitCode> {
    let (report, format) = match command {
        BridgeCommand::List(args) => {
            let mut api = ctx.client(&args.target)?;
            let groups = (!args.groups.is_empty()).then_some(args.groups.as_slice());
            let status = engine.bridge_status(api.as_mut(), groups).await?;
            let rendered = match args.format {
                Format::Json => serde_json::to_string_pretty(&status)?,
                Format::Table => render_bridges(&status),
            };
            emit(&rendered, None)?;
            return Ok(ExitCode::SUCCESS);
        }
        BridgeCommand::Create(args) => {
            let mut api = ctx.client(&args.target)?;
            let mode = Mode::from_execute(args.execute);
            let report = engine
                .bridge_create(api.as_mut(), &args.name, &args.url, &args.terms(), mode)
                .await;
            (report, Format::Table)
        }
        BridgeCommand::Delete(args) => {
            let mut api = ctx.client(&args.target)?;
            let mode = Mode::from_execute(args.execute);
            (engine.bridge_delete(api.as_mut(), &args.name, mode).await, Format::Table)
        }
        BridgeCommand::Batch(args) => {
            let mut api = ctx.client(&args.target)?;
            let groups = (!args.groups.is_empty()).then_some(args.groups.as_slice());
            let mode = Mode::from_execute(args.execute);
            (engine.bridge_batch(api.as_mut(), groups, mode).await, args.format)
        }
        BridgeCommand::BatchDelete(args) => {
            let mut api = ctx.client(&args.target)?;
            let groups = (!args.groups.is_empty()).then_some(args.groups.as_slice());
            let mode = Mode::from_execute(args.execute);
            (engine.bridge_batch_delete(api.as_mut(), groups, mode).await, args.format)
        }
    };
    print_report(&report, format)?;
    Ok(exit_code([&report]))
}

fn selection(args: &SelectArgs) -> anyhow::Result<Selection> {
    Selection::from_parts(args.file.as_deref(), args.name.as_deref(), args.job_id.as_deref())
        .context("invalid job selection")
}

/// 0 when everything succeeded, 1 on item failures, 2 if any pass aborted.
fn exit_code<'r>(reports: impl IntoIterator<Item = &'r PassReport>) -> ExitCode {
    let mut code = 0;
    for report in reports {
        if report.is_aborted() {
            code = 2;
        } else if report.has_failures() && code == 0 {
            code = 1;
        }
    }
    ExitCode::from(code)
}

fn emit(rendered: &str, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Wrote output to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn print_report(report: &PassReport, format: Format) -> anyhow::Result<()> {
    let rendered = match format {
        Format::Json => serde_json::to_string_pretty(report)?,
        Format::Table => render_report(report),
    };
    emit(&rendered, None)
}

/// Jobs grouped by status, one line each.
pub fn render_jobs(jobs: &[Job], undetermined: &[String]) -> String {
    let mut by_status: BTreeMap<String, Vec<&Job>> = BTreeMap::new();
    for job in jobs {
        by_status.entry(job.status.to_string()).or_default().push(job);
    }

    let mut out = String::new();
    for (status, jobs) in &by_status {
        let _ = writeln!(out, "{status} ({})", jobs.len());
        for job in jobs {
            let update = if job.pending_update { "  [update pending]" } else { "" };
            let spec = job.spec_id.as_deref().unwrap_or("-");
            let _ = writeln!(out, "  {:>6}  spec {:>6}  {}{}", job.id, spec, job.name, update);
        }
    }
    if jobs.is_empty() {
        out.push_str("No jobs found\n");
    }
    for source in undetermined {
        let _ = writeln!(out, "Could not determine: {source}");
    }
    out.trim_end().to_string()
}

pub fn render_bridges(status: &BridgeStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Bridges on node ({}):", status.current.len());
    for bridge in &status.current {
        let _ = writeln!(out, "  {:<32} {}", bridge.name, bridge.url);
    }
    let _ = writeln!(out, "Required ({}):", status.required.len());
    for bridge in status.required.iter() {
        let group = bridge.group.as_deref().unwrap_or("-");
        let _ = writeln!(out, "  {:<32} {} [{}]", bridge.name, bridge.url, group);
    }
    for bridge in &status.diff.missing {
        let _ = writeln!(out, "missing: {} -> {}", bridge.name, bridge.url);
    }
    for drift in &status.diff.drifted {
        let _ = writeln!(
            out,
            "drifted: {} is {} but should be {}",
            drift.required.name, drift.current_url, drift.required.url
        );
    }
    for bridge in &status.diff.extra {
        let _ = writeln!(out, "extra:   {} -> {}", bridge.name, bridge.url);
    }
    for o in &status.required.overrides {
        let _ = writeln!(
            out,
            "warning: '{}' from group '{}' overrides group '{}'",
            o.name, o.to_group, o.from_group
        );
    }
    for group in &status.required.missing_groups {
        let _ = writeln!(out, "warning: group '{group}' is not defined");
    }
    out.trim_end().to_string()
}

pub fn render_report(report: &PassReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} on {} ({})", report.action, report.node, report.mode);
    for item in &report.items {
        let status = match &item.outcome {
            Outcome::Planned => "would apply".to_string(),
            Outcome::Applied => "applied".to_string(),
            Outcome::Unchanged => "unchanged".to_string(),
            Outcome::Failed { kind, detail } => format!("FAILED ({kind}): {detail}"),
        };
        let _ = writeln!(out, "  {:>6}  {:<48} {}", item.target, item.label, status);
    }
    for id in &report.unmatched {
        let _ = writeln!(out, "unmatched: {id}");
    }
    for line in &report.diagnostics {
        let _ = writeln!(out, "note: {line}");
    }
    for source in &report.undetermined {
        let _ = writeln!(out, "could not determine: {source}");
    }
    if let Some(abort) = &report.aborted {
        let _ = writeln!(out, "ABORTED ({}): {}", abort.kind, abort.detail);
    }
    let c = report.counts();
    let _ = writeln!(
        out,
        "{} planned, {} applied, {} unchanged, {} failed",
        c.planned, c.applied, c.unchanged, c.failed
    );
    if report.mode == Mode::DryRun && c.planned > 0 {
        out.push_str("Dry run: pass --execute to apply\n");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Action, ItemOutcome};
    use crate::types::{JobStatus, NodeId};
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_bridge_batch_with_groups() {
        let cli = Cli::try_parse_from([
            "jobkeeper", "bridge", "batch", "ocr", "ethereum", "-g", "common", "-g", "eth",
            "--execute",
        ])
        .unwrap();
        match cli.command {
            Command::Bridge(BridgeCommand::Batch(args)) => {
                assert_eq!(args.groups, vec!["common".to_string(), "eth".to_string()]);
                assert!(args.execute);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn execute_defaults_to_off() {
        let cli =
            Cli::try_parse_from(["jobkeeper", "cancel", "ocr", "base", "--name", "eth"]).unwrap();
        match cli.command {
            Command::Cancel(args) => assert!(!args.execute),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bridge_create_takes_payment_terms() {
        let cli = Cli::try_parse_from([
            "jobkeeper", "bridge", "create", "ocr", "base", "kaiko", "http://kaiko:8080",
            "--payment", "250", "--confirmations", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Bridge(BridgeCommand::Create(args)) => {
                assert_eq!(
                    args.terms(),
                    BridgeTerms {
                        confirmations: 2,
                        minimum_payment: "250".into(),
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "jobkeeper", "bridge", "create", "ocr", "base", "kaiko", "http://kaiko:8080",
        ])
        .unwrap();
        match cli.command {
            Command::Bridge(BridgeCommand::Create(args)) => {
                assert_eq!(args.terms(), BridgeTerms::default());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn jobs_are_grouped_by_status() {
        let jobs = vec![
            crate::node::mock::job("1", "eth/usd", JobStatus::Approved),
            crate::node::mock::job("2", "btc/usd", JobStatus::Pending),
        ];
        let rendered = render_jobs(&jobs, &[]);
        assert!(rendered.starts_with("APPROVED (1)"));
        assert!(rendered.contains("PENDING (1)"));
    }

    #[test]
    fn exit_code_reflects_worst_report() {
        let node = NodeId::new("ocr", "base");
        let mut failed = PassReport::new(node.clone(), Action::Cancel, Mode::Execute);
        failed
            .items
            .push(ItemOutcome::new("1", "a", Outcome::Failed {
                kind: crate::error::ErrorKind::Network,
                detail: "reset".into(),
            }));
        let clean = PassReport::new(node, Action::Cancel, Mode::Execute);

        assert_eq!(exit_code([&clean]), ExitCode::SUCCESS);
        assert_eq!(exit_code([&clean, &failed]), ExitCode::from(1));
    }
}
