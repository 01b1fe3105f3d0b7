//! One pass over one node.
//!
//! Every pass authenticates, reads the node state it needs, then applies
//! its action to each selected item. The mode is fixed for the pass: in a
//! dry run no mutating [`NodeApi`] call is ever issued. Item failures land
//! in the report; only authentication failures and failed setup reads
//! abandon the pass.

use std::path::Path;

use log::{debug, info, warn};
use serde::Serialize;

use crate::bridges::{self, BridgeDiff, RequiredBridges};
use crate::config::BridgeDirectory;
use crate::error::{Error, Result};
use crate::matcher::{self, IdentifierSet, MatchResult};
use crate::node::NodeApi;
use crate::report::{Action, ItemOutcome, Outcome, PassReport};
use crate::types::{Bridge, BridgeTerms, Job, JobListing, JobStatus, Mode, Mutation};

/// Which jobs a cancel or reapprove pass acts on.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    identifiers: IdentifierSet,
    job_id: Option<String>,
}

impl Selection {
    /// Combines an identifier file, a single name pattern and an exact job id.
    /// At least one must be given.
    pub fn from_parts(
        file: Option<&Path>,
        pattern: Option<&str>,
        job_id: Option<&str>,
    ) -> Result<Self> {
        let mut identifiers = match file {
            Some(path) => IdentifierSet::load(path)?,
            None => IdentifierSet::default(),
        };
        if let Some(pattern) = pattern.map(str::trim).filter(|p| !p.is_empty()) {
            identifiers.add_pattern(pattern);
        }

        let job_id = job_id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(id) = job_id {
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::Validation(format!("job id must be numeric, got '{id}'")));
            }
        }

        if identifiers.is_empty() && job_id.is_none() {
            return Err(Error::Validation(
                "no identifiers given: pass an identifier file, a name pattern or a job id".into(),
            ));
        }

        Ok(Self {
            identifiers,
            job_id: job_id.map(str::to_string),
        })
    }

    pub fn identifiers(identifiers: IdentifierSet) -> Self {
        Self {
            identifiers,
            job_id: None,
        }
    }

    pub fn job_id(id: impl Into<String>) -> Self {
        Self {
            identifiers: IdentifierSet::default(),
            job_id: Some(id.into()),
        }
    }

    fn apply(&self, jobs: &[Job]) -> Result<MatchResult> {
        let mut result = if self.identifiers.is_empty() {
            MatchResult::default()
        } else {
            matcher::match_jobs(jobs, &self.identifiers)
        };
        if let Some(id) = &self.job_id {
            result.merge(matcher::match_job_id(jobs, id)?);
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SortKey {
    #[default]
    Name,
    Id,
    Spec,
    Updates,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Case-insensitive status match.
    pub status: Option<String>,
    /// Only jobs with a pending update.
    pub updates_only: bool,
    pub sort: SortKey,
    pub reverse: bool,
}

impl JobFilter {
    pub fn apply(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        if let Some(status) = &self.status {
            let wanted = JobStatus::from(status.clone());
            jobs.retain(|j| j.status == wanted);
        }
        if self.updates_only {
            jobs.retain(|j| j.pending_update);
        }

        match self.sort {
            SortKey::Name => jobs.sort_by(|a, b| a.name.cmp(&b.name)),
            SortKey::Id => jobs.sort_by_key(|j| numeric_key(&j.id)),
            SortKey::Spec => jobs.sort_by_key(|j| j.spec_id.as_deref().map(numeric_key)),
            SortKey::Updates => jobs.sort_by(|a, b| {
                b.pending_update
                    .cmp(&a.pending_update)
                    .then_with(|| a.name.cmp(&b.name))
            }),
        }
        if self.reverse {
            jobs.reverse();
        }
        jobs
    }
}

fn numeric_key(id: &str) -> (u64, String) {
    (id.parse().unwrap_or(u64::MAX), id.to_string())
}

/// Required bridges of a node next to what the node currently has.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub current: Vec<Bridge>,
    pub required: RequiredBridges,
    pub diff: BridgeDiff,
}

pub struct Engine<'a> {
    bridges: &'a BridgeDirectory,
}

impl<'a> Engine<'a> {
    pub fn new(bridges: &'a BridgeDirectory) -> Self {
        Self { bridges }
    }

    pub async fn list_jobs(&self, api: &mut dyn NodeApi, filter: &JobFilter) -> Result<JobListing> {
        api.authenticate().await?;
        let listing = api.list_jobs().await?;
        for source in &listing.undetermined {
            warn!("{}: could not determine jobs from {}", api.node().id, source);
        }
        Ok(JobListing {
            jobs: filter.apply(listing.jobs),
            undetermined: listing.undetermined,
        })
    }

    /// Approves every job awaiting approval.
    pub async fn approve_pending(&self, api: &mut dyn NodeApi, mode: Mode) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), Action::Approve, mode);
        let Some(listing) = read_jobs(api, &mut report).await else {
            return report;
        };

        let pending: Vec<Job> = listing
            .jobs
            .into_iter()
            .filter(Job::needs_approval)
            .collect();
        if pending.is_empty() {
            debug!("{}: no jobs awaiting approval", report.node);
        }
        apply_to_jobs(api, &pending, Action::Approve, &mut report).await;
        report
    }

    pub async fn cancel(
        &self,
        api: &mut dyn NodeApi,
        selection: &Selection,
        mode: Mode,
    ) -> PassReport {
        self.matched_pass(api, selection, Action::Cancel, mode).await
    }

    pub async fn reapprove(
        &self,
        api: &mut dyn NodeApi,
        selection: &Selection,
        mode: Mode,
    ) -> PassReport {
        self.matched_pass(api, selection, Action::Reapprove, mode).await
    }

    async fn matched_pass(
        &self,
        api: &mut dyn NodeApi,
        selection: &Selection,
        action: Action,
        mode: Mode,
    ) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), action, mode);
        report
            .diagnostics
            .extend(selection.identifiers.diagnostics().iter().cloned());

        let Some(listing) = read_jobs(api, &mut report).await else {
            return report;
        };

        let result = match selection.apply(&listing.jobs) {
            Ok(result) => result,
            Err(e) => {
                report.diagnostics.push(e.to_string());
                return report;
            }
        };
        for duplicate in &result.duplicates {
            report.diagnostics.push(format!(
                "identifier '{}' appears {} times",
                duplicate.identifier, duplicate.count
            ));
        }
        report.unmatched = result.unmatched;
        report.duplicates = result.duplicates;

        info!(
            "{}: {} job(s) matched for {}, {} identifier(s) unmatched",
            report.node,
            result.matched.len(),
            action,
            report.unmatched.len()
        );

        let jobs: Vec<Job> = result.matched.into_iter().map(|m| m.job).collect();
        apply_to_jobs(api, &jobs, action, &mut report).await;
        report
    }

    /// Groups to resolve: an explicit override, or the node's own groups.
    fn required_for(&self, api: &dyn NodeApi, groups: Option<&[String]>) -> RequiredBridges {
        let groups = groups.unwrap_or(&api.node().bridge_groups);
        bridges::resolve_required(groups, self.bridges)
    }

    pub async fn bridge_status(
        &self,
        api: &mut dyn NodeApi,
        groups: Option<&[String]>,
    ) -> Result<BridgeStatus> {
        api.authenticate().await?;
        let mut current = api.list_bridges().await?;
        current.sort_by(|a, b| a.name.cmp(&b.name));
        let required = self.required_for(api, groups);
        let diff = bridges::diff(&required, &current);
        Ok(BridgeStatus {
            current,
            required,
            diff,
        })
    }

    /// Creates one bridge, or repoints it if it exists with another URL.
    pub async fn bridge_create(
        &self,
        api: &mut dyn NodeApi,
        name: &str,
        url: &str,
        terms: &BridgeTerms,
        mode: Mode,
    ) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), Action::BridgeCreate, mode);
        if name.trim().is_empty() || url.trim().is_empty() {
            let e = Error::Validation("bridge name and URL must not be empty".into());
            report.items.push(ItemOutcome::failed(name, url, &e));
            return report;
        }
        if let Err(e) = api.authenticate().await {
            report.abort(&e);
            return report;
        }
        if !mode.is_execute() {
            report.items.push(ItemOutcome::new(name, url, Outcome::Planned));
            return report;
        }
        record_mutation(
            api.create_or_update_bridge(name, url, terms).await,
            name,
            url,
            &mut report,
        );
        report
    }

    pub async fn bridge_delete(&self, api: &mut dyn NodeApi, name: &str, mode: Mode) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), Action::BridgeDelete, mode);
        if let Err(e) = api.authenticate().await {
            report.abort(&e);
            return report;
        }
        if !mode.is_execute() {
            report.items.push(ItemOutcome::new(name, "", Outcome::Planned));
            return report;
        }
        record_mutation(api.delete_bridge(name).await, name, "", &mut report);
        report
    }

    /// Creates missing bridges and repoints drifted ones.
    pub async fn bridge_batch(
        &self,
        api: &mut dyn NodeApi,
        groups: Option<&[String]>,
        mode: Mode,
    ) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), Action::BridgeBatch, mode);
        let status = match self.bridge_status(api, groups).await {
            Ok(status) => status,
            Err(e) => {
                report.abort(&e);
                return report;
            }
        };
        self.note_resolution(&status.required, &mut report);

        info!(
            "{}: {} missing, {} drifted, {} in sync, {} extra",
            report.node,
            status.diff.missing.len(),
            status.diff.drifted.len(),
            status.diff.in_sync.len(),
            status.diff.extra.len()
        );
        if status.diff.is_converged() {
            info!("{}: bridges already match the required set", report.node);
        }
        bridges::batch_create(api, &status.diff, mode, &mut report).await;
        report
    }

    /// Deletes bridges the node has but its groups do not require.
    pub async fn bridge_batch_delete(
        &self,
        api: &mut dyn NodeApi,
        groups: Option<&[String]>,
        mode: Mode,
    ) -> PassReport {
        let mut report = PassReport::new(api.node().id.clone(), Action::BridgeBatchDelete, mode);
        let status = match self.bridge_status(api, groups).await {
            Ok(status) => status,
            Err(e) => {
                report.abort(&e);
                return report;
            }
        };
        self.note_resolution(&status.required, &mut report);

        if !status.required.missing_groups.is_empty() {
            // An undefined group would make all of its bridges look extra.
            report.abort(&Error::Config(format!(
                "bridge group(s) not defined: {}",
                status.required.missing_groups.join(", ")
            )));
            return report;
        }
        bridges::batch_delete(api, &status.diff.extra, mode, &mut report).await;
        report
    }

    fn note_resolution(&self, required: &RequiredBridges, report: &mut PassReport) {
        for o in &required.overrides {
            report.diagnostics.push(format!(
                "bridge '{}': group '{}' overrides '{}' ({} -> {})",
                o.name, o.to_group, o.from_group, o.from_url, o.to_url
            ));
        }
        for group in &required.missing_groups {
            report
                .diagnostics
                .push(format!("bridge group '{group}' is not defined"));
        }
    }
}

/// Authenticates and reads the node's jobs, aborting `report` on failure.
async fn read_jobs(api: &mut dyn NodeApi, report: &mut PassReport) -> Option<JobListing> {
    if let Err(e) = api.authenticate().await {
        warn!("{}: {}", report.node, e);
        report.abort(&e);
        return None;
    }
    match api.list_jobs().await {
        Ok(listing) => {
            report.undetermined.extend(listing.undetermined.iter().cloned());
            Some(listing)
        }
        Err(e) => {
            warn!("{}: could not list jobs: {}", report.node, e);
            report.abort(&e);
            None
        }
    }
}

async fn apply_to_jobs(
    api: &mut dyn NodeApi,
    jobs: &[Job],
    action: Action,
    report: &mut PassReport,
) {
    for job in jobs {
        let Some(spec_id) = job.spec_id.as_deref() else {
            warn!("{}: skipping job {} ({}): no spec id", report.node, job.id, job.name);
            report
                .diagnostics
                .push(format!("job {} ({}) has no spec to {}, skipped", job.id, job.name, action));
            continue;
        };

        if !report.mode.is_execute() {
            report
                .items
                .push(ItemOutcome::new(&job.id, &job.name, Outcome::Planned));
            continue;
        }

        let result = match action {
            Action::Approve => api.approve_job(spec_id).await,
            Action::Cancel => api.cancel_job(spec_id).await,
            Action::Reapprove => api.reapprove_job(spec_id).await,
            other => Err(Error::Validation(format!("{other} does not act on jobs"))),
        };
        if !record_mutation(result, &job.id, &job.name, report) {
            return;
        }
        debug!("{}: {} job {} ({})", report.node, action, job.id, job.name);
    }
}

/// Records one mutation result. Returns `false` if the pass was aborted.
fn record_mutation(
    result: Result<Mutation>,
    target: &str,
    label: &str,
    report: &mut PassReport,
) -> bool {
    match result {
        Ok(mutation) => {
            report
                .items
                .push(ItemOutcome::new(target, label, bridges::outcome_of(mutation)));
            true
        }
        Err(e) if e.is_fatal() => {
            warn!("{}: abandoning {} pass: {}", report.node, report.action, e);
            report.abort(&e);
            false
        }
        Err(e) => {
            warn!("{}: {} of {} failed: {}", report.node, report.action, target, e);
            report.items.push(ItemOutcome::failed(target, label, &e));
            true
        }
    }
}
