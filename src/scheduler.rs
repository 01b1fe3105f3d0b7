//! Periodic approve passes over the whole fleet.
//!
//! A tick visits every node strictly in turn. The incident ledger is loaded
//! at the start of a tick and saved at the end; in between it is handed to
//! the tracker once per node.

use std::path::PathBuf;

use chrono::{DateTime, Duration, DurationRound, Utc};
use log::{error, info, warn};
use tokio::signal;
use tokio::time::sleep;

use crate::engine::Engine;
use crate::error::Result;
use crate::incident::{Coverage, IncidentEvent, IncidentLedger, IncidentTracker};
use crate::node::NodeApi;
use crate::notify::{Dispatcher, Event};
use crate::report::{Action, PassReport};
use crate::types::{Mode, Node};

/// Opens a client for one node.
pub type Connector<'c> = dyn FnMut(&Node) -> Result<Box<dyn NodeApi>> + 'c;

#[derive(Debug, Default)]
pub struct TickSummary {
    pub reports: Vec<PassReport>,
    pub events: Vec<IncidentEvent>,
}

impl TickSummary {
    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(PassReport::has_failures)
    }
}

pub struct Scheduler<'a> {
    nodes: &'a [Node],
    engine: Engine<'a>,
    dispatcher: &'a Dispatcher,
    ledger_path: PathBuf,
    mode: Mode,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        nodes: &'a [Node],
        engine: Engine<'a>,
        dispatcher: &'a Dispatcher,
        ledger_path: PathBuf,
        mode: Mode,
    ) -> Self {
        Self {
            nodes,
            engine,
            dispatcher,
            ledger_path,
            mode,
        }
    }

    /// One approve pass per node, in directory order.
    pub async fn tick(&self, connect: &mut Connector<'_>) -> Result<TickSummary> {
        info!("Starting tick over {} node(s) in {} mode", self.nodes.len(), self.mode);
        if !self.mode.is_execute() {
            warn!("Execute flag is not set; no jobs will be approved");
        }

        let mut ledger = IncidentLedger::load(&self.ledger_path);
        let mut summary = TickSummary::default();

        for node in self.nodes {
            info!("Checking jobs on {} ({})", node.id, node.url);
            let report = match connect(node) {
                Ok(mut api) => self.engine.approve_pending(api.as_mut(), self.mode).await,
                Err(e) => {
                    error!("Could not set up client for {}: {}", node.id, e);
                    let mut report = PassReport::new(node.id.clone(), Action::Approve, self.mode);
                    report.abort(&e);
                    report
                }
            };
            log_report(&report);

            let events = IncidentTracker::new(&mut ledger).observe(
                &report.node,
                &report.failures(),
                Coverage::of(&report),
                Utc::now(),
            );

            if let Some(event) = Event::from_report(&report) {
                self.dispatcher.dispatch(&event).await;
            }
            for event in &events {
                self.dispatcher.dispatch(&Event::from_incident(event)).await;
            }

            summary.events.extend(events);
            summary.reports.push(report);
        }

        ledger.save(&self.ledger_path, Utc::now())?;
        info!(
            "Tick complete: {} node(s), {} incident transition(s), {} open incident(s)",
            summary.reports.len(),
            summary.events.len(),
            ledger.open().count()
        );
        Ok(summary)
    }

    /// Runs a tick at every quarter hour until Ctrl+C. The next slot is
    /// computed after the previous tick finishes, so ticks never overlap.
    pub async fn run_forever(&self, connect: &mut Connector<'_>) -> Result<()> {
        loop {
            let now = Utc::now();
            let next = next_quarter_hour(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!("Next tick at {}", next.format("%H:%M:%S UTC"));

            tokio::select! {
                _ = sleep(wait) => {}
                res = signal::ctrl_c() => {
                    match res {
                        Ok(()) => info!("Received Ctrl+C, shutting down..."),
                        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                    }
                    return Ok(());
                }
            }

            if let Err(e) = self.tick(connect).await {
                error!("Tick failed: {}", e);
            }
        }
    }
}

fn log_report(report: &PassReport) {
    let counts = report.counts();
    if let Some(abort) = &report.aborted {
        error!("{}: pass aborted ({}): {}", report.node, abort.kind, abort.detail);
        return;
    }
    for source in &report.undetermined {
        warn!("{}: could not determine {}", report.node, source);
    }
    info!(
        "{}: {} planned, {} applied, {} unchanged, {} failed",
        report.node, counts.planned, counts.applied, counts.unchanged, counts.failed
    );
}

/// The first :00/:15/:30/:45 boundary strictly after `now`.
pub fn next_quarter_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let quarter = Duration::minutes(15);
    match now.duration_trunc(quarter) {
        Ok(floor) => floor + quarter,
        Err(_) => now + quarter,
    }
}
