//! Debounced incident tracking across passes.
//!
//! The ledger is the only state that outlives a tick. It is loaded before a
//! tick, handed by reference to an [`IncidentTracker`] for each pass, and
//! saved afterwards. An incident opens on the first failure of a signature,
//! stays quiet while the failure repeats and resolves on the first pass
//! that no longer reports it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::report::{Failure, PassReport};
use crate::types::NodeId;

/// Resolved incidents older than this are dropped on save.
const RESOLVED_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IncidentKey {
    pub node: NodeId,
    pub kind: ErrorKind,
    /// Job id or bridge name; `None` for node-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
}

impl IncidentKey {
    pub fn new(node: &NodeId, failure: &Failure) -> Self {
        Self {
            node: node.clone(),
            kind: failure.kind,
            item: failure.item.clone(),
        }
    }

    /// Stable string form, used as the ledger key and for alert dedup.
    pub fn signature(&self) -> String {
        match &self.item {
            Some(item) => format!("{}:{}:{}", self.node.slug(), self.kind, item),
            None => format!("{}:{}", self.node.slug(), self.kind),
        }
    }
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentState {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub key: IncidentKey,
    pub state: IncidentState,
    pub opened_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Failing passes seen since the incident opened.
    pub count: u32,
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.state == IncidentState::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentEvent {
    pub transition: Transition,
    pub incident: Incident,
}

/// How much of a node's state a pass was able to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// The pass completed; every item-level signature was evaluated.
    Complete,
    /// A dry run: the node was read but no item was attempted.
    Planned,
    /// The pass was abandoned; only node-level signatures are known.
    Aborted,
}

impl Coverage {
    pub fn of(report: &PassReport) -> Self {
        if report.is_aborted() {
            Coverage::Aborted
        } else if !report.mode.is_execute() {
            Coverage::Planned
        } else {
            Coverage::Complete
        }
    }

    /// Whether item-level incidents can be judged from this pass.
    fn covers_items(self) -> bool {
        self == Coverage::Complete
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    incidents: BTreeMap<String, Incident>,
}

/// Every known incident, keyed by signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentLedger {
    incidents: BTreeMap<String, Incident>,
}

impl IncidentLedger {
    /// Reads the ledger at `path`. A missing file is an empty ledger; an
    /// unreadable one is logged and replaced by an empty ledger.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No incident ledger at {}, starting empty", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to read incident ledger {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str::<LedgerFile>(&text) {
            Ok(file) => Self {
                incidents: file.incidents,
            },
            Err(e) => {
                warn!("Ignoring malformed incident ledger {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Prunes stale resolved incidents, then writes the ledger through a
    /// temporary file and a rename.
    pub fn save(&mut self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        self.prune(now);

        let file = LedgerFile {
            incidents: self.incidents.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = temp_path(path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved {} incident(s) to {}", self.incidents.len(), path.display());
        Ok(())
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(RESOLVED_RETENTION_DAYS);
        let before = self.incidents.len();
        self.incidents.retain(|_, incident| {
            incident.is_open() || incident.resolved_at.map_or(true, |at| at >= cutoff)
        });
        let pruned = before - self.incidents.len();
        if pruned > 0 {
            debug!("Pruned {} resolved incident(s)", pruned);
        }
    }

    pub fn open(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values().filter(|i| i.is_open())
    }

    pub fn open_for<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Incident> + 'a {
        self.open().filter(move |i| &i.key.node == node)
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "incidents".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Applies one pass worth of failures to a ledger.
pub struct IncidentTracker<'a> {
    ledger: &'a mut IncidentLedger,
}

impl<'a> IncidentTracker<'a> {
    pub fn new(ledger: &'a mut IncidentLedger) -> Self {
        Self { ledger }
    }

    /// Resolves open incidents of `node` that this pass no longer reports,
    /// then opens or refreshes one incident per failure signature.
    ///
    /// Unless the coverage is [`Coverage::Complete`], only node-level
    /// incidents can resolve; item incidents are left as they are.
    pub fn observe(
        &mut self,
        node: &NodeId,
        failures: &[Failure],
        coverage: Coverage,
        now: DateTime<Utc>,
    ) -> Vec<IncidentEvent> {
        let mut events = Vec::new();

        let current: BTreeMap<String, &Failure> = failures
            .iter()
            .map(|f| (IncidentKey::new(node, f).signature(), f))
            .collect();

        let resolvable: Vec<String> = self
            .ledger
            .open_for(node)
            .filter(|i| coverage.covers_items() || i.key.item.is_none())
            .map(|i| i.key.signature())
            .filter(|sig| !current.contains_key(sig))
            .collect();

        for signature in resolvable {
            if let Some(incident) = self.ledger.incidents.get_mut(&signature) {
                incident.state = IncidentState::Resolved;
                incident.resolved_at = Some(now);
                info!("Incident resolved: {}", signature);
                events.push(IncidentEvent {
                    transition: Transition::Resolved,
                    incident: incident.clone(),
                });
            }
        }

        for (signature, failure) in current {
            let still_open = self
                .ledger
                .incidents
                .get(&signature)
                .is_some_and(Incident::is_open);
            if still_open {
                if let Some(incident) = self.ledger.incidents.get_mut(&signature) {
                    incident.last_seen = now;
                    incident.count += 1;
                    incident.last_error = failure.detail.clone();
                    debug!("Incident {} still open ({} passes)", signature, incident.count);
                }
                continue;
            }

            let incident = Incident {
                key: IncidentKey::new(node, failure),
                state: IncidentState::Open,
                opened_at: now,
                last_seen: now,
                count: 1,
                last_error: failure.detail.clone(),
                resolved_at: None,
            };
            warn!("Incident opened: {} ({})", signature, failure.detail);
            self.ledger.incidents.insert(signature, incident.clone());
            events.push(IncidentEvent {
                transition: Transition::Opened,
                incident,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::report::Action;
    use crate::types::Mode;

    fn node() -> NodeId {
        NodeId::new("ocr", "ethereum")
    }

    fn item_failure(item: &str) -> Failure {
        Failure::from_error(Some(item.into()), &Error::Network("gateway timeout".into()))
    }

    fn pass_failure() -> Failure {
        Failure::from_error(
            None,
            &Error::Authentication {
                node: "OCR ETHEREUM".into(),
                reason: "login rejected with 401".into(),
            },
        )
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    #[test]
    fn repeated_failure_alerts_once_and_resolves_once() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);
        let failures = vec![item_failure("5")];

        let mut opened = 0;
        for pass in 0..3 {
            let events = tracker.observe(&node(), &failures, Coverage::Complete, at(pass * 15));
            opened += events
                .iter()
                .filter(|e| e.transition == Transition::Opened)
                .count();
            assert!(events.iter().all(|e| e.transition == Transition::Opened));
        }
        assert_eq!(opened, 1);

        let events = tracker.observe(&node(), &[], Coverage::Complete, at(45));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transition, Transition::Resolved);
        assert_eq!(events[0].incident.count, 3);
        assert_eq!(events[0].incident.last_seen, at(30));
    }

    #[test]
    fn distinct_items_are_tracked_independently() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);

        let events = tracker.observe(
            &node(),
            &[item_failure("5"), item_failure("6")],
            Coverage::Complete,
            at(0),
        );
        assert_eq!(events.len(), 2);

        let events = tracker.observe(&node(), &[item_failure("6")], Coverage::Complete, at(15));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].incident.key.item.as_deref(), Some("5"));
        assert_eq!(ledger.open().count(), 1);
    }

    #[test]
    fn recurrence_after_resolution_reopens() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);
        let failures = vec![item_failure("5")];

        tracker.observe(&node(), &failures, Coverage::Complete, at(0));
        tracker.observe(&node(), &[], Coverage::Complete, at(15));
        let events = tracker.observe(&node(), &failures, Coverage::Complete, at(30));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transition, Transition::Opened);
        assert_eq!(events[0].incident.count, 1);
        assert_eq!(events[0].incident.opened_at, at(30));
    }

    #[test]
    fn aborted_pass_leaves_item_incidents_alone() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);

        tracker.observe(&node(), &[item_failure("5")], Coverage::Complete, at(0));
        let events = tracker.observe(&node(), &[pass_failure()], Coverage::Aborted, at(15));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transition, Transition::Opened);
        assert_eq!(events[0].incident.key.item, None);

        // Node recovers: the node-level incident resolves, item 5 is fixed too.
        let events = tracker.observe(&node(), &[], Coverage::Complete, at(30));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.transition == Transition::Resolved));
    }

    #[test]
    fn dry_run_leaves_item_incidents_alone() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);

        tracker.observe(&node(), &[item_failure("5"), pass_failure()], Coverage::Complete, at(0));
        let events = tracker.observe(&node(), &[], Coverage::Planned, at(15));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transition, Transition::Resolved);
        assert_eq!(events[0].incident.key.item, None);
        assert_eq!(ledger.open_for(&node()).count(), 1);
    }

    #[test]
    fn coverage_follows_report() {
        let id = node();
        let mut report = PassReport::new(id.clone(), Action::Approve, Mode::Execute);
        assert_eq!(Coverage::of(&report), Coverage::Complete);
        report.abort(&Error::Network("reset".into()));
        assert_eq!(Coverage::of(&report), Coverage::Aborted);

        let report = PassReport::new(id, Action::Approve, Mode::DryRun);
        assert_eq!(Coverage::of(&report), Coverage::Planned);
    }

    #[test]
    fn other_nodes_are_not_resolved() {
        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);
        let other = NodeId::new("ocr", "arbitrum");

        tracker.observe(&other, &[item_failure("1")], Coverage::Complete, at(0));
        let events = tracker.observe(&node(), &[], Coverage::Complete, at(15));
        assert!(events.is_empty());
        assert_eq!(ledger.open_for(&other).count(), 1);
    }

    #[test]
    fn save_prunes_old_resolved_incidents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open_incidents.json");

        let mut ledger = IncidentLedger::default();
        let mut tracker = IncidentTracker::new(&mut ledger);
        let failures = [item_failure("5"), item_failure("6")];
        tracker.observe(&node(), &failures, Coverage::Complete, at(0));
        tracker.observe(&node(), &[item_failure("6")], Coverage::Complete, at(15));

        ledger.save(&path, at(15)).unwrap();
        assert_eq!(IncidentLedger::load(&path).len(), 2);

        ledger.save(&path, at(15) + Duration::days(8)).unwrap();
        let reloaded = IncidentLedger::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.open().count(), 1);
        assert!(!dir.path().join("open_incidents.json.tmp").exists());
    }

    #[test]
    fn malformed_ledger_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open_incidents.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(IncidentLedger::load(&path).is_empty());
        assert!(IncidentLedger::load(&dir.path().join("absent.json")).is_empty());
    }
}
