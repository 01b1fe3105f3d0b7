//! Required-bridge resolution and diffing.
//!
//! A node's required bridges are the union of its groups' definitions,
//! merged in configured group order. When two groups define the same bridge
//! with different URLs the later group wins and the override is logged.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde::Serialize;

use crate::config::BridgeDirectory;
use crate::node::NodeApi;
use crate::report::{ItemOutcome, Outcome, PassReport};
use crate::types::{Bridge, BridgeTerms, Mode, Mutation};

/// A bridge whose URL was replaced by a later group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Override {
    pub name: String,
    pub from_group: String,
    pub from_url: String,
    pub to_group: String,
    pub to_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequiredBridges {
    bridges: BTreeMap<String, Bridge>,
    pub overrides: Vec<Override>,
    /// Configured groups that the bridge directory does not define.
    pub missing_groups: Vec<String>,
}

impl RequiredBridges {
    pub fn get(&self, name: &str) -> Option<&Bridge> {
        self.bridges.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bridge> {
        self.bridges.values()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

/// Merges the definitions of `groups`, in order, into one required set.
pub fn resolve_required(groups: &[String], directory: &BridgeDirectory) -> RequiredBridges {
    let mut required = RequiredBridges::default();

    for group in groups {
        let Some(definitions) = directory.group(group) else {
            warn!("Bridge group '{}' is not defined in the bridge directory", group);
            required.missing_groups.push(group.clone());
            continue;
        };

        for (name, url) in definitions {
            let bridge = Bridge {
                name: name.clone(),
                url: url.clone(),
                group: Some(group.clone()),
            };
            if let Some(previous) = required.bridges.insert(name.clone(), bridge) {
                if previous.url != *url {
                    let from_group = previous.group.unwrap_or_default();
                    warn!(
                        "Bridge '{}' defined by groups '{}' ({}) and '{}' ({}); using '{}'",
                        name, from_group, previous.url, group, url, group
                    );
                    required.overrides.push(Override {
                        name: name.clone(),
                        from_group,
                        from_url: previous.url,
                        to_group: group.clone(),
                        to_url: url.clone(),
                    });
                }
            }
        }
    }

    required
}

/// A required bridge present on the node with a different URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub required: Bridge,
    pub current_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeDiff {
    pub missing: Vec<Bridge>,
    pub drifted: Vec<Drift>,
    /// Present on the node but not required. Never removed implicitly.
    pub extra: Vec<Bridge>,
    pub in_sync: Vec<Bridge>,
}

impl BridgeDiff {
    pub fn is_converged(&self) -> bool {
        self.missing.is_empty() && self.drifted.is_empty()
    }
}

pub fn diff(required: &RequiredBridges, current: &[Bridge]) -> BridgeDiff {
    let present: BTreeMap<&str, &Bridge> = current.iter().map(|b| (b.name.as_str(), b)).collect();
    let mut result = BridgeDiff::default();

    for bridge in required.iter() {
        match present.get(bridge.name.as_str()) {
            None => result.missing.push(bridge.clone()),
            Some(existing) if existing.url != bridge.url => result.drifted.push(Drift {
                required: bridge.clone(),
                current_url: existing.url.clone(),
            }),
            Some(_) => result.in_sync.push(bridge.clone()),
        }
    }

    let mut seen = BTreeSet::new();
    for bridge in current {
        if required.get(&bridge.name).is_none() && seen.insert(bridge.name.as_str()) {
            result.extra.push(bridge.clone());
        }
    }
    result.extra.sort_by(|a, b| a.name.cmp(&b.name));

    result
}

/// Creates every missing bridge and repoints every drifted one. Each entry
/// is attempted independently; a fatal error abandons the rest.
pub async fn batch_create(
    api: &mut dyn NodeApi,
    diff: &BridgeDiff,
    mode: Mode,
    report: &mut PassReport,
) {
    let targets = diff
        .missing
        .iter()
        .chain(diff.drifted.iter().map(|d| &d.required));

    let terms = BridgeTerms::default();
    for bridge in targets {
        if !mode.is_execute() {
            report
                .items
                .push(ItemOutcome::new(&bridge.name, &bridge.url, Outcome::Planned));
            continue;
        }
        match api.create_or_update_bridge(&bridge.name, &bridge.url, &terms).await {
            Ok(mutation) => report
                .items
                .push(ItemOutcome::new(&bridge.name, &bridge.url, outcome_of(mutation))),
            Err(e) if e.is_fatal() => {
                report.abort(&e);
                return;
            }
            Err(e) => {
                warn!("Failed to create bridge '{}' on {}: {}", bridge.name, api.node().id, e);
                report.items.push(ItemOutcome::failed(&bridge.name, &bridge.url, &e));
            }
        }
    }
}

/// Deletes `candidates` one by one. Dry runs only list them.
pub async fn batch_delete(
    api: &mut dyn NodeApi,
    candidates: &[Bridge],
    mode: Mode,
    report: &mut PassReport,
) {
    if !mode.is_execute() && !candidates.is_empty() {
        info!(
            "{} bridge(s) on {} would be deleted; pass --execute to delete them",
            candidates.len(),
            api.node().id
        );
    }

    for bridge in candidates {
        if !mode.is_execute() {
            report
                .items
                .push(ItemOutcome::new(&bridge.name, &bridge.url, Outcome::Planned));
            continue;
        }
        match api.delete_bridge(&bridge.name).await {
            Ok(mutation) => report
                .items
                .push(ItemOutcome::new(&bridge.name, &bridge.url, outcome_of(mutation))),
            Err(e) if e.is_fatal() => {
                report.abort(&e);
                return;
            }
            Err(e) => {
                warn!("Failed to delete bridge '{}' on {}: {}", bridge.name, api.node().id, e);
                report.items.push(ItemOutcome::failed(&bridge.name, &bridge.url, &e));
            }
        }
    }
}

pub(crate) fn outcome_of(mutation: Mutation) -> Outcome {
    match mutation {
        Mutation::Applied => Outcome::Applied,
        Mutation::Unchanged => Outcome::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::node::mock::MockNode;
    use crate::report::Action;
    use crate::types::NodeId;

    fn directory() -> BridgeDirectory {
        let mut dir = BridgeDirectory::default();
        dir.insert("g1", "b", "urlA");
        dir.insert("g1", "only-g1", "http://one");
        dir.insert("g2", "b", "urlB");
        dir.insert("g2", "only-g2", "http://two");
        dir
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn bridge(name: &str, url: &str) -> Bridge {
        Bridge {
            name: name.into(),
            url: url.into(),
            group: None,
        }
    }

    fn report(mode: Mode) -> PassReport {
        PassReport::new(NodeId::new("ocr", "base"), Action::BridgeBatch, mode)
    }

    #[test]
    fn later_group_wins() {
        let required = resolve_required(&groups(&["g1", "g2"]), &directory());
        assert_eq!(required.get("b").unwrap().url, "urlB");
        assert_eq!(required.get("b").unwrap().group.as_deref(), Some("g2"));
        assert_eq!(required.len(), 3);
        assert_eq!(required.overrides.len(), 1);
        assert_eq!(required.overrides[0].from_url, "urlA");

        let reversed = resolve_required(&groups(&["g2", "g1"]), &directory());
        assert_eq!(reversed.get("b").unwrap().url, "urlA");
    }

    #[test]
    fn same_url_in_two_groups_is_not_an_override() {
        let mut dir = directory();
        dir.insert("g3", "only-g1", "http://one");
        let required = resolve_required(&groups(&["g1", "g3"]), &dir);
        assert!(required.overrides.is_empty());
    }

    #[test]
    fn unknown_group_is_reported() {
        let required = resolve_required(&groups(&["g1", "nope"]), &directory());
        assert_eq!(required.missing_groups, vec!["nope".to_string()]);
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn diff_classifies_bridges() {
        let required = resolve_required(&groups(&["g1", "g2"]), &directory());
        let current = vec![
            bridge("b", "urlA"),
            bridge("only-g1", "http://one"),
            bridge("legacy", "http://old"),
        ];
        let diff = diff(&required, &current);

        let missing: Vec<_> = diff.missing.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(missing, vec!["only-g2"]);
        assert_eq!(diff.drifted.len(), 1);
        assert_eq!(diff.drifted[0].current_url, "urlA");
        assert_eq!(diff.drifted[0].required.url, "urlB");
        assert_eq!(diff.extra, vec![bridge("legacy", "http://old")]);
        assert_eq!(diff.in_sync.len(), 1);
        assert!(!diff.is_converged());
    }

    #[tokio::test]
    async fn batch_create_dry_run_issues_no_calls() {
        let mut node = MockNode::new();
        let required = resolve_required(&groups(&["g1", "g2"]), &directory());
        let diff = diff(&required, &[]);
        let mut report = report(Mode::DryRun);

        batch_create(&mut node, &diff, Mode::DryRun, &mut report).await;

        assert_eq!(node.mutations(), 0);
        assert_eq!(report.counts().planned, 3);
    }

    #[tokio::test]
    async fn batch_create_keeps_going_after_item_failure() {
        let mut node = MockNode::new().fail("b", || Error::Network("connection reset".into()));
        let required = resolve_required(&groups(&["g1", "g2"]), &directory());
        let diff = diff(&required, &[]);
        let mut report = report(Mode::Execute);

        batch_create(&mut node, &diff, Mode::Execute, &mut report).await;

        assert_eq!(node.mutations(), 3);
        let counts = report.counts();
        assert_eq!(counts.applied, 2);
        assert_eq!(counts.failed, 1);
        assert!(report.is_partial_failure());
        assert_eq!(node.bridges.get("only-g2").map(String::as_str), Some("http://two"));
    }

    #[tokio::test]
    async fn batch_create_stops_on_fatal_error() {
        let mut node = MockNode::new().fail("b", || Error::Authentication {
            node: "OCR BASE".into(),
            reason: "session rejected again".into(),
        });
        let required = resolve_required(&groups(&["g1", "g2"]), &directory());
        let diff = diff(&required, &[]);
        let mut report = report(Mode::Execute);

        batch_create(&mut node, &diff, Mode::Execute, &mut report).await;

        // "b" sorts first, so nothing else is attempted.
        assert_eq!(node.mutations(), 1);
        assert!(report.is_aborted());
    }

    #[tokio::test]
    async fn batch_delete_reports_each_entry() {
        let mut node = MockNode::new()
            .with_bridge("legacy", "http://old")
            .with_bridge("stale", "http://stale");
        let candidates = vec![
            bridge("legacy", "http://old"),
            bridge("ghost", "http://ghost"),
            bridge("stale", "http://stale"),
        ];

        let mut dry = report(Mode::DryRun);
        batch_delete(&mut node, &candidates, Mode::DryRun, &mut dry).await;
        assert_eq!(node.mutations(), 0);
        assert_eq!(dry.counts().planned, 3);

        let mut live = report(Mode::Execute);
        batch_delete(&mut node, &candidates, Mode::Execute, &mut live).await;
        assert_eq!(node.mutations(), 3);
        assert_eq!(live.counts().applied, 2);
        assert_eq!(live.failures()[0].item.as_deref(), Some("ghost"));
        assert!(node.bridges.is_empty());
    }
}
