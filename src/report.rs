//! Structured result of one pass over one node.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::matcher::Duplicate;
use crate::types::{Mode, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Cancel,
    Reapprove,
    BridgeCreate,
    BridgeDelete,
    BridgeBatch,
    BridgeBatchDelete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Approve => "approve",
            Action::Cancel => "cancel",
            Action::Reapprove => "reapprove",
            Action::BridgeCreate => "bridge create",
            Action::BridgeDelete => "bridge delete",
            Action::BridgeBatch => "bridge batch",
            Action::BridgeBatchDelete => "bridge batch-delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Dry run: the action would have been taken.
    Planned,
    Applied,
    /// Nothing to do; the node already matches.
    Unchanged,
    Failed { kind: ErrorKind, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    /// Job id or bridge name.
    pub target: String,
    /// Job name or bridge URL, for humans.
    pub label: String,
    pub outcome: Outcome,
}

impl ItemOutcome {
    pub fn new(target: impl Into<String>, label: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            target: target.into(),
            label: label.into(),
            outcome,
        }
    }

    pub fn failed(target: impl Into<String>, label: impl Into<String>, error: &Error) -> Self {
        Self::new(
            target,
            label,
            Outcome::Failed {
                kind: error.kind(),
                detail: error.to_string(),
            },
        )
    }
}

/// A failure as seen by the incident tracker. `item` is `None` for
/// pass-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub item: Option<String>,
    pub detail: String,
}

impl Failure {
    pub fn from_error(item: Option<String>, error: &Error) -> Self {
        Self {
            kind: error.kind(),
            item,
            detail: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub planned: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub node: NodeId,
    pub action: Action,
    pub mode: Mode,
    pub items: Vec<ItemOutcome>,
    pub unmatched: Vec<String>,
    pub duplicates: Vec<Duplicate>,
    /// Sources whose state could not be read; their items are neither
    /// planned nor known to be in sync.
    pub undetermined: Vec<String>,
    pub diagnostics: Vec<String>,
    /// Set when the pass was abandoned early.
    pub aborted: Option<Failure>,
}

impl PassReport {
    pub fn new(node: NodeId, action: Action, mode: Mode) -> Self {
        Self {
            node,
            action,
            mode,
            items: Vec::new(),
            unmatched: Vec::new(),
            duplicates: Vec::new(),
            undetermined: Vec::new(),
            diagnostics: Vec::new(),
            aborted: None,
        }
    }

    pub fn abort(&mut self, error: &Error) {
        self.aborted = Some(Failure::from_error(None, error));
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for item in &self.items {
            match item.outcome {
                Outcome::Planned => counts.planned += 1,
                Outcome::Applied => counts.applied += 1,
                Outcome::Unchanged => counts.unchanged += 1,
                Outcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Every failure of the pass: the abort reason, then failed items.
    pub fn failures(&self) -> Vec<Failure> {
        let items = self.items.iter().filter_map(|item| match &item.outcome {
            Outcome::Failed { kind, detail } => Some(Failure {
                kind: *kind,
                item: Some(item.target.clone()),
                detail: detail.clone(),
            }),
            _ => None,
        });
        self.aborted.iter().cloned().chain(items).collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Some items failed while others succeeded or were skipped.
    pub fn is_partial_failure(&self) -> bool {
        let counts = self.counts();
        counts.failed > 0 && counts.failed < self.items.len()
    }

    pub fn has_failures(&self) -> bool {
        self.aborted.is_some() || self.counts().failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_failures() {
        let mut report =
            PassReport::new(NodeId::new("ocr", "base"), Action::Approve, Mode::Execute);
        report.items.push(ItemOutcome::new("1", "a", Outcome::Applied));
        report.items.push(ItemOutcome::new("2", "b", Outcome::Unchanged));
        report.items.push(ItemOutcome::failed("3", "c", &Error::Network("reset".into())));

        let counts = report.counts();
        assert_eq!(counts.applied, 1);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.failed, 1);
        assert!(report.is_partial_failure());

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item.as_deref(), Some("3"));
        assert_eq!(failures[0].kind, ErrorKind::Network);
    }

    #[test]
    fn abort_is_a_pass_level_failure() {
        let mut report = PassReport::new(NodeId::new("ocr", "base"), Action::Cancel, Mode::DryRun);
        report.abort(&Error::Authentication {
            node: "OCR BASE".into(),
            reason: "bad password".into(),
        });
        assert!(report.is_aborted());
        let failures = report.failures();
        assert_eq!(failures[0].item, None);
        assert_eq!(failures[0].kind, ErrorKind::Authentication);
    }
}
