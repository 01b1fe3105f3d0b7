//! Data structures used throughout the reconciler.
//!
//! Nodes come from configuration and are immutable for a pass. Jobs and
//! bridges are read-only snapshots of what a node reported; they are never
//! mutated locally, only through explicit calls against the node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Service/network pair identifying one node, e.g. `OCR ETHEREUM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub service: String,
    pub network: String,
}

impl NodeId {
    pub fn new(service: impl AsRef<str>, network: impl AsRef<str>) -> Self {
        Self {
            service: service.as_ref().to_uppercase(),
            network: network.as_ref().to_uppercase(),
        }
    }

    /// `SERVICE_NETWORK`, used as a stable key fragment.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.service, self.network)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.service, self.network)
    }
}

/// A remotely hosted node as described by the node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    pub credential_index: String,
    /// Bridge groups in configured order; later groups win URL conflicts.
    pub bridge_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Approved,
    Cancelled,
    /// Any other node-reported value, kept verbatim.
    Other(String),
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.to_uppercase().as_str() {
            "PENDING" => JobStatus::Pending,
            "APPROVED" => JobStatus::Approved,
            "CANCELLED" | "CANCELED" => JobStatus::Cancelled,
            _ => JobStatus::Other(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(s: JobStatus) -> Self {
        s.to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => f.write_str("PENDING"),
            JobStatus::Approved => f.write_str("APPROVED"),
            JobStatus::Cancelled => f.write_str("CANCELLED"),
            JobStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Snapshot of one job proposal on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    /// First hex-address token of the job name, if any.
    pub address: Option<String>,
    /// Latest spec id; approve/cancel act on this.
    pub spec_id: Option<String>,
    pub latest_spec_status: Option<JobStatus>,
    pub pending_update: bool,
    /// Feeds manager the proposal was read from.
    pub manager: Option<String>,
}

impl Job {
    /// Awaiting approval: a new proposal, or an update to an approved one.
    pub fn needs_approval(&self) -> bool {
        self.status == JobStatus::Pending || self.latest_spec_status == Some(JobStatus::Pending)
    }
}

/// Result of reading a node's jobs. `undetermined` lists sources that could
/// not be read, so callers can tell "absent" from "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobListing {
    pub jobs: Vec<Job>,
    pub undetermined: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    pub url: String,
    /// Owning group for required bridges; `None` for bridges read from a node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Payment terms sent with a bridge create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTerms {
    pub confirmations: u32,
    /// Decimal amount, passed to the node as a string.
    pub minimum_payment: String,
}

impl Default for BridgeTerms {
    fn default() -> Self {
        Self {
            confirmations: 0,
            minimum_payment: "0".into(),
        }
    }
}

/// What a mutation did on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Applied,
    /// The node was already in the requested state.
    Unchanged,
}

/// Whether a pass may mutate remote state. Fixed for a whole pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DryRun,
    Execute,
}

impl Mode {
    pub fn from_execute(execute: bool) -> Self {
        if execute {
            Mode::Execute
        } else {
            Mode::DryRun
        }
    }

    pub fn is_execute(self) -> bool {
        self == Mode::Execute
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::DryRun => f.write_str("dry-run"),
            Mode::Execute => f.write_str("execute"),
        }
    }
}
