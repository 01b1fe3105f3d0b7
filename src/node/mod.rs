use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Bridge, BridgeTerms, JobListing, Mutation, Node};

pub mod client;
pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod session;

pub use client::{ClientOptions, NodeClient};
pub use session::{Credentials, Session, SessionManager};

/// Typed operations against one node.
///
/// Every call runs under the node's session; implementations re-authenticate
/// at most once per call when the session is rejected mid-operation.
#[async_trait]
pub trait NodeApi: Send {
    fn node(&self) -> &Node;

    /// Establishes (or reuses) a session. Fails fast on bad credentials.
    async fn authenticate(&mut self) -> Result<()>;

    async fn list_jobs(&mut self) -> Result<JobListing>;

    /// Approves a pending spec. Approving an approved spec is a no-op success.
    async fn approve_job(&mut self, spec_id: &str) -> Result<Mutation>;

    async fn cancel_job(&mut self, spec_id: &str) -> Result<Mutation>;

    /// Force-approves a spec, including previously cancelled ones.
    async fn reapprove_job(&mut self, spec_id: &str) -> Result<Mutation>;

    async fn list_bridges(&mut self) -> Result<Vec<Bridge>>;

    async fn create_or_update_bridge(
        &mut self,
        name: &str,
        url: &str,
        terms: &BridgeTerms,
    ) -> Result<Mutation>;

    async fn delete_bridge(&mut self, name: &str) -> Result<Mutation>;
}
