//! GraphQL/REST client for one node.
//!
//! Jobs are read and mutated through the node's GraphQL endpoint, bridges
//! through its REST API. Every call goes through [`NodeClient::call`], which
//! applies the retry policy to network failures and re-authenticates exactly
//! once if the node rejects the session.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::Transport;
use super::session::{Credentials, SessionManager};
use super::NodeApi;
use crate::error::{Error, Result};
use crate::matcher::first_address;
use crate::retry::RetryPolicy;
use crate::types::{Bridge, BridgeTerms, Job, JobListing, JobStatus, Mutation, Node};

const FEEDS_MANAGERS_QUERY: &str = r#"
query FetchFeedsManagers {
    feedsManagers {
        results {
            id
            name
        }
    }
}"#;

const JOB_PROPOSALS_QUERY: &str = r#"
query FetchFeedManagerWithProposals($id: ID!) {
    feedsManager(id: $id) {
        __typename
        ... on FeedsManager {
            jobProposals {
                id
                name
                status
                pendingUpdate
                latestSpec {
                    id
                    status
                }
            }
        }
        ... on NotFoundError {
            message
        }
    }
}"#;

const APPROVE_MUTATION: &str = r#"
mutation ApproveJobProposalSpec($id: ID!, $force: Boolean) {
    approveJobProposalSpec(id: $id, force: $force) {
        __typename
        ... on NotFoundError {
            message
        }
        ... on StatusConflictError {
            message
        }
    }
}"#;

const CANCEL_MUTATION: &str = r#"
mutation CancelJobProposalSpec($id: ID!) {
    cancelJobProposalSpec(id: $id) {
        __typename
        ... on NotFoundError {
            message
        }
        ... on StatusConflictError {
            message
        }
    }
}"#;

const BRIDGES_PATH: &str = "/v2/bridge_types";

/// Knobs for building a [`NodeClient`] from configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub session_ttl: Duration,
    pub accept_invalid_certs: bool,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(15 * 60),
            accept_invalid_certs: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Results<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedsManagersData {
    feeds_managers: Results<FeedsManager>,
}

#[derive(Debug, Clone, Deserialize)]
struct FeedsManager {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedsManagerData {
    feeds_manager: FeedsManagerPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedsManagerPayload {
    #[serde(rename = "__typename", default)]
    typename: Option<String>,
    #[serde(default)]
    job_proposals: Option<Vec<JobProposal>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobProposal {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    pending_update: bool,
    #[serde(default)]
    latest_spec: Option<SpecRef>,
}

#[derive(Debug, Deserialize)]
struct SpecRef {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

impl JobProposal {
    fn into_job(self, manager: &str) -> Job {
        let name = self.name.unwrap_or_default();
        Job {
            address: first_address(&name),
            id: self.id,
            name,
            status: JobStatus::from(self.status),
            spec_id: self.latest_spec.as_ref().map(|s| s.id.clone()),
            latest_spec_status: self
                .latest_spec
                .and_then(|s| s.status)
                .map(JobStatus::from),
            pending_update: self.pending_update,
            manager: Some(manager.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeResource {
    attributes: BridgeAttributes,
}

#[derive(Debug, Deserialize)]
struct BridgeAttributes {
    name: String,
    #[serde(default)]
    url: String,
}

pub struct NodeClient {
    node: Node,
    transport: Transport,
    sessions: SessionManager,
    retry: RetryPolicy,
}

impl NodeClient {
    pub fn new(node: Node, credentials: Credentials, options: &ClientOptions) -> Result<Self> {
        let transport = Transport::new(
            &node.url,
            options.request_timeout,
            options.accept_invalid_certs,
        )?;
        Ok(Self::with_transport(
            node,
            transport,
            credentials,
            options.retry.clone(),
            options.session_ttl,
        ))
    }

    pub fn with_transport(
        node: Node,
        transport: Transport,
        credentials: Credentials,
        retry: RetryPolicy,
        session_ttl: Duration,
    ) -> Self {
        let sessions = SessionManager::new(
            node.id.clone(),
            transport.clone(),
            credentials,
            retry.clone(),
            session_ttl,
        );
        Self {
            node,
            transport,
            sessions,
            retry,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Runs `f` with the current session cookie under the retry policy. A
    /// rejected session triggers one re-authentication and one more try; a
    /// second rejection is surfaced as an authentication failure.
    async fn call<T, F, Fut>(&mut self, operation: &str, f: F) -> Result<T>
    where
        F: Fn(Transport, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transport = self.transport.clone();
        let cookie = self.sessions.acquire().await?.cookie().to_string();
        let first = self
            .retry
            .execute(operation, || f(transport.clone(), cookie.clone()))
            .await;

        let reason = match first {
            Err(Error::Unauthorized(reason)) => reason,
            other => return other,
        };

        warn!(
            "{}: session rejected during {} ({}), re-authenticating",
            self.node.id, operation, reason
        );
        self.sessions.invalidate();
        let cookie = self.sessions.acquire().await?.cookie().to_string();
        let second = self
            .retry
            .execute(operation, || f(transport.clone(), cookie.clone()))
            .await;

        match second {
            Err(Error::Unauthorized(reason)) => {
                self.sessions.invalidate();
                Err(Error::Authentication {
                    node: self.node.id.to_string(),
                    reason: format!("session rejected again after re-authentication: {reason}"),
                })
            }
            other => other,
        }
    }

    async fn feeds_managers(&mut self) -> Result<Vec<FeedsManager>> {
        let data = self
            .call("list feeds managers", |t, cookie| async move {
                t.graphql(&cookie, FEEDS_MANAGERS_QUERY, json!({})).await
            })
            .await?;
        let parsed: FeedsManagersData = serde_json::from_value(data)
            .map_err(|e| Error::Remote(format!("unexpected feeds managers payload: {e}")))?;
        Ok(parsed.feeds_managers.results)
    }

    async fn job_proposals(&mut self, manager: &FeedsManager) -> Result<Vec<Job>> {
        let variables = json!({ "id": manager.id });
        let data = self
            .call("fetch job proposals", move |t, cookie| {
                let variables = variables.clone();
                async move { t.graphql(&cookie, JOB_PROPOSALS_QUERY, variables).await }
            })
            .await?;
        let parsed: FeedsManagerData = serde_json::from_value(data)
            .map_err(|e| Error::Remote(format!("unexpected job proposals payload: {e}")))?;

        let payload = parsed.feeds_manager;
        if payload.typename.as_deref() == Some("NotFoundError") {
            return Err(Error::NotFound(format!(
                "feeds manager {}: {}",
                manager.id,
                payload.message.unwrap_or_default()
            )));
        }
        Ok(payload
            .job_proposals
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.into_job(&manager.name))
            .collect())
    }

    async fn spec_mutation(
        &mut self,
        operation: &str,
        document: &'static str,
        field: &str,
        variables: Value,
    ) -> Result<Mutation> {
        let data = self
            .call(operation, move |t, cookie| {
                let variables = variables.clone();
                async move { t.graphql(&cookie, document, variables).await }
            })
            .await?;
        mutation_outcome(operation, &data[field])
    }

    async fn get_bridge(&mut self, name: &str) -> Result<Option<Bridge>> {
        let path = bridge_path(name);
        let result = self
            .call("get bridge", move |t, cookie| {
                let path = path.clone();
                async move { t.rest(&cookie, Method::GET, &path, None).await }
            })
            .await;
        match result {
            Ok(value) => {
                let resource: BridgeResource = serde_json::from_value(value["data"].clone())
                    .map_err(|e| Error::Remote(format!("unexpected bridge payload: {e}")))?;
                Ok(Some(Bridge {
                    name: resource.attributes.name,
                    url: resource.attributes.url,
                    group: None,
                }))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn mutation_outcome(operation: &str, payload: &Value) -> Result<Mutation> {
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match payload.get("__typename").and_then(Value::as_str) {
        Some(t) if t.ends_with("Success") => Ok(Mutation::Applied),
        Some("StatusConflictError") => {
            debug!("{operation}: already in requested state ({message})");
            Ok(Mutation::Unchanged)
        }
        Some("NotFoundError") => Err(Error::NotFound(format!("{operation}: {message}"))),
        Some(other) => Err(Error::Remote(format!(
            "{operation}: unexpected result {other} {message}"
        ))),
        None => Err(Error::Remote(format!("{operation}: empty mutation result"))),
    }
}

fn bridge_path(name: &str) -> String {
    format!("{BRIDGES_PATH}/{}", urlencoding::encode(name))
}

fn bridge_body(name: &str, url: &str, terms: &BridgeTerms) -> Value {
    json!({
        "name": name,
        "url": url,
        "confirmations": terms.confirmations,
        "minimumContractPayment": terms.minimum_payment,
    })
}

#[async_trait]
impl NodeApi for NodeClient {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn authenticate(&mut self) -> Result<()> {
        self.sessions.acquire().await.map(|_| ())
    }

    async fn list_jobs(&mut self) -> Result<JobListing> {
        let managers = self.feeds_managers().await?;
        let mut listing = JobListing::default();

        for manager in &managers {
            debug!("Fetching job proposals for {} on {}", manager.name, self.node.id);
            match self.job_proposals(manager).await {
                Ok(jobs) => listing.jobs.extend(jobs),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "Could not read job proposals for {} on {}: {}",
                        manager.name, self.node.id, e
                    );
                    listing
                        .undetermined
                        .push(format!("feeds manager {} ({}): {}", manager.name, manager.id, e));
                }
            }
        }
        Ok(listing)
    }

    async fn approve_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.spec_mutation(
            "approve job",
            APPROVE_MUTATION,
            "approveJobProposalSpec",
            json!({ "id": spec_id, "force": false }),
        )
        .await
    }

    async fn cancel_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.spec_mutation(
            "cancel job",
            CANCEL_MUTATION,
            "cancelJobProposalSpec",
            json!({ "id": spec_id }),
        )
        .await
    }

    async fn reapprove_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.spec_mutation(
            "reapprove job",
            APPROVE_MUTATION,
            "approveJobProposalSpec",
            json!({ "id": spec_id, "force": true }),
        )
        .await
    }

    async fn list_bridges(&mut self) -> Result<Vec<Bridge>> {
        let value = self
            .call("list bridges", |t, cookie| async move {
                t.rest(&cookie, Method::GET, BRIDGES_PATH, None).await
            })
            .await?;
        let resources: Vec<BridgeResource> =
            serde_json::from_value(value.get("data").cloned().unwrap_or(Value::Array(vec![])))
                .map_err(|e| Error::Remote(format!("unexpected bridge list payload: {e}")))?;
        Ok(resources
            .into_iter()
            .map(|r| Bridge {
                name: r.attributes.name,
                url: r.attributes.url,
                group: None,
            })
            .collect())
    }

    async fn create_or_update_bridge(
        &mut self,
        name: &str,
        url: &str,
        terms: &BridgeTerms,
    ) -> Result<Mutation> {
        let body = bridge_body(name, url, terms);
        match self.get_bridge(name).await? {
            Some(existing) if existing.url == url => {
                debug!("Bridge '{}' already points at {}", name, url);
                Ok(Mutation::Unchanged)
            }
            Some(existing) => {
                info!(
                    "Updating bridge '{}' on {}: {} -> {}",
                    name, self.node.id, existing.url, url
                );
                let path = bridge_path(name);
                self.call("update bridge", move |t, cookie| {
                    let path = path.clone();
                    let body = body.clone();
                    async move { t.rest(&cookie, Method::PATCH, &path, Some(&body)).await }
                })
                .await?;
                Ok(Mutation::Applied)
            }
            None => {
                info!("Creating bridge '{}' on {} -> {}", name, self.node.id, url);
                self.call("create bridge", move |t, cookie| {
                    let body = body.clone();
                    async move { t.rest(&cookie, Method::POST, BRIDGES_PATH, Some(&body)).await }
                })
                .await?;
                Ok(Mutation::Applied)
            }
        }
    }

    async fn delete_bridge(&mut self, name: &str) -> Result<Mutation> {
        let path = bridge_path(name);
        self.call("delete bridge", move |t, cookie| {
            let path = path.clone();
            async move { t.rest(&cookie, Method::DELETE, &path, None).await }
        })
        .await?;
        info!("Deleted bridge '{}' on {}", name, self.node.id);
        Ok(Mutation::Applied)
    }
}
