//! In-memory [`NodeApi`] for unit tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use super::NodeApi;
use crate::error::{Error, Result};
use crate::types::{Bridge, BridgeTerms, Job, JobListing, JobStatus, Mutation, Node, NodeId};

pub struct MockNode {
    pub node: Node,
    pub jobs: Vec<Job>,
    pub bridges: BTreeMap<String, String>,
    /// Terms of the most recent bridge upsert.
    pub last_terms: Option<BridgeTerms>,
    pub undetermined: Vec<String>,
    /// Every mutating call, as `"<method> <target>"`.
    pub calls: Vec<String>,
    pub reads: usize,
    /// Targets whose mutation fails with the given error.
    pub failures: HashMap<String, fn() -> Error>,
    pub auth_failure: Option<fn() -> Error>,
    pub list_failure: Option<fn() -> Error>,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            node: Node {
                id: NodeId::new("ocr", "base"),
                url: "http://node.test".into(),
                credential_index: "1".into(),
                bridge_groups: Vec::new(),
            },
            jobs: Vec::new(),
            bridges: BTreeMap::new(),
            last_terms: None,
            undetermined: Vec::new(),
            calls: Vec::new(),
            reads: 0,
            failures: HashMap::new(),
            auth_failure: None,
            list_failure: None,
        }
    }

    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.node.bridge_groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_job(mut self, id: &str, name: &str, status: JobStatus) -> Self {
        self.jobs.push(job(id, name, status));
        self
    }

    pub fn with_bridge(mut self, name: &str, url: &str) -> Self {
        self.bridges.insert(name.into(), url.into());
        self
    }

    pub fn fail(mut self, target: &str, error: fn() -> Error) -> Self {
        self.failures.insert(target.into(), error);
        self
    }

    pub fn mutations(&self) -> usize {
        self.calls.len()
    }

    fn record(&mut self, method: &str, target: &str) -> Result<()> {
        self.calls.push(format!("{method} {target}"));
        match self.failures.get(target) {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

pub fn job(id: &str, name: &str, status: JobStatus) -> Job {
    Job {
        id: id.into(),
        name: name.into(),
        address: crate::matcher::first_address(name),
        spec_id: Some(format!("{id}0")),
        latest_spec_status: Some(status.clone()),
        status,
        pending_update: false,
        manager: Some("fms".into()),
    }
}

#[async_trait]
impl NodeApi for MockNode {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn authenticate(&mut self) -> Result<()> {
        match self.auth_failure {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }

    async fn list_jobs(&mut self) -> Result<JobListing> {
        self.reads += 1;
        if let Some(error) = self.list_failure {
            return Err(error());
        }
        Ok(JobListing {
            jobs: self.jobs.clone(),
            undetermined: self.undetermined.clone(),
        })
    }

    async fn approve_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.record("approve", spec_id)?;
        Ok(Mutation::Applied)
    }

    async fn cancel_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.record("cancel", spec_id)?;
        Ok(Mutation::Applied)
    }

    async fn reapprove_job(&mut self, spec_id: &str) -> Result<Mutation> {
        self.record("reapprove", spec_id)?;
        Ok(Mutation::Applied)
    }

    async fn list_bridges(&mut self) -> Result<Vec<Bridge>> {
        self.reads += 1;
        if let Some(error) = self.list_failure {
            return Err(error());
        }
        Ok(self
            .bridges
            .iter()
            .map(|(name, url)| Bridge {
                name: name.clone(),
                url: url.clone(),
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
        self.record("upsert", name)?;
        self.last_terms = Some(terms.clone());
        match self.bridges.insert(name.into(), url.into()) {
            Some(previous) if previous == url => Ok(Mutation::Unchanged),
            _ => Ok(Mutation::Applied),
        }
    }

    async fn delete_bridge(&mut self, name: &str) -> Result<Mutation> {
        self.record("delete", name)?;
        match self.bridges.remove(name) {
            Some(_) => Ok(Mutation::Applied),
            None => Err(Error::NotFound(format!("bridge {name}"))),
        }
    }
}
