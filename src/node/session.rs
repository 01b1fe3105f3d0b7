//! Per-node session handling.
//!
//! A [`SessionManager`] belongs to exactly one node client. It keeps at most
//! one live session, replaces it wholesale on re-authentication and never
//! hands a session to another node.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};

use super::http::Transport;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::NodeId;

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub struct Session {
    cookie: String,
    issued_at: Instant,
    node: NodeId,
    valid: bool,
}

impl Session {
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }

    fn is_live(&self, ttl: Duration) -> bool {
        self.valid && self.age() < ttl
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("node", &self.node)
            .field("age", &self.age())
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager {
    node: NodeId,
    transport: Transport,
    credentials: Credentials,
    retry: RetryPolicy,
    ttl: Duration,
    current: Option<Session>,
    logins: u32,
}

impl SessionManager {
    pub fn new(
        node: NodeId,
        transport: Transport,
        credentials: Credentials,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            node,
            transport,
            credentials,
            retry,
            ttl,
            current: None,
            logins: 0,
        }
    }

    /// Returns the live session, logging in first if there is none, it has
    /// expired, or it was invalidated.
    pub async fn acquire(&mut self) -> Result<&Session> {
        let reusable = self
            .current
            .as_ref()
            .is_some_and(|s| s.is_live(self.ttl));
        if !reusable {
            let session = self.login().await?;
            self.current = Some(session);
        }
        self.current
            .as_ref()
            .ok_or_else(|| Error::Unauthorized(format!("no session for {}", self.node)))
    }

    /// Marks the current session unusable; the next `acquire` logs in again.
    pub fn invalidate(&mut self) {
        if let Some(session) = self.current.as_mut() {
            debug!("Invalidating session for {}", self.node);
            session.valid = false;
        }
    }

    /// Number of successful logins so far.
    pub fn logins(&self) -> u32 {
        self.logins
    }

    async fn login(&mut self) -> Result<Session> {
        let transport = &self.transport;
        let email = self.credentials.email.as_str();
        let password = self.credentials.password.as_str();
        let operation = format!("login to {}", self.node);

        let cookie = self
            .retry
            .execute(&operation, || transport.login(email, password))
            .await
            .map_err(|e| match e {
                Error::Authentication { reason, .. } => Error::Authentication {
                    node: self.node.to_string(),
                    reason,
                },
                other => other,
            })?;

        self.logins += 1;
        info!("Authenticated with {} ({})", self.node, self.transport.base_url());
        Ok(Session {
            cookie,
            issued_at: Instant::now(),
            node: self.node.clone(),
            valid: true,
        })
    }
}
