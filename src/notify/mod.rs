//! Outbound alerting.
//!
//! Passes and incident transitions become [`Event`]s, which a [`Dispatcher`]
//! hands to every configured [`Notifier`] concurrently. Delivery failures
//! are logged and never fail the pass that produced the event.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::incident::{IncidentEvent, Transition};
use crate::report::{Outcome, PassReport};
use crate::retry::RetryPolicy;
use crate::types::NodeId;

pub mod pagerduty;
pub mod slack;

pub use pagerduty::PagerDutyNotifier;
pub use slack::SlackNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PassSucceeded,
    PassFailed,
    IncidentOpened,
    IncidentResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub node: NodeId,
    pub summary: String,
    pub details: Vec<String>,
    /// Signature of the incident behind an incident event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<String>,
}

impl Event {
    /// Summary of a pass, or `None` when nothing was applied or failed.
    pub fn from_report(report: &PassReport) -> Option<Self> {
        let counts = report.counts();
        if let Some(abort) = &report.aborted {
            return Some(Self {
                kind: EventKind::PassFailed,
                severity: Severity::Warning,
                node: report.node.clone(),
                summary: format!("{} pass aborted on {}", report.action, report.node),
                details: vec![abort.detail.clone()],
                incident: None,
            });
        }
        if counts.applied == 0 && counts.failed == 0 {
            return None;
        }

        let mut details = Vec::new();
        for item in &report.items {
            match &item.outcome {
                Outcome::Applied => details.push(format!("{}: {}", item.target, item.label)),
                Outcome::Failed { kind, detail } => details.push(format!(
                    "{}: {} failed ({}): {}",
                    item.target, item.label, kind, detail
                )),
                Outcome::Planned | Outcome::Unchanged => {}
            }
        }

        let (kind, severity, summary) = if counts.failed > 0 {
            (
                EventKind::PassFailed,
                Severity::Warning,
                format!(
                    "{} on {}: {} applied, {} failed",
                    report.action, report.node, counts.applied, counts.failed
                ),
            )
        } else {
            (
                EventKind::PassSucceeded,
                Severity::Info,
                format!("{} on {}: {} applied", report.action, report.node, counts.applied),
            )
        };

        Some(Self {
            kind,
            severity,
            node: report.node.clone(),
            summary,
            details,
            incident: None,
        })
    }

    pub fn from_incident(event: &IncidentEvent) -> Self {
        let incident = &event.incident;
        let subject = match &incident.key.item {
            Some(item) => format!(
                "{} failure for {} on {}",
                incident.key.kind, item, incident.key.node
            ),
            None => format!("{} failure on {}", incident.key.kind, incident.key.node),
        };
        match event.transition {
            Transition::Opened => Self {
                kind: EventKind::IncidentOpened,
                severity: Severity::Critical,
                node: incident.key.node.clone(),
                summary: format!("Incident opened: {subject}"),
                details: vec![incident.last_error.clone()],
                incident: Some(incident.key.signature()),
            },
            Transition::Resolved => Self {
                kind: EventKind::IncidentResolved,
                severity: Severity::Info,
                node: incident.key.node.clone(),
                summary: format!("Incident resolved: {subject}"),
                details: vec![format!(
                    "open since {} across {} pass(es)",
                    incident.opened_at.format("%Y-%m-%d %H:%M UTC"),
                    incident.count
                )],
                incident: Some(incident.key.signature()),
            },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &Event) -> Result<()>;
}

/// Writes every event to the log. Always installed.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &Event) -> Result<()> {
        match event.severity {
            Severity::Info => info!("[{}] {}", event.node, event.summary),
            Severity::Warning => warn!("[{}] {}", event.node, event.summary),
            Severity::Critical => error!("[{}] {}", event.node, event.summary),
        }
        for detail in &event.details {
            debug!("[{}]   {}", event.node, detail);
        }
        Ok(())
    }
}

pub struct Dispatcher {
    sinks: Vec<Box<dyn Notifier>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            sinks: vec![Box::new(LogNotifier)],
            retry,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log sink plus whichever webhooks are configured, unless notifications
    /// are suppressed.
    pub fn from_config(config: &Config, suppress: bool) -> Result<Self> {
        let mut dispatcher = Self::new(config.retry.clone());
        if suppress || config.suppress_notifications {
            info!("Notifications are suppressed; events go to the log only");
            return Ok(dispatcher);
        }

        let http = http_client(Duration::from_secs(config.request_timeout_secs))?;
        if let Some(url) = &config.slack_webhook {
            dispatcher = dispatcher.with_sink(Box::new(SlackNotifier::new(http.clone(), url)));
        }
        if let Some(key) = &config.pagerduty_routing_key {
            dispatcher = dispatcher.with_sink(Box::new(PagerDutyNotifier::new(http, key)));
        }
        Ok(dispatcher)
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Delivers `event` to every sink. Returns how many sinks accepted it.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let operation = format!("{} notification", sink.name());
            let result = self.retry.execute(&operation, || sink.notify(event)).await;
            if let Err(e) = &result {
                error!("Failed to deliver '{}' via {}: {}", event.summary, sink.name(), e);
            }
            result.is_ok()
        });
        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("jobkeeper/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Maps a webhook response onto the error taxonomy.
pub(crate) async fn check_delivery(sink: &str, response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{sink} returned {status}: {}", body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(Error::Network(detail))
    } else {
        Err(Error::Remote(detail))
    }
}
