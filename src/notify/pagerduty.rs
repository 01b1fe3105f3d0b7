//! PagerDuty Events API v2 sink.
//!
//! Only incident events are forwarded: an opened incident triggers an alert
//! and a resolved one resolves it. Both use the same dedup key, derived from
//! the incident signature, so PagerDuty correlates them.

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{check_delivery, Event, EventKind, Notifier, Severity};
use crate::error::Result;

pub const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

pub struct PagerDutyNotifier {
    http: Client,
    routing_key: String,
    endpoint: String,
}

impl PagerDutyNotifier {
    pub fn new(http: Client, routing_key: &str) -> Self {
        Self::with_endpoint(http, routing_key, EVENTS_URL)
    }

    pub fn with_endpoint(http: Client, routing_key: &str, endpoint: &str) -> Self {
        Self {
            http,
            routing_key: routing_key.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// `jobkeeper-` plus the first 32 hex digits of the signature's SHA-256.
pub fn dedup_key(signature: &str) -> String {
    let digest = Sha256::digest(signature.as_bytes());
    format!("jobkeeper-{}", &hex::encode(digest)[..32])
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    fn name(&self) -> &str {
        "pagerduty"
    }

    async fn notify(&self, event: &Event) -> Result<()> {
        let action = match event.kind {
            EventKind::IncidentOpened => "trigger",
            EventKind::IncidentResolved => "resolve",
            EventKind::PassSucceeded | EventKind::PassFailed => return Ok(()),
        };
        let Some(signature) = event.incident.as_deref() else {
            return Ok(());
        };

        let severity = match event.severity {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        let body = json!({
            "routing_key": self.routing_key,
            "event_action": action,
            "dedup_key": dedup_key(signature),
            "payload": {
                "summary": event.summary,
                "severity": severity,
                "source": event.node.slug(),
                "custom_details": {
                    "signature": signature,
                    "details": event.details,
                },
            },
        });

        debug!("Sending PagerDuty {} for {}", action, signature);
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        check_delivery("pagerduty", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_and_short() {
        let a = dedup_key("OCR_BASE:network:5");
        assert_eq!(a, dedup_key("OCR_BASE:network:5"));
        assert_ne!(a, dedup_key("OCR_BASE:network:6"));
        assert_eq!(a.len(), "jobkeeper-".len() + 32);
        assert!(a["jobkeeper-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
