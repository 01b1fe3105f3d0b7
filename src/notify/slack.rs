use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{check_delivery, Event, EventKind, Notifier};
use crate::error::Result;

/// Posts a text rendering of every event to an incoming webhook.
pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(http: Client, webhook_url: &str) -> Self {
        Self {
            http,
            webhook_url: webhook_url.to_string(),
        }
    }
}

pub fn render(event: &Event) -> String {
    let prefix = match event.kind {
        EventKind::PassSucceeded => ":white_check_mark:",
        EventKind::PassFailed => ":warning:",
        EventKind::IncidentOpened => "@channel :rotating_light:",
        EventKind::IncidentResolved => ":large_green_circle:",
    };
    if event.details.is_empty() {
        format!("{prefix} {}", event.summary)
    } else {
        format!("{prefix} {}\n```{}```", event.summary, event.details.join("\n"))
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(&self, event: &Event) -> Result<()> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&json!({ "text": render(event) }))
            .send()
            .await?;
        check_delivery("slack", response).await
    }
}
