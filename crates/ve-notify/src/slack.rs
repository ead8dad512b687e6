//! Chat-webhook sink (Slack-compatible incoming webhook).

use std::time::Duration;

use serde_json::json;
use ve_protocol::Event;

use crate::format::{correlation_fields, severity_color, severity_icon};
use crate::NotifyError;

#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Full incoming-webhook URL.
    pub webhook_url: String,
}

#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(cfg: SlackConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(SlackNotifier {
            client,
            webhook_url: cfg.webhook_url,
        })
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let payload = build_payload(event);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                sink: "slack",
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn build_payload(event: &Event) -> serde_json::Value {
    let mut fields = vec![
        json!({"title": "Severity", "value": event.severity.as_tag(), "short": true}),
        json!({"title": "Source", "value": event.source, "short": true}),
    ];
    for (label, value) in correlation_fields(event) {
        fields.push(json!({"title": label, "value": value, "short": true}));
    }

    json!({
        "text": format!("{} *{}*", severity_icon(event.severity), event.title),
        "attachments": [{
            "color": severity_color(event.severity),
            "text": event.message,
            "fields": fields,
            "ts": event.timestamp.timestamp(),
        }],
    })
}
