//! Matrix-style room sink: dual plain/HTML body with colour per severity.

use std::time::Duration;

use serde_json::json;
use ve_protocol::Event;

use crate::format::{correlation_fields, severity_color};
use crate::NotifyError;

#[derive(Debug, Clone)]
pub struct MatrixConfig {
    /// Homeserver base URL, e.g. `https://matrix.example.org`.
    pub homeserver_url: String,
    pub access_token: String,
    pub room_id: String,
}

#[derive(Debug, Clone)]
pub struct MatrixNotifier {
    client: reqwest::Client,
    send_url: String,
}

impl MatrixNotifier {
    pub fn new(cfg: MatrixConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let send_url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/m.room.message?access_token={}",
            cfg.homeserver_url.trim_end_matches('/'),
            cfg.room_id,
            cfg.access_token,
        );
        Ok(MatrixNotifier { client, send_url })
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let payload = json!({
            "msgtype": "m.text",
            "body": plain_summary(event),
            "format": "org.matrix.custom.html",
            "formatted_body": html_body(event),
        });
        let response = self
            .client
            .post(&self.send_url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                sink: "matrix",
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn plain_summary(event: &Event) -> String {
    let mut body = format!(
        "[{}] {}: {}",
        event.severity.as_tag().to_uppercase(),
        event.title,
        event.message,
    );
    for (label, value) in correlation_fields(event) {
        body.push_str(&format!(" | {label}: {value}"));
    }
    body
}

fn html_body(event: &Event) -> String {
    let mut body = format!(
        "<font color=\"{}\"><b>[{}] {}</b></font><br/>{}",
        severity_color(event.severity),
        event.severity.as_tag().to_uppercase(),
        event.title,
        event.message,
    );
    for (label, value) in correlation_fields(event) {
        body.push_str(&format!("<br/><i>{label}:</i> {value}"));
    }
    body
}
