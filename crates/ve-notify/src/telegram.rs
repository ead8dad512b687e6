//! Telegram-style bot sink: HTTPS POST with the bot token in the path.

use std::time::Duration;

use serde_json::json;
use ve_protocol::Event;

use crate::format::{correlation_fields, severity_icon};
use crate::NotifyError;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    /// Override for tests; defaults to the public Bot API host.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    send_url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(cfg: TelegramConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = cfg
            .api_base
            .unwrap_or_else(|| "https://api.telegram.org".to_owned());
        Ok(TelegramNotifier {
            client,
            send_url: format!("{base}/bot{}/sendMessage", cfg.bot_token),
            chat_id: cfg.chat_id,
        })
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": markdown_body(event),
            "parse_mode": "Markdown",
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
                sink: "telegram",
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn markdown_body(event: &Event) -> String {
    let mut body = format!(
        "{} *{}*\n\n{}\n\n_severity:_ {}\n_source:_ {}",
        severity_icon(event.severity),
        event.title,
        event.message,
        event.severity,
        event.source,
    );
    for (label, value) in correlation_fields(event) {
        body.push_str(&format!("\n_{label}:_ {value}"));
    }
    body
}
