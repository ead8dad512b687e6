//! WhatsApp sink via a Twilio-style messaging API.
//!
//! HTTP Basic auth with the account SID and token; `From`/`To` are
//! `whatsapp:`-prefixed numbers.  Uses the longer Twilio timeout.

use std::time::Duration;

use serde_json::json;
use ve_protocol::Event;

use crate::format::{plain_body, severity_icon};
use crate::NotifyError;

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number without the `whatsapp:` prefix.
    pub from: String,
    /// Recipient number without the `whatsapp:` prefix.
    pub to: String,
    /// Override for tests; defaults to the public Twilio API host.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppNotifier {
    client: reqwest::Client,
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
    to: String,
}

impl WhatsAppNotifier {
    pub fn new(cfg: WhatsAppConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = cfg
            .api_base
            .unwrap_or_else(|| "https://api.twilio.com".to_owned());
        Ok(WhatsAppNotifier {
            messages_url: format!("{base}/2010-04-01/Accounts/{}/Messages.json", cfg.account_sid),
            client,
            account_sid: cfg.account_sid,
            auth_token: cfg.auth_token,
            from: cfg.from,
            to: cfg.to,
        })
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let payload = json!({
            "From": format!("whatsapp:{}", self.from),
            "To": format!("whatsapp:{}", self.to),
            "Body": format!("{} {}", severity_icon(event.severity), plain_body(event)),
        });
        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                sink: "whatsapp",
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
