//! Outbound notification sinks.
//!
//! Every sink is one-shot: `send` formats the event for its wire and makes a
//! single bounded outbound call.  There is no retry here; failed deliveries
//! are recovered by replaying from the persistent event log.
//!
//! # Credential handling
//! Tokens and passwords never appear in logs or error text.  HTTP errors are
//! stripped of their URL before propagating, since Telegram-style endpoints
//! embed the bot token in the path.

mod email;
mod format;
mod matrix;
mod slack;
mod telegram;
mod whatsapp;

pub use email::{EmailConfig, EmailNotifier};
pub use matrix::{MatrixConfig, MatrixNotifier};
pub use slack::{SlackConfig, SlackNotifier};
pub use telegram::{TelegramConfig, TelegramNotifier};
pub use whatsapp::{WhatsAppConfig, WhatsAppNotifier};

use std::time::Duration;

use thiserror::Error;
use ve_protocol::Event;

/// Default request timeout for HTTP notifier POSTs.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Twilio-style APIs are slower; they get a longer bound.
pub const TWILIO_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP transport: {0}")]
    Http(reqwest::Error),
    #[error("{sink} returned status {status}")]
    Status { sink: &'static str, status: u16 },
    #[error("SMTP: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("email build: {0}")]
    Email(#[from] lettre::error::Error),
    #[error("address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("notifier config: {0}")]
    Config(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        // Strip the URL: some endpoints carry credentials in the path/query.
        NotifyError::Http(e.without_url())
    }
}

/// The closed set of notification sinks, unified behind `send`.
#[derive(Debug, Clone)]
pub enum Notifier {
    Slack(SlackNotifier),
    Email(EmailNotifier),
    Telegram(TelegramNotifier),
    Matrix(MatrixNotifier),
    WhatsApp(WhatsAppNotifier),
}

impl Notifier {
    /// Stable sink name for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Notifier::Slack(_) => "slack",
            Notifier::Email(_) => "email",
            Notifier::Telegram(_) => "telegram",
            Notifier::Matrix(_) => "matrix",
            Notifier::WhatsApp(_) => "whatsapp",
        }
    }

    /// Format the event for this sink's wire and deliver it once.
    ///
    /// The call is bounded by the transport timeout configured at
    /// construction; any non-2xx response is a delivery failure.
    pub async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        match self {
            Notifier::Slack(n) => n.send(event).await,
            Notifier::Email(n) => n.send(event).await,
            Notifier::Telegram(n) => n.send(event).await,
            Notifier::Matrix(n) => n.send(event).await,
            Notifier::WhatsApp(n) => n.send(event).await,
        }
    }
}
