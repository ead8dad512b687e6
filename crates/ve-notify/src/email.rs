//! E-mail sink over SMTP with AUTH PLAIN.

use std::fmt;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use ve_protocol::Event;

use crate::format::plain_body;
use crate::NotifyError;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

#[derive(Clone)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The transport holds credentials; keep it out of debug output.
        f.debug_struct("EmailNotifier")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    pub fn new(cfg: EmailConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(cfg.username, cfg.password))
            .authentication(vec![Mechanism::Plain])
            .timeout(Some(timeout))
            .build();
        Ok(EmailNotifier {
            transport,
            from: cfg.from.parse()?,
            to: cfg.to.parse()?,
        })
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject_line(event))
            .body(plain_body(event))?;
        self.transport.send(message).await?;
        Ok(())
    }
}

fn subject_line(event: &Event) -> String {
    format!(
        "[{}] {}",
        event.severity.as_tag().to_uppercase(),
        event.title
    )
}
