use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// The closed set of event discriminants.
///
/// Wire tags are the snake_case variant names (e.g. `verification_started`).
/// Unknown tags are rejected at parse time; gateways discard them silently
/// during subscription negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VerificationStarted,
    VerificationCompleted,
    VerificationFailed,
    ScoreChanged,
    ModelAdded,
    ModelRemoved,
    ProviderAdded,
    ProviderRemoved,
    IssueDetected,
    IssueResolved,
    ConfigExported,
    ClientConnected,
    ClientDisconnected,
    SystemHealthChanged,
    SecurityAlert,
}

impl EventKind {
    /// Every known kind, in declaration order.
    pub const ALL: [EventKind; 15] = [
        EventKind::VerificationStarted,
        EventKind::VerificationCompleted,
        EventKind::VerificationFailed,
        EventKind::ScoreChanged,
        EventKind::ModelAdded,
        EventKind::ModelRemoved,
        EventKind::ProviderAdded,
        EventKind::ProviderRemoved,
        EventKind::IssueDetected,
        EventKind::IssueResolved,
        EventKind::ConfigExported,
        EventKind::ClientConnected,
        EventKind::ClientDisconnected,
        EventKind::SystemHealthChanged,
        EventKind::SecurityAlert,
    ];

    /// The stable snake_case wire tag.
    pub fn as_tag(self) -> &'static str {
        match self {
            EventKind::VerificationStarted => "verification_started",
            EventKind::VerificationCompleted => "verification_completed",
            EventKind::VerificationFailed => "verification_failed",
            EventKind::ScoreChanged => "score_changed",
            EventKind::ModelAdded => "model_added",
            EventKind::ModelRemoved => "model_removed",
            EventKind::ProviderAdded => "provider_added",
            EventKind::ProviderRemoved => "provider_removed",
            EventKind::IssueDetected => "issue_detected",
            EventKind::IssueResolved => "issue_resolved",
            EventKind::ConfigExported => "config_exported",
            EventKind::ClientConnected => "client_connected",
            EventKind::ClientDisconnected => "client_disconnected",
            EventKind::SystemHealthChanged => "system_health_changed",
            EventKind::SecurityAlert => "security_alert",
        }
    }
}

/// Error returned when parsing an unrecognized kind or severity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tag: {}", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for EventKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_tag() == s)
            .ok_or_else(|| UnknownKind(s.to_owned()))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Totally-ordered severity level.
///
/// The derived `Ord` follows declaration order, so
/// `Severity::Debug < Severity::Critical` holds and threshold filters can
/// use plain comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_tag(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for Severity {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

fn default_source() -> String {
    "system".to_owned()
}

/// A structured event record.  Immutable once published.
///
/// Serialization is the canonical wire form: snake_case keys, RFC 3339
/// timestamps, absent correlation handles omitted.  An empty `id` means
/// "not yet assigned"; the bus derives one from `(timestamp, kind)` at
/// publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Empty means "not yet assigned"; omitted from the wire in that case.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub kind: EventKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    /// Ordered string-keyed details; JSON-compatible values only.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Construct an event with the wall clock captured now.
    ///
    /// Construction never fails; the bus validates (non-empty title and
    /// message) once, at publish time.
    pub fn new(
        kind: EventKind,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Event {
            id: String::new(),
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            details: serde_json::Map::new(),
            model_id: None,
            provider_id: None,
            verification_id: None,
            issue_id: None,
            client_id: None,
            user_id: None,
            source: default_source(),
            timestamp: Utc::now(),
            processed_at: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_verification(mut self, verification_id: impl Into<String>) -> Self {
        self.verification_id = Some(verification_id.into());
        self
    }

    pub fn with_issue(mut self, issue_id: impl Into<String>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Derive a stable event id from the capture timestamp and kind.
pub fn derive_event_id(timestamp: DateTime<Utc>, kind: EventKind) -> String {
    let nanos = timestamp.timestamp_nanos_opt().unwrap_or_default();
    format!("evt-{nanos}-{}", kind.as_tag())
}
