//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/eventd/eventd.toml`.  Every option has a
//! working default, so an empty file is a valid development config (it
//! accepts all WebSocket origins and configures no notification sinks).
//!
//! The core components receive plain structs built here; config loading
//! never leaks past this module.

use std::path::Path;
use std::time::Duration;

use event_core::{BusConfig, LivenessHorizons};
use serde::Deserialize;
use thiserror::Error;
use ve_protocol::{EventKind, Severity};

/// Upper bound for `retention.audit_retention_hours` (10 years).  Keeps
/// the seconds conversion and downstream date arithmetic far from any
/// overflow edge while allowing any sane retention policy.
pub const MAX_AUDIT_RETENTION_HOURS: u64 = 10 * 365 * 24;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO: {0}")]
    Io(String),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct EventdConfig {
    /// SQLite event log path.
    pub store_path: String,
    /// Bind address for the HTTP listener (`/ws`, `/health`, `/metrics`).
    pub http_bind: String,
    /// Bind address for the gRPC listener.
    pub grpc_bind: String,
    pub bus: BusSettings,
    pub ws: WsSettings,
    pub grpc: GrpcSettings,
    pub notifiers: NotifierSettings,
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub intake_capacity: usize,
    /// 0 means the runtime default.
    pub worker_count: usize,
    pub subscriber_queue_capacity: usize,
    pub reaper_interval: Duration,
    pub ws_idle_max: Duration,
    pub rpc_idle_max: Duration,
    pub notifier_idle_max: Duration,
}

impl BusSettings {
    /// The bus-facing view of these settings.
    pub fn to_bus_config(&self) -> BusConfig {
        BusConfig {
            intake_capacity: self.intake_capacity,
            worker_count: self.worker_count,
            subscriber_queue_capacity: self.subscriber_queue_capacity,
            reaper_interval: self.reaper_interval,
            horizons: LivenessHorizons {
                ws_idle_max: self.ws_idle_max,
                rpc_idle_max: self.rpc_idle_max,
                notifier_idle_max: self.notifier_idle_max,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Origin allowlist: exact entries, `*`, or `*.suffix` wildcards.
    /// Empty means development mode (accept all; warned at startup).
    pub allowed_origins: Vec<String>,
    /// Sliding inbound deadline; refreshed by any frame or pong.
    pub read_deadline: Duration,
    /// Per-frame outbound deadline.
    pub write_deadline: Duration,
    /// Server-initiated ping cadence; must stay below the read deadline.
    pub ping_interval: Duration,
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct GrpcSettings {
    pub max_streams: u32,
    /// HTTP/2 keepalive ping cadence.
    pub keepalive_interval: Duration,
    /// How long to wait for a keepalive ack before closing.
    pub keepalive_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub http_timeout: Duration,
    pub twilio_http_timeout: Duration,
    pub sinks: Vec<SinkConfig>,
}

/// One configured notification sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub transport: SinkTransport,
    pub min_severity: Severity,
    /// Empty means all kinds.
    pub interested_kinds: Vec<EventKind>,
}

#[derive(Debug, Clone)]
pub enum SinkTransport {
    Slack(ve_notify::SlackConfig),
    Email(ve_notify::EmailConfig),
    Telegram(ve_notify::TelegramConfig),
    Matrix(ve_notify::MatrixConfig),
    WhatsApp(ve_notify::WhatsAppConfig),
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// `None` means unbounded: the log is never pruned.
    pub audit_retention: Option<Duration>,
    pub prune_interval: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    store_path: Option<String>,
    http_bind: Option<String>,
    grpc_bind: Option<String>,
    bus: Option<RawBus>,
    ws: Option<RawWs>,
    grpc: Option<RawGrpc>,
    notifier: Option<RawNotifierDefaults>,
    #[serde(default)]
    notifiers: Vec<RawSink>,
    retention: Option<RawRetention>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBus {
    intake_capacity: Option<usize>,
    worker_count: Option<usize>,
    subscriber_queue_capacity: Option<usize>,
    reaper_interval_secs: Option<u64>,
    ws_idle_max_secs: Option<u64>,
    rpc_idle_max_secs: Option<u64>,
    notifier_idle_max_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWs {
    allowed_origins: Option<Vec<String>>,
    read_deadline_secs: Option<u64>,
    write_deadline_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    max_message_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGrpc {
    max_streams: Option<u32>,
    keepalive_interval_secs: Option<u64>,
    keepalive_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNotifierDefaults {
    http_timeout_secs: Option<u64>,
    twilio_http_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawSink {
    Slack {
        webhook_url: String,
        min_severity: Option<String>,
        types: Option<Vec<String>>,
    },
    Email {
        smtp_host: String,
        smtp_port: Option<u16>,
        username: String,
        password: String,
        from: String,
        to: String,
        min_severity: Option<String>,
        types: Option<Vec<String>>,
    },
    Telegram {
        bot_token: String,
        chat_id: String,
        min_severity: Option<String>,
        types: Option<Vec<String>>,
    },
    Matrix {
        homeserver_url: String,
        access_token: String,
        room_id: String,
        min_severity: Option<String>,
        types: Option<Vec<String>>,
    },
    Whatsapp {
        account_sid: String,
        auth_token: String,
        from: String,
        to: String,
        min_severity: Option<String>,
        types: Option<Vec<String>>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawRetention {
    audit_retention_hours: Option<u64>,
    prune_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<EventdConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/eventd/eventd.toml`.
pub fn load_config() -> Result<EventdConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/eventd/eventd.toml"))
}

/// Load config from a TOML string, applying defaults for absent fields.
pub fn load_config_from_str(toml_str: &str) -> Result<EventdConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;

    let bus = raw.bus.unwrap_or_default();
    let ws = raw.ws.unwrap_or_default();
    let grpc = raw.grpc.unwrap_or_default();
    let notifier = raw.notifier.unwrap_or_default();
    let retention = raw.retention.unwrap_or_default();

    let ws = WsSettings {
        allowed_origins: ws.allowed_origins.unwrap_or_default(),
        read_deadline: Duration::from_secs(ws.read_deadline_secs.unwrap_or(60)),
        write_deadline: Duration::from_secs(ws.write_deadline_secs.unwrap_or(10)),
        ping_interval: Duration::from_secs(ws.ping_interval_secs.unwrap_or(54)),
        max_message_bytes: ws.max_message_bytes.unwrap_or(512 * 1024),
    };
    if ws.ping_interval >= ws.read_deadline {
        return Err(ConfigError::Invalid(
            "ws.ping_interval_secs must be strictly less than ws.read_deadline_secs".to_owned(),
        ));
    }

    if let Some(hours) = retention.audit_retention_hours {
        if hours == 0 || hours > MAX_AUDIT_RETENTION_HOURS {
            return Err(ConfigError::Invalid(format!(
                "retention.audit_retention_hours must be between 1 and {MAX_AUDIT_RETENTION_HOURS}"
            )));
        }
    }

    let mut sinks = Vec::with_capacity(raw.notifiers.len());
    for sink in raw.notifiers {
        sinks.push(validate_sink(sink)?);
    }

    Ok(EventdConfig {
        store_path: raw
            .store_path
            .unwrap_or_else(|| "/var/lib/eventd/events.db".to_owned()),
        http_bind: raw.http_bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        grpc_bind: raw.grpc_bind.unwrap_or_else(|| "0.0.0.0:50051".to_owned()),
        bus: BusSettings {
            intake_capacity: bus.intake_capacity.unwrap_or(1000),
            worker_count: bus.worker_count.unwrap_or(0),
            subscriber_queue_capacity: bus.subscriber_queue_capacity.unwrap_or(100),
            reaper_interval: Duration::from_secs(bus.reaper_interval_secs.unwrap_or(30)),
            ws_idle_max: Duration::from_secs(bus.ws_idle_max_secs.unwrap_or(5 * 60)),
            rpc_idle_max: Duration::from_secs(bus.rpc_idle_max_secs.unwrap_or(10 * 60)),
            notifier_idle_max: Duration::from_secs(
                bus.notifier_idle_max_secs.unwrap_or(24 * 60 * 60),
            ),
        },
        ws,
        grpc: GrpcSettings {
            max_streams: grpc.max_streams.unwrap_or(100),
            keepalive_interval: Duration::from_secs(grpc.keepalive_interval_secs.unwrap_or(60)),
            keepalive_timeout: Duration::from_secs(grpc.keepalive_timeout_secs.unwrap_or(20)),
        },
        notifiers: NotifierSettings {
            http_timeout: Duration::from_secs(notifier.http_timeout_secs.unwrap_or(10)),
            twilio_http_timeout: Duration::from_secs(
                notifier.twilio_http_timeout_secs.unwrap_or(30),
            ),
            sinks,
        },
        retention: RetentionSettings {
            audit_retention: retention
                .audit_retention_hours
                .map(|h| Duration::from_secs(h * 60 * 60)),
            prune_interval: Duration::from_secs(retention.prune_interval_secs.unwrap_or(3600)),
        },
    })
}

fn validate_sink(raw: RawSink) -> Result<SinkConfig, ConfigError> {
    let (transport, min_severity, types) = match raw {
        RawSink::Slack {
            webhook_url,
            min_severity,
            types,
        } => {
            require_non_empty("slack.webhook_url", &webhook_url)?;
            (
                SinkTransport::Slack(ve_notify::SlackConfig { webhook_url }),
                min_severity,
                types,
            )
        }
        RawSink::Email {
            smtp_host,
            smtp_port,
            username,
            password,
            from,
            to,
            min_severity,
            types,
        } => {
            require_non_empty("email.smtp_host", &smtp_host)?;
            require_non_empty("email.from", &from)?;
            require_non_empty("email.to", &to)?;
            (
                SinkTransport::Email(ve_notify::EmailConfig {
                    smtp_host,
                    smtp_port: smtp_port.unwrap_or(587),
                    username,
                    password,
                    from,
                    to,
                }),
                min_severity,
                types,
            )
        }
        RawSink::Telegram {
            bot_token,
            chat_id,
            min_severity,
            types,
        } => {
            require_non_empty("telegram.bot_token", &bot_token)?;
            require_non_empty("telegram.chat_id", &chat_id)?;
            (
                SinkTransport::Telegram(ve_notify::TelegramConfig {
                    bot_token,
                    chat_id,
                    api_base: None,
                }),
                min_severity,
                types,
            )
        }
        RawSink::Matrix {
            homeserver_url,
            access_token,
            room_id,
            min_severity,
            types,
        } => {
            require_non_empty("matrix.homeserver_url", &homeserver_url)?;
            require_non_empty("matrix.room_id", &room_id)?;
            (
                SinkTransport::Matrix(ve_notify::MatrixConfig {
                    homeserver_url,
                    access_token,
                    room_id,
                }),
                min_severity,
                types,
            )
        }
        RawSink::Whatsapp {
            account_sid,
            auth_token,
            from,
            to,
            min_severity,
            types,
        } => {
            require_non_empty("whatsapp.account_sid", &account_sid)?;
            require_non_empty("whatsapp.from", &from)?;
            require_non_empty("whatsapp.to", &to)?;
            (
                SinkTransport::WhatsApp(ve_notify::WhatsAppConfig {
                    account_sid,
                    auth_token,
                    from,
                    to,
                    api_base: None,
                }),
                min_severity,
                types,
            )
        }
    };

    let min_severity = match min_severity {
        Some(tag) => tag
            .parse::<Severity>()
            .map_err(|_| ConfigError::Invalid(format!("unknown min_severity '{tag}'")))?,
        None => Severity::Warning,
    };
    let interested_kinds = match types {
        Some(tags) => {
            let mut kinds = Vec::with_capacity(tags.len());
            for tag in tags {
                kinds.push(tag.parse::<EventKind>().map_err(|_| {
                    ConfigError::Invalid(format!("unknown event type '{tag}' in notifier config"))
                })?);
            }
            kinds
        }
        None => Vec::new(),
    };

    Ok(SinkConfig {
        transport,
        min_severity,
        interested_kinds,
    })
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    Ok(())
}
