//! Subscriber registration records and the delivery channels behind them.
//!
//! The bus owns the registration entry; the transport object behind it
//! (socket, RPC stream, outbound HTTP client) is owned by the gateway that
//! constructed the subscriber and released on disconnect.  `deliver` never
//! blocks beyond a single non-blocking send or one outbound call bounded by
//! its transport timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use ve_notify::Notifier;
use ve_protocol::{Event, EventKind, Severity};

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Shared last-activity handle between a gateway connection and the bus.
///
/// Gateways touch it on inbound traffic; streaming deliveries touch it on
/// successful enqueue.  The reaper reads it to decide liveness.
#[derive(Debug)]
pub struct Activity {
    last_seen_unix: AtomicI64,
    connected: AtomicBool,
}

impl Activity {
    pub fn new() -> Arc<Self> {
        Arc::new(Activity {
            last_seen_unix: AtomicI64::new(Utc::now().timestamp()),
            connected: AtomicBool::new(true),
        })
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_seen_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Flip the connected/enabled flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Seconds elapsed since the last recorded activity, as seen at `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let last = self.last_seen_unix.load(Ordering::Relaxed);
        let idle = now.timestamp().saturating_sub(last);
        Duration::from_secs(idle.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Liveness horizons
// ---------------------------------------------------------------------------

/// Per-variant idle horizons; owned by the bus config.
#[derive(Debug, Clone, Copy)]
pub struct LivenessHorizons {
    pub ws_idle_max: Duration,
    pub rpc_idle_max: Duration,
    pub notifier_idle_max: Duration,
}

impl Default for LivenessHorizons {
    fn default() -> Self {
        LivenessHorizons {
            ws_idle_max: Duration::from_secs(5 * 60),
            rpc_idle_max: Duration::from_secs(10 * 60),
            notifier_idle_max: Duration::from_secs(24 * 60 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The subscriber's queue was full; the event is not redelivered on the
    /// live path (it is already durable and recoverable via replay).
    Dropped,
    /// Filtered out (severity threshold); silent, not an error.
    Skipped,
    /// Transport failure on a notification sink.
    Failed,
}

/// The sealed set of delivery channels.
#[derive(Debug, Clone)]
pub enum SubscriberChannel {
    /// WebSocket connection: bounded per-socket queue drained by the
    /// gateway's socket task.
    StreamingWs {
        tx: mpsc::Sender<Event>,
        activity: Arc<Activity>,
    },
    /// gRPC server-stream: same semantics, longer liveness horizon.
    StreamingRpc {
        tx: mpsc::Sender<Event>,
        activity: Arc<Activity>,
    },
    /// Outbound notification sink; delivery runs inline on a dispatcher
    /// worker, bounded by the sink's transport timeout.
    Notification {
        notifier: Notifier,
        min_severity: Severity,
        activity: Arc<Activity>,
    },
}

/// A registered consumer: filter plus delivery capability.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: String,
    /// Empty set means "all kinds".
    pub interested_kinds: HashSet<EventKind>,
    pub channel: SubscriberChannel,
}

impl Subscriber {
    pub fn streaming_ws(
        id: impl Into<String>,
        interested_kinds: HashSet<EventKind>,
        tx: mpsc::Sender<Event>,
        activity: Arc<Activity>,
    ) -> Self {
        Subscriber {
            id: id.into(),
            interested_kinds,
            channel: SubscriberChannel::StreamingWs { tx, activity },
        }
    }

    pub fn streaming_rpc(
        id: impl Into<String>,
        interested_kinds: HashSet<EventKind>,
        tx: mpsc::Sender<Event>,
        activity: Arc<Activity>,
    ) -> Self {
        Subscriber {
            id: id.into(),
            interested_kinds,
            channel: SubscriberChannel::StreamingRpc { tx, activity },
        }
    }

    pub fn notification(
        id: impl Into<String>,
        interested_kinds: HashSet<EventKind>,
        notifier: Notifier,
        min_severity: Severity,
    ) -> Self {
        Subscriber {
            id: id.into(),
            interested_kinds,
            channel: SubscriberChannel::Notification {
                notifier,
                min_severity,
                activity: Activity::new(),
            },
        }
    }

    /// Stable variant name for logs and the active-subscriber listing.
    pub fn variant(&self) -> &'static str {
        match &self.channel {
            SubscriberChannel::StreamingWs { .. } => "streaming_ws",
            SubscriberChannel::StreamingRpc { .. } => "streaming_rpc",
            SubscriberChannel::Notification { .. } => "notification",
        }
    }

    /// Kind filter: empty set admits everything.
    pub fn is_interested(&self, kind: EventKind) -> bool {
        self.interested_kinds.is_empty() || self.interested_kinds.contains(&kind)
    }

    pub fn activity(&self) -> &Arc<Activity> {
        match &self.channel {
            SubscriberChannel::StreamingWs { activity, .. }
            | SubscriberChannel::StreamingRpc { activity, .. }
            | SubscriberChannel::Notification { activity, .. } => activity,
        }
    }

    /// Variant-specific liveness: connected/enabled and seen within the
    /// variant's idle horizon.
    pub fn is_live(&self, now: DateTime<Utc>, horizons: &LivenessHorizons) -> bool {
        let activity = self.activity();
        if !activity.is_connected() {
            return false;
        }
        let horizon = match &self.channel {
            SubscriberChannel::StreamingWs { .. } => horizons.ws_idle_max,
            SubscriberChannel::StreamingRpc { .. } => horizons.rpc_idle_max,
            SubscriberChannel::Notification { .. } => horizons.notifier_idle_max,
        };
        activity.idle_for(now) <= horizon
    }

    /// Push one event.  Bounded: a try-send for streaming variants, one
    /// timeout-guarded outbound call for notification sinks.
    pub async fn deliver(&self, event: &Event) -> Delivery {
        match &self.channel {
            SubscriberChannel::StreamingWs { tx, activity }
            | SubscriberChannel::StreamingRpc { tx, activity } => {
                match tx.try_send(event.clone()) {
                    Ok(()) => {
                        activity.touch();
                        Delivery::Delivered
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
                    Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Failed,
                }
            }
            SubscriberChannel::Notification {
                notifier,
                min_severity,
                activity,
            } => {
                if event.severity < *min_severity {
                    return Delivery::Skipped;
                }
                match notifier.send(event).await {
                    Ok(()) => {
                        activity.touch();
                        Delivery::Delivered
                    }
                    Err(e) => {
                        warn!(
                            subscriber_id = %self.id,
                            sink = notifier.name(),
                            error = %e,
                            "notification delivery failed"
                        );
                        Delivery::Failed
                    }
                }
            }
        }
    }
}
