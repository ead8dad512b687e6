//! The event bus: bounded intake, dispatcher worker pool, subscriber
//! registry, periodic liveness reaper.
//!
//! # Back-pressure boundaries
//! 1. The intake queue is bounded; a saturated queue surfaces `BufferFull`
//!    to the publisher (the event was already persisted by the publisher
//!    façade, so nothing is lost on retry).
//! 2. Each streaming subscriber's queue is bounded; a full queue records a
//!    drop and the live path moves on.  Recovery is replay from the log.
//!
//! # Locking
//! The registry read-write lock is never held across a `deliver` call:
//! fan-out snapshots the interested live subscribers into a local vector
//! first.  Registry mutation is therefore permitted while events flow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ve_protocol::{Event, EventKind, derive_event_id};

use crate::metrics::{BusMetrics, BusMetricsSnapshot};
use crate::store::EventSink;
use crate::subscriber::{Delivery, LivenessHorizons, Subscriber};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Bus construction options.  All fields have working defaults.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded intake queue between publishers and dispatcher workers.
    pub intake_capacity: usize,
    /// Dispatcher worker count; 0 means the runtime default.
    pub worker_count: usize,
    /// Capacity gateways use for per-subscriber streaming queues.
    pub subscriber_queue_capacity: usize,
    /// How often the reaper scans for subscribers that failed liveness.
    pub reaper_interval: Duration,
    pub horizons: LivenessHorizons,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            intake_capacity: 1000,
            worker_count: 0,
            subscriber_queue_capacity: 100,
            reaper_interval: Duration::from_secs(30),
            horizons: LivenessHorizons::default(),
        }
    }
}

/// Runtime-default worker count: one per core, clamped to 2..=8.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get().clamp(2, 8))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The intake queue is saturated.  The bus did not persist the event;
    /// the producer may retry or fall back to replay.
    #[error("event intake buffer is full")]
    BufferFull,
    #[error("event bus is shutting down")]
    ShuttingDown,
    /// Publish-time validation failed (empty title or message, see the
    /// event model contract).
    #[error("invalid event: title and message must be non-empty")]
    InvalidEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("subscriber id '{0}' is already registered")]
    Duplicate(String),
    #[error("event bus is shutting down")]
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(1);

/// Fill publish-time defaults: derived id and `"system"` source.
///
/// `(timestamp, kind)` alone can tie under coarse clocks, so a process-wide
/// sequence number keeps derived ids unique.
pub fn normalize_event(event: &mut Event) {
    if event.id.is_empty() {
        let seq = PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed);
        event.id = format!("{}-{seq}", derive_event_id(event.timestamp, event.kind));
    }
    if event.source.is_empty() {
        event.source = "system".to_owned();
    }
}

/// The one-time publish validation from the event model contract.
pub fn validate_event(event: &Event) -> Result<(), PublishError> {
    if event.title.trim().is_empty() || event.message.trim().is_empty() {
        return Err(PublishError::InvalidEvent);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Snapshot entry returned by `list_active`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub variant: &'static str,
    pub interested_kinds: Vec<String>,
}

/// Cheaply cloneable handle to the running bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    state: AtomicU8,
    /// `None` once shutdown has closed the intake.
    intake_tx: std::sync::Mutex<Option<mpsc::Sender<Event>>>,
    registry: RwLock<HashMap<String, Subscriber>>,
    metrics: Arc<BusMetrics>,
    sink: Arc<dyn EventSink>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    /// Start the bus: spawns the dispatcher workers and the reaper.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: BusConfig, sink: Arc<dyn EventSink>) -> Self {
        let intake_capacity = config.intake_capacity.max(1);
        let worker_count = if config.worker_count == 0 {
            default_worker_count()
        } else {
            config.worker_count
        };

        let (intake_tx, intake_rx) = mpsc::channel(intake_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(BusInner {
            config,
            state: AtomicU8::new(STATE_RUNNING),
            intake_tx: std::sync::Mutex::new(Some(intake_tx)),
            registry: RwLock::new(HashMap::new()),
            metrics: Arc::new(BusMetrics::default()),
            sink,
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let shared_rx = Arc::new(Mutex::new(intake_rx));
        let mut tasks = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            tasks.push(tokio::spawn(worker_loop(
                Arc::clone(&inner),
                Arc::clone(&shared_rx),
                worker_id,
            )));
        }
        tasks.push(tokio::spawn(reaper_loop(
            Arc::clone(&inner),
            inner.shutdown_tx.subscribe(),
        )));
        *inner.tasks.lock().expect("bus task list mutex poisoned") = tasks;

        info!(worker_count, intake_capacity, "event bus started");
        EventBus { inner }
    }

    /// Accept an event for fan-out.  Non-blocking: a saturated intake
    /// returns `BufferFull` immediately.  Never fails because of
    /// subscribers.
    pub fn publish(&self, mut event: Event) -> Result<(), PublishError> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(PublishError::ShuttingDown);
        }
        validate_event(&event)?;
        normalize_event(&mut event);

        let tx = self
            .inner
            .intake_tx
            .lock()
            .expect("intake sender mutex poisoned")
            .clone();
        let Some(tx) = tx else {
            return Err(PublishError::ShuttingDown);
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.inner.metrics.record_published();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(PublishError::BufferFull),
            Err(TrySendError::Closed(_)) => Err(PublishError::ShuttingDown),
        }
    }

    /// Insert a subscriber keyed by its id.
    pub async fn register(&self, subscriber: Subscriber) -> Result<(), RegisterError> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(RegisterError::ShuttingDown);
        }
        let mut registry = self.inner.registry.write().await;
        if registry.contains_key(&subscriber.id) {
            return Err(RegisterError::Duplicate(subscriber.id));
        }
        info!(
            subscriber_id = %subscriber.id,
            variant = subscriber.variant(),
            kinds = subscriber.interested_kinds.len(),
            "subscriber registered"
        );
        registry.insert(subscriber.id.clone(), subscriber);
        Ok(())
    }

    /// Remove a subscriber.  Idempotent: unknown ids are a no-op.
    pub async fn unregister(&self, id: &str) {
        let removed = self.inner.registry.write().await.remove(id);
        if removed.is_some() {
            info!(subscriber_id = %id, "subscriber unregistered");
        }
    }

    /// Replace a subscriber's interested-kind set.  Returns false if the
    /// id is not registered.
    pub async fn set_interested_kinds(&self, id: &str, kinds: HashSet<EventKind>) -> bool {
        let mut registry = self.inner.registry.write().await;
        match registry.get_mut(id) {
            Some(subscriber) => {
                subscriber.interested_kinds = kinds;
                true
            }
            None => false,
        }
    }

    /// Add kinds to a subscriber's set; returns the updated set, or `None`
    /// if the id is not registered.
    pub async fn add_interested_kinds(
        &self,
        id: &str,
        kinds: &[EventKind],
    ) -> Option<HashSet<EventKind>> {
        let mut registry = self.inner.registry.write().await;
        let subscriber = registry.get_mut(id)?;
        subscriber.interested_kinds.extend(kinds.iter().copied());
        Some(subscriber.interested_kinds.clone())
    }

    /// Remove kinds from a subscriber's set; returns the updated set, or
    /// `None` if the id is not registered.
    pub async fn remove_interested_kinds(
        &self,
        id: &str,
        kinds: &[EventKind],
    ) -> Option<HashSet<EventKind>> {
        let mut registry = self.inner.registry.write().await;
        let subscriber = registry.get_mut(id)?;
        for kind in kinds {
            subscriber.interested_kinds.remove(kind);
        }
        Some(subscriber.interested_kinds.clone())
    }

    /// Snapshot of subscribers whose liveness currently holds.
    pub async fn list_active(&self) -> Vec<SubscriberInfo> {
        let now = Utc::now();
        let registry = self.inner.registry.read().await;
        let mut active: Vec<SubscriberInfo> = registry
            .values()
            .filter(|s| s.is_live(now, &self.inner.config.horizons))
            .map(|s| {
                let mut kinds: Vec<String> = s
                    .interested_kinds
                    .iter()
                    .map(|k| k.as_tag().to_owned())
                    .collect();
                kinds.sort_unstable();
                SubscriberInfo {
                    id: s.id.clone(),
                    variant: s.variant(),
                    interested_kinds: kinds,
                }
            })
            .collect();
        active.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Shared counter handle (the publisher façade records persist errors
    /// through it).
    pub fn metrics_handle(&self) -> Arc<BusMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Capacity gateways should use for per-subscriber streaming queues.
    pub fn subscriber_queue_capacity(&self) -> usize {
        self.inner.config.subscriber_queue_capacity.max(1)
    }

    /// Close intake, drain the workers, stop the reaper, clear the
    /// registry.  Dropping registry entries closes every subscriber queue,
    /// which the gateways observe as their cue to tear down connections.
    pub async fn shutdown(&self) {
        let prev = self.inner.state.swap(STATE_DRAINING, Ordering::SeqCst);
        if prev != STATE_RUNNING {
            self.inner.state.store(prev, Ordering::SeqCst);
            return;
        }
        info!("event bus draining");
        let _ = self.inner.shutdown_tx.send(true);
        *self
            .inner
            .intake_tx
            .lock()
            .expect("intake sender mutex poisoned") = None;

        let tasks = std::mem::take(
            &mut *self.inner.tasks.lock().expect("bus task list mutex poisoned"),
        );
        for task in tasks {
            let _ = task.await;
        }
        self.inner.registry.write().await.clear();
        self.inner.state.store(STATE_STOPPED, Ordering::SeqCst);
        info!("event bus stopped");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher workers
// ---------------------------------------------------------------------------

async fn worker_loop(
    inner: Arc<BusInner>,
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    worker_id: usize,
) {
    loop {
        // Hold the receiver lock only for the pull; fan-out happens after
        // release so other workers can drain intake concurrently.
        let event = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(event) = event else { break };
        dispatch_one(&inner, event).await;
    }
    debug!(worker_id, "dispatcher worker exited");
}

async fn dispatch_one(inner: &BusInner, mut event: Event) {
    inner.metrics.record_dispatched();
    let now = Utc::now();
    if event.processed_at.is_none() {
        event.processed_at = Some(now);
        if let Err(e) = inner.sink.mark_processed(&event.id, now) {
            inner.metrics.record_persist_error();
            warn!(event_id = %event.id, error = %e, "failed to stamp processed_at");
        }
    }

    // Stable snapshot per event: read-lock acquire and release around the
    // interested/live walk, never across `deliver`.
    let targets: Vec<Subscriber> = {
        let registry = inner.registry.read().await;
        registry
            .values()
            .filter(|s| s.is_interested(event.kind) && s.is_live(now, &inner.config.horizons))
            .cloned()
            .collect()
    };

    for subscriber in targets {
        match subscriber.deliver(&event).await {
            Delivery::Delivered => inner.metrics.record_delivered(),
            Delivery::Skipped => {}
            Delivery::Dropped => {
                inner.metrics.record_dropped();
                warn!(
                    subscriber_id = %subscriber.id,
                    event_id = %event.id,
                    "subscriber queue full, event dropped"
                );
            }
            Delivery::Failed => inner.metrics.record_delivery_error(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

async fn reaper_loop(inner: Arc<BusInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.reaper_interval);
    // The first tick fires immediately; skip it so a fresh bus does not
    // reap before anything had a chance to register.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                let mut registry = inner.registry.write().await;
                let before = registry.len();
                registry.retain(|id, subscriber| {
                    let live = subscriber.is_live(now, &inner.config.horizons);
                    if !live {
                        info!(
                            subscriber_id = %id,
                            variant = subscriber.variant(),
                            "reaping subscriber that failed liveness"
                        );
                    }
                    live
                });
                let reaped = before - registry.len();
                if reaped > 0 {
                    inner.metrics.record_reaped(reaped as u64);
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("reaper exited");
}
