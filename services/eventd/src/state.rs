//! Shared gateway state and WebSocket connection counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use event_core::{EventBus, EventPublisher, EventSink};

use crate::config::WsSettings;

/// WebSocket gateway counters (`/metrics`).
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    connections_rejected: AtomicU64,
    errors: AtomicU64,
}

impl GatewayMetrics {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        GatewayMetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GatewayMetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub connections_rejected: u64,
    pub errors: u64,
}

/// Axum-facing application state.
#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub publisher: Arc<EventPublisher>,
    pub sink: Arc<dyn EventSink>,
    pub ws: Arc<WsSettings>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(
        bus: EventBus,
        publisher: Arc<EventPublisher>,
        sink: Arc<dyn EventSink>,
        ws: WsSettings,
    ) -> Self {
        AppState {
            bus,
            publisher,
            sink,
            ws: Arc::new(ws),
            metrics: Arc::new(GatewayMetrics::default()),
        }
    }
}
