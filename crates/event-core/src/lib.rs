//! Event distribution core: durable event log, subscriber registry, and the
//! publish/fan-out bus between them.
//!
//! Gateways (WebSocket, gRPC) construct subscribers and register them here;
//! domain code publishes through the [`publisher::EventPublisher`] façade,
//! which persists first and then enqueues for live fan-out.

pub mod bus;
pub mod metrics;
pub mod publisher;
pub mod store;
pub mod subscriber;

pub use bus::{
    BusConfig, EventBus, PublishError, RegisterError, SubscriberInfo, default_worker_count,
    normalize_event, validate_event,
};
pub use metrics::{BusMetrics, BusMetricsSnapshot};
pub use publisher::EventPublisher;
pub use store::{
    DEFAULT_QUERY_LIMIT, EventFilter, EventLogStats, EventSink, MAX_QUERY_LIMIT,
    SqliteEventStore, StoreError,
};
pub use subscriber::{Activity, Delivery, LivenessHorizons, Subscriber, SubscriberChannel};
