//! eventd: event distribution gateways over the core bus.
//!
//! One HTTP listener carries `/ws`, `/health` and `/metrics`; a second
//! listener serves the gRPC `EventStream` service.  Notification sinks from
//! the config are registered as bus subscribers at startup.

pub mod config;
pub mod grpc;
pub mod http;
pub mod origin;
pub mod state;
pub mod ws;

pub use state::AppState;

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use event_core::{EventBus, EventSink, Subscriber};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ve_notify::{
    EmailNotifier, MatrixNotifier, Notifier, NotifyError, SlackNotifier, TelegramNotifier,
    WhatsAppNotifier,
};
use ve_protocol::EventKind;

use crate::config::{GrpcSettings, NotifierSettings, RetentionSettings, SinkTransport};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health))
        .route("/metrics", get(http::metrics))
        .with_state(state)
}

/// Errors surfaced by [`run_until_shutdown`].
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("http server: {0}")]
    Http(#[from] std::io::Error),
    #[error("grpc server: {0}")]
    Grpc(#[from] tonic::transport::Error),
    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Drive both gateway listeners until `shutdown` flips to true, then
/// return once everything has drained.
///
/// The bus drains CONCURRENTLY with the listeners' graceful shutdown.
/// A long-lived WS/gRPC connection only closes once the bus clears its
/// registry (the subscriber queue closes, the socket task sends its
/// goodbye and exits), while axum and tonic both wait for in-flight
/// connections to finish on their own.  Sequencing the bus after the
/// listeners would therefore deadlock with any client still connected.
pub async fn run_until_shutdown(
    state: AppState,
    grpc_service: grpc::EventStreamService,
    http_listener: tokio::net::TcpListener,
    grpc_listener: tokio::net::TcpListener,
    grpc_settings: GrpcSettings,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServeError> {
    let bus = state.bus.clone();
    let router = build_router(state);

    let mut http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut grpc_shutdown = shutdown.clone();
    let grpc_task = tokio::spawn(grpc::serve(
        grpc_service,
        grpc_listener,
        grpc_settings,
        async move {
            let _ = grpc_shutdown.wait_for(|stop| *stop).await;
        },
    ));

    let mut bus_shutdown = shutdown;
    let bus_task = tokio::spawn(async move {
        let _ = bus_shutdown.wait_for(|stop| *stop).await;
        bus.shutdown().await;
    });

    http_task.await??;
    grpc_task.await??;
    let _ = bus_task.await;
    Ok(())
}

/// Build every configured notification sink and register it on the bus.
///
/// Returns the number of sinks registered.
pub async fn register_notifiers(
    bus: &EventBus,
    settings: &NotifierSettings,
) -> Result<usize, NotifyError> {
    let mut registered = 0;
    for (index, sink) in settings.sinks.iter().enumerate() {
        let notifier = match &sink.transport {
            SinkTransport::Slack(cfg) => {
                Notifier::Slack(SlackNotifier::new(cfg.clone(), settings.http_timeout)?)
            }
            SinkTransport::Email(cfg) => {
                Notifier::Email(EmailNotifier::new(cfg.clone(), settings.http_timeout)?)
            }
            SinkTransport::Telegram(cfg) => {
                Notifier::Telegram(TelegramNotifier::new(cfg.clone(), settings.http_timeout)?)
            }
            SinkTransport::Matrix(cfg) => {
                Notifier::Matrix(MatrixNotifier::new(cfg.clone(), settings.http_timeout)?)
            }
            SinkTransport::WhatsApp(cfg) => Notifier::WhatsApp(WhatsAppNotifier::new(
                cfg.clone(),
                settings.twilio_http_timeout,
            )?),
        };
        let id = format!("notify-{}-{index}", notifier.name());
        let kinds: HashSet<EventKind> = sink.interested_kinds.iter().copied().collect();
        info!(
            subscriber_id = %id,
            sink = notifier.name(),
            min_severity = %sink.min_severity,
            "registering notification sink"
        );
        bus.register(Subscriber::notification(
            id,
            kinds,
            notifier,
            sink.min_severity,
        ))
        .await
        .map_err(|e| NotifyError::Config(e.to_string()))?;
        registered += 1;
    }
    Ok(registered)
}

/// Periodic event-log pruning.  Returns `None` when retention is unbounded.
pub fn spawn_prune_task(
    sink: Arc<dyn EventSink>,
    retention: RetentionSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let age = retention.audit_retention?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention.prune_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sink.delete_older_than(age) {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "pruned events past retention"),
                        Err(e) => warn!(error = %e, "event log prune failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}
