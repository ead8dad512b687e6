// eventd: event distribution gateways (WebSocket + gRPC) over the core bus.

use std::path::Path;
use std::sync::Arc;

use event_core::{EventBus, EventPublisher, SqliteEventStore};
use eventd::grpc::EventStreamService;
use eventd::state::AppState;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "eventd starting");

    // Optional config path as the first argument; default otherwise.
    let cfg = match std::env::args().nth(1) {
        Some(path) => eventd::config::load_config_from_path(Path::new(&path)),
        None => eventd::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                http_bind = %cfg.http_bind,
                grpc_bind = %cfg.grpc_bind,
                sinks = cfg.notifiers.sinks.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if cfg.ws.allowed_origins.is_empty() {
        warn!("websocket origin allowlist is empty; accepting all origins (development mode)");
    }

    let store = match SqliteEventStore::open(Path::new(&cfg.store_path)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open event store: {e}");
            std::process::exit(1);
        }
    };
    info!(path = %cfg.store_path, "event log open");

    let bus = EventBus::start(cfg.bus.to_bus_config(), store.clone());
    let publisher = Arc::new(EventPublisher::new(store.clone(), bus.clone()));

    match eventd::register_notifiers(&bus, &cfg.notifiers).await {
        Ok(0) => {}
        Ok(sinks) => info!(sinks, "notification sinks registered"),
        Err(e) => {
            eprintln!("FATAL: failed to register notification sinks: {e}");
            std::process::exit(1);
        }
    }

    // One shutdown signal fans out to both listeners, the prune task, and
    // the bus.  The bus drains concurrently with the listeners inside
    // run_until_shutdown: clearing the registry is what closes long-lived
    // client connections, so the listeners' graceful drains depend on it.
    let (shutdown_tx, _) = watch::channel(false);
    let prune_task = eventd::spawn_prune_task(
        store.clone(),
        cfg.retention.clone(),
        shutdown_tx.subscribe(),
    );

    let http_listener = tokio::net::TcpListener::bind(&cfg.http_bind)
        .await
        .expect("failed to bind http listener");
    info!(addr = %cfg.http_bind, "websocket gateway listening");
    let grpc_listener = tokio::net::TcpListener::bind(&cfg.grpc_bind)
        .await
        .expect("failed to bind grpc listener");

    let grpc_service = EventStreamService::new(bus.clone(), publisher.clone());
    let state = AppState::new(bus.clone(), publisher, store.clone(), cfg.ws.clone());

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    if let Err(e) = eventd::run_until_shutdown(
        state,
        grpc_service,
        http_listener,
        grpc_listener,
        cfg.grpc.clone(),
        shutdown_tx.subscribe(),
    )
    .await
    {
        warn!(error = %e, "gateway error during serve or shutdown");
    }

    if let Some(task) = prune_task {
        let _ = task.await;
    }
    info!("eventd shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
