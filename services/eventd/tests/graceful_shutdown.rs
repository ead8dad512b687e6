//! The binary's serve/shutdown orchestration (`run_until_shutdown`): a
//! connected client must never block graceful shutdown.  axum and tonic
//! both wait for in-flight connections to finish on their own, and those
//! connections only close once the bus clears its registry, so the bus
//! must drain concurrently with the listeners rather than after them.

use std::sync::Arc;
use std::time::Duration;

use event_core::{BusConfig, EventBus, EventPublisher, SqliteEventStore};
use eventd::config::{GrpcSettings, WsSettings};
use eventd::grpc::EventStreamService;
use eventd::grpc::proto::SubscribeRequest;
use eventd::grpc::proto::event_stream_client::EventStreamClient;
use eventd::state::AppState;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use ve_protocol::{Event, EventKind, Severity};

fn test_ws_settings() -> WsSettings {
    WsSettings {
        allowed_origins: vec![],
        read_deadline: Duration::from_secs(60),
        write_deadline: Duration::from_secs(10),
        ping_interval: Duration::from_secs(54),
        max_message_bytes: 512 * 1024,
    }
}

fn test_grpc_settings() -> GrpcSettings {
    GrpcSettings {
        max_streams: 100,
        keepalive_interval: Duration::from_secs(60),
        keepalive_timeout: Duration::from_secs(20),
    }
}

#[tokio::test]
async fn connected_clients_unblock_graceful_shutdown() {
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let bus = EventBus::start(
        BusConfig {
            worker_count: 1,
            ..BusConfig::default()
        },
        store.clone(),
    );
    let publisher = Arc::new(EventPublisher::new(store.clone(), bus.clone()));
    let state = AppState::new(
        bus.clone(),
        publisher.clone(),
        store.clone(),
        test_ws_settings(),
    );
    let grpc_service = EventStreamService::new(bus.clone(), publisher);

    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http");
    let http_addr = http_listener.local_addr().expect("http addr");
    let grpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind grpc");
    let grpc_addr = grpc_listener.local_addr().expect("grpc addr");

    let (shutdown_tx, _) = watch::channel(false);
    let serving = tokio::spawn(eventd::run_until_shutdown(
        state,
        grpc_service,
        http_listener,
        grpc_listener,
        test_grpc_settings(),
        shutdown_tx.subscribe(),
    ));

    // One live client on each transport.
    let (mut ws, _) = connect_async(format!("ws://{http_addr}/ws?types=score_changed"))
        .await
        .expect("ws connect");
    let mut grpc_client = EventStreamClient::connect(format!("http://{grpc_addr}"))
        .await
        .expect("grpc connect");
    let mut stream = grpc_client
        .subscribe_events(SubscribeRequest {
            client_id: "graceful".to_owned(),
            event_types: vec![],
        })
        .await
        .expect("subscribe")
        .into_inner();

    timeout(Duration::from_secs(2), async {
        while bus.subscriber_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both clients registered");

    // Deliveries are flowing right up to the signal.
    bus.publish(Event::new(
        EventKind::ScoreChanged,
        Severity::Info,
        "Score changed",
        "pre-shutdown",
    ))
    .expect("publish");

    shutdown_tx.send(true).expect("signal");

    // The whole orchestration must come down within the grace period even
    // though both clients are still connected.
    let result = timeout(Duration::from_secs(5), serving)
        .await
        .expect("graceful shutdown deadlocked with live clients")
        .expect("serve task join");
    assert!(result.is_ok(), "serve error: {result:?}");

    // The WebSocket client got its GoingAway close frame.
    let close_code = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("ws close frame");
    assert_eq!(close_code, Some(1001), "GoingAway");

    // The gRPC stream ended instead of hanging (any still-buffered
    // deliveries drain first).
    let end = timeout(Duration::from_secs(2), async {
        loop {
            match stream.message().await {
                Ok(Some(_)) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("grpc stream must end");
    assert!(matches!(end, Ok(None) | Err(_)));

    assert!(bus.list_active().await.is_empty());
    assert!(!bus.is_running());
}

#[tokio::test]
async fn idle_orchestration_shuts_down_cleanly() {
    // No clients at all: the signal alone must bring everything down.
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let bus = EventBus::start(BusConfig::default(), store.clone());
    let publisher = Arc::new(EventPublisher::new(store.clone(), bus.clone()));
    let state = AppState::new(
        bus.clone(),
        publisher.clone(),
        store.clone(),
        test_ws_settings(),
    );
    let grpc_service = EventStreamService::new(bus.clone(), publisher);

    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http");
    let grpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind grpc");

    let (shutdown_tx, _) = watch::channel(false);
    let serving = tokio::spawn(eventd::run_until_shutdown(
        state,
        grpc_service,
        http_listener,
        grpc_listener,
        test_grpc_settings(),
        shutdown_tx.subscribe(),
    ));

    shutdown_tx.send(true).expect("signal");
    let result = timeout(Duration::from_secs(5), serving)
        .await
        .expect("idle shutdown must not hang")
        .expect("serve task join");
    assert!(result.is_ok());
    assert!(!bus.is_running());
}
