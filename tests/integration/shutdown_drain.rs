//! Graceful shutdown with live clients: every connected WebSocket client
//! receives Close(GoingAway) within the grace period, queued intake is
//! drained best-effort, and the registry ends empty.

use std::sync::Arc;
use std::time::Duration;

use event_core::{BusConfig, EventBus, EventPublisher, SqliteEventStore};
use eventd::config::WsSettings;
use eventd::state::AppState;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::protocol::Message;
use ve_protocol::{Event, EventKind, Severity};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drain a client until its close frame; returns (events_seen, close_code).
async fn drain_until_close(mut ws: WsClient) -> (usize, Option<u16>) {
    let mut events = 0;
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(_)))) => events += 1,
            Ok(Some(Ok(Message::Close(frame)))) => {
                return (events, frame.map(|f| u16::from(f.code)));
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_)) | None) => return (events, None),
            Err(_) => panic!("no close frame within the grace period"),
        }
    }
}

#[tokio::test]
async fn shutdown_closes_clients_and_drains_intake() {
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let bus = EventBus::start(
        BusConfig {
            worker_count: 2,
            ..BusConfig::default()
        },
        store.clone(),
    );
    let publisher = Arc::new(EventPublisher::new(store.clone(), bus.clone()));

    let state = AppState::new(
        bus.clone(),
        publisher,
        store.clone(),
        WsSettings {
            allowed_origins: vec![],
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            max_message_bytes: 512 * 1024,
        },
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, eventd::build_router(state)).await;
    });

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (ws, _) = connect_async(format!("ws://{addr}/ws?types=system_health_changed"))
            .await
            .expect("connect");
        clients.push(ws);
    }
    timeout(Duration::from_secs(2), async {
        while bus.subscriber_count().await < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all three registered");

    for i in 0..50 {
        bus.publish(Event::new(
            EventKind::SystemHealthChanged,
            Severity::Info,
            "System health changed",
            format!("event {i}"),
        ))
        .expect("publish");
    }

    bus.shutdown().await;

    assert!(bus.list_active().await.is_empty());
    assert_eq!(bus.subscriber_count().await, 0);

    for ws in clients {
        let (events, close_code) = drain_until_close(ws).await;
        assert_eq!(close_code, Some(1001), "GoingAway close frame");
        assert!(
            events <= 50,
            "fan-out is best-effort, never duplicated: {events}"
        );
    }

    // The workers drained the intake before exiting (the three
    // client-connected lifecycle events ride along with the burst).
    let metrics = bus.metrics();
    assert!(
        metrics.dispatched >= 50,
        "intake not drained: {}",
        metrics.dispatched
    );
}
