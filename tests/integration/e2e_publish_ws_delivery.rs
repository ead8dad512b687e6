//! End-to-end: domain publish → durable log → bus fan-out → WebSocket
//! client, with an on-disk SQLite event log.

use std::sync::Arc;
use std::time::Duration;

use event_core::{
    BusConfig, EventBus, EventFilter, EventPublisher, EventSink, SqliteEventStore,
};
use eventd::config::WsSettings;
use eventd::state::AppState;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use ve_protocol::EventKind;

#[tokio::test]
async fn verification_events_reach_a_websocket_client_and_the_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteEventStore::open(&dir.path().join("events.db")).expect("open store"),
    );
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

    let url = format!("ws://{addr}/ws?types=verification_completed,score_changed");
    let (mut ws, _) = connect_async(url).await.expect("ws connect");
    timeout(Duration::from_secs(2), async {
        while bus.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration");

    publisher
        .publish_verification_completed("gpt-x", "ver-1", 50, 50)
        .expect("publish");
    publisher
        .publish_score_changed("gpt-x", 88.0, 93.0, "overall")
        .expect("publish");
    // Not subscribed: must not reach the client.
    publisher
        .publish_model_added("gpt-x", "openai")
        .expect("publish");

    let mut kinds = Vec::new();
    for _ in 0..2 {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame")
            .expect("stream open")
            .expect("ws ok");
        if let Message::Text(text) = msg {
            let frame: serde_json::Value = serde_json::from_str(text.as_str()).expect("json");
            assert_eq!(frame["type"], "event");
            kinds.push(frame["event"]["kind"].as_str().expect("kind").to_owned());
        }
    }
    assert_eq!(kinds, vec!["verification_completed", "score_changed"]);

    let extra = timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "model_added must be filtered: {extra:?}");

    // Everything is durable, including the unsubscribed kind and the
    // client-connected lifecycle event.
    let completed = store
        .query(&EventFilter::new().kind(EventKind::VerificationCompleted))
        .expect("query");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].model_id.as_deref(), Some("gpt-x"));
    let added = store
        .query(&EventFilter::new().kind(EventKind::ModelAdded))
        .expect("query");
    assert_eq!(added.len(), 1);
    let connected = store
        .query(&EventFilter::new().kind(EventKind::ClientConnected))
        .expect("query");
    assert_eq!(connected.len(), 1);

    // The dispatcher stamped processed_at on delivered events.
    timeout(Duration::from_secs(2), async {
        loop {
            let stats = store.stats().expect("stats");
            if stats.processed >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("processed_at stamped");

    bus.shutdown().await;
}
