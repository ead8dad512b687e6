//! Per-subscriber isolation over real sockets: a client that never reads
//! must not stall delivery to a healthy client.

use std::sync::Arc;
use std::time::Duration;

use event_core::{BusConfig, EventBus, EventPublisher, SqliteEventStore};
use eventd::config::WsSettings;
use eventd::state::AppState;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use ve_protocol::{Event, EventKind, Severity};

#[tokio::test]
async fn stalled_client_does_not_starve_a_healthy_one() {
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let bus = EventBus::start(
        BusConfig {
            worker_count: 2,
            subscriber_queue_capacity: 50,
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
            write_deadline: Duration::from_secs(2),
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

    // The stalled client connects and then never reads its socket.
    let (stalled, _) = connect_async(format!("ws://{addr}/ws?types=score_changed"))
        .await
        .expect("stalled connect");
    let (mut healthy, _) = connect_async(format!("ws://{addr}/ws?types=score_changed"))
        .await
        .expect("healthy connect");

    timeout(Duration::from_secs(2), async {
        while bus.subscriber_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both registered");

    let burst = 200;
    for i in 0..burst {
        bus.publish(
            Event::new(
                EventKind::ScoreChanged,
                Severity::Info,
                "Score changed",
                format!("event {i}"),
            )
            .with_model("m1"),
        )
        .expect("publish");
    }

    // The healthy client must see the whole burst promptly even though its
    // peer is not reading.
    let mut received = 0;
    let deadline = timeout(Duration::from_secs(5), async {
        while received < burst {
            match healthy.next().await {
                Some(Ok(Message::Text(_))) => received += 1,
                Some(Ok(_)) => {}
                Some(Err(e)) => panic!("healthy client errored: {e}"),
                None => panic!("healthy client stream ended early"),
            }
        }
    })
    .await;
    assert!(
        deadline.is_ok(),
        "healthy client starved: got {received}/{burst}"
    );

    drop(stalled);
    bus.shutdown().await;
}
