//! gRPC gateway integration tests: in-process tonic server, a real client
//! stream, filter semantics, broadcast, and unregistration on disconnect.

use std::sync::Arc;
use std::time::Duration;

use event_core::{BusConfig, EventBus, EventPublisher, SqliteEventStore};
use eventd::grpc::proto::event_stream_client::EventStreamClient;
use eventd::grpc::proto::SubscribeRequest;
use eventd::grpc::EventStreamService;
use tokio::time::timeout;
use tokio_stream::wrappers::TcpListenerStream;
use ve_protocol::{Event, EventKind, Severity};

struct TestGrpc {
    addr: std::net::SocketAddr,
    bus: EventBus,
    service: EventStreamService,
}

async fn spawn_grpc() -> TestGrpc {
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let bus = EventBus::start(
        BusConfig {
            worker_count: 1,
            ..BusConfig::default()
        },
        store.clone(),
    );
    let publisher = Arc::new(EventPublisher::new(store.clone(), bus.clone()));
    let service = EventStreamService::new(bus.clone(), publisher);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let server = service.clone().into_server();
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    TestGrpc { addr, bus, service }
}

async fn client(addr: std::net::SocketAddr) -> EventStreamClient<tonic::transport::Channel> {
    EventStreamClient::connect(format!("http://{addr}"))
        .await
        .expect("grpc connect")
}

fn make_event(kind: EventKind) -> Event {
    Event::new(kind, Severity::Info, "Test event", "test message")
}

#[tokio::test]
async fn stream_receives_only_subscribed_kinds() {
    let grpc = spawn_grpc().await;
    let mut client = client(grpc.addr).await;

    let mut stream = client
        .subscribe_events(SubscribeRequest {
            client_id: "test-client".to_owned(),
            event_types: vec!["score_changed".to_owned(), "bogus".to_owned()],
        })
        .await
        .expect("subscribe")
        .into_inner();

    // Wait for the registration to land on the bus.
    timeout(Duration::from_secs(2), async {
        while grpc.bus.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration");

    grpc.bus
        .publish(make_event(EventKind::IssueDetected))
        .expect("publish");
    grpc.bus
        .publish(make_event(EventKind::ScoreChanged))
        .expect("publish");

    let message = timeout(Duration::from_secs(2), stream.message())
        .await
        .expect("stream message")
        .expect("stream ok")
        .expect("message present");
    assert_eq!(message.kind, "score_changed");
    assert_eq!(message.severity, "info");
    assert!(!message.id.is_empty());

    grpc.bus.shutdown().await;
}

#[tokio::test]
async fn empty_client_id_is_invalid_argument() {
    let grpc = spawn_grpc().await;
    let mut client = client(grpc.addr).await;

    let status = client
        .subscribe_events(SubscribeRequest {
            client_id: String::new(),
            event_types: vec![],
        })
        .await
        .expect_err("empty client_id must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    grpc.bus.shutdown().await;
}

#[tokio::test]
async fn broadcast_event_counts_accepted_deliveries() {
    let grpc = spawn_grpc().await;
    let mut client_a = client(grpc.addr).await;
    let mut client_b = client(grpc.addr).await;

    let _stream_a = client_a
        .subscribe_events(SubscribeRequest {
            client_id: "a".to_owned(),
            event_types: vec!["score_changed".to_owned()],
        })
        .await
        .expect("subscribe a")
        .into_inner();
    let _stream_b = client_b
        .subscribe_events(SubscribeRequest {
            client_id: "b".to_owned(),
            event_types: vec!["issue_detected".to_owned()],
        })
        .await
        .expect("subscribe b")
        .into_inner();

    timeout(Duration::from_secs(2), async {
        while grpc.service.client_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both clients connected");

    let accepted = grpc
        .service
        .broadcast_event(&make_event(EventKind::ScoreChanged))
        .await;
    assert_eq!(accepted, 1, "only the score_changed subscriber accepts");

    let accepted = grpc
        .service
        .broadcast_event(&make_event(EventKind::ClientConnected))
        .await;
    assert_eq!(accepted, 0);

    grpc.bus.shutdown().await;
}

#[tokio::test]
async fn dropped_stream_unregisters_the_subscriber() {
    let grpc = spawn_grpc().await;
    let mut client = client(grpc.addr).await;

    let stream = client
        .subscribe_events(SubscribeRequest {
            client_id: "short-lived".to_owned(),
            event_types: vec![],
        })
        .await
        .expect("subscribe")
        .into_inner();

    timeout(Duration::from_secs(2), async {
        while grpc.service.client_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client connected");

    drop(stream);

    // The forwarding task notices on the next delivery attempt.
    timeout(Duration::from_secs(3), async {
        loop {
            let _ = grpc
                .bus
                .publish(make_event(EventKind::SystemHealthChanged));
            tokio::time::sleep(Duration::from_millis(50)).await;
            if grpc.service.client_count().await == 0 {
                break;
            }
        }
    })
    .await
    .expect("dropped stream must unregister");

    // The registry entry is gone too (only the grpc subscriber existed).
    assert_eq!(grpc.bus.subscriber_count().await, 0);

    grpc.bus.shutdown().await;
}

#[tokio::test]
async fn bus_shutdown_ends_open_streams() {
    let grpc = spawn_grpc().await;
    let mut client = client(grpc.addr).await;

    let mut stream = client
        .subscribe_events(SubscribeRequest {
            client_id: "until-shutdown".to_owned(),
            event_types: vec![],
        })
        .await
        .expect("subscribe")
        .into_inner();

    timeout(Duration::from_secs(2), async {
        while grpc.bus.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration");

    grpc.bus.shutdown().await;

    // The server-side queue closed; the stream must end rather than hang.
    let end = timeout(Duration::from_secs(2), stream.message())
        .await
        .expect("stream must end after shutdown");
    assert!(matches!(end, Ok(None) | Err(_)));
}
