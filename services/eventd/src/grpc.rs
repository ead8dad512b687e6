//! gRPC gateway: the `EventStream.SubscribeEvents` server-streaming RPC.
//!
//! Each open stream is a streaming-RPC subscriber on the bus.  A forwarding
//! task bridges the bounded subscriber queue to the tonic response stream;
//! it unregisters on either side closing (client disconnect, reaper
//! eviction, or bus shutdown), so no stream outlives its registration.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;
use ve_protocol::{Event, EventKind};

use event_core::{Activity, EventBus, EventPublisher, Subscriber};

use crate::config::GrpcSettings;

pub mod proto {
    tonic::include_proto!("eventstream.v1");
}

use proto::event_stream_server::{EventStream, EventStreamServer};
use proto::{EventMessage, SubscribeRequest};

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct GrpcClient {
    /// Weak so the bus registry entry stays the only strong sender: when
    /// the bus drops the subscriber (shutdown, reaper) the channel closes
    /// and the stream ends.
    tx: mpsc::WeakSender<Event>,
    kinds: HashSet<EventKind>,
    activity: Arc<Activity>,
}

struct GatewayShared {
    bus: EventBus,
    publisher: Arc<EventPublisher>,
    clients: RwLock<HashMap<String, GrpcClient>>,
}

/// Cloneable handle; also the tonic service implementation.
#[derive(Clone)]
pub struct EventStreamService {
    shared: Arc<GatewayShared>,
}

impl EventStreamService {
    pub fn new(bus: EventBus, publisher: Arc<EventPublisher>) -> Self {
        EventStreamService {
            shared: Arc::new(GatewayShared {
                bus,
                publisher,
                clients: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Push a synthetic event to every interested connected client with a
    /// non-blocking enqueue.  Returns the number of accepted deliveries.
    pub async fn broadcast_event(&self, event: &Event) -> usize {
        let clients = self.shared.clients.read().await;
        let mut accepted = 0;
        for client in clients.values() {
            let interested = client.kinds.is_empty() || client.kinds.contains(&event.kind);
            if !interested {
                continue;
            }
            let Some(tx) = client.tx.upgrade() else {
                continue;
            };
            if tx.try_send(event.clone()).is_ok() {
                client.activity.touch();
                accepted += 1;
            }
        }
        accepted
    }

    /// Currently connected stream count (for tests and metrics).
    pub async fn client_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }

    pub fn into_server(self) -> EventStreamServer<EventStreamService> {
        EventStreamServer::new(self)
    }
}

#[tonic::async_trait]
impl EventStream for EventStreamService {
    type SubscribeEventsStream = ReceiverStream<Result<EventMessage, Status>>;

    async fn subscribe_events(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeEventsStream>, Status> {
        let req = request.into_inner();
        if req.client_id.trim().is_empty() {
            return Err(Status::invalid_argument("client_id is required"));
        }

        let kinds: HashSet<EventKind> = req
            .event_types
            .iter()
            .filter_map(|tag| match tag.parse::<EventKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    debug!(tag = tag.as_str(), "discarding unknown kind tag");
                    None
                }
            })
            .collect();

        let subscriber_id = format!("grpc-{}-{}", req.client_id, Uuid::new_v4());
        let activity = Activity::new();
        let capacity = self.shared.bus.subscriber_queue_capacity();
        let (tx, mut rx) = mpsc::channel::<Event>(capacity);

        let weak_tx = tx.downgrade();
        self.shared
            .bus
            .register(Subscriber::streaming_rpc(
                subscriber_id.clone(),
                kinds.clone(),
                tx,
                activity.clone(),
            ))
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        self.shared.clients.write().await.insert(
            subscriber_id.clone(),
            GrpcClient {
                tx: weak_tx,
                kinds,
                activity: activity.clone(),
            },
        );
        if let Err(e) = self
            .shared
            .publisher
            .publish_client_connected(&req.client_id, "grpc")
        {
            debug!(client_id = %req.client_id, error = %e, "client-connected event not published");
        }
        info!(subscriber_id = %subscriber_id, client_id = %req.client_id, "grpc stream opened");

        let (out_tx, out_rx) = mpsc::channel::<Result<EventMessage, Status>>(capacity);
        let shared = Arc::clone(&self.shared);
        let client_id = req.client_id;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out_tx.send(Ok(event_to_message(&event))).await.is_err() {
                    // Client went away; stop bridging.
                    break;
                }
            }
            // Either side closed: drop the registration and the client slot.
            activity.set_connected(false);
            shared.bus.unregister(&subscriber_id).await;
            shared.clients.write().await.remove(&subscriber_id);
            if let Err(e) = shared
                .publisher
                .publish_client_disconnected(&client_id, "grpc")
            {
                debug!(client_id = %client_id, error = %e, "client-disconnected event not published");
            }
            info!(subscriber_id = %subscriber_id, "grpc stream closed");
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

fn event_to_message(event: &Event) -> EventMessage {
    EventMessage {
        id: event.id.clone(),
        kind: event.kind.as_tag().to_owned(),
        severity: event.severity.as_tag().to_owned(),
        title: event.title.clone(),
        message: event.message.clone(),
        details_json: serde_json::to_string(&event.details).unwrap_or_else(|_| "{}".to_owned()),
        model_id: event.model_id.clone().unwrap_or_default(),
        provider_id: event.provider_id.clone().unwrap_or_default(),
        verification_id: event.verification_id.clone().unwrap_or_default(),
        issue_id: event.issue_id.clone().unwrap_or_default(),
        client_id: event.client_id.clone().unwrap_or_default(),
        user_id: event.user_id.clone().unwrap_or_default(),
        source: event.source.clone(),
        timestamp: event.timestamp.to_rfc3339(),
        processed_at: event
            .processed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    }
}

/// Serve the gRPC listener until `shutdown` resolves.
///
/// Takes a pre-bound listener so callers (and tests) can bind an
/// ephemeral port and learn the address before serving starts.
pub async fn serve(
    service: EventStreamService,
    listener: tokio::net::TcpListener,
    settings: GrpcSettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), tonic::transport::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, max_streams = settings.max_streams, "grpc gateway listening");
    }
    Server::builder()
        .max_concurrent_streams(settings.max_streams)
        .http2_keepalive_interval(Some(settings.keepalive_interval))
        .http2_keepalive_timeout(Some(settings.keepalive_timeout))
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .inspect_err(|e| warn!(error = %e, "grpc gateway exited with error"))
}
