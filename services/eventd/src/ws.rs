//! WebSocket gateway: upgrade, subscription negotiation, control protocol,
//! and the per-connection socket loop.
//!
//! # Connection lifecycle
//! 1. Origin check before any upgrade work (403 on mismatch).
//! 2. `?types=` CSV negotiates the initial kind set; unknown tags are
//!    discarded; empty resolves to the documented default subset.
//! 3. The socket task owns both directions: outbound deliveries drain the
//!    subscriber queue, inbound frames refresh the sliding read deadline
//!    and drive the control protocol, server pings fire under the read
//!    deadline.
//! 4. When the bus drops the registration (shutdown or reaper) the queue
//!    closes and the task sends `Close(GoingAway)` before exiting.

use std::collections::HashSet;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use ve_protocol::{
    AckType, ClientMessage, DEFAULT_WS_KINDS, Event, EventKind, ServerFrame, error_codes,
};

use event_core::{Activity, Subscriber};

use crate::origin::origin_allowed;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    types: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if !origin_allowed(&state.ws.allowed_origins, origin.as_deref()) {
        state.metrics.record_rejected();
        warn!(
            origin = origin.as_deref().unwrap_or("<none>"),
            "websocket upgrade rejected by origin allowlist"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let kinds = negotiated_kinds(query.types.as_deref());
    ws.max_message_size(state.ws.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, kinds))
        .into_response()
}

/// Resolve the `?types=` CSV into the initial kind set.
fn negotiated_kinds(csv: Option<&str>) -> HashSet<EventKind> {
    let parsed = match csv {
        Some(csv) => parse_kind_tags(csv.split(',')),
        None => HashSet::new(),
    };
    if parsed.is_empty() {
        DEFAULT_WS_KINDS.into_iter().collect()
    } else {
        parsed
    }
}

/// Parse kind tags, silently discarding unknown tokens.
fn parse_kind_tags<'a>(tags: impl Iterator<Item = &'a str>) -> HashSet<EventKind> {
    tags.filter_map(|tag| {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }
        match tag.parse::<EventKind>() {
            Ok(kind) => Some(kind),
            Err(_) => {
                debug!(tag, "discarding unknown kind tag");
                None
            }
        }
    })
    .collect()
}

fn sorted_tags(kinds: &HashSet<EventKind>) -> Vec<&'static str> {
    let mut tags: Vec<&'static str> = kinds.iter().map(|k| k.as_tag()).collect();
    tags.sort_unstable();
    tags
}

async fn handle_socket(mut socket: WebSocket, state: AppState, kinds: HashSet<EventKind>) {
    let client_id = format!("ws-{}", Uuid::new_v4());
    state.metrics.connection_opened();

    let activity = Activity::new();
    let (tx, rx) = mpsc::channel::<Event>(state.bus.subscriber_queue_capacity());
    if let Err(e) = state
        .bus
        .register(Subscriber::streaming_ws(
            client_id.clone(),
            kinds.clone(),
            tx,
            activity.clone(),
        ))
        .await
    {
        warn!(client_id = %client_id, error = %e, "failed to register websocket subscriber");
        state.metrics.record_error();
        let frame = ServerFrame::error(error_codes::INTERNAL_ERROR, "subscriber registration failed");
        let _ = send_frame(&mut socket, &state, &frame).await;
        state.metrics.connection_closed();
        return;
    }

    if let Err(e) = state.publisher.publish_client_connected(&client_id, "websocket") {
        debug!(client_id = %client_id, error = %e, "client-connected event not published");
    }
    info!(client_id = %client_id, kinds = kinds.len(), "websocket client connected");

    run_socket(&mut socket, &state, &client_id, kinds, rx, &activity).await;

    activity.set_connected(false);
    state.bus.unregister(&client_id).await;
    if let Err(e) = state
        .publisher
        .publish_client_disconnected(&client_id, "websocket")
    {
        debug!(client_id = %client_id, error = %e, "client-disconnected event not published");
    }
    state.metrics.connection_closed();
    info!(client_id = %client_id, "websocket client disconnected");
}

async fn run_socket(
    socket: &mut WebSocket,
    state: &AppState,
    client_id: &str,
    mut local_kinds: HashSet<EventKind>,
    mut rx: mpsc::Receiver<Event>,
    activity: &Activity,
) {
    let mut ping_interval = tokio::time::interval(state.ws.ping_interval);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let frame = ServerFrame::event(event);
                        if send_frame(socket, state, &frame).await.is_err() {
                            state.metrics.record_error();
                            break;
                        }
                    }
                    None => {
                        // The bus dropped our registration: shutdown or
                        // reaper eviction.  Say goodbye properly.
                        let close = Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server going away".into(),
                        }));
                        let _ = timeout(state.ws.write_deadline, socket.send(close)).await;
                        break;
                    }
                }
            }
            inbound = timeout(state.ws.read_deadline, socket.recv()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        state.metrics.record_received();
                        activity.touch();
                        if handle_control(socket, state, client_id, &mut local_kinds, text.as_str())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        activity.touch();
                        if timeout(state.ws.write_deadline, socket.send(Message::Pong(data)))
                            .await
                            .map_or(true, |r| r.is_err())
                        {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {
                        activity.touch();
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        // Binary frames are not part of the protocol.
                        debug!(client_id = %client_id, "ignoring binary frame");
                    }
                    Ok(Some(Err(e))) => {
                        warn!(client_id = %client_id, error = %e, "websocket read error");
                        state.metrics.record_error();
                        break;
                    }
                    Err(_elapsed) => {
                        warn!(client_id = %client_id, "read deadline exceeded, closing");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                let ping = Message::Ping(Vec::new().into());
                if timeout(state.ws.write_deadline, socket.send(ping))
                    .await
                    .map_or(true, |r| r.is_err())
                {
                    break;
                }
            }
        }
    }
}

/// Handle one inbound control message.  `Err` means the connection is no
/// longer writable and the caller should stop.
async fn handle_control(
    socket: &mut WebSocket,
    state: &AppState,
    client_id: &str,
    local_kinds: &mut HashSet<EventKind>,
    text: &str,
) -> Result<(), ()> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => {
            state.metrics.record_error();
            let frame = ServerFrame::error(error_codes::INVALID_MESSAGE, "malformed control message");
            return send_frame(socket, state, &frame).await;
        }
    };

    match msg.msg_type.as_str() {
        "subscribe" => {
            let requested = msg
                .payload
                .map(|p| parse_kind_tags(p.types.iter().map(String::as_str)))
                .unwrap_or_default();
            if !requested.is_empty() {
                *local_kinds = requested;
                state
                    .bus
                    .set_interested_kinds(client_id, local_kinds.clone())
                    .await;
            }
            let frame = ServerFrame::ack(
                AckType::Subscribed,
                Some(serde_json::json!({ "types": sorted_tags(local_kinds) })),
            );
            send_frame(socket, state, &frame).await
        }
        "unsubscribe" => {
            let requested = msg
                .payload
                .map(|p| parse_kind_tags(p.types.iter().map(String::as_str)))
                .unwrap_or_default();
            for kind in &requested {
                local_kinds.remove(kind);
            }
            if local_kinds.is_empty() {
                // Removing every kind falls back to the connect-time
                // default subset rather than flipping to "all kinds".
                *local_kinds = DEFAULT_WS_KINDS.into_iter().collect();
            }
            state
                .bus
                .set_interested_kinds(client_id, local_kinds.clone())
                .await;
            let frame = ServerFrame::ack(
                AckType::Unsubscribed,
                Some(serde_json::json!({ "types": sorted_tags(local_kinds) })),
            );
            send_frame(socket, state, &frame).await
        }
        "ping" => {
            let frame = ServerFrame::ack(AckType::Pong, None);
            send_frame(socket, state, &frame).await
        }
        "status" => {
            let frame = ServerFrame::ack(
                AckType::Status,
                Some(serde_json::json!({
                    "client_id": client_id,
                    "types": sorted_tags(local_kinds),
                })),
            );
            send_frame(socket, state, &frame).await
        }
        other => {
            debug!(client_id = %client_id, msg_type = other, "ignoring unknown control message type");
            Ok(())
        }
    }
}

/// Serialize and send one frame under the write deadline.
async fn send_frame(socket: &mut WebSocket, state: &AppState, frame: &ServerFrame) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(frame) else {
        return Err(());
    };
    match timeout(state.ws.write_deadline, socket.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => {
            state.metrics.record_sent();
            Ok(())
        }
        _ => Err(()),
    }
}
