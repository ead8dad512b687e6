use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind};

// ---------------------------------------------------------------------------
// Client -> gateway control messages
// ---------------------------------------------------------------------------

/// Inbound WebSocket control message.
///
/// `msg_type` is deliberately a plain string rather than a closed enum:
/// malformed JSON must produce an `invalid_message` error frame, while a
/// well-formed message with an unrecognized type is logged and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TypesPayload>,
}

/// `payload` of subscribe/unsubscribe messages: a list of kind tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypesPayload {
    #[serde(default)]
    pub types: Vec<String>,
}

// ---------------------------------------------------------------------------
// Gateway -> client frames
// ---------------------------------------------------------------------------

/// Acknowledgement discriminants for control responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    Pong,
    Subscribed,
    Unsubscribed,
    Status,
}

/// Outbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// An admitted event, wrapped with the server-side send time.
    Event {
        event: Event,
        timestamp: DateTime<Utc>,
    },
    /// Response to a handled control message.
    Ack {
        ack_type: AckType,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Structured error with a stable `code`; the connection stays open.
    Error {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn event(event: Event) -> Self {
        ServerFrame::Event {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn ack(ack_type: AckType, data: Option<serde_json::Value>) -> Self {
        ServerFrame::Ack {
            ack_type,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_owned(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Frozen wire error codes.
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const ORIGIN_REJECTED: &str = "origin_rejected";
    pub const SUBSCRIBER_LIMIT: &str = "subscriber_limit";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Default kind subset for WebSocket clients that connect without a
/// `types` query parameter.
pub const DEFAULT_WS_KINDS: [EventKind; 7] = [
    EventKind::VerificationCompleted,
    EventKind::VerificationFailed,
    EventKind::ScoreChanged,
    EventKind::IssueDetected,
    EventKind::IssueResolved,
    EventKind::SystemHealthChanged,
    EventKind::SecurityAlert,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;

    #[test]
    fn subscribe_message_parses_with_payload() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","payload":{"types":["issue_detected","score_changed"]}}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_type, "subscribe");
        let payload = msg.payload.unwrap();
        assert_eq!(payload.types, vec!["issue_detected", "score_changed"]);
    }

    #[test]
    fn ping_message_parses_without_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.msg_type, "ping");
        assert!(msg.action.is_none());
        assert!(msg.payload.is_none());
    }

    #[test]
    fn event_frame_serializes_with_type_tag() {
        let frame = ServerFrame::event(Event::new(
            EventKind::ScoreChanged,
            Severity::Info,
            "Score changed",
            "details inside",
        ));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["kind"], "score_changed");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn ack_frame_carries_ack_type_and_optional_data() {
        let frame = ServerFrame::ack(AckType::Pong, None);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["ack_type"], "pong");
        assert!(json.get("data").is_none());

        let frame = ServerFrame::ack(
            AckType::Status,
            Some(serde_json::json!({"types": ["score_changed"]})),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["data"]["types"][0], "score_changed");
    }

    #[test]
    fn error_frame_has_stable_code() {
        let frame = ServerFrame::error(error_codes::INVALID_MESSAGE, "bad json");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "invalid_message");
    }
}
