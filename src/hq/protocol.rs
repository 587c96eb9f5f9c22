//! Wire messages exchanged over the HQ↔remote WebSocket tunnel (C12).
//!
//! JSON-tagged, one message per WS text frame — deliberately not the binary
//! C7 frame protocol, since this channel carries whole REST-shaped requests
//! and responses rather than a live byte stream. Grounded on the shape of
//! `tunnel/relay.rs`'s device messages (register, heartbeat, request/response
//! keyed by an id), generalized from device-serial proxying to the
//! session-operation surface this crate exposes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HqMessage {
    Register { name: String, key: String },
    Registered { remote_id: String },
    Rejected { reason: String },
    Heartbeat,
    Request { request_id: String, body: HqRequestBody },
    Response { request_id: String, body: HqResponseBody },
}

/// One proxyable session operation, mirroring the HTTP surface in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HqRequestBody {
    ListSessions,
    GetSession { session_id: String },
    CreateSession {
        command: Vec<String>,
        working_dir: String,
        name: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    },
    DeleteSession { session_id: String },
    Input { session_id: String, text: String },
    Resize { session_id: String, cols: u16, rows: u16 },
    GetText { session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HqResponseBody {
    Ok(serde_json::Value),
    Error { error: String, status: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = HqMessage::Request {
            request_id: "r1".into(),
            body: HqRequestBody::Resize { session_id: "s1".into(), cols: 80, rows: 24 },
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: HqMessage = serde_json::from_str(&json).unwrap();
        match back {
            HqMessage::Request { request_id, body: HqRequestBody::Resize { session_id, cols, rows } } => {
                assert_eq!(request_id, "r1");
                assert_eq!(session_id, "s1");
                assert_eq!((cols, rows), (80, 24));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ok_response_carries_arbitrary_json() {
        let resp = HqResponseBody::Ok(serde_json::json!({"sessionId": "abc"}));
        let json = serde_json::to_string(&resp).unwrap();
        let back: HqResponseBody = serde_json::from_str(&json).unwrap();
        match back {
            HqResponseBody::Ok(value) => assert_eq!(value["sessionId"], "abc"),
            HqResponseBody::Error { .. } => panic!("expected Ok"),
        }
    }

    #[test]
    fn error_response_round_trips() {
        let resp = HqResponseBody::Error { error: "not found".into(), status: 404 };
        let json = serde_json::to_string(&resp).unwrap();
        let back: HqResponseBody = serde_json::from_str(&json).unwrap();
        match back {
            HqResponseBody::Error { error, status } => {
                assert_eq!(error, "not found");
                assert_eq!(status, 404);
            }
            HqResponseBody::Ok(_) => panic!("expected Error"),
        }
    }

    #[test]
    fn register_message_uses_snake_case_tag() {
        let msg = HqMessage::Register { name: "laptop".into(), key: "secret".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"register""#));
    }
}
