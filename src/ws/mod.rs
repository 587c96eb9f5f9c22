//! Binary-frame WebSocket transport (C11): the live control channel for
//! subscribing to a session's output and pushing input/resize/signal.
//!
//! Grounded on the teacher's `ws/mod.rs` connection lifecycle — query-param
//! token auth before upgrade, split sink/stream, one forwarding task per
//! live subscription feeding a shared outbound channel, cleanup on
//! disconnect — generalized from its JSON message protocol to the binary
//! frame protocol (C7) this crate already shares with the forwarder's Unix
//! socket.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::hub::HubEvent;
use crate::ipc::{Frame, FrameDecoder, FrameType, SubscribeFlags};
use crate::AppState;

pub const SUBPROTOCOL: &str = "vibetunnel.v3";

#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter — the upgrade request can't carry
    /// a bearer header from a browser WebSocket client.
    pub token: String,
}

/// `GET /ws?token=<key>` — validates the token before the upgrade completes.
pub async fn ws_upgrade(State(state): State<AppState>, Query(query): Query<WsQuery>, ws: WebSocketUpgrade) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes()) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    ws.protocols([SUBPROTOCOL]).on_upgrade(move |socket| handle_ws(socket, state))
}

fn hub_event_to_frame(session_id: &str, event: HubEvent) -> Frame {
    match event {
        HubEvent::Header { cols, rows } | HubEvent::Resize(cols, rows) => Frame::resize(session_id, cols, rows),
        HubEvent::Output(data) => Frame::new(FrameType::Stdout, session_id, data.into_bytes()),
        HubEvent::SnapshotVt(bytes) => Frame::snapshot_vt(session_id, bytes),
        HubEvent::Marker(data) => {
            Frame::new(FrameType::Event, session_id, json!({"type": "marker", "data": data}).to_string().into_bytes())
        }
        HubEvent::Exit(code) => {
            Frame::new(FrameType::Event, session_id, json!({"type": "exit", "exitCode": code}).to_string().into_bytes())
        }
        HubEvent::Error(message) => Frame::error(session_id, 0, &message),
    }
}

struct Subscription {
    subscriber_id: u64,
    task: tokio::task::JoinHandle<()>,
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);

    let connected = Frame::global(FrameType::Event, json!({"type": "connected"}).to_string().into_bytes());
    if send_frame(&mut sink, &connected).await.is_err() {
        return;
    }

    let mut decoder = FrameDecoder::new();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        decoder.feed(&bytes);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => {
                                    handle_incoming_frame(&state, frame, &outbound_tx, &mut subscriptions).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    let _ = send_frame(&mut sink, &Frame::error("", 6, &e.to_string())).await;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "ws: read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for (session_id, sub) in subscriptions {
        sub.task.abort();
        state.hub.unsubscribe(&session_id, sub.subscriber_id).await;
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    sink.send(Message::Binary(frame.encode().to_vec().into())).await
}

async fn handle_incoming_frame(
    state: &AppState,
    frame: Frame,
    outbound_tx: &mpsc::Sender<Frame>,
    subscriptions: &mut HashMap<String, Subscription>,
) {
    match frame.frame_type {
        FrameType::Subscribe => {
            let Some((flags, min_ms, max_ms)) = frame.parse_subscribe() else {
                let _ = outbound_tx.send(Frame::error(frame.session_id.clone(), 6, "malformed subscribe payload")).await;
                return;
            };
            let wants_stdout = flags.contains(SubscribeFlags::STDOUT);
            let wants_snapshots = flags.contains(SubscribeFlags::SNAPSHOTS);

            match state.hub.subscribe(&frame.session_id, wants_stdout, wants_snapshots, min_ms, max_ms).await {
                Ok(subscriber) => {
                    if let Some(old) = subscriptions.remove(&frame.session_id) {
                        old.task.abort();
                        state.hub.unsubscribe(&frame.session_id, old.subscriber_id).await;
                    }
                    let subscriber_id = subscriber.id;
                    let session_id = frame.session_id.clone();
                    let tx = outbound_tx.clone();
                    let task = tokio::spawn(async move {
                        while let Some(event) = subscriber.recv().await {
                            if tx.send(hub_event_to_frame(&session_id, event)).await.is_err() {
                                break;
                            }
                        }
                    });
                    subscriptions.insert(frame.session_id.clone(), Subscription { subscriber_id, task });
                }
                Err(e) => {
                    let _ = outbound_tx.send(Frame::error(frame.session_id.clone(), e.frame_code(), &e.to_string())).await;
                }
            }
        }
        FrameType::Unsubscribe => {
            if let Some(sub) = subscriptions.remove(&frame.session_id) {
                sub.task.abort();
                state.hub.unsubscribe(&frame.session_id, sub.subscriber_id).await;
            }
        }
        FrameType::InputText | FrameType::Resize | FrameType::Signal => {
            let paths = state.session_manager.paths(&frame.session_id);
            if let Err(e) = crate::ipc::socket::send_once(&paths.ipc_socket(), &frame).await {
                let _ = outbound_tx.send(Frame::error(frame.session_id.clone(), e.frame_code(), &e.to_string())).await;
            }
        }
        FrameType::Ping => {
            let _ = outbound_tx.send(Frame::global(FrameType::Pong, vec![])).await;
        }
        other => {
            warn!(frame_type = ?other, session_id = %frame.session_id, "ws: unexpected frame from client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_event_becomes_a_stdout_frame() {
        let frame = hub_event_to_frame("s1", HubEvent::Output("hi".into()));
        assert_eq!(frame.frame_type, FrameType::Stdout);
        assert_eq!(frame.session_id, "s1");
        assert_eq!(frame.payload, b"hi");
    }

    #[test]
    fn exit_event_carries_the_exit_code_as_json() {
        let frame = hub_event_to_frame("s1", HubEvent::Exit(7));
        assert_eq!(frame.frame_type, FrameType::Event);
        let body: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(body["exitCode"], 7);
    }

    #[test]
    fn resize_event_becomes_a_resize_frame() {
        let frame = hub_event_to_frame("s1", HubEvent::Resize(100, 40));
        assert_eq!(frame.frame_type, FrameType::Resize);
        assert_eq!(frame.parse_resize(), Some((100, 40)));
    }
}
