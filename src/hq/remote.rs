//! Remote-mode registration client — the other half of C12. Spawned when
//! `[hq]` carries a `remote_url`: maintains a persistent outbound WebSocket
//! to an HQ, answering proxied session operations against this server's own
//! `AppState`.
//!
//! Grounded on `tunnel/client.rs`'s reconnect loop: exponential backoff
//! capped at a configured max, reset on a clean disconnect, and a
//! `Permanent`/`Transient` split so a rejected registration stops retrying
//! instead of hammering the HQ forever.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::HqConfig;
use crate::error::CoreError;
use crate::sessions::launch::{spawn_forwarder, LaunchRequest};
use crate::sessions::record::TitleMode;
use crate::AppState;

use super::protocol::{HqMessage, HqRequestBody, HqResponseBody};

pub fn spawn(state: AppState, config: HqConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(remote_loop(state, config))
}

enum ConnectError {
    Permanent(String),
    Transient(String),
}

async fn remote_loop(state: AppState, config: HqConfig) {
    let Some(url) = config.remote_url.clone() else {
        error!("hq: remote_url is required in remote mode");
        return;
    };
    let name = config.remote_name.clone().unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "remote".to_string())
    });

    let mut delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);

    loop {
        info!(url = %url, "hq: connecting to aggregator");
        match connect_and_serve(&state, &config, &url, &name).await {
            Ok(()) => {
                info!("hq: connection to aggregator closed cleanly, reconnecting");
                delay = Duration::from_secs(config.reconnect_delay_secs);
            }
            Err(ConnectError::Permanent(msg)) => {
                error!(error = %msg, "hq: registration rejected, giving up");
                return;
            }
            Err(ConnectError::Transient(msg)) => {
                warn!(error = %msg, backoff_secs = delay.as_secs(), "hq: connection failed, retrying");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

async fn connect_and_serve(
    state: &AppState,
    config: &HqConfig,
    url: &str,
    name: &str,
) -> Result<(), ConnectError> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ConnectError::Transient(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let register = HqMessage::Register { name: name.to_string(), key: config.hq_key.clone() };
    sink.send(to_ws(&register)).await.map_err(|e| ConnectError::Transient(e.to_string()))?;

    match stream.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<HqMessage>(&text) {
            Ok(HqMessage::Registered { remote_id }) => {
                info!(remote_id = %remote_id, "hq: registered with aggregator");
            }
            Ok(HqMessage::Rejected { reason }) => return Err(ConnectError::Permanent(reason)),
            _ => return Err(ConnectError::Transient("unexpected response to registration".into())),
        },
        Some(Ok(_)) => return Err(ConnectError::Transient("non-text response to registration".into())),
        Some(Err(e)) => return Err(ConnectError::Transient(e.to_string())),
        None => return Err(ConnectError::Transient("connection closed during registration".into())),
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<HqMessage>(64);
    let heartbeat_tx = outbound_tx.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            interval.tick().await;
            if heartbeat_tx.send(HqMessage::Heartbeat).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if sink.send(to_ws(&msg)).await.is_err() {
                            break Err(ConnectError::Transient("send to aggregator failed".into()));
                        }
                    }
                    None => break Ok(()),
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(HqMessage::Request { request_id, body }) = serde_json::from_str::<HqMessage>(&text) {
                            let state = state.clone();
                            let reply_tx = outbound_tx.clone();
                            tokio::spawn(async move {
                                let body = handle_request(&state, body).await;
                                let _ = reply_tx.send(HqMessage::Response { request_id, body }).await;
                            });
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(ConnectError::Transient(e.to_string())),
                    _ => {}
                }
            }
        }
    };

    heartbeat_task.abort();
    result
}

fn to_ws(msg: &HqMessage) -> Message {
    Message::Text(serde_json::to_string(msg).unwrap_or_default().into())
}

fn error_body(err: CoreError) -> HqResponseBody {
    HqResponseBody::Error { error: err.to_string(), status: err.http_status().as_u16() }
}

/// Services one proxied request against this server's own state, the same
/// way a local HTTP handler would.
async fn handle_request(state: &AppState, body: HqRequestBody) -> HqResponseBody {
    match body {
        HqRequestBody::ListSessions => {
            let sessions = state.session_manager.list().await;
            HqResponseBody::Ok(json!(sessions))
        }
        HqRequestBody::GetSession { session_id } => match state.session_manager.load(&session_id).await {
            Ok(record) => HqResponseBody::Ok(json!(record)),
            Err(e) => error_body(e),
        },
        HqRequestBody::CreateSession { command, working_dir, name, cols, rows } => {
            let req = LaunchRequest {
                command,
                working_dir: Some(working_dir),
                name,
                cols,
                rows,
                title_mode: Some(TitleMode::None),
            };
            match spawn_forwarder(&state.config, req).await {
                Ok(session_id) => HqResponseBody::Ok(json!({ "sessionId": session_id })),
                Err(e) => error_body(e),
            }
        }
        HqRequestBody::DeleteSession { session_id } => {
            let frame = crate::ipc::Frame::signal(session_id.clone(), libc::SIGTERM as u8);
            match send_frame(state, &session_id, frame).await {
                Ok(()) => HqResponseBody::Ok(json!({ "ok": true })),
                Err(e) => error_body(e),
            }
        }
        HqRequestBody::Input { session_id, text } => match send_control_frame(
            state,
            &session_id,
            crate::ipc::FrameType::InputText,
            text.into_bytes(),
        )
        .await
        {
            Ok(()) => HqResponseBody::Ok(json!({ "ok": true })),
            Err(e) => error_body(e),
        },
        HqRequestBody::Resize { session_id, cols, rows } => {
            let frame = crate::ipc::Frame::resize(session_id.clone(), cols, rows);
            match send_frame(state, &session_id, frame).await {
                Ok(()) => HqResponseBody::Ok(json!({ "ok": true })),
                Err(e) => error_body(e),
            }
        }
        HqRequestBody::GetText { session_id } => match state.hub.render_text(&session_id).await {
            Ok(text) => HqResponseBody::Ok(json!({ "text": text })),
            Err(e) => error_body(e),
        },
    }
}

async fn send_control_frame(
    state: &AppState,
    session_id: &str,
    frame_type: crate::ipc::FrameType,
    payload: Vec<u8>,
) -> Result<(), CoreError> {
    send_frame(state, session_id, crate::ipc::Frame::new(frame_type, session_id.to_string(), payload)).await
}

/// Dials the session's IPC socket for a single fire-and-forget control frame.
/// Mirrors the forwarder's expectation that any number of short-lived control
/// connections may come and go over a session's life.
async fn send_frame(state: &AppState, session_id: &str, frame: crate::ipc::Frame) -> Result<(), CoreError> {
    let paths = state.session_manager.paths(session_id);
    crate::ipc::socket::send_once(&paths.ipc_socket(), &frame).await
}
