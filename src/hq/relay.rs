//! HQ-side registry of connected remotes and request proxying (C12).
//!
//! Grounded on `tunnel/relay.rs`'s `RelayState`: a registry keyed by
//! identifier behind an `RwLock<HashMap>`, a heartbeat sweep evicting stale
//! entries, and a pending-oneshot-keyed request map per connection used to
//! correlate proxied responses. Generalized here from device serials to
//! named remote servers and from REST-over-WS device proxying to this
//! crate's session-operation surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::protocol::{HqMessage, HqRequestBody, HqResponseBody};
use crate::auth::constant_time_eq;
use crate::error::CoreError;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One remote currently registered with this HQ, reachable over its inbound
/// WebSocket connection.
pub struct ConnectedRemote {
    pub remote_id: String,
    pub name: String,
    outbound: mpsc::Sender<HqMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<HqResponseBody>>>,
    last_heartbeat_ms: AtomicU64,
}

/// Drains every pending request for a remote with an error response, mirroring
/// `drain_device`'s behavior when a device's tunnel connection drops.
async fn drain_pending(remote: &ConnectedRemote, reason: &str) {
    let mut pending = remote.pending.lock().await;
    let count = pending.len();
    for (_, tx) in pending.drain() {
        let _ = tx.send(HqResponseBody::Error { error: reason.to_string(), status: 502 });
    }
    if count > 0 {
        info!(remote = %remote.name, count, "drained pending HQ requests: {reason}");
    }
}

#[derive(Clone)]
pub struct HqState {
    remotes: Arc<RwLock<HashMap<String, Arc<ConnectedRemote>>>>,
    hq_key: String,
    epoch: Instant,
}

impl HqState {
    pub fn new(hq_key: String) -> Self {
        Self { remotes: Arc::new(RwLock::new(HashMap::new())), hq_key, epoch: Instant::now() }
    }

    fn now_ms(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.epoch.elapsed().as_millis() as u64
        }
    }

    async fn register(&self, name: String, outbound: mpsc::Sender<HqMessage>) -> String {
        let remote_id = Uuid::new_v4().to_string();
        let remote = Arc::new(ConnectedRemote {
            remote_id: remote_id.clone(),
            name,
            outbound,
            pending: Mutex::new(HashMap::new()),
            last_heartbeat_ms: AtomicU64::new(self.now_ms()),
        });
        self.remotes.write().await.insert(remote_id.clone(), remote);
        remote_id
    }

    async fn unregister(&self, remote_id: &str) {
        let removed = self.remotes.write().await.remove(remote_id);
        if let Some(remote) = removed {
            drain_pending(&remote, "remote disconnected").await;
        }
    }

    async fn touch_heartbeat(&self, remote_id: &str) {
        if let Some(remote) = self.remotes.read().await.get(remote_id) {
            remote.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Evicts remotes whose heartbeat is older than [`HEARTBEAT_TIMEOUT`].
    pub async fn sweep_dead(&self) -> Vec<String> {
        let timeout_ms = HEARTBEAT_TIMEOUT.as_millis() as u64;
        let now_ms = self.now_ms();
        let mut remotes = self.remotes.write().await;
        let dead: Vec<String> = remotes
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_heartbeat_ms.load(Ordering::Relaxed)) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            if let Some(remote) = remotes.remove(id) {
                drain_pending(&remote, "heartbeat timeout").await;
                warn!(remote_id = %id, "evicted remote (heartbeat timeout)");
            }
        }
        dead
    }

    async fn resolve_response(&self, remote_id: &str, request_id: &str, body: HqResponseBody) {
        if let Some(remote) = self.remotes.read().await.get(remote_id) {
            if let Some(tx) = remote.pending.lock().await.remove(request_id) {
                let _ = tx.send(body);
            }
        }
    }

    /// Sends `body` to `remote_id` and awaits its correlated response, or a
    /// `ForwarderUnreachable` error on timeout / disconnect.
    pub async fn proxy_request(&self, remote_id: &str, body: HqRequestBody) -> Result<HqResponseBody, CoreError> {
        let remote = self
            .remotes
            .read()
            .await
            .get(remote_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("remote {remote_id}")))?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        remote.pending.lock().await.insert(request_id.clone(), tx);

        if remote.outbound.send(HqMessage::Request { request_id: request_id.clone(), body }).await.is_err() {
            remote.pending.lock().await.remove(&request_id);
            return Err(CoreError::ForwarderUnreachable(format!("remote {remote_id} send failed")));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoreError::ForwarderUnreachable(format!("remote {remote_id} dropped the request"))),
            Err(_) => {
                remote.pending.lock().await.remove(&request_id);
                Err(CoreError::ForwarderUnreachable(format!("remote {remote_id} timed out")))
            }
        }
    }

    /// `(remote_id, name)` pairs for every currently connected remote, used
    /// to tag the union returned from `GET /api/sessions`.
    pub async fn remotes(&self) -> Vec<(String, String)> {
        self.remotes.read().await.values().map(|r| (r.remote_id.clone(), r.name.clone())).collect()
    }

    /// Proxies `ListSessions` to every connected remote and flattens the
    /// results, tagging each session with its owning remote's name.
    pub async fn list_remote_sessions(&self) -> Vec<serde_json::Value> {
        let remotes = self.remotes().await;
        let mut out = Vec::new();
        for (remote_id, name) in remotes {
            match self.proxy_request(&remote_id, HqRequestBody::ListSessions).await {
                Ok(HqResponseBody::Ok(serde_json::Value::Array(sessions))) => {
                    for mut session in sessions {
                        if let Some(obj) = session.as_object_mut() {
                            obj.insert("remoteId".to_string(), json!(remote_id));
                            obj.insert("remoteName".to_string(), json!(name));
                        }
                        out.push(session);
                    }
                }
                Ok(_) | Err(_) => {
                    warn!(remote = %name, "failed to list sessions from remote");
                }
            }
        }
        out
    }
}

/// `GET /api/hq/register` — accepts a remote's inbound WebSocket and keeps it
/// alive until it disconnects. Mirrors `tunnel/relay.rs`'s
/// `device_register_ws`/`handle_device_ws` pair, minus the device-serial and
/// client-multiplexing machinery this crate has no use for.
pub async fn hq_register_ws(ws: WebSocketUpgrade, State(state): State<HqState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_remote_ws(socket, state))
}

async fn handle_remote_ws(socket: WebSocket, state: HqState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<HqMessage>(64);

    let registered = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<HqMessage>(&text) {
                Ok(HqMessage::Register { name, key }) => {
                    if !constant_time_eq(state.hq_key.as_bytes(), key.as_bytes()) {
                        let _ = sink.send(to_ws(&HqMessage::Rejected { reason: "invalid hq key".into() })).await;
                        return;
                    }
                    break Some(name);
                }
                _ => continue,
            },
            Some(Ok(Message::Close(_))) | None => return,
            _ => continue,
        }
    };

    let Some(name) = registered else { return };
    let remote_id = state.register(name.clone(), outbound_tx).await;
    if sink.send(to_ws(&HqMessage::Registered { remote_id: remote_id.clone() })).await.is_err() {
        state.unregister(&remote_id).await;
        return;
    }
    info!(remote_id = %remote_id, name = %name, "hq: remote registered");

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if sink.send(to_ws(&msg)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<HqMessage>(&text) {
                            Ok(HqMessage::Heartbeat) => state.touch_heartbeat(&remote_id).await,
                            Ok(HqMessage::Response { request_id, body }) => {
                                state.resolve_response(&remote_id, &request_id, body).await;
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(remote_id = %remote_id, error = %e, "hq: connection error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.unregister(&remote_id).await;
    info!(remote_id = %remote_id, "hq: remote disconnected");
}

fn to_ws(msg: &HqMessage) -> Message {
    Message::Text(serde_json::to_string(msg).unwrap_or_default().into())
}

/// Router exposing the HQ registration endpoint, merged into the main app
/// when `[hq] enabled = true`.
pub fn hq_router(state: HqState) -> Router {
    Router::new().route("/api/hq/register", get(hq_register_ws)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proxy_request_resolves_once_the_remote_responds() {
        let state = HqState::new("secret".into());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let remote_id = state.register("laptop".into(), outbound_tx).await;

        let state2 = state.clone();
        let remote_id2 = remote_id.clone();
        let responder = tokio::spawn(async move {
            let HqMessage::Request { request_id, .. } = outbound_rx.recv().await.unwrap() else {
                panic!("expected a Request message");
            };
            state2
                .resolve_response(&remote_id2, &request_id, HqResponseBody::Ok(json!({"sessionId": "abc"})))
                .await;
        });

        let response = state.proxy_request(&remote_id, HqRequestBody::ListSessions).await.unwrap();
        responder.await.unwrap();
        match response {
            HqResponseBody::Ok(value) => assert_eq!(value["sessionId"], "abc"),
            HqResponseBody::Error { .. } => panic!("expected Ok"),
        }
    }

    #[tokio::test]
    async fn proxy_request_errors_for_unknown_remote() {
        let state = HqState::new("secret".into());
        let err = state.proxy_request("nonexistent", HqRequestBody::ListSessions).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_drains_pending_requests_with_an_error() {
        let state = HqState::new("secret".into());
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let remote_id = state.register("laptop".into(), outbound_tx).await;

        let state2 = state.clone();
        let remote_id2 = remote_id.clone();
        let waiter = tokio::spawn(async move { state2.proxy_request(&remote_id2, HqRequestBody::ListSessions).await });

        // Give proxy_request a chance to register its pending entry before we drop the remote.
        tokio::task::yield_now().await;
        state.unregister(&remote_id).await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::ForwarderUnreachable(_))));
    }

    #[tokio::test]
    async fn sweep_dead_evicts_remotes_past_the_heartbeat_timeout() {
        let mut state = HqState::new("secret".into());
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let remote_id = state.register("laptop".into(), outbound_tx).await;

        // Push `epoch` further into the past so `now_ms()` jumps ahead of the
        // heartbeat recorded at registration, without sleeping in the test.
        state.epoch -= HEARTBEAT_TIMEOUT + Duration::from_secs(1);

        let dead = state.sweep_dead().await;
        assert!(dead.contains(&remote_id));
        assert!(state.remotes().await.is_empty());
    }
}
