//! Unauthenticated health-check endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe. No authentication required, suitable
/// for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.session_manager.list().await.len();

    let hq = match &state.hq {
        Some(hq_state) => {
            let remotes = hq_state.remotes().await;
            Some(json!({ "mode": "aggregator", "remoteCount": remotes.len() }))
        }
        None => None,
    };

    Json(json!({
        "status": "ok",
        "uptimeSecs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "hq": hq,
    }))
}
