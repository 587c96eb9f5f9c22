//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::events::EventBus;
use crate::hq::HqState;
use crate::hub::Hub;
use crate::sessions::SessionManager;

/// Shared application state for the vtrund server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns the on-disk session directory layout and registry (C4).
    pub session_manager: SessionManager,
    /// Per-session output readers and subscriber fan-out (C8/C9).
    pub hub: Hub,
    /// Process-wide lifecycle event bus (C10), fed to WS `Event` frames and
    /// the SSE endpoint alike.
    pub event_bus: EventBus,
    /// Present only when `[hq]` is configured with `enabled = true`: the
    /// registry of connected remotes this server aggregates (C12).
    pub hq: Option<HqState>,
    /// Concurrent SSE connection count, capped in `routes::events`.
    pub sse_connections: Arc<AtomicU32>,
}
