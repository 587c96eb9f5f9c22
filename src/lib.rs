#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! vtrund library — the server-side terminal session runtime.
//!
//! This library re-exports the key building blocks:
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `sessions` — per-session on-disk layout and registry
//! - `hub` — output journal readers and subscriber fan-out
//! - `ipc` — binary frame protocol shared with the forwarder
//! - `hq` — multi-server federation (aggregator and remote modes)
//! - `routes` — REST API route handlers
//! - `ws` — WebSocket protocol handling
//! - `pty` — process spawning and PTY management

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod hq;
pub mod hub;
pub mod ipc;
pub mod journal;
pub mod pty;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use sessions::SessionManager;
pub use state::AppState;
