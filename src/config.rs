//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VIBETUNNEL_CONTROL_DIR`, `VIBETUNNEL_VERBOSITY`,
//!    `VIBETUNNEL_API_KEY`, `VIBETUNNEL_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `vtrund.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4022"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [session]
//! default_terminal_cols = 80
//! default_terminal_rows = 24
//! idle_timeout_secs = 0            # 0 disables idle reaping
//! control_dir = "~/.vibetunnel/control"
//!
//! [journal]
//! max_cast_size = 52428800         # 50 MB, omit for unbounded
//! cast_size_check_interval_secs = 30
//! cast_truncation_target_percentage = 0.8
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//!
//! # Optional — omit entirely to run standalone
//! [hq]
//! enabled = false                                  # true = this server is the HQ aggregator
//! remote_url = "wss://hq.example.com/api/hq/register" # remote mode only
//! remote_name = "laptop"                           # remote mode only
//! hq_key = "shared-secret"                         # auth for register/proxy traffic
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 20
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Optional HQ/federation configuration; absent means standalone mode.
    pub hq: Option<HqConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4022`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session defaults and the on-disk control root (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Seconds of no subscribers + exited status before a session directory
    /// is eligible for `cleanup-exited`. 0 disables time-based reaping
    /// (cleanup then only runs on explicit request).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Root directory for session directories. Overridden by
    /// `VIBETUNNEL_CONTROL_DIR`.
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
}

/// Journal size-management settings, passed through to each forwarder
/// invocation as the `Limits` it opens its journal writer with.
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// Journal size in bytes past which truncation runs. Omit for unbounded.
    pub max_cast_size: Option<u64>,
    #[serde(default = "default_check_interval_secs")]
    pub cast_size_check_interval_secs: u64,
    #[serde(default = "default_truncation_target")]
    pub cast_truncation_target_percentage: f64,
}

/// Supervisor settings for `vtrund supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

/// Authentication settings. The runtime only consumes an opaque
/// authorized/not-authorized decision — it never implements its own
/// credential store (spec.md §1 non-goal).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `VIBETUNNEL_API_KEY`.
    /// Defaults to `"change-me"`, which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` or
    /// `VIBETUNNEL_VERBOSITY`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// HQ/federation configuration (C12) — enables either HQ-aggregator mode or
/// remote-registration mode. Generalizes the teacher's `TunnelConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct HqConfig {
    /// Run as the HQ aggregator, accepting remote registrations.
    #[serde(default)]
    pub enabled: bool,
    /// HQ URL to register with, in remote mode (e.g.
    /// `wss://hq.example.com/api/hq/register`).
    pub remote_url: Option<String>,
    /// Name this server registers under, in remote mode.
    pub remote_name: Option<String>,
    /// Shared secret for register/proxy authentication.
    pub hq_key: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:4022".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_control_dir() -> String {
    "~/.vibetunnel/control".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_truncation_target() -> f64 {
    0.8
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: default_listen(), max_connections: default_max_connections() }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_terminal_cols: default_terminal_cols(),
            default_terminal_rows: default_terminal_rows(),
            idle_timeout_secs: 0,
            control_dir: default_control_dir(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_cast_size: None,
            cast_size_check_interval_secs: default_check_interval_secs(),
            cast_truncation_target_percentage: default_truncation_target(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { api_key: default_api_key() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl JournalConfig {
    pub fn as_limits(&self) -> crate::journal::writer::Limits {
        crate::journal::writer::Limits {
            max_cast_size: self.max_cast_size,
            cast_size_check_interval: std::time::Duration::from_secs(self.cast_size_check_interval_secs),
            cast_truncation_target_percentage: self.cast_truncation_target_percentage,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `vtrund.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vtrund.toml").exists() {
            let content = std::fs::read_to_string("vtrund.toml").expect("Failed to read vtrund.toml");
            toml::from_str(&content).expect("Failed to parse vtrund.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                session: SessionConfig::default(),
                journal: JournalConfig::default(),
                logging: LoggingConfig::default(),
                supervisor: SupervisorConfig::default(),
                hq: None,
            }
        };

        if let Ok(key) = std::env::var("VIBETUNNEL_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("VIBETUNNEL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("VIBETUNNEL_CONTROL_DIR") {
            config.session.control_dir = dir;
        }
        config.session.control_dir = crate::util::expand_tilde(&config.session.control_dir).into_owned();

        config
    }

    /// Maps `VIBETUNNEL_VERBOSITY` (0-3+) onto a tracing filter, falling back
    /// to `RUST_LOG` and finally `logging.level`.
    pub fn log_filter(&self) -> String {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            return filter;
        }
        if let Ok(verbosity) = std::env::var("VIBETUNNEL_VERBOSITY") {
            let level = match verbosity.parse::<u32>().unwrap_or(1) {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            return level.to_string();
        }
        self.logging.level.clone()
    }
}
