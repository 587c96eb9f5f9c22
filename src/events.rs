//! Process-wide event bus (C10): a typed publish/subscribe channel carrying
//! [`ServerEvent`] records to every interested transport — the WS `Event`
//! frame and the HTTP SSE endpoint both subscribe to the same channel.
//!
//! Grounded on the teacher's `ActivityLog` (`broadcast::Sender` zero-copy
//! fan-out, `RwLock<VecDeque>` ring buffer for late joiners) generalized from
//! loosely-typed `serde_json::Value` entries to the spec's tagged
//! `ServerEvent` enum.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

/// A process-wide event, delivered at-most-once and in publish order per
/// publisher (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionStart {
        session_id: String,
        session_name: String,
        timestamp: String,
    },
    SessionExit {
        session_id: String,
        session_name: String,
        exit_code: Option<i32>,
        timestamp: String,
    },
    Bell {
        session_id: String,
        session_name: String,
        bell_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        process_info: Option<String>,
        timestamp: String,
    },
    CommandFinished {
        session_id: String,
        command: String,
        duration_ms: u64,
        exit_code: i32,
        timestamp: String,
    },
    CommandError {
        session_id: String,
        command: String,
        duration_ms: u64,
        exit_code: i32,
        timestamp: String,
    },
    ClaudeTurn {
        session_id: String,
        session_name: String,
        message: String,
        timestamp: String,
    },
    TestNotification {
        timestamp: String,
    },
}

impl ServerEvent {
    pub fn session_start(session_id: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self::SessionStart {
            session_id: session_id.into(),
            session_name: session_name.into(),
            timestamp: now_iso8601(),
        }
    }

    pub fn session_exit(session_id: impl Into<String>, session_name: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::SessionExit {
            session_id: session_id.into(),
            session_name: session_name.into(),
            exit_code,
            timestamp: now_iso8601(),
        }
    }

    pub fn bell(session_id: impl Into<String>, session_name: impl Into<String>, bell_count: u32, process_info: Option<String>) -> Self {
        Self::Bell {
            session_id: session_id.into(),
            session_name: session_name.into(),
            bell_count,
            process_info,
            timestamp: now_iso8601(),
        }
    }

    /// `command-finished` when `exit_code == 0`, `command-error` otherwise,
    /// per spec.md §4.10.
    pub fn command_result(session_id: impl Into<String>, command: impl Into<String>, duration_ms: u64, exit_code: i32) -> Self {
        let session_id = session_id.into();
        let command = command.into();
        let timestamp = now_iso8601();
        if exit_code == 0 {
            Self::CommandFinished { session_id, command, duration_ms, exit_code, timestamp }
        } else {
            Self::CommandError { session_id, command, duration_ms, exit_code, timestamp }
        }
    }

    pub fn claude_turn(session_id: impl Into<String>, session_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClaudeTurn {
            session_id: session_id.into(),
            session_name: session_name.into(),
            message: message.into(),
            timestamp: now_iso8601(),
        }
    }

    pub fn test_notification() -> Self {
        Self::TestNotification { timestamp: now_iso8601() }
    }
}

fn now_iso8601() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    // A dependency-free RFC 3339 rendering (UTC, second resolution) — avoids
    // pulling in `chrono`/`time` just for a formatted timestamp nothing else
    // in the crate needs.
    civil_from_unix(secs)
}

/// Renders a Unix timestamp as `YYYY-MM-DDTHH:MM:SSZ` using the proleptic
/// Gregorian calendar (civil_from_days, Howard Hinnant's algorithm).
fn civil_from_unix(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

/// Default ring buffer size for late-joining subscribers (e.g. a dashboard
/// that wants the last few events on connect).
const DEFAULT_HISTORY: usize = 200;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// The process-wide bus. Cheap to clone — internally `Arc`-backed via
/// `broadcast::Sender`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
    history: std::sync::Arc<RwLock<VecDeque<ServerEvent>>>,
    next_id: std::sync::Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            tx,
            history: std::sync::Arc::new(RwLock::new(VecDeque::with_capacity(DEFAULT_HISTORY))),
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publishes `event`, recording it in the replay history and fanning it
    /// out to every current subscriber. Never fails: with no subscribers the
    /// send is simply dropped.
    pub async fn publish(&self, event: ServerEvent) {
        self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.write().await;
            if history.len() >= DEFAULT_HISTORY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of recently published events, oldest first, for a new SSE/WS
    /// client that wants immediate context.
    pub async fn recent(&self, limit: usize) -> Vec<ServerEvent> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).rev().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ServerEvent::session_start("s1", "bash")).await;

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ServerEvent::SessionStart { session_id, .. } if session_id == "s1"));
    }

    #[tokio::test]
    async fn command_result_picks_finished_or_error_by_exit_code() {
        let ok = ServerEvent::command_result("s1", "true", 10, 0);
        assert!(matches!(ok, ServerEvent::CommandFinished { .. }));

        let failed = ServerEvent::command_result("s1", "false", 10, 1);
        assert!(matches!(failed, ServerEvent::CommandError { .. }));
    }

    #[tokio::test]
    async fn recent_returns_history_in_publish_order() {
        let bus = EventBus::new();
        bus.publish(ServerEvent::test_notification()).await;
        bus.publish(ServerEvent::session_start("s2", "zsh")).await;

        let recent = bus.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(matches!(recent[0], ServerEvent::TestNotification { .. }));
        assert!(matches!(recent[1], ServerEvent::SessionStart { .. }));
    }

    #[test]
    fn civil_from_unix_renders_a_known_epoch() {
        assert_eq!(civil_from_unix(0), "1970-01-01T00:00:00Z");
        assert_eq!(civil_from_unix(1_700_000_000), "2023-11-14T22:13:20Z");
    }
}
