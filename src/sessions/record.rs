//! The `SessionRecord` (spec §3) and its on-disk paths.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a session's terminal title is kept in sync with the shell's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMode {
    None,
    Filter,
    Static,
    Dynamic,
}

impl Default for TitleMode {
    fn default() -> Self {
        Self::None
    }
}

/// Recognized environment options carried on a session, distinct from the
/// full environment passed to the child process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub term: Option<String>,
    #[serde(default)]
    pub path_additions: Vec<String>,
    #[serde(default)]
    pub title_mode: TitleMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// One session's persisted metadata. Written atomically by whoever owns it
/// (forwarder on start/exit, server on rename).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default)]
    pub env_snapshot: EnvSnapshot,
    pub cols: u16,
    pub rows: u16,
    /// Unix epoch milliseconds.
    pub started_at: u64,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub last_clear_offset: u64,
    pub pid: Option<u32>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

impl SessionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        command: Vec<String>,
        working_dir: String,
        env_snapshot: EnvSnapshot,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            id,
            name,
            command,
            working_dir,
            env_snapshot,
            cols,
            rows,
            started_at: crate::journal::format::now_unix() * 1000,
            status: SessionStatus::Starting,
            exit_code: None,
            last_clear_offset: 0,
            pid: None,
            remote_id: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Filesystem layout for one session's control directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
}

impl SessionPaths {
    pub fn new(control_root: &std::path::Path, id: &str) -> Self {
        Self {
            dir: control_root.join(id),
        }
    }

    pub fn record_file(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.dir.join("stdout")
    }

    pub fn stdin_file(&self) -> PathBuf {
        self.dir.join("stdin")
    }

    pub fn ipc_socket(&self) -> PathBuf {
        self.dir.join("ipc.sock")
    }

    pub fn forwarder_log(&self) -> PathBuf {
        self.dir.join("fwd.log")
    }
}

/// Recognized env options pulled from a raw env map, matching the
/// `envSnapshot` fields spec.md §3 calls out explicitly.
pub fn snapshot_env(env: &HashMap<String, String>, title_mode: TitleMode) -> EnvSnapshot {
    EnvSnapshot {
        term: env.get("TERM").cloned(),
        path_additions: env
            .get("VIBETUNNEL_PATH_ADDITIONS")
            .map(|s| s.split(':').map(str::to_string).collect())
            .unwrap_or_default(),
        title_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_in_starting_status() {
        let rec = SessionRecord::new(
            "abc123".into(),
            "bash".into(),
            vec!["bash".into()],
            "/tmp".into(),
            EnvSnapshot::default(),
            80,
            24,
        );
        assert_eq!(rec.status, SessionStatus::Starting);
        assert!(rec.exit_code.is_none());
        assert!(!rec.is_live());
    }

    #[test]
    fn paths_are_rooted_under_control_dir() {
        let root = std::path::Path::new("/tmp/control");
        let paths = SessionPaths::new(root, "abc123");
        assert_eq!(paths.record_file(), root.join("abc123/session.json"));
        assert_eq!(paths.ipc_socket(), root.join("abc123/ipc.sock"));
    }

    #[test]
    fn snapshot_env_picks_recognized_fields_only() {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("VIBETUNNEL_PATH_ADDITIONS".to_string(), "/a:/b".to_string());
        env.insert("SECRET".to_string(), "shh".to_string());

        let snap = snapshot_env(&env, TitleMode::Dynamic);
        assert_eq!(snap.term.as_deref(), Some("xterm-256color"));
        assert_eq!(snap.path_additions, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(snap.title_mode, TitleMode::Dynamic);
    }
}
