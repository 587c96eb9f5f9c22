//! Per-session on-disk layout and registry (C4).
//!
//! Each session gets a directory under a configurable control root
//! (`~/.vibetunnel/control/<id>/` by default): `session.json` (the
//! [`SessionRecord`], written atomically), `stdout` (the journal, owned by
//! the writer), `ipc.sock` (mode 0600), and optionally `stdin`/`fwd.log`.
//!
//! The registry itself holds no authoritative state — disk is the source of
//! truth, matching the single-writer-per-field discipline in spec.md §5.
//! What this manager adds over bare filesystem calls is per-id mutual
//! exclusion for read-modify-write updates (`updateName`, status flips) and
//! directory-listing based enumeration.

pub mod launch;
pub mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use record::{EnvSnapshot, SessionPaths, SessionRecord, SessionStatus};

/// Registry of per-session update locks plus the shared control root.
///
/// Cloneable — all clones share the same control root and lock table.
#[derive(Clone)]
pub struct SessionManager {
    control_root: PathBuf,
    /// One mutex per session id, held across session.json read-modify-write
    /// cycles so concurrent renamers/status-flippers never interleave.
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionManager {
    pub fn new(control_root: impl Into<PathBuf>) -> Self {
        Self {
            control_root: control_root.into(),
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn paths(&self, id: &str) -> SessionPaths {
        SessionPaths::new(&self.control_root, id)
    }

    /// Creates a new session directory with a fresh `session.json` in
    /// `Starting` status, assigning it a fresh id. Returns the record and
    /// its on-disk paths.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        name: Option<String>,
        command: Vec<String>,
        working_dir: String,
        env_snapshot: EnvSnapshot,
        cols: u16,
        rows: u16,
    ) -> Result<(SessionRecord, SessionPaths), CoreError> {
        let id = Uuid::new_v4().simple().to_string();
        self.create_with_id(id, name, command, working_dir, env_snapshot, cols, rows).await
    }

    /// Like [`create`](Self::create), but with the id supplied by the
    /// caller. Used by the forwarder binary, whose `--session-id` is
    /// assigned by whoever spawned it (the server, when creating a session
    /// through the HTTP surface).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_with_id(
        &self,
        id: String,
        name: Option<String>,
        command: Vec<String>,
        working_dir: String,
        env_snapshot: EnvSnapshot,
        cols: u16,
        rows: u16,
    ) -> Result<(SessionRecord, SessionPaths), CoreError> {
        let paths = self.paths(&id);

        fs::create_dir_all(&paths.dir)
            .await
            .map_err(|e| crate::error::classify_io(&e, false))?;

        let display_name = name.unwrap_or_else(|| command.join(" "));
        let record = SessionRecord::new(id.clone(), display_name, command, working_dir, env_snapshot, cols, rows);
        self.save(&paths, &record).await?;

        info!(session_id = %id, "session directory created");
        Ok((record, paths))
    }

    /// Loads `session.json` for `id`.
    pub async fn load(&self, id: &str) -> Result<SessionRecord, CoreError> {
        let path = self.paths(id).record_file();
        let bytes = fs::read(&path)
            .await
            .map_err(|e| CoreError::NotFound(format!("session {id}: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::Parse(format!("session {id} record: {e}")))
    }

    /// Writes `record` atomically (temp file + rename) to `paths.record_file()`.
    pub async fn save(&self, paths: &SessionPaths, record: &SessionRecord) -> Result<(), CoreError> {
        let json = serde_json::to_vec_pretty(record).map_err(|e| CoreError::Parse(e.to_string()))?;
        let dir = paths.dir.clone();
        let dest = paths.record_file();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(tmp.as_file_mut(), &json)?;
            tmp.as_file_mut().flush()?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::PermanentIo(e.to_string()))?
        .map_err(|e| crate::error::classify_io(&e, false))
    }

    /// Lists every session directory under the control root, skipping
    /// entries whose `session.json` is missing or unreadable.
    pub async fn list(&self) -> Vec<SessionRecord> {
        let mut out = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.control_root).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&id).await {
                Ok(record) => out.push(record),
                Err(e) => warn!(session_id = %id, error = %e, "skipping unreadable session"),
            }
        }
        out
    }

    /// Renames a session under its per-id lock (load, mutate, save).
    pub async fn update_name(&self, id: &str, name: String) -> Result<SessionRecord, CoreError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        record.name = name;
        self.save(&self.paths(id), &record).await?;
        Ok(record)
    }

    /// Flips `status`/`exitCode`/`pid` under the per-id lock. Used by the PTY
    /// lifecycle (starting→running→exited) and by orphan reconciliation.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
        pid: Option<u32>,
    ) -> Result<SessionRecord, CoreError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        record.status = status;
        if exit_code.is_some() {
            record.exit_code = exit_code;
        }
        if pid.is_some() {
            record.pid = pid;
        }
        self.save(&self.paths(id), &record).await?;
        Ok(record)
    }

    /// Updates the recorded terminal size, e.g. after a client-driven resize.
    pub async fn update_size(&self, id: &str, cols: u16, rows: u16) -> Result<(), CoreError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        record.cols = cols;
        record.rows = rows;
        self.save(&self.paths(id), &record).await
    }

    /// Persists a newly observed pruning checkpoint offset.
    pub async fn update_last_clear_offset(&self, id: &str, offset: u64) -> Result<(), CoreError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        record.last_clear_offset = offset;
        self.save(&self.paths(id), &record).await
    }

    /// Removes a session's entire directory. Only meaningful once the
    /// session has exited; callers are expected to check status first.
    pub async fn cleanup(&self, id: &str) -> Result<(), CoreError> {
        let paths = self.paths(id);
        fs::remove_dir_all(&paths.dir)
            .await
            .map_err(|e| crate::error::classify_io(&e, false))?;
        self.locks.write().await.remove(id);
        info!(session_id = %id, "session directory removed");
        Ok(())
    }

    /// Marks every session claiming `status=running` whose pid is no longer
    /// alive (or is alive but doesn't plausibly match its recorded command,
    /// per `/proc/<pid>/cmdline`) as `exited`. Run at startup and
    /// periodically to reconcile crash-orphaned forwarders.
    pub async fn sweep_orphans(&self) -> Vec<String> {
        let mut reconciled = Vec::new();
        for record in self.list().await {
            if record.status != SessionStatus::Running {
                continue;
            }
            let Some(pid) = record.pid else { continue };
            if process_matches_session(pid, &record) {
                continue;
            }
            warn!(session_id = %record.id, pid, "reconciling orphaned session as exited");
            if self
                .update_status(&record.id, SessionStatus::Exited, Some(-1), None)
                .await
                .is_ok()
            {
                reconciled.push(record.id);
            }
        }
        reconciled
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(id) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

/// `libc::kill(pid, 0)` liveness probe plus a `/proc/<pid>/cmdline` sanity
/// check against the recorded command's executable name.
fn process_matches_session(pid: u32, record: &SessionRecord) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if !alive {
        return false;
    }
    let Some(exe) = record.command.first() else {
        return true; // alive and nothing to check against
    };
    let exe_name = Path::new(exe).file_name().and_then(|s| s.to_str()).unwrap_or(exe);
    std::fs::read(format!("/proc/{pid}/cmdline"))
        .ok()
        .and_then(|bytes| {
            let first = bytes.split(|&b| b == 0).next()?.to_vec();
            String::from_utf8(first).ok()
        })
        .map(|cmdline_exe| cmdline_exe.contains(exe_name))
        .unwrap_or(true) // /proc unreadable (permissions, container boundary): trust the liveness probe
}

#[cfg(test)]
mod tests {
    use super::*;
    use record::TitleMode;

    fn env() -> EnvSnapshot {
        EnvSnapshot {
            term: Some("xterm-256color".into()),
            path_additions: vec![],
            title_mode: TitleMode::None,
        }
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());

        let (record, paths) = mgr
            .create(Some("shell".into()), vec!["bash".into()], "/tmp".into(), env(), 80, 24)
            .await
            .unwrap();

        assert!(paths.record_file().exists());
        let loaded = mgr.load(&record.id).await.unwrap();
        assert_eq!(loaded.name, "shell");
        assert_eq!(loaded.status, SessionStatus::Starting);
    }

    #[tokio::test]
    async fn update_name_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let (record, _paths) = mgr
            .create(None, vec!["bash".into()], "/tmp".into(), env(), 80, 24)
            .await
            .unwrap();

        mgr.update_name(&record.id, "renamed".into()).await.unwrap();
        let loaded = mgr.load(&record.id).await.unwrap();
        assert_eq!(loaded.name, "renamed");
    }

    #[tokio::test]
    async fn list_skips_corrupt_session_json() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        mgr.create(None, vec!["bash".into()], "/tmp".into(), env(), 80, 24)
            .await
            .unwrap();

        fs::create_dir_all(dir.path().join("broken")).await.unwrap();
        fs::write(dir.path().join("broken/session.json"), b"not json")
            .await
            .unwrap();

        let listed = mgr.list().await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let (record, paths) = mgr
            .create(None, vec!["bash".into()], "/tmp".into(), env(), 80, 24)
            .await
            .unwrap();

        mgr.cleanup(&record.id).await.unwrap();
        assert!(!paths.dir.exists());
    }

    #[tokio::test]
    async fn update_status_sets_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let (record, _paths) = mgr
            .create(None, vec!["bash".into()], "/tmp".into(), env(), 80, 24)
            .await
            .unwrap();

        mgr.update_status(&record.id, SessionStatus::Exited, Some(0), None)
            .await
            .unwrap();
        let loaded = mgr.load(&record.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Exited);
        assert_eq!(loaded.exit_code, Some(0));
    }

    #[test]
    fn unreachable_pid_is_not_alive() {
        // A PID this high is never valid on Linux's default pid_max, so
        // kill(pid, 0) reliably fails with ESRCH.
        let record = SessionRecord::new(
            "x".into(),
            "x".into(),
            vec!["bash".into()],
            "/tmp".into(),
            EnvSnapshot::default(),
            80,
            24,
        );
        assert!(!process_matches_session(999_999_999, &record));
    }
}
