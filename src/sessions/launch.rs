//! Spawns the `vtrund-forwarder` child process that owns a new session.
//!
//! The server's job ends at handing the forwarder a fresh id and an argv —
//! the forwarder creates the session directory itself (see
//! `sessions::create_with_id`), so the server must never also call
//! `SessionManager::create` for the same id.

use std::path::PathBuf;
use std::process::Stdio;

use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;

use super::record::TitleMode;

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub title_mode: Option<TitleMode>,
}

/// Resolves the `vtrund-forwarder` binary: next to the running `vtrund`
/// executable if present there, otherwise whatever `PATH` provides.
fn forwarder_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join("vtrund-forwarder")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("vtrund-forwarder"))
}

fn title_mode_flag(mode: TitleMode) -> &'static str {
    match mode {
        TitleMode::None => "none",
        TitleMode::Filter => "filter",
        TitleMode::Static => "static",
        TitleMode::Dynamic => "dynamic",
    }
}

/// Assigns a fresh session id and spawns the forwarder to own it, returning
/// the id immediately — the forwarder writes `session.json` itself once it
/// creates the session directory.
pub async fn spawn_forwarder(config: &Config, req: LaunchRequest) -> Result<String, CoreError> {
    if req.command.is_empty() {
        return Err(CoreError::Validation("command must not be empty".into()));
    }

    let session_id = Uuid::new_v4().simple().to_string();
    let cols = req.cols.unwrap_or(config.session.default_terminal_cols);
    let rows = req.rows.unwrap_or(config.session.default_terminal_rows);
    let title_mode = req.title_mode.unwrap_or(TitleMode::None);

    let mut cmd = tokio::process::Command::new(forwarder_binary());
    cmd.arg("--session-id")
        .arg(&session_id)
        .arg("--cols")
        .arg(cols.to_string())
        .arg("--rows")
        .arg(rows.to_string())
        .arg("--title-mode")
        .arg(title_mode_flag(title_mode))
        .arg("--control-dir")
        .arg(&config.session.control_dir);

    if let Some(dir) = &req.working_dir {
        cmd.arg("--cwd").arg(dir);
    }
    if let Some(name) = &req.name {
        cmd.arg("--name").arg(name);
    }
    if let Some(max) = config.journal.max_cast_size {
        cmd.arg("--max-cast-size").arg(max.to_string());
    }
    cmd.arg("--cast-check-interval-secs").arg(config.journal.cast_size_check_interval_secs.to_string());
    cmd.arg("--cast-truncation-target").arg(config.journal.cast_truncation_target_percentage.to_string());
    cmd.arg("--").args(&req.command);

    // Detached: the forwarder outlives the request that spawned it. We still
    // reap it so it never lingers as a zombie once it exits.
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = cmd.spawn().map_err(|e| CoreError::PermanentIo(format!("spawning forwarder: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = child.wait().await {
            warn!(error = %e, "forwarder process reaping failed");
        }
    });

    Ok(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_mode_flag_covers_every_variant() {
        assert_eq!(title_mode_flag(TitleMode::None), "none");
        assert_eq!(title_mode_flag(TitleMode::Filter), "filter");
        assert_eq!(title_mode_flag(TitleMode::Static), "static");
        assert_eq!(title_mode_flag(TitleMode::Dynamic), "dynamic");
    }

    #[tokio::test]
    async fn rejects_empty_command_without_spawning() {
        let config = Config::load(None);
        let req = LaunchRequest { command: vec![], ..Default::default() };
        let err = spawn_forwarder(&config, req).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
