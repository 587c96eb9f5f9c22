//! `vtrund-forwarder` — the per-session process (C6) that owns one PTY-backed
//! child from spawn to exit. Invoked by the server as:
//!
//! ```text
//! vtrund-forwarder --session-id <id> --cwd <dir> --cols <n> --rows <n> -- <argv...>
//! ```
//!
//! It creates its session directory, opens the journal, listens on the
//! session's IPC socket for control connections (the server reconnects after
//! a restart rather than the forwarder dialing out), and drives the PTY
//! lifecycle through to `session.json` landing in `Exited`.
//!
//! Exit codes follow the BSD `sysexits.h` convention the rest of the pack
//! uses for CLI tools: 64 (usage), 69 (service unavailable), 70 (internal
//! software error).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use vtrund::error::CoreError;
use vtrund::ipc::socket::{listen, FramedConn};
use vtrund::ipc::{Frame, FrameType};
use vtrund::journal::{JournalWriter, Limits};
use vtrund::pty::{spawn_pty_session, PtyHandle};
use vtrund::sessions::record::{snapshot_env, SessionPaths, SessionStatus, TitleMode};
use vtrund::sessions::SessionManager;

const EX_USAGE: i32 = 64;
const EX_UNAVAILABLE: i32 = 69;
const EX_SOFTWARE: i32 = 70;

#[derive(Parser)]
#[command(name = "vtrund-forwarder")]
struct Args {
    /// Id assigned by the server; this forwarder owns that session end to end.
    #[arg(long)]
    session_id: String,

    /// Working directory for the spawned command.
    #[arg(long = "cwd")]
    working_dir: Option<String>,

    #[arg(long, default_value_t = 80)]
    cols: u16,

    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Display name; defaults to the joined command line.
    #[arg(long)]
    name: Option<String>,

    /// One of "none", "filter", "static", "dynamic".
    #[arg(long = "title-mode", default_value = "none")]
    title_mode: String,

    #[arg(long = "control-dir", env = "VIBETUNNEL_CONTROL_DIR")]
    control_root: Option<PathBuf>,

    /// Journal truncation cap in bytes. Omit for unbounded.
    #[arg(long = "max-cast-size")]
    max_cast_size: Option<u64>,

    #[arg(long = "cast-check-interval-secs", default_value_t = 30)]
    cast_check_interval_secs: u64,

    #[arg(long = "cast-truncation-target", default_value_t = 0.8)]
    cast_truncation_target: f64,

    /// Command and its arguments, after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if args.command.is_empty() {
        eprintln!("vtrund-forwarder: no command given after `--`");
        std::process::exit(EX_USAGE);
    }

    let title_mode = match args.title_mode.as_str() {
        "none" => TitleMode::None,
        "filter" => TitleMode::Filter,
        "static" => TitleMode::Static,
        "dynamic" => TitleMode::Dynamic,
        other => {
            eprintln!("vtrund-forwarder: unrecognized --title-mode {other}");
            std::process::exit(EX_USAGE);
        }
    };

    let control_root = args
        .control_root
        .or_else(dirs_control_root)
        .unwrap_or_else(|| PathBuf::from(".vibetunnel/control"));

    let working_dir = args
        .working_dir
        .unwrap_or_else(|| std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_else(|_| "/".to_string()));

    let env_map: HashMap<String, String> = std::env::vars().collect();
    let env_snapshot = snapshot_env(&env_map, title_mode);

    let mgr = SessionManager::new(control_root);
    let paths = mgr.paths(&args.session_id);

    let (record, _paths) = match mgr
        .create_with_id(
            args.session_id.clone(),
            args.name.clone(),
            args.command.clone(),
            working_dir.clone(),
            env_snapshot.clone(),
            args.cols,
            args.rows,
        )
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("vtrund-forwarder: could not create session directory: {e}");
            std::process::exit(EX_UNAVAILABLE);
        }
    };

    if let Err(e) = run(&mgr, &paths, &record, &args, env_map).await {
        error!(session_id = %args.session_id, error = %e, "forwarder exiting on error");
        let _ = mgr
            .update_status(&args.session_id, SessionStatus::Exited, Some(-1), None)
            .await;
        std::process::exit(EX_SOFTWARE);
    }
}

fn dirs_control_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".vibetunnel/control"))
}

/// Resolves on SIGINT or SIGTERM, whichever comes first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            ctrl_c.await.ok();
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}

async fn run(
    mgr: &SessionManager,
    paths: &SessionPaths,
    record: &vtrund::sessions::record::SessionRecord,
    args: &Args,
    env_map: HashMap<String, String>,
) -> Result<(), CoreError> {
    let display_title = record.name.clone();

    let limits = Limits {
        max_cast_size: args.max_cast_size,
        cast_size_check_interval: std::time::Duration::from_secs(args.cast_check_interval_secs),
        cast_truncation_target_percentage: args.cast_truncation_target,
    };
    let (writer, mut checkpoint_rx) = JournalWriter::open(
        paths.stdout_file(),
        args.cols,
        args.rows,
        &args.command,
        &display_title,
        env_map,
        limits,
    )
    .await?;
    let writer = Arc::new(writer);

    let listener = listen(&paths.ipc_socket()).await?;

    let (pty_handle, exit_join) = spawn_pty_session(
        &args.command,
        &record.working_dir,
        args.cols,
        args.rows,
        &record.env_snapshot,
        Arc::clone(&writer),
    )
    .await?;
    let pty_handle = Arc::new(pty_handle);

    mgr.update_status(&args.session_id, SessionStatus::Running, None, Some(pty_handle.pid()))
        .await?;
    info!(session_id = %args.session_id, pid = pty_handle.pid(), "session running");

    let checkpoint_mgr = mgr.clone();
    let checkpoint_id = args.session_id.clone();
    let checkpoint_task = tokio::spawn(async move {
        while checkpoint_rx.changed().await.is_ok() {
            let checkpoint = *checkpoint_rx.borrow();
            if let Some(offset) = checkpoint.offset {
                if let Err(e) = checkpoint_mgr.update_last_clear_offset(&checkpoint_id, offset).await {
                    warn!(session_id = %checkpoint_id, error = %e, "failed to persist pruning checkpoint");
                }
            }
        }
    });

    let accept_mgr = mgr.clone();
    let accept_id = args.session_id.clone();
    let accept_pty = Arc::clone(&pty_handle);
    let accept_writer = Arc::clone(&writer);
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let conn_mgr = accept_mgr.clone();
                    let conn_id = accept_id.clone();
                    let conn_pty = Arc::clone(&accept_pty);
                    let conn_writer = Arc::clone(&accept_writer);
                    tokio::spawn(async move {
                        handle_control_conn(stream, conn_mgr, conn_id, conn_pty, conn_writer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "ipc accept failed");
                    break;
                }
            }
        }
    });

    let mut exit_join = exit_join;
    let shutdown_pty = Arc::clone(&pty_handle);
    let exit_reason = tokio::select! {
        reason = &mut exit_join => reason.map_err(|e| CoreError::PermanentIo(format!("pty lifecycle task panicked: {e}")))?,
        () = wait_for_shutdown_signal() => {
            info!(session_id = %args.session_id, "forwarder received shutdown signal, forwarding to child");
            let _ = shutdown_pty.signal(libc::SIGTERM);
            (&mut exit_join)
                .await
                .map_err(|e| CoreError::PermanentIo(format!("pty lifecycle task panicked: {e}")))?
        }
    };

    accept_loop.abort();
    checkpoint_task.abort();

    mgr.update_status(&args.session_id, SessionStatus::Exited, Some(exit_reason.as_code()), None)
        .await?;
    info!(session_id = %args.session_id, code = exit_reason.as_code(), "session exited");

    Ok(())
}

/// Services one control connection: decodes `InputText`/`Resize`/`Signal`
/// frames and applies them to the live PTY. The server may reconnect
/// multiple times across the session's life (e.g. after its own restart),
/// so this just serves whoever is connected until they disconnect.
async fn handle_control_conn(
    stream: tokio::net::UnixStream,
    mgr: SessionManager,
    session_id: String,
    pty: Arc<PtyHandle>,
    writer: Arc<JournalWriter>,
) {
    let mut conn = FramedConn::new(stream);
    loop {
        let frame = match conn.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "control connection read failed");
                break;
            }
        };

        match frame.frame_type {
            FrameType::InputText => {
                if let Ok(text) = String::from_utf8(frame.payload.clone()) {
                    let _ = writer.write_input(text);
                }
                if let Err(e) = pty.write_input(&frame.payload) {
                    warn!(session_id = %session_id, error = %e, "failed to forward input");
                }
            }
            FrameType::Resize => {
                if let Some((cols, rows)) = frame.parse_resize() {
                    if let Err(e) = pty.resize(cols, rows) {
                        warn!(session_id = %session_id, error = %e, "failed to resize pty");
                        continue;
                    }
                    let _ = writer.write_resize(cols, rows);
                    if let Err(e) = mgr.update_size(&session_id, cols, rows).await {
                        warn!(session_id = %session_id, error = %e, "failed to persist resize");
                    }
                }
            }
            FrameType::Signal => {
                if let Some(signal) = frame.parse_signal() {
                    if let Err(e) = pty.signal(i32::from(signal)) {
                        warn!(session_id = %session_id, error = %e, "failed to deliver signal");
                    }
                }
            }
            FrameType::Ping => {
                let _ = conn.send(&Frame::global(FrameType::Pong, vec![])).await;
            }
            other => {
                warn!(session_id = %session_id, frame_type = ?other, "unexpected frame on control connection");
            }
        }
    }
}
