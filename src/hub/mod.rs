//! Cast Output Hub (C8): one background reader per live session file,
//! fanning decoded journal events out to every interested subscriber so the
//! parsing cost is paid once no matter how many viewers are attached.
//!
//! Grounded on `sessions/buffer.rs`'s single-writer/many-reader
//! `OutputBuffer`, generalized from an in-memory ring fed directly by the
//! PTY to a reader that tails the on-disk asciicast journal (the server and
//! the forwarder are different processes here, so the fan-out point has to
//! live on the read side).

pub mod snapshot;
pub mod subscriber;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, warn};

pub use subscriber::{HubEvent, Subscriber};

use crate::error::CoreError;
use crate::journal::format::{parse_resize_data, Event, EventKind, Header};
use crate::sessions::record::{SessionPaths, SessionRecord};
use crate::sessions::SessionManager;
use snapshot::{feed_screen, resize_screen, Pacer, ScreenState};

/// A subscriber's outbound queue depth (events, not bytes).
const SUBSCRIBER_QUEUE_CAPACITY: usize = 512;
/// How long a reader keeps running with zero subscribers before exiting.
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(30);
/// Fallback interval for tail-follow when the filesystem watcher is
/// unavailable or coalesces events away.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(300);

enum ReaderCmd {
    Subscribe {
        wants_stdout: bool,
        wants_snapshots: bool,
        snapshot_min_ms: u16,
        snapshot_max_ms: u16,
        reply: oneshot::Sender<Arc<Subscriber>>,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Registry of live session readers, keyed by session id. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    session_manager: SessionManager,
    readers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ReaderCmd>>>>,
}

impl Hub {
    pub fn new(session_manager: SessionManager) -> Self {
        Self {
            session_manager,
            readers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attaches a new subscriber to `session_id`'s live output, spawning a
    /// reader for it if one isn't already running.
    pub async fn subscribe(
        &self,
        session_id: &str,
        wants_stdout: bool,
        wants_snapshots: bool,
        snapshot_min_ms: u16,
        snapshot_max_ms: u16,
    ) -> Result<Arc<Subscriber>, CoreError> {
        let tx = self.reader_for(session_id).await;
        let (reply, reply_rx) = oneshot::channel();
        tx.send(ReaderCmd::Subscribe {
            wants_stdout,
            wants_snapshots,
            snapshot_min_ms,
            snapshot_max_ms,
            reply,
        })
        .map_err(|_| CoreError::NotFound(format!("session {session_id} has no active reader")))?;

        reply_rx
            .await
            .map_err(|_| CoreError::NotFound(format!("session {session_id} reader exited before replying")))
    }

    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        if let Some(tx) = self.readers.read().await.get(session_id) {
            let _ = tx.send(ReaderCmd::Unsubscribe { id: subscriber_id });
        }
    }

    /// Renders the session's current screen as plain text, for
    /// `GET /api/sessions/:id/text`. Independent of any live reader: replays
    /// the journal from its resolved start position through EOF into a
    /// throwaway screen, so it works whether or not a subscriber is attached.
    pub async fn render_text(&self, session_id: &str) -> Result<String, CoreError> {
        let paths = self.session_manager.paths(session_id);
        let record = self.session_manager.load(session_id).await?;
        let (start_offset, cols, rows, discovered_checkpoint) = resolve_start(&paths, &record).await?;
        if let Some(offset) = discovered_checkpoint {
            if let Err(e) = self.session_manager.update_last_clear_offset(session_id, offset).await {
                warn!(session_id = %session_id, error = %e, "hub: failed to persist discovered pruning checkpoint");
            }
        }

        let mut file = fs::File::open(paths.stdout_file())
            .await
            .map_err(|e| CoreError::NotFound(format!("journal for session {session_id}: {e}")))?;
        file.seek(std::io::SeekFrom::Start(start_offset))
            .await
            .map_err(|e| crate::error::classify_io(&e, false))?;
        let mut reader = BufReader::new(file);

        let mut screen = ScreenState::new(cols, rows);
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(|e| crate::error::classify_io(&e, false))?;
            if n == 0 {
                break;
            }
            let Some(event) = Event::from_line(line.trim_end_matches('\n')) else {
                continue;
            };
            match event.kind {
                EventKind::Output => screen.feed(event.data.as_bytes()),
                EventKind::Resize => {
                    if let Some((c, r)) = parse_resize_data(&event.data) {
                        screen.resize(c, r);
                    }
                }
                EventKind::Exit => break,
                EventKind::Input | EventKind::Marker => {}
            }
        }

        Ok(screen.contents())
    }

    async fn reader_for(&self, session_id: &str) -> mpsc::UnboundedSender<ReaderCmd> {
        if let Some(tx) = self.readers.read().await.get(session_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let mut readers = self.readers.write().await;
        if let Some(tx) = readers.get(session_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let paths = self.session_manager.paths(session_id);
        let session_manager = self.session_manager.clone();
        let id = session_id.to_string();
        let readers_handle = Arc::clone(&self.readers);
        tokio::spawn(async move {
            run_reader(id.clone(), paths, session_manager, rx, DEFAULT_IDLE_GRACE).await;
            readers_handle.write().await.remove(&id);
        });
        readers.insert(session_id.to_string(), tx.clone());
        tx
    }
}

/// Resolves where a reader should start tailing from, plus the geometry in
/// effect at that point: seeks to `record.last_clear_offset` when the
/// record already carries one, otherwise scans the journal once for the
/// last recognized pruning sequence (the "or scan for the last pruning
/// point" fallback — relevant for a journal whose writer hadn't yet
/// persisted a checkpoint when the reader first attaches).
///
/// The fourth element is `Some(offset)` only when that fallback scan is
/// what produced `start_offset` (i.e. the record had no checkpoint of its
/// own yet) — callers write it back onto the record so the next reader to
/// attach can skip the rescan.
async fn resolve_start(
    paths: &SessionPaths,
    record: &SessionRecord,
) -> Result<(u64, u16, u16, Option<u64>), CoreError> {
    let file = fs::File::open(paths.stdout_file())
        .await
        .map_err(|e| CoreError::NotFound(format!("journal for session {}: {e}", record.id)))?;
    let mut reader = BufReader::new(file);

    let mut header_line = String::new();
    let header_len = reader
        .read_line(&mut header_line)
        .await
        .map_err(|e| crate::error::classify_io(&e, false))?;
    if header_len == 0 {
        return Err(CoreError::Parse(format!("journal for session {} is empty", record.id)));
    }
    let header: Header =
        serde_json::from_str(header_line.trim_end()).map_err(|e| CoreError::Parse(format!("bad journal header: {e}")))?;

    let mut offset = header_len as u64;
    let mut last_pruning_end: Option<u64> = None;
    let mut breakpoints: Vec<(u64, u16, u16)> = Vec::new();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(|e| crate::error::classify_io(&e, false))?;
        if n == 0 {
            break;
        }
        let line_end = offset + n as u64;

        if let Some(event) = Event::from_line(line.trim_end_matches('\n')) {
            match event.kind {
                EventKind::Resize => {
                    if let Some((cols, rows)) = parse_resize_data(&event.data) {
                        breakpoints.push((line_end, cols, rows));
                    }
                }
                EventKind::Output => {
                    if crate::journal::detect_last(event.data.as_bytes()).is_some() {
                        last_pruning_end = Some(line_end);
                    }
                }
                EventKind::Exit => break,
                EventKind::Input | EventKind::Marker => {}
            }
        }

        offset = line_end;
    }

    let (start_offset, discovered_checkpoint) = if record.last_clear_offset > 0 {
        (record.last_clear_offset, None)
    } else {
        match last_pruning_end {
            Some(offset) => (offset, Some(offset)),
            None => (header_len as u64, None),
        }
    };

    let mut cols = header.width;
    let mut rows = header.height;
    for (bp_offset, bp_cols, bp_rows) in &breakpoints {
        if *bp_offset > start_offset {
            break;
        }
        cols = *bp_cols;
        rows = *bp_rows;
    }

    Ok((start_offset, cols, rows, discovered_checkpoint))
}

async fn dispatch(subscribers: &HashMap<u64, Arc<Subscriber>>, event: HubEvent) {
    let stdout_only = matches!(event, HubEvent::Output(_));
    for sub in subscribers.values() {
        if !stdout_only || sub.wants_stdout {
            sub.push(event.clone()).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_cmd(
    cmd: ReaderCmd,
    subscribers: &mut HashMap<u64, Arc<Subscriber>>,
    next_id: &mut u64,
    cols: u16,
    rows: u16,
    screen: &Arc<Mutex<ScreenState>>,
    dirty: &Arc<AtomicBool>,
) {
    match cmd {
        ReaderCmd::Subscribe { wants_stdout, wants_snapshots, snapshot_min_ms, snapshot_max_ms, reply } => {
            let id = *next_id;
            *next_id += 1;
            let sub = Arc::new(Subscriber::new(id, wants_stdout, wants_snapshots, SUBSCRIBER_QUEUE_CAPACITY));
            sub.push(HubEvent::Header { cols, rows }).await;
            subscribers.insert(id, Arc::clone(&sub));

            if wants_snapshots {
                let pacer = Pacer::new(snapshot_min_ms, snapshot_max_ms);
                let pacer_sub = Arc::clone(&sub);
                let pacer_screen = Arc::clone(screen);
                let pacer_dirty = Arc::clone(dirty);
                tokio::spawn(async move { pacer.run(pacer_sub, pacer_screen, pacer_dirty).await });
            }

            let _ = reply.send(sub);
        }
        ReaderCmd::Unsubscribe { id } => {
            if let Some(sub) = subscribers.remove(&id) {
                sub.close();
            }
        }
    }
}

/// One reader's lifetime: resolve the start position, stream decoded events
/// to whoever is attached, and tail-follow once it catches up to EOF.
/// Exits when the journal ends in an `exit` event or after `idle_grace`
/// passes with no subscribers attached.
async fn run_reader(
    session_id: String,
    paths: SessionPaths,
    session_manager: SessionManager,
    mut cmd_rx: mpsc::UnboundedReceiver<ReaderCmd>,
    idle_grace: Duration,
) {
    let record = match session_manager.load(&session_id).await {
        Ok(record) => record,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "hub: cannot load session record");
            return;
        }
    };

    let (start_offset, cols, rows, discovered_checkpoint) = match resolve_start(&paths, &record).await {
        Ok(v) => v,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "hub: failed to resolve tail start");
            return;
        }
    };

    if let Some(offset) = discovered_checkpoint {
        if let Err(e) = session_manager.update_last_clear_offset(&session_id, offset).await {
            warn!(session_id = %session_id, error = %e, "hub: failed to persist discovered pruning checkpoint");
        }
    }

    let mut file = match fs::File::open(paths.stdout_file()).await {
        Ok(f) => f,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "hub: cannot reopen journal for tailing");
            return;
        }
    };
    if let Err(e) = file.seek(std::io::SeekFrom::Start(start_offset)).await {
        error!(session_id = %session_id, error = %e, "hub: seek to tail start failed");
        return;
    }
    let mut reader = BufReader::new(file);

    let mut subscribers: HashMap<u64, Arc<Subscriber>> = HashMap::new();
    let mut next_id: u64 = 1;
    let mut cur_cols = cols;
    let mut cur_rows = rows;
    let screen = Arc::new(Mutex::new(ScreenState::new(cols, rows)));
    let dirty = Arc::new(AtomicBool::new(false));

    let (fs_tx, mut fs_rx) = mpsc::channel::<()>(1);
    let _watcher = spawn_fs_watcher(paths.stdout_file(), fs_tx);
    let mut poll = tokio::time::interval(TAIL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut idle_since: Option<tokio::time::Instant> = None;

    'outer: loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                if subscribers.is_empty() {
                    let since = *idle_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= idle_grace {
                        break 'outer;
                    }
                } else {
                    idle_since = None;
                }

                tokio::select! {
                    biased;
                    Some(cmd) = cmd_rx.recv() => {
                        handle_cmd(cmd, &mut subscribers, &mut next_id, cur_cols, cur_rows, &screen, &dirty).await;
                    }
                    _ = fs_rx.recv() => {}
                    _ = poll.tick() => {}
                }
                continue 'outer;
            }
            Ok(_) => {
                idle_since = None;
                let Some(event) = Event::from_line(line.trim_end_matches('\n')) else {
                    debug!(session_id = %session_id, "hub: skipping malformed journal line");
                    continue 'outer;
                };

                match event.kind {
                    EventKind::Output => {
                        feed_screen(&screen, event.data.as_bytes());
                        dirty.store(true, Ordering::Release);
                        dispatch(&subscribers, HubEvent::Output(event.data)).await;
                    }
                    EventKind::Resize => {
                        if let Some((c, r)) = parse_resize_data(&event.data) {
                            cur_cols = c;
                            cur_rows = r;
                            resize_screen(&screen, c, r);
                            dispatch(&subscribers, HubEvent::Resize(c, r)).await;
                        }
                    }
                    EventKind::Marker => {
                        dispatch(&subscribers, HubEvent::Marker(event.data)).await;
                    }
                    EventKind::Exit => {
                        let code = event.data.parse::<i32>().unwrap_or(-1);
                        dispatch(&subscribers, HubEvent::Exit(code)).await;
                        break 'outer;
                    }
                    EventKind::Input => {}
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "hub: journal read failed, resyncing closed");
                dispatch(&subscribers, HubEvent::Error(e.to_string())).await;
                break 'outer;
            }
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            handle_cmd(cmd, &mut subscribers, &mut next_id, cur_cols, cur_rows, &screen, &dirty).await;
        }
    }

    for sub in subscribers.values() {
        sub.close();
    }
}

/// Best-effort wakeup source for tail-follow; the caller still falls back to
/// periodic polling, since `notify` can coalesce or miss events under load
/// and a missing watcher (e.g. inotify instance limits) must not stall
/// delivery.
fn spawn_fs_watcher(path: PathBuf, tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.try_send(());
        }
    })
    .map_err(|e| warn!(error = %e, "failed to construct filesystem watcher, falling back to polling only"))
    .ok()?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| warn!(path = %path.display(), error = %e, "failed to watch journal file"))
        .ok()?;

    Some(watcher)
}
