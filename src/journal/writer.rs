//! Append-only asciicast journal writer (C2).
//!
//! One writer owns one on-disk journal file. Writes are funneled through an
//! mpsc channel to a background task that batches and flushes them, mirroring
//! the teacher's `SessionJournal` / `journal_writer_task` split. A sticky
//! `alive` flag records a fatal write failure; once false every further call
//! returns `PermanentIo` without touching the channel again.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::error::CoreError;

use super::format::{resize_data, Event, EventKind, Header};
use super::pruning;
use super::truncate::streaming_truncate;

/// Size/interval knobs for the journal writer, configurable per session.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Journal size, in bytes, past which truncation runs. `None` disables
    /// the cap entirely.
    pub max_cast_size: Option<u64>,
    /// How often the writer checks the on-disk file size against the cap.
    pub cast_size_check_interval: std::time::Duration,
    /// Fraction of `max_cast_size` a truncation pass targets, so the next
    /// check doesn't immediately re-trigger.
    pub cast_truncation_target_percentage: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cast_size: None,
            cast_size_check_interval: std::time::Duration::from_secs(30),
            cast_truncation_target_percentage: 0.8,
        }
    }
}

/// Running byte counters a caller can poll without going through the
/// background task.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalPosition {
    /// Bytes confirmed flushed to disk.
    pub written: u64,
    /// Bytes enqueued but not yet flushed.
    pub pending: u64,
    pub total: u64,
}

/// File offset of the most recent recognized pruning sequence, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruningCheckpoint {
    pub offset: Option<u64>,
}

enum WriteCmd {
    Output(Vec<u8>),
    Input(String),
    Resize(u16, u16),
    Marker(String),
    Exit(i32),
    Close(oneshot::Sender<()>),
}

impl WriteCmd {
    fn encoded_len(&self) -> usize {
        match self {
            WriteCmd::Output(b) => b.len() + 32,
            WriteCmd::Input(s) | WriteCmd::Marker(s) => s.len() + 32,
            WriteCmd::Resize(..) => 24,
            WriteCmd::Exit(_) => 24,
            WriteCmd::Close(_) => 0,
        }
    }
}

/// Pulls the longest complete, valid UTF-8 prefix out of `carry` (which has
/// just had a raw PTY read appended to it), leaving any trailing incomplete
/// multi-byte sequence buffered for the next read. This is what keeps a rune
/// split across two 16KiB PTY reads from turning into a `U+FFFD` on each
/// side: the incomplete tail waits here until the bytes that complete it
/// arrive, instead of being lossily decoded in isolation.
///
/// Genuinely invalid byte sequences (not just a boundary split) are replaced
/// with `U+FFFD` at the point they're unambiguously invalid, same as
/// `String::from_utf8_lossy` would, and scanning continues past them.
fn take_valid_utf8_prefix(carry: &mut Vec<u8>) -> Option<String> {
    if carry.is_empty() {
        return None;
    }
    match std::str::from_utf8(carry) {
        Ok(_) => {
            let bytes: Vec<u8> = carry.drain(..).collect();
            Some(String::from_utf8(bytes).expect("validated as utf8 above"))
        }
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            match e.error_len() {
                // Ran out of bytes mid-sequence; wait for the rest before decoding.
                None if valid_up_to == 0 => None,
                None => {
                    let bytes: Vec<u8> = carry.drain(..valid_up_to).collect();
                    Some(String::from_utf8(bytes).expect("valid_up_to bytes are valid utf8"))
                }
                Some(bad_len) => {
                    let head: Vec<u8> = carry.drain(..valid_up_to).collect();
                    let mut out = String::from_utf8(head).expect("valid_up_to bytes are valid utf8");
                    carry.drain(..bad_len);
                    out.push('\u{FFFD}');
                    if let Some(rest) = take_valid_utf8_prefix(carry) {
                        out.push_str(&rest);
                    }
                    Some(out)
                }
            }
        }
    }
}

/// Handle to a running journal writer task.
pub struct JournalWriter {
    tx: mpsc::UnboundedSender<WriteCmd>,
    alive: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
}

/// What was found (if anything) at `path` when a writer is about to open it.
#[derive(Debug, PartialEq, Eq)]
enum ExistingJournal {
    /// No file there yet; start fresh.
    Absent,
    /// A valid asciicast header, and the file is within the configured cap
    /// (or no cap is configured) — append to it.
    WithinLimit,
    /// A valid asciicast header, but the file exceeds the configured cap —
    /// rewrite it down from its own tail before appending.
    Oversized,
    /// The file exists but has no readable, parseable header line.
    Malformed,
}

/// Inspects whatever is already at `path`, without holding it open, so
/// `open()` can decide whether to append, rewrite, or start fresh (the
/// "startup reconciliation" contract: append within the size cap, rewrite
/// from the tail if oversized, rotate to a new file if the existing one is
/// unreadable or malformed).
async fn inspect_existing(path: &Path, max_cast_size: Option<u64>) -> ExistingJournal {
    let metadata = match fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return ExistingJournal::Absent,
    };

    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return ExistingJournal::Malformed,
    };
    let mut reader = BufReader::new(file);
    let mut header_line = String::new();
    let n = match reader.read_line(&mut header_line).await {
        Ok(n) => n,
        Err(_) => return ExistingJournal::Malformed,
    };
    if n == 0 || serde_json::from_str::<Header>(header_line.trim_end()).is_err() {
        return ExistingJournal::Malformed;
    }

    match max_cast_size {
        Some(max) if metadata.len() > max => ExistingJournal::Oversized,
        _ => ExistingJournal::WithinLimit,
    }
}

impl JournalWriter {
    /// Opens the journal at `path`, spawning the background writer task.
    /// `checkpoint_rx` lets callers (the session record, the Cast Output
    /// Hub) observe pruning checkpoints as they're detected, without a
    /// callback registered into the writer itself.
    ///
    /// Implements the startup reconciliation contract: a fresh, absent file
    /// gets a new header; an existing, valid file within `limits.max_cast_size`
    /// is appended to as-is; an existing, valid file over the cap is rewritten
    /// down from its own tail (via the Streaming Truncator) before appending;
    /// an existing file that's unreadable or has no parseable header is
    /// rotated away (overwritten with a fresh header), with a logged warning.
    pub async fn open(
        path: PathBuf,
        width: u16,
        height: u16,
        command: &[String],
        title: &str,
        env: std::collections::HashMap<String, String>,
        limits: Limits,
    ) -> Result<(Self, watch::Receiver<PruningCheckpoint>), CoreError> {
        let existing = inspect_existing(&path, limits.max_cast_size).await;

        if existing == ExistingJournal::Malformed {
            warn!(path = %path.display(), "existing journal unreadable or malformed, rotating to a fresh file");
        }

        if existing == ExistingJournal::Oversized {
            let max = limits.max_cast_size.expect("Oversized is only returned when a cap is configured");
            let target_bytes = (max as f64 * limits.cast_truncation_target_percentage) as u64;
            let rewrite_path = path.clone();
            tokio::task::spawn_blocking(move || streaming_truncate(&rewrite_path, target_bytes))
                .await
                .map_err(|e| CoreError::PermanentIo(format!("startup truncation task panicked: {e}")))?
                .map_err(|e| CoreError::PermanentIo(format!("startup truncation failed: {e}")))?;
        }

        let append = matches!(existing, ExistingJournal::WithinLimit | ExistingJournal::Oversized);

        let (mut file, header_len) = if append {
            let file = fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await
                .map_err(|e| crate::error::classify_io(&e, false))?;
            let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            (file, size)
        } else {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(|e| crate::error::classify_io(&e, false))?;

            let header = Header::new(width, height, command, title, env);
            let header_line = serde_json::to_string(&header)
                .map_err(|e| CoreError::Parse(e.to_string()))?;
            file.write_all(header_line.as_bytes())
                .await
                .map_err(|e| crate::error::classify_io(&e, true))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| crate::error::classify_io(&e, true))?;
            file.flush()
                .await
                .map_err(|e| crate::error::classify_io(&e, true))?;

            let header_len = header_line.len() as u64 + 1;
            (file, header_len)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let written = Arc::new(AtomicU64::new(header_len));
        let pending = Arc::new(AtomicU64::new(0));
        let (checkpoint_tx, checkpoint_rx) = watch::channel(PruningCheckpoint::default());

        tokio::spawn(writer_task(
            rx,
            file,
            path,
            limits,
            Arc::clone(&written),
            Arc::clone(&pending),
            Arc::clone(&alive),
            checkpoint_tx,
            Instant::now(),
        ));

        Ok((
            Self {
                tx,
                alive,
                written,
                pending,
            },
            checkpoint_rx,
        ))
    }

    pub fn write_output(&self, data: Vec<u8>) -> Result<(), CoreError> {
        self.send(WriteCmd::Output(data))
    }

    pub fn write_input(&self, data: String) -> Result<(), CoreError> {
        self.send(WriteCmd::Input(data))
    }

    pub fn write_resize(&self, cols: u16, rows: u16) -> Result<(), CoreError> {
        self.send(WriteCmd::Resize(cols, rows))
    }

    pub fn write_marker(&self, label: String) -> Result<(), CoreError> {
        self.send(WriteCmd::Marker(label))
    }

    pub fn write_exit(&self, code: i32) -> Result<(), CoreError> {
        self.send(WriteCmd::Exit(code))
    }

    /// Flushes and closes the journal, waiting for the background task to
    /// drain its queue.
    pub async fn close(&self) -> Result<(), CoreError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(CoreError::PermanentIo("journal writer already closed".into()));
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteCmd::Close(done_tx)).is_err() {
            return Err(CoreError::PermanentIo("journal writer task gone".into()));
        }
        done_rx
            .await
            .map_err(|_| CoreError::PermanentIo("journal writer task dropped before closing".into()))
    }

    pub fn position(&self) -> JournalPosition {
        let written = self.written.load(Ordering::Acquire);
        let pending = self.pending.load(Ordering::Acquire);
        JournalPosition {
            written,
            pending,
            total: written + pending,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn send(&self, cmd: WriteCmd) -> Result<(), CoreError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(CoreError::PermanentIo("journal writer closed".into()));
        }
        self.pending.fetch_add(cmd.encoded_len() as u64, Ordering::AcqRel);
        self.tx
            .send(cmd)
            .map_err(|_| CoreError::PermanentIo("journal writer task gone".into()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_task(
    mut rx: mpsc::UnboundedReceiver<WriteCmd>,
    mut file: fs::File,
    path: PathBuf,
    limits: Limits,
    written: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    checkpoint_tx: watch::Sender<PruningCheckpoint>,
    start: Instant,
) {
    let mut check_interval = tokio::time::interval(limits.cast_size_check_interval);
    check_interval.tick().await; // first tick fires immediately

    // Bytes from an Output command split mid-rune by a PTY read boundary,
    // held here until the bytes completing them arrive (see
    // `take_valid_utf8_prefix`).
    let mut utf8_carry: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                if let WriteCmd::Close(done) = cmd {
                    flush_utf8_carry(&mut file, &mut utf8_carry, &written, start).await;
                    let _ = file.flush().await;
                    let _ = done.send(());
                    break;
                }
                if !drain_one(&mut file, cmd, &written, &pending, &checkpoint_tx, &mut utf8_carry, start).await {
                    alive.store(false, Ordering::Release);
                    return;
                }
                // Batch-drain anything else already queued before flushing.
                let mut batched = Vec::new();
                while let Ok(cmd) = rx.try_recv() {
                    batched.push(cmd);
                }
                for cmd in batched {
                    if let WriteCmd::Close(done) = cmd {
                        flush_utf8_carry(&mut file, &mut utf8_carry, &written, start).await;
                        let _ = file.flush().await;
                        let _ = done.send(());
                        alive.store(false, Ordering::Release);
                        return;
                    }
                    if !drain_one(&mut file, cmd, &written, &pending, &checkpoint_tx, &mut utf8_carry, start).await {
                        alive.store(false, Ordering::Release);
                        return;
                    }
                }
                if let Err(e) = file.flush().await {
                    error!(error = %e, "journal flush failed");
                    alive.store(false, Ordering::Release);
                    return;
                }
            }
            _ = check_interval.tick() => {
                if let Some(max) = limits.max_cast_size {
                    maybe_truncate(&path, max, limits.cast_truncation_target_percentage, &written).await;
                }
            }
        }
    }
}

/// Called once on close: the stream has ended, so any still-incomplete tail
/// in `utf8_carry` can never be completed. Lossily decode it (same as
/// `String::from_utf8_lossy` would) rather than silently dropping it.
async fn flush_utf8_carry(file: &mut fs::File, utf8_carry: &mut Vec<u8>, written: &Arc<AtomicU64>, start: Instant) {
    if utf8_carry.is_empty() {
        return;
    }
    let data = String::from_utf8_lossy(utf8_carry).into_owned();
    utf8_carry.clear();
    let elapsed = start.elapsed().as_secs_f64();
    let line = Event::new(elapsed, EventKind::Output, data).to_line();
    if file.write_all(line.as_bytes()).await.is_ok() && file.write_all(b"\n").await.is_ok() {
        written.fetch_add(line.len() as u64 + 1, Ordering::AcqRel);
    }
}

async fn drain_one(
    file: &mut fs::File,
    cmd: WriteCmd,
    written: &Arc<AtomicU64>,
    pending: &Arc<AtomicU64>,
    checkpoint_tx: &watch::Sender<PruningCheckpoint>,
    utf8_carry: &mut Vec<u8>,
    start: Instant,
) -> bool {
    let elapsed = start.elapsed().as_secs_f64();
    let encoded_len = cmd.encoded_len() as u64;

    let to_write: Option<(String, Option<String>)> = match cmd {
        WriteCmd::Output(bytes) => {
            utf8_carry.extend_from_slice(&bytes);
            take_valid_utf8_prefix(utf8_carry)
                .map(|data| (Event::new(elapsed, EventKind::Output, data.clone()).to_line(), Some(data)))
        }
        WriteCmd::Input(data) => Some((Event::new(elapsed, EventKind::Input, data).to_line(), None)),
        WriteCmd::Resize(cols, rows) => Some((Event::new(elapsed, EventKind::Resize, resize_data(cols, rows)).to_line(), None)),
        WriteCmd::Marker(label) => Some((Event::new(elapsed, EventKind::Marker, label).to_line(), None)),
        WriteCmd::Exit(code) => Some((Event::new(elapsed, EventKind::Exit, code.to_string()).to_line(), None)),
        WriteCmd::Close(_) => unreachable!("Close handled by caller"),
    };

    let Some((line, pruning_data)) = to_write else {
        // Buffered an incomplete UTF-8 tail; nothing to write this round.
        pending.fetch_sub(encoded_len.min(pending.load(Ordering::Acquire)), Ordering::AcqRel);
        return true;
    };

    let event_start_offset = written.load(Ordering::Acquire);

    if let Some(data) = pruning_data.as_deref() {
        if let Some(m) = pruning::detect_last(data.as_bytes()) {
            let prefix_len = json_prefix_len(&line, data);
            let escaped_up_to_end = pruning::json_escaped_len(data, m.end);
            let offset = pruning::sequence_file_offset(event_start_offset, prefix_len, escaped_up_to_end);
            let _ = checkpoint_tx.send(PruningCheckpoint { offset: Some(offset) });
            debug!(sequence = m.sequence.name, offset, "pruning sequence detected");
        }
    }

    if let Err(e) = file.write_all(line.as_bytes()).await {
        error!(error = %e, "journal write failed");
        return false;
    }
    if let Err(e) = file.write_all(b"\n").await {
        error!(error = %e, "journal write failed");
        return false;
    }

    let actual_len = line.len() as u64 + 1;
    written.fetch_add(actual_len, Ordering::AcqRel);
    pending.fetch_sub(encoded_len.min(pending.load(Ordering::Acquire)), Ordering::AcqRel);
    true
}

/// Length in bytes of the JSON line up to (not including) the data string's
/// contents, e.g. `[12.3,"o","` for an output event.
fn json_prefix_len(line: &str, data: &str) -> usize {
    let escaped = serde_json::to_string(data).unwrap_or_default();
    let escaped_inner = &escaped[1..escaped.len().saturating_sub(1)];
    match line.find(escaped_inner) {
        Some(idx) => idx,
        None => line.len(),
    }
}

/// File size past which `maybe_truncate` switches from the in-memory
/// rewrite to the line-streamed one, so a multi-gigabyte journal is never
/// read into memory in one shot.
const STREAMING_TRUNCATE_THRESHOLD: u64 = 50 * 1024 * 1024;

async fn maybe_truncate(path: &Path, max_size: u64, target_pct: f64, written: &Arc<AtomicU64>) {
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!(error = %e, "could not stat journal for size check");
            return;
        }
    };
    if size <= max_size {
        return;
    }
    let target_bytes = ((max_size as f64) * target_pct) as u64;
    let result = if size < STREAMING_TRUNCATE_THRESHOLD {
        let owned_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || super::truncate::in_memory_truncate(&owned_path, target_bytes))
            .await
            .unwrap_or_else(|e| Err(super::truncate::TruncateError::Io(std::io::Error::other(e))))
    } else {
        let owned_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || streaming_truncate(&owned_path, target_bytes))
            .await
            .unwrap_or_else(|e| Err(super::truncate::TruncateError::Io(std::io::Error::other(e))))
    };
    match result {
        Ok(dropped) => {
            if let Ok(new_size) = tokio::fs::metadata(&path).await.map(|m| m.len()) {
                written.store(new_size, Ordering::Release);
            }
            debug!(dropped, "journal truncated to stay under size cap");
        }
        Err(e) => warn!(error = %e, "journal truncation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write as _;

    fn write_raw_journal(path: &std::path::Path, header: &Header, events: &[Event]) {
        let mut f = std::fs::File::create(path).unwrap();
        writeln!(f, "{}", serde_json::to_string(header).unwrap()).unwrap();
        for e in events {
            writeln!(f, "{}", e.to_line()).unwrap();
        }
    }

    #[tokio::test]
    async fn open_appends_to_an_existing_valid_journal_within_the_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = Header::new(80, 24, &["bash".to_string()], "bash", HashMap::new());
        let existing_event = Event::new(0.0, EventKind::Output, "already here\n".to_string());
        write_raw_journal(&path, &header, &[existing_event]);

        let (writer, _rx) = JournalWriter::open(
            path.clone(), 80, 24, &["bash".to_string()], "bash", HashMap::new(), Limits::default(),
        )
        .await
        .unwrap();
        writer.write_output(b"new stuff".to_vec()).unwrap();
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<Event> = content.lines().skip(1).map(|l| Event::from_line(l).unwrap()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "already here\n");
        assert_eq!(events[1].data, "new stuff");
    }

    #[tokio::test]
    async fn open_rotates_a_malformed_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"not a journal at all\n").unwrap();

        let (writer, _rx) = JournalWriter::open(
            path.clone(), 100, 30, &["zsh".to_string()], "zsh", HashMap::new(), Limits::default(),
        )
        .await
        .unwrap();
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header: Header = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header.width, 100);
        assert_eq!(header.height, 30);
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn open_rewrites_an_oversized_journal_from_its_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = Header::new(80, 24, &["bash".to_string()], "bash", HashMap::new());
        let events: Vec<Event> = (0..200)
            .map(|i| Event::new(i as f64 * 0.1, EventKind::Output, format!("line {i} of padding text")))
            .collect();
        write_raw_journal(&path, &header, &events);
        let oversized_len = std::fs::metadata(&path).unwrap().len();

        let limits = Limits {
            max_cast_size: Some(oversized_len / 4),
            cast_truncation_target_percentage: 0.5,
            ..Limits::default()
        };
        let (writer, _rx) = JournalWriter::open(
            path.clone(), 80, 24, &["bash".to_string()], "bash", HashMap::new(), limits,
        )
        .await
        .unwrap();
        writer.write_output(b"appended after rewrite".to_vec()).unwrap();
        writer.close().await.unwrap();

        let new_len = std::fs::metadata(&path).unwrap().len();
        assert!(new_len < oversized_len, "oversized journal should have been rewritten down before appending");

        let content = std::fs::read_to_string(&path).unwrap();
        let last_event = Event::from_line(content.lines().last().unwrap()).unwrap();
        assert_eq!(last_event.data, "appended after rewrite");
        assert!(content.contains("Truncated"), "the streaming truncator's marker event should survive into the rewritten file");
    }

    #[tokio::test]
    async fn writes_header_then_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, _checkpoints) = JournalWriter::open(
            path.clone(),
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();

        writer.write_output(b"hello\n".to_vec()).unwrap();
        writer.write_input("ls\n".to_string()).unwrap();
        writer.write_resize(100, 40).unwrap();
        writer.write_exit(0).unwrap();
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header: Header = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header.width, 80);

        let events: Vec<Event> = lines.map(|l| Event::from_line(l).unwrap()).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, EventKind::Output);
        assert_eq!(events[1].kind, EventKind::Input);
        assert_eq!(events[2].kind, EventKind::Resize);
        assert_eq!(events[2].data, "100x40");
        assert_eq!(events[3].kind, EventKind::Exit);
        assert_eq!(events[3].data, "0");
    }

    #[tokio::test]
    async fn detects_pruning_sequence_and_publishes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, mut checkpoints) = JournalWriter::open(
            path.clone(),
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();

        writer.write_output(b"before\x1b[3Jafter".to_vec()).unwrap();
        writer.close().await.unwrap();

        checkpoints.changed().await.unwrap();
        let checkpoint = *checkpoints.borrow();
        assert!(checkpoint.offset.is_some());
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, _rx) = JournalWriter::open(
            path,
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();
        writer.close().await.unwrap();
        assert!(writer.write_output(b"late".to_vec()).is_err());
    }

    #[tokio::test]
    async fn position_reflects_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, _rx) = JournalWriter::open(
            path,
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();

        let before = writer.position();
        assert!(before.total > 0); // header already accounted for

        writer.write_output(b"some output".to_vec()).unwrap();
        writer.close().await.unwrap();

        let after = writer.position();
        assert!(after.written > before.written);
        assert_eq!(after.pending, 0);
    }

    #[tokio::test]
    async fn output_reassembles_a_multibyte_rune_split_across_two_writes() {
        // "café" — the 'é' is the two-byte UTF-8 sequence 0xC3 0xA9; split it
        // across two write_output calls the way two separate 16KiB PTY reads
        // could land on either side of it.
        let full = "caf\u{e9}".as_bytes().to_vec();
        let (head, tail) = full.split_at(full.len() - 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, _rx) = JournalWriter::open(
            path.clone(),
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();

        writer.write_output(head.to_vec()).unwrap();
        writer.write_output(tail.to_vec()).unwrap();
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<Event> = content.lines().skip(1).map(|l| Event::from_line(l).unwrap()).collect();
        let joined: String = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(joined, "caf\u{e9}");
        assert!(!joined.contains('\u{fffd}'), "split rune must not decode to a replacement character");
    }

    #[tokio::test]
    async fn incomplete_trailing_rune_is_lossily_flushed_on_close() {
        let full = "caf\u{e9}".as_bytes().to_vec();
        let (head, tail) = full.split_at(full.len() - 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (writer, _rx) = JournalWriter::open(
            path.clone(),
            80,
            24,
            &["bash".to_string()],
            "bash",
            HashMap::new(),
            Limits::default(),
        )
        .await
        .unwrap();

        writer.write_output(head.to_vec()).unwrap();
        // `tail` never arrives — the stream ends mid-rune.
        let _ = tail;
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<Event> = content.lines().skip(1).map(|l| Event::from_line(l).unwrap()).collect();
        // "caf" decodes immediately; the dangling lead byte of 'é' only
        // resolves (lossily, as U+FFFD) once close() confirms no more bytes
        // are coming.
        let joined: String = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(joined, "caf\u{fffd}");
    }

    #[test]
    fn take_valid_utf8_prefix_buffers_an_incomplete_lead_byte() {
        let mut carry = vec![0xE2, 0x82]; // first two bytes of the three-byte '€'
        assert_eq!(take_valid_utf8_prefix(&mut carry), None);
        assert_eq!(carry, vec![0xE2, 0x82]);

        carry.push(0xAC); // completes '€'
        assert_eq!(take_valid_utf8_prefix(&mut carry), Some("\u{20ac}".to_string()));
        assert!(carry.is_empty());
    }

    #[test]
    fn take_valid_utf8_prefix_substitutes_genuinely_invalid_bytes() {
        let mut carry = vec![b'a', 0xFF, b'b'];
        let out = take_valid_utf8_prefix(&mut carry).unwrap();
        assert_eq!(out, "a\u{fffd}b");
        assert!(carry.is_empty());
    }
}
