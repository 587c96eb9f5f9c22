//! vt100-driven screen state and the paced `SnapshotVt` renderer.
//!
//! Grounded on the teacher's vt100 dependency (already present for a
//! different screen-diffing purpose) generalized here into the wire format
//! §4.7 reserves the `SnapshotVt` magic/version constants for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use vt100::Parser;

use crate::hub::subscriber::{HubEvent, Subscriber};
use crate::ipc::frame::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

/// Incrementally fed vt100 screen, one per session reader.
pub struct ScreenState {
    parser: Parser,
}

impl ScreenState {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { parser: Parser::new(rows, cols, 0) }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Plain-text screen contents, for `GET /api/sessions/:id/text`.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    /// Renders the current screen into the `SnapshotVt` payload: a small
    /// fixed header (magic, version, geometry, cursor) followed by the
    /// screen's text contents.
    pub fn render(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_row, cursor_col) = screen.cursor_position();
        let contents = screen.contents();
        let contents_bytes = contents.as_bytes();

        let mut buf = Vec::with_capacity(16 + contents_bytes.len());
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&cols.to_le_bytes());
        buf.extend_from_slice(&rows.to_le_bytes());
        buf.extend_from_slice(&cursor_row.to_le_bytes());
        buf.extend_from_slice(&cursor_col.to_le_bytes());
        buf.push(u8::from(!screen.hide_cursor()));
        buf.extend_from_slice(&(contents_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(contents_bytes);
        buf
    }
}

fn lock_screen(screen: &Mutex<ScreenState>) -> std::sync::MutexGuard<'_, ScreenState> {
    screen.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn feed_screen(screen: &Mutex<ScreenState>, bytes: &[u8]) {
    lock_screen(screen).feed(bytes);
}

pub fn resize_screen(screen: &Mutex<ScreenState>, cols: u16, rows: u16) {
    lock_screen(screen).resize(cols, rows);
}

fn render_screen(screen: &Mutex<ScreenState>) -> Vec<u8> {
    lock_screen(screen).render()
}

/// Paces `SnapshotVt` delivery to one subscriber: never more often than
/// `min_interval`, never less often than `max_interval` while output is
/// flowing (a heartbeat snapshot even without new dirty bytes, so a late
/// joiner's client-side screen never silently goes stale).
pub struct Pacer {
    min_interval: Duration,
    max_interval: Duration,
}

impl Pacer {
    pub fn new(min_interval_ms: u16, max_interval_ms: u16) -> Self {
        let min = Duration::from_millis(u64::from(min_interval_ms.max(1)));
        let max = Duration::from_millis(u64::from(max_interval_ms.max(min_interval_ms)));
        Self { min_interval: min, max_interval: max }
    }

    pub async fn run(self, subscriber: Arc<Subscriber>, screen: Arc<Mutex<ScreenState>>, dirty: Arc<AtomicBool>) {
        // Send one immediately so a newly attached client isn't staring at
        // a blank screen for a full `max_interval`.
        subscriber.push(HubEvent::SnapshotVt(render_screen(&screen))).await;
        let mut last_sent = Instant::now();

        loop {
            if subscriber.is_closed() {
                return;
            }
            tokio::time::sleep(self.min_interval).await;
            if subscriber.is_closed() {
                return;
            }

            let was_dirty = dirty.swap(false, Ordering::AcqRel);
            if was_dirty || last_sent.elapsed() >= self.max_interval {
                subscriber.push(HubEvent::SnapshotVt(render_screen(&screen))).await;
                last_sent = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_reflects_fed_bytes() {
        let mut screen = ScreenState::new(80, 24);
        screen.feed(b"hello world");
        assert!(screen.contents().contains("hello world"));
    }

    #[test]
    fn resize_changes_reported_geometry() {
        let mut screen = ScreenState::new(80, 24);
        screen.resize(40, 10);
        let rendered = screen.render();
        // Header layout: magic(2) version(1) cols(2) rows(2) ...
        let cols = u16::from_le_bytes([rendered[3], rendered[4]]);
        let rows = u16::from_le_bytes([rendered[5], rendered[6]]);
        assert_eq!((cols, rows), (40, 10));
    }

    #[test]
    fn render_payload_starts_with_snapshot_magic() {
        let screen = ScreenState::new(80, 24);
        let rendered = screen.render();
        let magic = u16::from_le_bytes([rendered[0], rendered[1]]);
        assert_eq!(magic, SNAPSHOT_MAGIC);
    }
}
