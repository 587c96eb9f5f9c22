//! Per-subscriber outbound queue and backpressure policy (C9).
//!
//! Grounded on `sessions/buffer.rs`'s `OutputBuffer` (`VecDeque` + shared
//! `Notify` for wakeup) generalized from one shared cursor to an
//! independently paced queue per subscriber, and from a flat eviction policy
//! to the spec's differentiated one: stdout is droppable, snapshots
//! coalesce, everything else (`Header`, `Exit`, `Error`, `Marker`) is never
//! dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// One event as delivered from a session reader to a subscriber. This is the
/// Hub's internal shape; the WS/IPC transport layer encodes it into the
/// wire frame protocol (C7).
#[derive(Debug, Clone)]
pub enum HubEvent {
    Header { cols: u16, rows: u16 },
    Output(String),
    Resize(u16, u16),
    Marker(String),
    Exit(i32),
    Error(String),
    SnapshotVt(Vec<u8>),
}

impl HubEvent {
    fn is_droppable_stdout(&self) -> bool {
        matches!(self, Self::Output(_))
    }

    fn is_snapshot(&self) -> bool {
        matches!(self, Self::SnapshotVt(_))
    }
}

/// Bounded mailbox applying the §4.9 drop policy. Shared between the
/// session reader (producer) and the transport-facing receive loop
/// (consumer).
struct Queue {
    entries: Mutex<VecDeque<HubEvent>>,
    notify: Notify,
    capacity: usize,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64)),
            ),
            notify: Notify::new(),
            capacity,
        }
    }

    async fn push(&self, event: HubEvent) {
        let mut entries = self.entries.lock().await;

        if event.is_snapshot() {
            // Coalesce: at most one pending snapshot, the latest wins.
            entries.retain(|e| !e.is_snapshot());
        } else if entries.len() >= self.capacity {
            if event.is_droppable_stdout() {
                if let Some(pos) = entries.iter().position(HubEvent::is_droppable_stdout) {
                    entries.remove(pos);
                }
            }
            // Control events (Header/Exit/Error/Marker/Resize) are never
            // dropped; the queue is allowed to grow past capacity for them
            // since they're rare relative to stdout volume.
        }

        entries.push_back(event);
        drop(entries);
        self.notify.notify_waiters();
    }

    async fn pop(&self) -> Option<HubEvent> {
        loop {
            {
                let mut entries = self.entries.lock().await;
                if let Some(event) = entries.pop_front() {
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A single subscription to a session's live output. Dropping all clones
/// (or calling [`close`](Self::close)) signals the reader to remove it on
/// its next emission, per §4.9's cancellation rule.
pub struct Subscriber {
    pub id: u64,
    pub wants_stdout: bool,
    pub wants_snapshots: bool,
    queue: Arc<Queue>,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    pub fn new(id: u64, wants_stdout: bool, wants_snapshots: bool, capacity: usize) -> Self {
        Self {
            id,
            wants_stdout,
            wants_snapshots,
            queue: Arc::new(Queue::new(capacity)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) async fn push(&self, event: HubEvent) {
        if self.is_closed() {
            return;
        }
        self.queue.push(event).await;
    }

    /// Waits for the next event, or `None` once [`close`](Self::close) has
    /// been called and the queue has drained.
    pub async fn recv(&self) -> Option<HubEvent> {
        if self.is_closed() {
            return None;
        }
        self.queue.pop().await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_stdout_when_full() {
        let sub = Subscriber::new(1, true, false, 2);
        sub.push(HubEvent::Output("a".into())).await;
        sub.push(HubEvent::Output("b".into())).await;
        sub.push(HubEvent::Output("c".into())).await; // drops "a"

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, HubEvent::Output(s) if s == "b"));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second, HubEvent::Output(s) if s == "c"));
    }

    #[tokio::test]
    async fn never_drops_control_events() {
        let sub = Subscriber::new(1, true, false, 1);
        sub.push(HubEvent::Output("a".into())).await;
        sub.push(HubEvent::Exit(0)).await;
        sub.push(HubEvent::Error("boom".into())).await;

        assert!(matches!(sub.recv().await.unwrap(), HubEvent::Output(_)));
        assert!(matches!(sub.recv().await.unwrap(), HubEvent::Exit(0)));
        assert!(matches!(sub.recv().await.unwrap(), HubEvent::Error(_)));
    }

    #[tokio::test]
    async fn snapshot_events_coalesce_to_latest() {
        let sub = Subscriber::new(1, false, true, 8);
        sub.push(HubEvent::SnapshotVt(vec![1])).await;
        sub.push(HubEvent::SnapshotVt(vec![2])).await;

        let only = sub.recv().await.unwrap();
        assert!(matches!(only, HubEvent::SnapshotVt(v) if v == vec![2]));
    }

    #[tokio::test]
    async fn closed_subscriber_stops_yielding_events() {
        let sub = Subscriber::new(1, true, false, 4);
        sub.close();
        assert!(sub.recv().await.is_none());
    }
}
