//! Asciicast journal: on-disk format, pruning detection, the append-only
//! writer, and the oversized-file truncator (C1/C2/C3).

pub mod format;
pub mod pruning;
pub mod truncate;
pub mod writer;

pub use format::{parse_resize_data, resize_data, Event, EventKind, Header};
pub use pruning::{detect_last, Match as PruningMatch};
pub use writer::{JournalPosition, JournalWriter, Limits, PruningCheckpoint};
