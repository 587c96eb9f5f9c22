//! Recognizes the fixed set of "safe pruning" escape sequences and computes
//! exact journal byte offsets for them.
//!
//! Detection operates on raw bytes only, never a lossily-decoded `String`,
//! so that offsets line up exactly with what lands on disk.

/// One of the nine sequences after which the terminal's visible state is
/// self-contained (clear-scrollback, RIS, clear-screen, home+clear variants,
/// alt-screen enter/exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruningSequence {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// Table order matters only for display; `detect_last` is order-independent.
pub const PRUNING_SEQUENCES: &[PruningSequence] = &[
    PruningSequence { name: "clear-scrollback", bytes: b"\x1b[3J" },
    PruningSequence { name: "reset", bytes: b"\x1bc" },
    PruningSequence { name: "clear-screen", bytes: b"\x1b[2J" },
    PruningSequence { name: "home-clear", bytes: b"\x1b[H\x1b[J" },
    PruningSequence { name: "home-clear-screen", bytes: b"\x1b[H\x1b[2J" },
    PruningSequence { name: "alt-screen-enter", bytes: b"\x1b[?1049h" },
    PruningSequence { name: "alt-screen-exit", bytes: b"\x1b[?1049l" },
    PruningSequence { name: "alt-screen-enter-legacy", bytes: b"\x1b[?47h" },
    PruningSequence { name: "alt-screen-exit-legacy", bytes: b"\x1b[?47l" },
];

/// A match of a pruning sequence inside a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub sequence: PruningSequence,
    /// Byte index of the match's first byte within `data`.
    pub start: usize,
    /// Byte index one past the match's last byte within `data`.
    pub end: usize,
}

/// Returns the latest occurrence of any recognized sequence in `data`.
/// Tie-break: latest end offset wins.
pub fn detect_last(data: &[u8]) -> Option<Match> {
    let mut best: Option<Match> = None;
    for seq in PRUNING_SEQUENCES {
        if seq.bytes.is_empty() || seq.bytes.len() > data.len() {
            continue;
        }
        // Scan all occurrences of this sequence, keep the last one.
        let mut search_from = 0usize;
        while let Some(rel) = find(&data[search_from..], seq.bytes) {
            let start = search_from + rel;
            let end = start + seq.bytes.len();
            let candidate = Match { sequence: *seq, start, end };
            let better = match &best {
                None => true,
                Some(b) => end > b.end,
            };
            if better {
                best = Some(candidate);
            }
            search_from = start + 1;
            if search_from >= data.len() {
                break;
            }
        }
    }
    best
}

/// Whether `data` contains any recognized pruning sequence.
pub fn contains_any(data: &[u8]) -> bool {
    PRUNING_SEQUENCES
        .iter()
        .any(|seq| !seq.bytes.is_empty() && find(data, seq.bytes).is_some())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Computes the exact file byte offset one byte past a matched sequence.
///
/// `event_start_offset` is the file offset of the first byte of the JSON
/// event line (`[<ts>,"o","`). `prefix_len` is the number of bytes of that
/// JSON prefix before the encoded `data` string begins. `full_data` is the
/// raw event payload (the `"o"` chunk passed to `writeOutput`); `m` locates
/// the sequence within it. The caller is responsible for JSON-escaping: this
/// function reasons in terms of *encoded* byte widths, so pass the already
/// JSON-string-escaped length up to `m.end` via `encoded_len_up_to`.
pub fn sequence_file_offset(event_start_offset: u64, prefix_len: usize, encoded_len_up_to_end: usize) -> u64 {
    event_start_offset + prefix_len as u64 + encoded_len_up_to_end as u64
}

/// Length of `data[..end]` after JSON string-escaping, matching what the
/// writer actually emits to disk. Used to convert a raw-byte match offset
/// into an offset inside the serialized journal line.
pub fn json_escaped_len(data: &str, end_byte: usize) -> usize {
    let prefix = &data.as_bytes()[..end_byte.min(data.len())];
    let as_str = String::from_utf8_lossy(prefix);
    serde_json::to_string(as_str.as_ref())
        .map(|s| s.len().saturating_sub(2)) // strip the surrounding quotes
        .unwrap_or(prefix.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_clear_scrollback() {
        let data = b"hello\x1b[3Jworld";
        let m = detect_last(data).expect("match");
        assert_eq!(m.sequence.name, "clear-scrollback");
        assert_eq!(m.start, 5);
        assert_eq!(m.end, 9);
    }

    #[test]
    fn picks_latest_when_multiple_present() {
        let data = b"\x1b[2Jfoo\x1b[3Jbar";
        let m = detect_last(data).expect("match");
        assert_eq!(m.sequence.name, "clear-scrollback");
        assert_eq!(m.start, 7);
    }

    #[test]
    fn no_match_returns_none() {
        assert!(detect_last(b"plain text, no escapes here").is_none());
    }

    #[test]
    fn contains_any_true_false() {
        assert!(contains_any(b"\x1bc"));
        assert!(!contains_any(b"nothing special"));
    }

    #[test]
    fn alt_screen_variants_detected() {
        assert_eq!(detect_last(b"\x1b[?1049h").unwrap().sequence.name, "alt-screen-enter");
        assert_eq!(detect_last(b"\x1b[?1049l").unwrap().sequence.name, "alt-screen-exit");
        assert_eq!(detect_last(b"\x1b[?47h").unwrap().sequence.name, "alt-screen-enter-legacy");
        assert_eq!(detect_last(b"\x1b[?47l").unwrap().sequence.name, "alt-screen-exit-legacy");
    }

    #[test]
    fn home_clear_sequence_not_confused_with_clear_screen() {
        let data = b"\x1b[H\x1b[J";
        let m = detect_last(data).unwrap();
        assert_eq!(m.sequence.name, "home-clear");
    }
}
