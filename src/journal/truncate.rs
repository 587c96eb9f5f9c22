//! Line-streamed rewrite of an oversized journal (C3).
//!
//! Used by the writer when a journal has grown past `max_cast_size` and is
//! too large (≥ 50 MiB) to truncate by reading the whole file into memory.
//! Keeps memory bounded to roughly `target_bytes` plus one line.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::format::{Event, EventKind};

#[derive(Debug, thiserror::Error)]
pub enum TruncateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal has no header line")]
    MissingHeader,
}

/// Streams `path` forward line by line, keeping the header and a rolling
/// tail of event lines whose cumulative encoded size never exceeds
/// `target_bytes`. Writes the result to a temp file and renames it over
/// `path`. Returns the number of dropped event lines.
///
/// Progress is logged every 100k lines per spec §4.3.
pub fn streaming_truncate(path: &Path, target_bytes: u64) -> Result<u64, TruncateError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_line = String::new();
    if reader.read_line(&mut header_line)? == 0 {
        return Err(TruncateError::MissingHeader);
    }
    let header_line = header_line.trim_end_matches('\n').to_string();

    let mut tail: VecDeque<String> = VecDeque::new();
    let mut tail_bytes: u64 = 0;
    let mut dropped: u64 = 0;
    let mut lines_seen: u64 = 0;
    let mut first_kept_time: Option<f64> = None;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        lines_seen += 1;
        if lines_seen % 100_000 == 0 {
            tracing::debug!(lines_seen, "streaming truncation progress");
        }

        let line_bytes = line.len() as u64 + 1; // + newline
        tail.push_back(line.clone());
        tail_bytes += line_bytes;

        while tail_bytes > target_bytes && tail.len() > 1 {
            if let Some(dropped_line) = tail.pop_front() {
                tail_bytes -= dropped_line.len() as u64 + 1;
                dropped += 1;
            }
        }
    }

    if let Some(first) = tail.front() {
        first_kept_time = Event::from_line(first).map(|e| e.time);
    }
    let marker_time = first_kept_time.unwrap_or(0.0);
    let marker = Event::new(
        marker_time,
        EventKind::Marker,
        format!("[Truncated {dropped} events to limit file size]"),
    );

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let w = tmp.as_file_mut();
        writeln!(w, "{header_line}")?;
        writeln!(w, "{}", marker.to_line())?;
        for line in &tail {
            writeln!(w, "{line}")?;
        }
        w.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(dropped)
}

/// In-memory variant of the size-bounded truncation policy, used for
/// journals under the 50 MiB streaming threshold where reading the whole
/// file in one shot is cheap. Same drop-oldest-while-over-budget logic as
/// [`streaming_truncate`], but the marker is appended after the kept tail
/// (timestamped at the last surviving event) rather than stamped in front
/// of it.
pub fn in_memory_truncate(path: &Path, target_bytes: u64) -> Result<u64, TruncateError> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    let header_line = lines.next().ok_or(TruncateError::MissingHeader)?.to_string();

    let mut tail: VecDeque<&str> = VecDeque::new();
    let mut tail_bytes: u64 = 0;
    let mut dropped: u64 = 0;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line_bytes = line.len() as u64 + 1;
        tail.push_back(line);
        tail_bytes += line_bytes;

        while tail_bytes > target_bytes && tail.len() > 1 {
            if let Some(dropped_line) = tail.pop_front() {
                tail_bytes -= dropped_line.len() as u64 + 1;
                dropped += 1;
            }
        }
    }

    let marker_time = tail.back().and_then(|line| Event::from_line(line)).map(|e| e.time).unwrap_or(0.0);
    let marker = Event::new(
        marker_time,
        EventKind::Marker,
        format!("[Truncated {dropped} events to limit file size]"),
    );

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let w = tmp.as_file_mut();
        writeln!(w, "{header_line}")?;
        for line in &tail {
            writeln!(w, "{line}")?;
        }
        writeln!(w, "{}", marker.to_line())?;
        w.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::format::Header;
    use std::collections::HashMap;
    use std::io::Write as _;

    fn write_test_journal(dir: &Path, n: usize) -> std::path::PathBuf {
        let path = dir.join("stdout");
        let mut f = std::fs::File::create(&path).unwrap();
        let header = Header::new(80, 24, &["bash".into()], "bash", HashMap::new());
        writeln!(f, "{}", serde_json::to_string(&header).unwrap()).unwrap();
        for i in 0..n {
            let e = Event::new(i as f64 * 0.1, EventKind::Output, format!("line {i} payload data"));
            writeln!(f, "{}", e.to_line()).unwrap();
        }
        path
    }

    #[test]
    fn keeps_header_and_recent_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_journal(dir.path(), 100);
        let original_size = std::fs::metadata(&path).unwrap().len();

        let dropped = streaming_truncate(&path, 1024).unwrap();
        assert!(dropped > 0);

        let new_size = std::fs::metadata(&path).unwrap().len();
        assert!(new_size < original_size);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header_line = lines.next().unwrap();
        let header: Header = serde_json::from_str(header_line).unwrap();
        assert_eq!(header.width, 80);

        let marker_line = lines.next().unwrap();
        let marker = Event::from_line(marker_line).unwrap();
        assert_eq!(marker.kind, EventKind::Marker);
        assert!(marker.data.contains(&dropped.to_string()));

        let last_line = content.lines().last().unwrap();
        let last_event = Event::from_line(last_line).unwrap();
        assert!(last_event.data.contains("line 99"));
    }

    #[test]
    fn in_memory_truncate_appends_marker_after_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_journal(dir.path(), 100);
        let original_size = std::fs::metadata(&path).unwrap().len();

        let dropped = in_memory_truncate(&path, 1024).unwrap();
        assert!(dropped > 0);

        let new_size = std::fs::metadata(&path).unwrap().len();
        assert!(new_size < original_size);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header_line = lines.next().unwrap();
        let header: Header = serde_json::from_str(header_line).unwrap();
        assert_eq!(header.width, 80);

        // Unlike `streaming_truncate`, the marker comes last, after the
        // surviving tail, not right after the header.
        let all_lines: Vec<&str> = content.lines().skip(1).collect();
        let last_event = Event::from_line(all_lines.last().unwrap()).unwrap();
        assert_eq!(last_event.kind, EventKind::Marker);
        assert!(last_event.data.contains(&dropped.to_string()));

        let second_to_last = Event::from_line(all_lines[all_lines.len() - 2]).unwrap();
        assert!(second_to_last.data.contains("line 99"));
    }

    #[test]
    fn in_memory_truncate_missing_header_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();
        assert!(matches!(in_memory_truncate(&path, 1024), Err(TruncateError::MissingHeader)));
    }

    #[test]
    fn missing_header_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();
        assert!(matches!(streaming_truncate(&path, 1024), Err(TruncateError::MissingHeader)));
    }
}
