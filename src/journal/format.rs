//! Asciicast v2 on-disk types: the header object and the `[t, kind, data]`
//! event tuples (spec §6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Line 1 of every journal: `{"version":2,"width":..,"height":..,...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: u64,
    pub command: String,
    pub title: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Header {
    pub fn new(width: u16, height: u16, command: &[String], title: &str, env: HashMap<String, String>) -> Self {
        Self {
            version: 2,
            width,
            height,
            timestamp: now_unix(),
            command: command.join(" "),
            title: title.to_string(),
            env,
        }
    }
}

/// Event kind tag, the second element of the `[t, kind, data]` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    Input,
    Resize,
    Marker,
    Exit,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
            Self::Marker => "m",
            Self::Exit => "exit",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "o" => Some(Self::Output),
            "i" => Some(Self::Input),
            "r" => Some(Self::Resize),
            "m" => Some(Self::Marker),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// A decoded journal event line.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: f64,
    pub kind: EventKind,
    pub data: String,
}

impl Event {
    pub fn new(time: f64, kind: EventKind, data: impl Into<String>) -> Self {
        Self { time, kind, data: data.into() }
    }

    /// Serializes to a single journal line, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(&(self.time, self.kind.as_str(), &self.data))
            .expect("tuple of f64/str/str always serializes")
    }

    /// Parses a single journal line (header lines must be parsed separately).
    pub fn from_line(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let arr = value.as_array()?;
        if arr.len() != 3 {
            return None;
        }
        let time = arr[0].as_f64()?;
        let kind = EventKind::from_str_opt(arr[1].as_str()?)?;
        let data = arr[2].as_str()?.to_string();
        Some(Self { time, kind, data })
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resize event data encoding: `"<cols>x<rows>"`.
pub fn resize_data(cols: u16, rows: u16) -> String {
    format!("{cols}x{rows}")
}

pub fn parse_resize_data(data: &str) -> Option<(u16, u16)> {
    let (cols, rows) = data.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_line() {
        let e = Event::new(1.5, EventKind::Output, "hello\nworld");
        let line = e.to_line();
        let parsed = Event::from_line(&line).expect("parses");
        assert_eq!(parsed, e);
    }

    #[test]
    fn resize_data_round_trips() {
        let data = resize_data(80, 24);
        assert_eq!(data, "80x24");
        assert_eq!(parse_resize_data(&data), Some((80, 24)));
    }

    #[test]
    fn header_round_trips_through_json() {
        let h = Header::new(80, 24, &["bash".to_string(), "-lc".to_string(), "true".to_string()], "bash", HashMap::new());
        let json = serde_json::to_string(&h).unwrap();
        let parsed: Header = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.width, 80);
        assert_eq!(parsed.command, "bash -lc true");
    }
}
