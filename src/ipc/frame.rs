//! Binary frame protocol shared by the forwarder↔server Unix socket and the
//! server↔browser WebSocket (C7). Little-endian, length-prefixed.
//!
//! ```text
//! magic(2) version(1) type(1) sessionIdLen(2) payloadLen(4) sessionId(N) payload(M)
//! ```

use bytes::{Buf, BufMut, BytesMut};

pub const MAGIC: [u8; 2] = *b"TV";
pub const VERSION: u8 = 3;
const HEADER_LEN: usize = 2 + 1 + 1 + 2 + 4;

pub const SNAPSHOT_MAGIC: u16 = 0x5654; // 'VT' little-endian
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Stdout,
    SnapshotVt,
    InputText,
    Resize,
    Signal,
    Event,
    Error,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Subscribe => 1,
            Self::Unsubscribe => 2,
            Self::Ping => 3,
            Self::Pong => 4,
            Self::Stdout => 5,
            Self::SnapshotVt => 6,
            Self::InputText => 7,
            Self::Resize => 8,
            Self::Signal => 9,
            Self::Event => 10,
            Self::Error => 11,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            5 => Some(Self::Stdout),
            6 => Some(Self::SnapshotVt),
            7 => Some(Self::InputText),
            8 => Some(Self::Resize),
            9 => Some(Self::Signal),
            10 => Some(Self::Event),
            11 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Channel selection flags carried in a `Subscribe` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeFlags(u8);

impl SubscribeFlags {
    pub const STDOUT: Self = Self(0b001);
    pub const SNAPSHOTS: Self = Self(0b010);
    pub const EVENTS: Self = Self(0b100);
    pub const NONE: Self = Self(0);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SubscribeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A decoded frame. `session_id` is empty for global frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub session_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("session id is not valid utf-8")]
    BadSessionId,
}

impl Frame {
    pub fn new(frame_type: FrameType, session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            session_id: session_id.into(),
            payload,
        }
    }

    pub fn global(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self::new(frame_type, String::new(), payload)
    }

    /// Encodes this frame to its wire representation.
    pub fn encode(&self) -> BytesMut {
        let session_bytes = self.session_id.as_bytes();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + session_bytes.len() + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type.to_byte());
        buf.put_u16_le(session_bytes.len() as u16);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(session_bytes);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn subscribe(session_id: impl Into<String>, flags: SubscribeFlags, min_interval_ms: u16, max_interval_ms: u16) -> Self {
        let mut payload = Vec::with_capacity(5);
        payload.push(flags.bits());
        payload.extend_from_slice(&min_interval_ms.to_le_bytes());
        payload.extend_from_slice(&max_interval_ms.to_le_bytes());
        Self::new(FrameType::Subscribe, session_id, payload)
    }

    pub fn snapshot_vt(session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(FrameType::SnapshotVt, session_id, payload)
    }

    pub fn resize(session_id: impl Into<String>, cols: u16, rows: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&cols.to_le_bytes());
        payload.extend_from_slice(&rows.to_le_bytes());
        Self::new(FrameType::Resize, session_id, payload)
    }

    pub fn signal(session_id: impl Into<String>, signal: u8) -> Self {
        Self::new(FrameType::Signal, session_id, vec![signal])
    }

    pub fn error(session_id: impl Into<String>, code: u16, message: &str) -> Self {
        let msg_bytes = message.as_bytes();
        let mut payload = Vec::with_capacity(4 + msg_bytes.len());
        payload.extend_from_slice(&code.to_le_bytes());
        payload.extend_from_slice(&(msg_bytes.len() as u16).to_le_bytes());
        payload.extend_from_slice(msg_bytes);
        Self::new(FrameType::Error, session_id, payload)
    }

    /// Parses the `Resize` payload `{cols, rows}`.
    pub fn parse_resize(&self) -> Option<(u16, u16)> {
        if self.payload.len() < 4 {
            return None;
        }
        let cols = u16::from_le_bytes([self.payload[0], self.payload[1]]);
        let rows = u16::from_le_bytes([self.payload[2], self.payload[3]]);
        Some((cols, rows))
    }

    /// Parses the `Subscribe` payload `{flags, minIntervalMs, maxIntervalMs}`.
    pub fn parse_subscribe(&self) -> Option<(SubscribeFlags, u16, u16)> {
        if self.payload.len() < 5 {
            return None;
        }
        let flags = SubscribeFlags::from_bits_truncate(self.payload[0]);
        let min = u16::from_le_bytes([self.payload[1], self.payload[2]]);
        let max = u16::from_le_bytes([self.payload[3], self.payload[4]]);
        Some((flags, min, max))
    }

    pub fn parse_signal(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Incremental decoder: feed it bytes as they arrive, drain fully decoded
/// frames with `next_frame`. Accumulates partial frames across calls so it
/// works directly against a stream socket.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one frame from the buffered bytes. Returns
    /// `Ok(None)` if more bytes are needed. A malformed header is a hard
    /// error; the caller should respond with an `Error` frame and likely
    /// close the connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        if self.buf[0..2] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let version = self.buf[2];
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let frame_type = FrameType::from_byte(self.buf[3]).ok_or(FrameError::UnknownType(self.buf[3]))?;
        let session_id_len = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
        let payload_len = u32::from_le_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]]) as usize;

        let total_len = HEADER_LEN + session_id_len + payload_len;
        if self.buf.len() < total_len {
            return Ok(None); // wait for more bytes
        }

        let mut frame_bytes = self.buf.split_to(total_len);
        frame_bytes.advance(HEADER_LEN);
        let session_bytes = frame_bytes.split_to(session_id_len);
        let session_id = String::from_utf8(session_bytes.to_vec()).map_err(|_| FrameError::BadSessionId)?;
        let payload = frame_bytes.to_vec();

        Ok(Some(Frame { frame_type, session_id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_global_frame() {
        let frame = Frame::global(FrameType::Ping, vec![]);
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_a_session_scoped_frame_with_payload() {
        let frame = Frame::new(FrameType::Stdout, "abc123", b"hello world".to_vec());
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.session_id, "abc123");
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn incremental_feed_across_multiple_chunks() {
        let frame = Frame::new(FrameType::InputText, "sess", b"ls -la\n".to_vec());
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();
        // Feed one byte at a time to exercise partial-frame buffering.
        for byte in &encoded {
            decoder.feed(&[*byte]);
            if decoder.buf.len() < encoded.len() {
                assert!(decoder.next_frame().unwrap().is_none());
            }
        }
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn two_frames_back_to_back_decode_in_order() {
        let a = Frame::new(FrameType::Stdout, "s1", b"a".to_vec());
        let b = Frame::new(FrameType::Stdout, "s1", b"bb".to_vec());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&a.encode());
        decoder.feed(&b.encode());

        assert_eq!(decoder.next_frame().unwrap().unwrap(), a);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Frame::global(FrameType::Ping, vec![]).encode();
        bytes[0] = b'X';
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_frame(), Err(FrameError::BadMagic));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = Frame::global(FrameType::Ping, vec![]).encode();
        bytes[2] = 9;
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_frame(), Err(FrameError::UnsupportedVersion(9)));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut bytes = Frame::global(FrameType::Ping, vec![]).encode();
        bytes[3] = 200;
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_frame(), Err(FrameError::UnknownType(200)));
    }

    #[test]
    fn resize_payload_round_trips() {
        let frame = Frame::resize("s", 120, 40);
        assert_eq!(frame.parse_resize(), Some((120, 40)));
    }

    #[test]
    fn subscribe_payload_round_trips() {
        let frame = Frame::subscribe("s", SubscribeFlags::STDOUT | SubscribeFlags::EVENTS, 50, 1000);
        let (flags, min, max) = frame.parse_subscribe().unwrap();
        assert!(flags.contains(SubscribeFlags::STDOUT));
        assert!(!flags.contains(SubscribeFlags::SNAPSHOTS));
        assert_eq!((min, max), (50, 1000));
    }

    #[test]
    fn error_frame_round_trips_message() {
        let frame = Frame::error("s", 4, "permanent io error: disk full");
        assert_eq!(frame.frame_type, FrameType::Error);
        let code = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
        assert_eq!(code, 4);
    }
}
