//! Unix-domain socket transport for IPC frames, used by both sides: the
//! forwarder listens, the server connects (and reconnects after a restart).

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::error::CoreError;

use super::frame::{Frame, FrameDecoder};

/// Binds `path`, removing a stale socket file first, and restricts
/// permissions to the owner (mode 0600) per spec.md §4.4.
pub async fn listen(path: &Path) -> Result<UnixListener, CoreError> {
    let _ = tokio::fs::remove_file(path).await;
    let listener = UnixListener::bind(path).map_err(|e| crate::error::classify_io(&e, false))?;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).map_err(|e| crate::error::classify_io(&e, false))?;
    Ok(listener)
}

pub async fn connect(path: &Path) -> Result<UnixStream, CoreError> {
    UnixStream::connect(path)
        .await
        .map_err(|e| crate::error::classify_io(&e, true))
}

/// Dials `path` for a single fire-and-forget frame, then drops the
/// connection. Used by callers that need to push one control frame
/// (input/resize/signal) to a forwarder without keeping a connection open.
pub async fn send_once(path: &Path, frame: &Frame) -> Result<(), CoreError> {
    let stream = connect(path).await?;
    let mut conn = FramedConn::new(stream);
    conn.send(frame).await
}

/// A connection with an attached incremental frame decoder.
pub struct FramedConn {
    stream: UnixStream,
    decoder: FrameDecoder,
    read_buf: [u8; 16 * 1024],
}

impl FramedConn {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            read_buf: [0u8; 16 * 1024],
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), CoreError> {
        let encoded = frame.encode();
        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| crate::error::classify_io(&e, true))
    }

    /// Reads from the socket until a full frame is decoded, or `Ok(None)`
    /// on clean EOF. A framing error closes the connection from the
    /// caller's perspective (propagated as `Transport`).
    pub async fn recv(&mut self) -> Result<Option<Frame>, CoreError> {
        loop {
            if let Some(frame) = self
                .decoder
                .next_frame()
                .map_err(|e| CoreError::Transport(e.to_string()))?
            {
                return Ok(Some(frame));
            }
            let n = self
                .stream
                .read(&mut self.read_buf)
                .await
                .map_err(|e| crate::error::classify_io(&e, true))?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::frame::FrameType;

    #[tokio::test]
    async fn listen_sets_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let _listener = listen(&path).await.unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn sends_and_receives_a_frame_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let listener = listen(&path).await.unwrap();

        let client_path = path.clone();
        let client = tokio::spawn(async move {
            let stream = connect(&client_path).await.unwrap();
            let mut conn = FramedConn::new(stream);
            conn.send(&Frame::new(FrameType::Ping, "", vec![])).await.unwrap();
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let mut server_conn = FramedConn::new(server_stream);
        let frame = server_conn.recv().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);

        client.await.unwrap();
    }
}
