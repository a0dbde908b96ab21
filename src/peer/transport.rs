use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::Frame;
use crate::constants::HANDSHAKE_TIMEOUT;

/// Reads length-prefixed frames off one half of a peer socket.
pub struct FrameReader {
    stream: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(stream: OwnedReadHalf) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Reads the next complete frame.
    ///
    /// Blocks until a frame is available; a clean remote close surfaces as
    /// [`PeerError::ConnectionClosed`].
    pub async fn read_frame(&mut self) -> Result<Frame, PeerError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(frame);
            }

            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
    }

    /// Reads the next frame under the handshake deadline.
    pub async fn read_frame_handshake(&mut self) -> Result<Frame, PeerError> {
        timeout(HANDSHAKE_TIMEOUT, self.read_frame())
            .await
            .map_err(|_| PeerError::HandshakeFailed("hello timed out".into()))?
    }
}

/// Writes frames to the other half of a peer socket.
///
/// One writer per session drains the session's outbound queue, which is
/// what serializes writes to the socket.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
}

impl FrameWriter {
    pub fn new(stream: OwnedWriteHalf) -> Self {
        Self { stream }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), PeerError> {
        let data = frame.encode();
        self.stream.write_all(&data).await?;
        Ok(())
    }
}

/// Splits a connected socket into its frame reader and writer halves.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    (FrameReader::new(r), FrameWriter::new(w))
}
