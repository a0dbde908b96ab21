use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::error::PeerError;
use super::message::Frame;
use super::peer_id::PeerId;

/// Whether we dialed the peer or it dialed us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A live, handshake-complete peer session.
///
/// Addressable both by its session id (the local "socket handle") and by
/// the remote peer id; the client keeps one entry per map, both pointing
/// at the same `Arc<PeerSession>`. Dropped when the socket closes or the
/// session is disconnected.
pub struct PeerSession {
    /// Monotonic local identifier, stable for the session lifetime.
    pub session_id: u64,
    /// Remote identity from the hello exchange.
    pub peer_id: PeerId,
    /// Remote socket address of the connection.
    pub addr: SocketAddr,
    /// The port the remote side accepts connections on, from its hello.
    pub listen_port: u16,
    pub direction: Direction,
    pub connected_at: Instant,
    outbound: mpsc::UnboundedSender<Frame>,
    close: Notify,
    last_sent: Mutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A point-in-time snapshot of a session for `list_peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub listen_port: u16,
    pub direction: Direction,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PeerSession {
    pub(super) fn new(
        session_id: u64,
        peer_id: PeerId,
        addr: SocketAddr,
        listen_port: u16,
        direction: Direction,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            session_id,
            peer_id,
            addr,
            listen_port,
            direction,
            connected_at: Instant::now(),
            outbound,
            close: Notify::new(),
            last_sent: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Enqueues a frame on the session's outbound queue.
    ///
    /// Fails only once the write task has shut down.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<(), PeerError> {
        let len = frame.payload.len() as u64;
        self.outbound
            .send(frame)
            .map_err(|_| PeerError::ConnectionClosed)?;
        *self.last_sent.lock() = Instant::now();
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Asks the session's read task to shut the connection down.
    pub(super) fn close(&self) {
        self.close.notify_one();
    }

    pub(super) async fn closed(&self) {
        self.close.notified().await;
    }

    pub(super) fn idle_for(&self) -> std::time::Duration {
        self.last_sent.lock().elapsed()
    }

    pub(super) fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id,
            addr: self.addr,
            listen_port: self.listen_port,
            direction: self.direction,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
