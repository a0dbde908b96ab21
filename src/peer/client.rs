use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{DisconnectReason, PeerError};
use super::message::{self, Frame, FrameKind, Hello};
use super::peer_id::PeerId;
use super::session::{Direction, PeerInfo, PeerSession};
use super::transport::{self, FrameReader, FrameWriter};
use crate::constants::{
    CONNECT_TIMEOUT, KEEPALIVE_INTERVAL, PONG_TIMEOUT, PROTOCOL_VERSION, SHUTDOWN_GRACE,
};
use crate::net;

type ConnectCallback = Arc<dyn Fn(PeerId) + Send + Sync>;
type StringCallback = Arc<dyn Fn(PeerId, String) + Send + Sync>;
type BinaryCallback = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(PeerId, DisconnectReason) + Send + Sync>;

/// Internal hook for the reserved `file_*`/`dir_*` message space.
///
/// The file transfer engine attaches itself here; the client routes
/// reserved control messages and binary chunk frames through it before
/// falling back to the public callbacks.
pub(crate) trait ReservedHandler: Send + Sync {
    fn on_control(&self, peer: PeerId, msg: serde_json::Value);

    /// Returns true if the handler claimed the binary payload.
    fn on_binary(&self, peer: PeerId, payload: Bytes) -> bool;

    fn on_peer_disconnected(&self, peer: PeerId);
}

#[derive(Default)]
struct Callbacks {
    on_connect: RwLock<Option<ConnectCallback>>,
    on_string_data: RwLock<Option<StringCallback>>,
    on_binary_data: RwLock<Option<BinaryCallback>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
}

/// Both session maps, guarded by one lock so reads see a consistent
/// point-in-time snapshot.
#[derive(Default)]
struct SessionTable {
    by_session: HashMap<u64, Arc<PeerSession>>,
    by_peer: HashMap<PeerId, Arc<PeerSession>>,
}

enum Established {
    New(PeerId),
    /// The remote identity was already live; the new socket was dropped.
    Duplicate(PeerId),
}

/// The peer session manager.
///
/// Accepts inbound connections, dials outbound ones over both address
/// families, runs the hello handshake, and multiplexes framed messages to
/// the registered callbacks. Callbacks are serialized per peer (each
/// session has exactly one read task, which dispatches inline) but run in
/// parallel across peers.
///
/// # Examples
///
/// ```no_run
/// use rats::peer::PeerClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PeerClient::new();
/// client.on_string_data(|peer, data| {
///     println!("{}: {}", peer, data);
/// });
///
/// client.start(8080).await?;
/// client.connect_to_peer("192.168.1.7", 8080).await?;
/// client.broadcast("hello");
/// # Ok(())
/// # }
/// ```
pub struct PeerClient {
    peer_id: PeerId,
    listen_port: AtomicU16,
    running: AtomicBool,
    sessions: RwLock<SessionTable>,
    next_session_id: AtomicU64,
    callbacks: Callbacks,
    reserved: RwLock<Option<Arc<dyn ReservedHandler>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerClient {
    /// Creates a stopped client with a fresh random identity.
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            peer_id: PeerId::generate(),
            listen_port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            sessions: RwLock::new(SessionTable::default()),
            next_session_id: AtomicU64::new(1),
            callbacks: Callbacks::default(),
            reserved: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The port the listeners are bound to; 0 before `start`.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn on_connect(&self, f: impl Fn(PeerId) + Send + Sync + 'static) {
        *self.callbacks.on_connect.write() = Some(Arc::new(f));
    }

    pub fn on_string_data(&self, f: impl Fn(PeerId, String) + Send + Sync + 'static) {
        *self.callbacks.on_string_data.write() = Some(Arc::new(f));
    }

    pub fn on_binary_data(&self, f: impl Fn(PeerId, Bytes) + Send + Sync + 'static) {
        *self.callbacks.on_binary_data.write() = Some(Arc::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn(PeerId, DisconnectReason) + Send + Sync + 'static) {
        *self.callbacks.on_disconnect.write() = Some(Arc::new(f));
    }

    pub(crate) fn set_reserved_handler(&self, handler: Arc<dyn ReservedHandler>) {
        *self.reserved.write() = Some(handler);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Binds the listeners and starts accepting connections.
    ///
    /// Binds both an IPv4 and an IPv6 listener on `listen_port` (0 picks
    /// an ephemeral port) and spawns one accept task per listener.
    /// Returns the bound port.
    pub async fn start(self: &Arc<Self>, listen_port: u16) -> Result<u16, PeerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PeerError::InvalidState("client already running"));
        }

        let (v4, v6, port) = net::bind_dual_stack(listen_port).await.map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            PeerError::Io(std::io::Error::other(e.to_string()))
        })?;

        self.listen_port.store(port, Ordering::Relaxed);

        for listener in [v4, v6].into_iter().flatten() {
            let client = self.clone();
            self.track(tokio::spawn(async move {
                client.accept_loop(listener).await;
            }));
        }

        info!(peer_id = %self.peer_id, port, "peer client listening");
        Ok(port)
    }

    /// Shuts the client down: closes the listeners and every session, and
    /// joins all spawned tasks. Idempotent; no callbacks fire afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        let sessions: Vec<Arc<PeerSession>> = {
            let table = self.sessions.read();
            table.by_session.values().cloned().collect()
        };
        for session in sessions {
            session.close();
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            warn!("peer client tasks did not exit within the grace period");
        }

        self.sessions.write().by_session.clear();
        self.sessions.write().by_peer.clear();

        // Re-arm so the client can be started again.
        let _ = self.shutdown_tx.send(false);
        info!(peer_id = %self.peer_id, "peer client stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Resolves `host` over both families and dials candidates in order,
    /// IPv6 first, with a per-candidate timeout. Returns once a handshake
    /// completes; connecting to an already-connected peer returns the
    /// existing session's id.
    pub async fn connect_to_peer(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<PeerId, PeerError> {
        if !self.is_running() {
            return Err(PeerError::InvalidState("client not running"));
        }

        let candidates = net::resolve_dual(host, port)
            .await
            .map_err(|e| PeerError::ResolutionFailed(e.to_string()))?;

        let mut last_err: Option<PeerError> = None;
        for addr in candidates {
            match net::connect_tcp(addr, CONNECT_TIMEOUT).await {
                Ok(stream) => match self.establish(stream, addr, Direction::Outbound).await {
                    Ok(Established::New(id)) | Ok(Established::Duplicate(id)) => return Ok(id),
                    Err(e) => {
                        debug!(%addr, error = %e, "handshake failed");
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    debug!(%addr, error = %e, "dial failed");
                    last_err = Some(PeerError::ConnectFailed(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| PeerError::ConnectFailed(format!("{}:{}", host, port))))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let client = self.clone();
                            self.track(tokio::spawn(async move {
                                if let Err(e) =
                                    client.establish(stream, addr, Direction::Inbound).await
                                {
                                    debug!(%addr, error = %e, "inbound handshake failed");
                                }
                            }));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// Runs the hello exchange on a fresh socket and, on success,
    /// registers the session and spawns its read and write tasks.
    async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<Established, PeerError> {
        let (mut reader, mut writer) = transport::split(stream);

        let hello = Hello::new(&self.peer_id, self.listen_port());
        writer.write_frame(&hello.to_frame()).await?;

        let frame = reader.read_frame_handshake().await?;
        if frame.kind != FrameKind::Control {
            return Err(PeerError::HandshakeFailed("expected control frame".into()));
        }

        let their_hello: Hello = serde_json::from_slice(&frame.payload)
            .map_err(|_| PeerError::HandshakeFailed("malformed hello".into()))?;
        if their_hello.kind != "hello" {
            return Err(PeerError::HandshakeFailed(format!(
                "expected hello, got {}",
                their_hello.kind
            )));
        }
        if their_hello.v != PROTOCOL_VERSION {
            return Err(PeerError::HandshakeFailed(format!(
                "unsupported protocol version {}",
                their_hello.v
            )));
        }

        let peer_id: PeerId = their_hello
            .peer_id
            .parse()
            .map_err(|_| PeerError::HandshakeFailed("bad peer id in hello".into()))?;
        if peer_id == self.peer_id {
            return Err(PeerError::HandshakeFailed("connected to self".into()));
        }

        // Dedup on identity, not address: the first session for a peer id
        // wins, the newcomer's socket is dropped.
        let (session, rx) = {
            let mut table = self.sessions.write();
            if table.by_peer.contains_key(&peer_id) {
                debug!(%peer_id, "duplicate connection dropped");
                return Ok(Established::Duplicate(peer_id));
            }

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Arc::new(PeerSession::new(
                session_id,
                peer_id,
                addr,
                their_hello.listen_port,
                direction,
                tx,
            ));
            table.by_session.insert(session_id, session.clone());
            table.by_peer.insert(peer_id, session.clone());
            (session, rx)
        };

        info!(%peer_id, %addr, ?direction, "peer connected");

        {
            // The write task holds only a weak handle: the session owns
            // the channel sender, so a strong reference here would keep
            // the channel (and the task) alive forever.
            let weak = Arc::downgrade(&session);
            let peer_id = session.peer_id;
            self.track(tokio::spawn(async move {
                write_loop(peer_id, weak, rx, writer).await;
            }));
        }

        // Fire on_connect before the read task exists, so no data
        // callback for this peer can overlap it.
        if let Some(cb) = self.callbacks.on_connect.read().clone() {
            cb(peer_id);
        }

        {
            let client = self.clone();
            let session = session.clone();
            self.track(tokio::spawn(async move {
                client.read_loop(session, reader).await;
            }));
        }

        Ok(Established::New(peer_id))
    }

    // ------------------------------------------------------------------
    // Per-session tasks
    // ------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>, session: Arc<PeerSession>, mut reader: FrameReader) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut keepalive = tokio::time::interval(Duration::from_secs(1));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut pong_deadline: Option<Instant> = None;

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break DisconnectReason::Local;
                    }
                }
                _ = session.closed() => {
                    break DisconnectReason::Local;
                }
                result = reader.read_frame() => {
                    match result {
                        Ok(frame) => {
                            session.record_received(frame.payload.len() as u64);
                            match self.dispatch(&session, frame, &mut pong_deadline) {
                                Ok(()) => {}
                                Err(e) => {
                                    warn!(peer_id = %session.peer_id, error = %e, "protocol error");
                                    break DisconnectReason::ProtocolError;
                                }
                            }
                        }
                        Err(PeerError::ConnectionClosed) => break DisconnectReason::Closed,
                        Err(PeerError::Protocol(msg)) => {
                            warn!(peer_id = %session.peer_id, error = %msg, "bad frame");
                            break DisconnectReason::ProtocolError;
                        }
                        Err(e) => {
                            debug!(peer_id = %session.peer_id, error = %e, "read failed");
                            break DisconnectReason::IoError;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Some(deadline) = pong_deadline {
                        if Instant::now() >= deadline {
                            break DisconnectReason::Timeout;
                        }
                    } else if session.idle_for() >= KEEPALIVE_INTERVAL {
                        let _ = session.enqueue(message::ping_frame(now_ms()));
                        pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                    }
                }
            }
        };

        self.teardown(&session, reason);
    }

    /// Routes one inbound frame. Called only from the session's read task,
    /// which is what serializes callbacks per peer.
    fn dispatch(
        &self,
        session: &Arc<PeerSession>,
        frame: Frame,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), PeerError> {
        let peer_id = session.peer_id;

        if frame.kind == FrameKind::Binary {
            let claimed = match self.reserved.read().clone() {
                Some(handler) => handler.on_binary(peer_id, frame.payload.clone()),
                None => false,
            };
            if !claimed {
                if let Some(cb) = self.callbacks.on_binary_data.read().clone() {
                    cb(peer_id, frame.payload);
                }
            }
            return Ok(());
        }

        let value: serde_json::Value = serde_json::from_slice(&frame.payload)
            .map_err(|_| PeerError::Protocol("control frame is not valid JSON".into()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| PeerError::Protocol("control frame missing type".into()))?;

        match kind {
            "hello" => Err(PeerError::Protocol("unexpected hello after handshake".into())),
            "ping" => {
                let ts = value.get("ts").and_then(|t| t.as_u64()).unwrap_or(0);
                let _ = session.enqueue(message::pong_frame(ts));
                Ok(())
            }
            "pong" => {
                *pong_deadline = None;
                Ok(())
            }
            "message" => {
                let data = value
                    .get("data")
                    .and_then(|d| d.as_str())
                    .ok_or_else(|| PeerError::Protocol("message missing data".into()))?;
                if let Some(cb) = self.callbacks.on_string_data.read().clone() {
                    cb(peer_id, data.to_string());
                }
                Ok(())
            }
            _ if kind.starts_with("file_") || kind.starts_with("dir_") => {
                if let Some(handler) = self.reserved.read().clone() {
                    handler.on_control(peer_id, value);
                }
                Ok(())
            }
            _ => {
                // Unreserved typed messages are handed over as raw JSON.
                if let Some(cb) = self.callbacks.on_string_data.read().clone() {
                    cb(peer_id, String::from_utf8_lossy(&frame.payload).into_owned());
                }
                Ok(())
            }
        }
    }

    /// Removes a session from both maps and reports the disconnect.
    fn teardown(&self, session: &Arc<PeerSession>, reason: DisconnectReason) {
        let removed = {
            let mut table = self.sessions.write();
            let removed = table.by_session.remove(&session.session_id).is_some();
            if removed {
                table.by_peer.remove(&session.peer_id);
            }
            removed
        };

        if !removed {
            return;
        }

        info!(peer_id = %session.peer_id, %reason, "peer disconnected");

        if let Some(handler) = self.reserved.read().clone() {
            handler.on_peer_disconnected(session.peer_id);
        }

        // No user callbacks once shutdown has begun.
        if *self.shutdown_rx.borrow() {
            return;
        }
        if let Some(cb) = self.callbacks.on_disconnect.read().clone() {
            cb(session.peer_id, reason);
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Enqueues `msg` to every live session. Returns how many accepted it.
    pub fn broadcast(&self, msg: &str) -> usize {
        let sessions: Vec<Arc<PeerSession>> = {
            let table = self.sessions.read();
            table.by_session.values().cloned().collect()
        };

        let frame = message::wrap_message(msg);
        sessions
            .iter()
            .filter(|s| s.enqueue(frame.clone()).is_ok())
            .count()
    }

    /// Sends `msg` to the session with the given peer id.
    pub fn send_to_peer_by_hash(&self, peer_id: &PeerId, msg: &str) -> Result<(), PeerError> {
        let session = self.session_by_peer(peer_id)?;
        session.enqueue(message::wrap_message(msg))
    }

    pub(crate) fn send_control(
        &self,
        peer_id: &PeerId,
        value: &serde_json::Value,
    ) -> Result<(), PeerError> {
        let session = self.session_by_peer(peer_id)?;
        let payload = serde_json::to_vec(value).map_err(|e| {
            PeerError::Protocol(format!("control message failed to serialize: {}", e))
        })?;
        session.enqueue(Frame::control(Bytes::from(payload)))
    }

    pub(crate) fn send_binary(&self, peer_id: &PeerId, payload: Bytes) -> Result<(), PeerError> {
        let session = self.session_by_peer(peer_id)?;
        session.enqueue(Frame::binary(payload))
    }

    fn session_by_peer(&self, peer_id: &PeerId) -> Result<Arc<PeerSession>, PeerError> {
        self.sessions
            .read()
            .by_peer
            .get(peer_id)
            .cloned()
            .ok_or(PeerError::NotFound)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn get_peer_count(&self) -> usize {
        self.sessions.read().by_peer.len()
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.sessions
            .read()
            .by_session
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Whether a session already exists for this endpoint, matching either
    /// the connection's remote address or the peer's advertised listen
    /// address.
    pub fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        let table = self.sessions.read();
        table.by_session.values().any(|s| {
            s.addr == *addr || (s.addr.ip() == addr.ip() && s.listen_port == addr.port())
        })
    }

    /// Closes the session with the given peer id.
    pub fn disconnect_peer(&self, peer_id: &PeerId) -> Result<(), PeerError> {
        let session = self.session_by_peer(peer_id)?;
        session.close();
        Ok(())
    }
}

/// Drains a session's outbound queue onto the socket; one per session,
/// which serializes writes. Ends when the session is dropped (the queue
/// closes) or a write fails.
async fn write_loop(
    peer_id: PeerId,
    session: std::sync::Weak<PeerSession>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut writer: FrameWriter,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            debug!(%peer_id, error = %e, "write failed");
            if let Some(session) = session.upgrade() {
                session.close();
            }
            break;
        }
    }
    // Dropping the writer closes our send half.
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
