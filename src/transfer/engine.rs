use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directory::{build_manifest, DirDirection, DirTransfer, DirectoryProgress};
use super::error::TransferError;
use super::message::{ChunkFrame, ControlMessage, ManifestEntry};
use super::metadata::{file_checksum, FileMetadata};
use super::progress::{eta_ms, RateWindow, TransferDirection, TransferProgress, TransferStatus};
use crate::constants::{
    TRANSFER_ACK_TIMEOUT, TRANSFER_CHUNK_SIZE, TRANSFER_MAX_PARALLEL_FILES, TRANSFER_MAX_RETRIES,
    TRANSFER_METER_TICK, TRANSFER_WINDOW,
};
use crate::peer::{PeerClient, PeerId, ReservedHandler};

type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;
type CompletionCallback = Arc<dyn Fn(Uuid, bool, Option<String>) + Send + Sync>;
type OfferPolicy = Arc<dyn Fn(PeerId, &FileMetadata, Uuid) -> bool + Send + Sync>;
type PathPolicy = Arc<dyn Fn(PeerId, &str, Uuid) -> bool + Send + Sync>;
type DirPolicy = Arc<dyn Fn(PeerId, &str, bool, Uuid) -> bool + Send + Sync>;
type DirProgressCallback = Arc<dyn Fn(&DirectoryProgress) + Send + Sync>;

/// Engine tuning; the defaults mirror the wire constants.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Unacknowledged chunks allowed in flight per transfer.
    pub window: usize,
    pub max_retries: u32,
    pub ack_timeout: Duration,
    /// Where auto-accepted files and directories land.
    pub download_dir: PathBuf,
    pub max_parallel_files: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: TRANSFER_CHUNK_SIZE,
            window: TRANSFER_WINDOW,
            max_retries: TRANSFER_MAX_RETRIES,
            ack_timeout: TRANSFER_ACK_TIMEOUT,
            download_dir: PathBuf::from("downloads"),
            max_parallel_files: TRANSFER_MAX_PARALLEL_FILES,
        }
    }
}

struct InFlightChunk {
    sent_at: Instant,
    retries: u32,
    len: u32,
    /// Set by a chunk nack to force the next retransmit pass.
    nacked: bool,
}

pub(super) struct TransferState {
    pub metadata: FileMetadata,
    pub local_path: PathBuf,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub chunks_completed: u32,
    pub rate: RateWindow,
    pub error: Option<String>,
    // Sender bookkeeping.
    next_index: u32,
    inflight: HashMap<u32, InFlightChunk>,
    acked: Vec<bool>,
    acked_count: u32,
    // Receiver bookkeeping.
    received: Vec<bool>,
    received_count: u32,
    remote_checksum: Option<String>,
    /// Permit under the owning directory transfer's parallelism cap.
    dir_permit: Option<OwnedSemaphorePermit>,
}

/// One live transfer. The state sits behind its own lock; the engine's
/// registry lock is never held while a transfer's lock is taken.
pub(super) struct Transfer {
    pub id: Uuid,
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub dir_transfer_id: Option<Uuid>,
    pub state: Mutex<TransferState>,
    /// Wakes the sender or receiver task after a state change.
    wake: Notify,
    /// Receiving transfers get their chunks through this channel.
    chunk_tx: Option<mpsc::UnboundedSender<ChunkFrame>>,
}

impl Transfer {
    fn new_state(metadata: FileMetadata, local_path: PathBuf) -> TransferState {
        let total = metadata.total_chunks as usize;
        TransferState {
            metadata,
            local_path,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            chunks_completed: 0,
            rate: RateWindow::new(),
            error: None,
            next_index: 0,
            inflight: HashMap::new(),
            acked: vec![false; total],
            acked_count: 0,
            received: vec![false; total],
            received_count: 0,
            remote_checksum: None,
            dir_permit: None,
        }
    }

    fn sender(
        id: Uuid,
        peer_id: PeerId,
        metadata: FileMetadata,
        local_path: PathBuf,
        dir_transfer_id: Option<Uuid>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer_id,
            direction: TransferDirection::Sending,
            dir_transfer_id,
            state: Mutex::new(Self::new_state(metadata, local_path)),
            wake: Notify::new(),
            chunk_tx: None,
        })
    }

    fn receiver(
        id: Uuid,
        peer_id: PeerId,
        metadata: FileMetadata,
        local_path: PathBuf,
        dir_transfer_id: Option<Uuid>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChunkFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transfer = Arc::new(Self {
            id,
            peer_id,
            direction: TransferDirection::Receiving,
            dir_transfer_id,
            state: Mutex::new(Self::new_state(metadata, local_path)),
            wake: Notify::new(),
            chunk_tx: Some(tx),
        });
        (transfer, rx)
    }

    fn wake(&self) {
        self.wake.notify_one();
    }

    fn snapshot(&self) -> TransferProgress {
        let st = self.state.lock();
        let instant = st.rate.instant_rate_bps();
        TransferProgress {
            transfer_id: self.id,
            peer_id: self.peer_id,
            direction: self.direction,
            status: st.status,
            filename: st.metadata.filename.clone(),
            local_path: st.local_path.clone(),
            file_size: st.metadata.file_size,
            bytes_transferred: st.bytes_transferred,
            chunks_completed: st.chunks_completed,
            total_chunks: st.metadata.total_chunks,
            instant_rate_bps: instant,
            average_rate_bps: st.rate.average_rate_bps(st.bytes_transferred),
            eta_ms: eta_ms(st.metadata.file_size, st.bytes_transferred, instant),
            elapsed_ms: st.rate.started_at().elapsed().as_millis() as u64,
            error: st.error.clone(),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    progress: RwLock<Option<ProgressCallback>>,
    completion: RwLock<Option<CompletionCallback>>,
    offer_policy: RwLock<Option<OfferPolicy>>,
    file_request_policy: RwLock<Option<PathPolicy>>,
    dir_request_policy: RwLock<Option<DirPolicy>>,
    dir_progress: RwLock<Option<DirProgressCallback>>,
}

/// Chunked file and directory transfer over the peer session layer.
///
/// Attaches to a [`PeerClient`] as the handler for the reserved
/// `file_*` / `dir_*` message space. Control messages are JSON frames;
/// chunk payloads ride binary frames with a CRC32C per chunk. Each
/// transfer keeps at most a window of unacknowledged chunks in flight and
/// survives pause, resume, and retransmits.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use rats::peer::PeerClient;
/// use rats::transfer::{FileTransferManager, TransferConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PeerClient::new();
/// let engine = FileTransferManager::new(client.clone(), TransferConfig::default());
/// engine.on_completion(|id, success, error| {
///     println!("{}: success={} {:?}", id, success, error);
/// });
///
/// client.start(8080).await?;
/// let peer = client.connect_to_peer("192.168.1.7", 8080).await?;
/// engine.send_file(peer, "movie.mkv".as_ref()).await?;
/// # Ok(())
/// # }
/// ```
pub struct FileTransferManager {
    client: Arc<PeerClient>,
    config: TransferConfig,
    transfers: RwLock<HashMap<Uuid, Arc<Transfer>>>,
    dirs: RwLock<HashMap<Uuid, Arc<DirTransfer>>>,
    callbacks: Callbacks,
    /// Handle back to our own Arc for the spawn paths reached from the
    /// synchronous reserved-handler callbacks.
    self_ref: std::sync::Weak<FileTransferManager>,
    shutdown_tx: watch::Sender<bool>,
}

impl FileTransferManager {
    /// Creates the engine, attaches it to the client's reserved message
    /// space, and starts the rate meter task.
    pub fn new(client: Arc<PeerClient>, config: TransferConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::new_cyclic(|weak| Self {
            client: client.clone(),
            config,
            transfers: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
            callbacks: Callbacks::default(),
            self_ref: weak.clone(),
            shutdown_tx,
        });

        client.set_reserved_handler(engine.clone());

        let meter = engine.clone();
        tokio::spawn(async move {
            meter.meter_loop(shutdown_rx).await;
        });

        engine
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Stops the meter task. Active transfers are failed by their peers
    /// disconnecting, not by this call.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn on_progress(&self, f: impl Fn(&TransferProgress) + Send + Sync + 'static) {
        *self.callbacks.progress.write() = Some(Arc::new(f));
    }

    pub fn on_completion(&self, f: impl Fn(Uuid, bool, Option<String>) + Send + Sync + 'static) {
        *self.callbacks.completion.write() = Some(Arc::new(f));
    }

    /// Policy hook for inbound file offers. Returning false rejects the
    /// offer; without a hook every offer is accepted into
    /// `download_dir`.
    pub fn on_transfer_request(
        &self,
        f: impl Fn(PeerId, &FileMetadata, Uuid) -> bool + Send + Sync + 'static,
    ) {
        *self.callbacks.offer_policy.write() = Some(Arc::new(f));
    }

    /// Policy hook for peer-initiated file pulls.
    pub fn on_file_request(
        &self,
        f: impl Fn(PeerId, &str, Uuid) -> bool + Send + Sync + 'static,
    ) {
        *self.callbacks.file_request_policy.write() = Some(Arc::new(f));
    }

    /// Policy hook for inbound directory offers and pulls.
    pub fn on_directory_request(
        &self,
        f: impl Fn(PeerId, &str, bool, Uuid) -> bool + Send + Sync + 'static,
    ) {
        *self.callbacks.dir_request_policy.write() = Some(Arc::new(f));
    }

    pub fn on_directory_progress(&self, f: impl Fn(&DirectoryProgress) + Send + Sync + 'static) {
        *self.callbacks.dir_progress.write() = Some(Arc::new(f));
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Offers a file to a peer under its own name.
    pub async fn send_file(&self, peer: PeerId, path: &Path) -> Result<Uuid, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidPath(format!("{}", path.display())))?;
        self.start_send(peer, path.to_path_buf(), name, Uuid::new_v4(), None, None)
            .await
    }

    /// Offers a file under a different remote name.
    pub async fn send_file_as(
        &self,
        peer: PeerId,
        path: &Path,
        remote_name: &str,
    ) -> Result<Uuid, TransferError> {
        self.start_send(
            peer,
            path.to_path_buf(),
            remote_name.to_string(),
            Uuid::new_v4(),
            None,
            None,
        )
        .await
    }

    /// Asks a peer to send us the file at `remote_path`, saving it to
    /// `local_path`. Subject to the peer's file request policy.
    pub async fn request_file(
        &self,
        peer: PeerId,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<Uuid, TransferError> {
        let id = Uuid::new_v4();

        // Pre-register a placeholder carrying our chosen local path, so
        // the answering offer is recognized and accepted without
        // consulting the offer policy. The placeholder is replaced by
        // the real receiving transfer (with its live chunk channel) when
        // the offer arrives.
        let (placeholder, rx) = Transfer::receiver(
            id,
            peer,
            self.placeholder_metadata(remote_path),
            local_path.to_path_buf(),
            None,
        );
        drop(rx);
        self.transfers.write().insert(id, placeholder);

        self.send_control(
            &peer,
            &ControlMessage::FileRequest {
                transfer_id: id,
                remote_path: remote_path.to_string(),
            },
        )?;
        Ok(id)
    }

    fn placeholder_metadata(&self, name: &str) -> FileMetadata {
        FileMetadata {
            filename: name.to_string(),
            file_size: 0,
            chunk_size: self.config.chunk_size,
            total_chunks: 0,
            checksum_algo: "sha1".to_string(),
            file_checksum: String::new(),
            mtime: 0,
        }
    }

    /// Pauses an active transfer and tells the peer.
    pub fn pause_transfer(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.get(id)?;
        {
            let mut st = transfer.state.lock();
            if !matches!(
                st.status,
                TransferStatus::InProgress | TransferStatus::Resuming
            ) {
                return Err(TransferError::InvalidState(format!(
                    "cannot pause a {} transfer",
                    st.status
                )));
            }
            st.status = TransferStatus::Paused;
        }
        transfer.wake();
        self.send_control(
            &transfer.peer_id,
            &ControlMessage::FilePause { transfer_id: id },
        )?;
        Ok(())
    }

    /// Resumes a paused transfer. The receiving side reports its first
    /// missing chunk so the sender can rewind.
    pub fn resume_transfer(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.get(id)?;
        let first_missing = {
            let mut st = transfer.state.lock();
            if st.status != TransferStatus::Paused {
                return Err(TransferError::InvalidState(format!(
                    "cannot resume a {} transfer",
                    st.status
                )));
            }
            st.status = TransferStatus::Resuming;
            match transfer.direction {
                TransferDirection::Receiving => first_missing_index(&st.received),
                TransferDirection::Sending => st.next_index,
            }
        };

        self.send_control(
            &transfer.peer_id,
            &ControlMessage::FileResume {
                transfer_id: id,
                first_missing_index: first_missing,
            },
        )?;
        transfer.wake();
        Ok(())
    }

    /// Cancels a transfer on both sides. Terminal; cannot be resumed.
    pub fn cancel_transfer(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.get(id)?;
        let _ = self.send_control(
            &transfer.peer_id,
            &ControlMessage::FileCancel { transfer_id: id },
        );
        self.finish(&transfer, TransferStatus::Cancelled, Some("cancelled".into()));
        Ok(())
    }

    pub fn transfer_progress(&self, id: Uuid) -> Option<TransferProgress> {
        self.transfers.read().get(&id).map(|t| t.snapshot())
    }

    pub fn list_transfers(&self) -> Vec<TransferProgress> {
        self.transfers
            .read()
            .values()
            .map(|t| t.snapshot())
            .collect()
    }

    // ------------------------------------------------------------------
    // Directory operations
    // ------------------------------------------------------------------

    /// Offers a whole directory to a peer. Files transfer in parallel
    /// under the `max_parallel_files` cap once the peer accepts.
    pub async fn send_directory(
        self: &Arc<Self>,
        peer: PeerId,
        path: &Path,
        recursive: bool,
    ) -> Result<Uuid, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidPath(format!("{}", path.display())))?;

        let entries = build_manifest(path, recursive).await?;
        let id = Uuid::new_v4();
        let dir = DirTransfer::new(
            id,
            peer,
            DirDirection::Sending,
            path.to_path_buf(),
            name.clone(),
            recursive,
        );
        dir.set_entries(&entries);
        self.dirs.write().insert(id, dir.clone());

        let (total_files, total_bytes) = dir.totals();
        self.send_control(
            &peer,
            &ControlMessage::DirOffer {
                transfer_id: id,
                directory_name: name,
                total_files,
                total_bytes,
                recursive,
            },
        )?;
        Ok(id)
    }

    /// Asks a peer for the directory at `remote_path`, mirrored into
    /// `local_path`. Subject to the peer's directory request policy.
    pub async fn request_directory(
        &self,
        peer: PeerId,
        remote_path: &str,
        local_path: &Path,
        recursive: bool,
    ) -> Result<Uuid, TransferError> {
        let id = Uuid::new_v4();
        let dir = DirTransfer::new(
            id,
            peer,
            DirDirection::Receiving,
            local_path.to_path_buf(),
            remote_path.to_string(),
            recursive,
        );
        self.dirs.write().insert(id, dir);

        self.send_control(
            &peer,
            &ControlMessage::DirRequest {
                transfer_id: id,
                remote_path: remote_path.to_string(),
                recursive,
            },
        )?;
        Ok(id)
    }

    pub fn directory_progress(&self, id: Uuid) -> Option<DirectoryProgress> {
        self.dirs.read().get(&id).map(|d| d.snapshot())
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    async fn start_send(
        &self,
        peer: PeerId,
        path: PathBuf,
        remote_name: String,
        id: Uuid,
        dir_transfer_id: Option<Uuid>,
        dir_permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Uuid, TransferError> {
        let metadata = FileMetadata::from_file(&path, remote_name, self.config.chunk_size).await?;

        let transfer = Transfer::sender(id, peer, metadata.clone(), path, dir_transfer_id);
        {
            let mut st = transfer.state.lock();
            st.status = TransferStatus::Starting;
            st.dir_permit = dir_permit;
        }
        self.transfers.write().insert(id, transfer);

        info!(
            transfer_id = %id,
            peer = %peer,
            file = %metadata.filename,
            size = metadata.file_size,
            "offering file"
        );

        let offer = ControlMessage::FileOffer {
            transfer_id: id,
            metadata,
            dir_transfer_id,
        };
        if let Err(e) = self.send_control(&peer, &offer) {
            // Never leave an unsendable offer (and its directory permit)
            // parked in the registry.
            self.transfers.write().remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// The sender task: fills the in-flight window, retransmits chunks
    /// whose acks are overdue, and announces completion. Spawned when the
    /// peer accepts.
    async fn sender_task(self: Arc<Self>, transfer: Arc<Transfer>) {
        enum Plan {
            Exit,
            Fail(String),
            Wait,
            Send(Vec<(u32, u32)>),
            Complete(String),
        }

        let path = transfer.state.lock().local_path.clone();
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                self.fail_transfer(&transfer, format!("open failed: {}", e));
                return;
            }
        };

        loop {
            let plan = {
                let mut st = transfer.state.lock();
                match st.status {
                    TransferStatus::Completed
                    | TransferStatus::Failed
                    | TransferStatus::Cancelled => Plan::Exit,
                    TransferStatus::Paused | TransferStatus::Pending | TransferStatus::Starting => {
                        Plan::Wait
                    }
                    TransferStatus::Resuming | TransferStatus::InProgress => {
                        st.status = TransferStatus::InProgress;

                        // Retransmit overdue chunks; give up past the
                        // retry budget.
                        let now = Instant::now();
                        let mut resend: Vec<(u32, u32)> = Vec::new();
                        let mut exhausted: Option<u32> = None;
                        for (&idx, fl) in st.inflight.iter_mut() {
                            if fl.nacked
                                || now.duration_since(fl.sent_at) >= self.config.ack_timeout
                            {
                                if fl.retries >= self.config.max_retries {
                                    exhausted = Some(idx);
                                    break;
                                }
                                fl.retries += 1;
                                fl.sent_at = now;
                                fl.nacked = false;
                                resend.push((idx, fl.len));
                            }
                        }

                        if let Some(idx) = exhausted {
                            Plan::Fail(format!("chunk {} exceeded retry budget", idx))
                        } else {
                            // Slide fresh chunks into the window.
                            let total = st.metadata.total_chunks;
                            let mut fresh: Vec<(u32, u32)> = Vec::new();
                            while st.inflight.len() + fresh.len() < self.config.window
                                && st.next_index < total
                            {
                                let idx = st.next_index;
                                st.next_index += 1;
                                if st.acked[idx as usize] {
                                    continue;
                                }
                                fresh.push((idx, st.metadata.chunk_len(idx)));
                            }

                            for &(idx, len) in &fresh {
                                st.inflight.insert(
                                    idx,
                                    InFlightChunk {
                                        sent_at: now,
                                        retries: 0,
                                        len,
                                        nacked: false,
                                    },
                                );
                            }

                            resend.extend(fresh);
                            if resend.is_empty() {
                                if st.acked_count == total && st.inflight.is_empty() {
                                    Plan::Complete(st.metadata.file_checksum.clone())
                                } else {
                                    Plan::Wait
                                }
                            } else {
                                Plan::Send(resend)
                            }
                        }
                    }
                }
            };

            match plan {
                Plan::Exit => break,
                Plan::Fail(error) => {
                    let _ = self.send_control(
                        &transfer.peer_id,
                        &ControlMessage::FileCancel {
                            transfer_id: transfer.id,
                        },
                    );
                    self.fail_transfer(&transfer, error);
                    break;
                }
                Plan::Complete(checksum) => {
                    let _ = self.send_control(
                        &transfer.peer_id,
                        &ControlMessage::FileComplete {
                            transfer_id: transfer.id,
                            file_checksum: checksum,
                        },
                    );
                    self.finish(&transfer, TransferStatus::Completed, None);
                    break;
                }
                Plan::Send(chunks) => {
                    for (idx, len) in chunks {
                        let offset = {
                            let st = transfer.state.lock();
                            st.metadata.chunk_offset(idx)
                        };
                        let mut data = vec![0u8; len as usize];
                        let read = async {
                            file.seek(std::io::SeekFrom::Start(offset)).await?;
                            file.read_exact(&mut data).await?;
                            Ok::<(), std::io::Error>(())
                        }
                        .await;

                        if let Err(e) = read {
                            self.fail_transfer(&transfer, format!("read failed: {}", e));
                            return;
                        }

                        let frame = ChunkFrame::new(transfer.id, idx, Bytes::from(data));
                        if self
                            .client
                            .send_binary(&transfer.peer_id, frame.encode())
                            .is_err()
                        {
                            self.fail_transfer(&transfer, "peer gone".to_string());
                            return;
                        }
                    }
                }
                Plan::Wait => {
                    tokio::select! {
                        _ = transfer.wake.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    /// Accepts an inbound offer: resolves the local path, pre-creates the
    /// file, registers the receiving transfer, and replies `file_accept`.
    async fn handle_offer(
        self: Arc<Self>,
        peer: PeerId,
        id: Uuid,
        metadata: FileMetadata,
        dir_transfer_id: Option<Uuid>,
    ) {
        // A transfer we pre-registered with `request_file` is a pending
        // receiving placeholder: it supplies its own local path and skips
        // the offer policy. Any other id collision (an active transfer,
        // or one of our own sends echoed back) is ignored outright.
        enum Known {
            Requested(PathBuf),
            Busy,
        }
        let known = {
            let transfers = self.transfers.read();
            transfers.get(&id).map(|t| {
                let st = t.state.lock();
                if t.direction == TransferDirection::Receiving
                    && st.status == TransferStatus::Pending
                {
                    Known::Requested(st.local_path.clone())
                } else {
                    Known::Busy
                }
            })
        };

        let local_path = if let Some(known) = known {
            match known {
                Known::Requested(path) => path,
                Known::Busy => {
                    debug!(transfer_id = %id, "ignoring offer colliding with a live transfer");
                    return;
                }
            }
        } else if let Some(dir_id) = dir_transfer_id {
            // Directory members were accepted at the directory level.
            let Some(dir) = self.dirs.read().get(&dir_id).cloned() else {
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::FileReject {
                        transfer_id: id,
                        reason: "unknown directory transfer".to_string(),
                    },
                );
                return;
            };
            let Some(relative) = sanitize_relative(&metadata.filename) else {
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::FileReject {
                        transfer_id: id,
                        reason: "unsafe path".to_string(),
                    },
                );
                return;
            };
            dir.root_local.join(relative)
        } else {
            let accepted = match self.callbacks.offer_policy.read().clone() {
                Some(policy) => policy(peer, &metadata, id),
                None => true,
            };
            if !accepted {
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::FileReject {
                        transfer_id: id,
                        reason: "declined".to_string(),
                    },
                );
                return;
            }

            let Some(name) = sanitize_relative(&metadata.filename) else {
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::FileReject {
                        transfer_id: id,
                        reason: "unsafe path".to_string(),
                    },
                );
                return;
            };
            self.config.download_dir.join(name)
        };

        if let Err(e) = self.prepare_receive_file(&local_path, metadata.file_size).await {
            warn!(transfer_id = %id, error = %e, "failed to prepare receive file");
            let _ = self.send_control(
                &peer,
                &ControlMessage::FileReject {
                    transfer_id: id,
                    reason: format!("local error: {}", e),
                },
            );
            return;
        }

        let (transfer, rx) =
            Transfer::receiver(id, peer, metadata, local_path, dir_transfer_id);
        transfer.state.lock().status = TransferStatus::InProgress;
        self.transfers.write().insert(id, transfer.clone());

        info!(transfer_id = %id, peer = %peer, "accepting file offer");
        if self
            .send_control(&peer, &ControlMessage::FileAccept { transfer_id: id })
            .is_err()
        {
            self.fail_transfer(&transfer, "peer gone".to_string());
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.receiver_task(transfer, rx).await;
        });
    }

    async fn prepare_receive_file(
        &self,
        path: &Path,
        size: u64,
    ) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        file.set_len(size).await?;
        Ok(())
    }

    /// The receiver task: writes verified chunks at their offsets, acks
    /// them, and finalizes with a whole-file checksum once everything has
    /// arrived and the sender has announced completion.
    async fn receiver_task(
        self: Arc<Self>,
        transfer: Arc<Transfer>,
        mut rx: mpsc::UnboundedReceiver<ChunkFrame>,
    ) {
        let path = transfer.state.lock().local_path.clone();
        let mut file = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(f) => f,
            Err(e) => {
                self.fail_transfer(&transfer, format!("open failed: {}", e));
                return;
            }
        };

        loop {
            let terminal = transfer.state.lock().status.is_terminal();
            if terminal {
                break;
            }

            tokio::select! {
                maybe = rx.recv() => {
                    let Some(chunk) = maybe else { break };
                    if !self.handle_chunk(&transfer, &mut file, chunk).await {
                        return;
                    }
                }
                _ = transfer.wake.notified() => {}
            }

            if self.ready_to_finalize(&transfer) {
                self.finalize_receive(&transfer, &mut file, &path).await;
                return;
            }
        }
    }

    /// Returns false when the transfer has failed and the task must stop.
    async fn handle_chunk(
        &self,
        transfer: &Arc<Transfer>,
        file: &mut tokio::fs::File,
        chunk: ChunkFrame,
    ) -> bool {
        if !chunk.verify() {
            debug!(
                transfer_id = %transfer.id,
                index = chunk.index,
                "chunk failed crc, requesting retransmit"
            );
            let _ = self.send_control(
                &transfer.peer_id,
                &ControlMessage::FileChunkNack {
                    transfer_id: transfer.id,
                    index: chunk.index,
                },
            );
            return true;
        }

        let (offset, duplicate, expected_len) = {
            let st = transfer.state.lock();
            if chunk.index >= st.metadata.total_chunks {
                return true;
            }
            (
                st.metadata.chunk_offset(chunk.index),
                st.received[chunk.index as usize],
                st.metadata.chunk_len(chunk.index),
            )
        };

        if chunk.data.len() as u32 != expected_len {
            debug!(transfer_id = %transfer.id, index = chunk.index, "chunk length mismatch");
            let _ = self.send_control(
                &transfer.peer_id,
                &ControlMessage::FileChunkNack {
                    transfer_id: transfer.id,
                    index: chunk.index,
                },
            );
            return true;
        }

        if !duplicate {
            let write = async {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.write_all(&chunk.data).await?;
                Ok::<(), std::io::Error>(())
            }
            .await;

            if let Err(e) = write {
                self.fail_transfer(transfer, format!("write failed: {}", e));
                return false;
            }

            {
                let mut st = transfer.state.lock();
                st.received[chunk.index as usize] = true;
                st.received_count += 1;
                st.chunks_completed += 1;
                st.bytes_transferred += chunk.data.len() as u64;
                if st.status == TransferStatus::Resuming {
                    st.status = TransferStatus::InProgress;
                }
            }
            self.report_progress(transfer);
        }

        // Acks are sent even for duplicates so a lost ack cannot wedge
        // the sender's window.
        let _ = self.send_control(
            &transfer.peer_id,
            &ControlMessage::FileChunkAck {
                transfer_id: transfer.id,
                index: chunk.index,
            },
        );
        true
    }

    fn ready_to_finalize(&self, transfer: &Arc<Transfer>) -> bool {
        let st = transfer.state.lock();
        !st.status.is_terminal()
            && st.remote_checksum.is_some()
            && st.received_count == st.metadata.total_chunks
    }

    async fn finalize_receive(
        &self,
        transfer: &Arc<Transfer>,
        file: &mut tokio::fs::File,
        path: &Path,
    ) {
        if let Err(e) = file.sync_all().await {
            self.fail_transfer(transfer, format!("sync failed: {}", e));
            return;
        }

        let expected = transfer
            .state
            .lock()
            .remote_checksum
            .clone()
            .unwrap_or_default();
        match file_checksum(path).await {
            Ok(actual) if actual == expected => {
                self.finish(transfer, TransferStatus::Completed, None);
            }
            Ok(actual) => {
                self.fail_transfer(
                    transfer,
                    format!("checksum mismatch: expected {}, got {}", expected, actual),
                );
            }
            Err(e) => {
                self.fail_transfer(transfer, format!("checksum failed: {}", e));
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion plumbing
    // ------------------------------------------------------------------

    fn fail_transfer(&self, transfer: &Arc<Transfer>, error: String) {
        self.finish(transfer, TransferStatus::Failed, Some(error));
    }

    /// Moves a transfer into a terminal status (absorbing: a transfer
    /// already terminal is left untouched), releases its directory
    /// permit, and fires the completion callback exactly once.
    fn finish(&self, transfer: &Arc<Transfer>, status: TransferStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        let changed = {
            let mut st = transfer.state.lock();
            if st.status.is_terminal() {
                false
            } else {
                st.status = status;
                st.error = error.clone();
                st.dir_permit = None;
                true
            }
        };
        if !changed {
            return;
        }

        transfer.wake();

        let success = status == TransferStatus::Completed;
        info!(
            transfer_id = %transfer.id,
            %status,
            error = error.as_deref().unwrap_or(""),
            "transfer finished"
        );

        if let Some(cb) = self.callbacks.completion.read().clone() {
            cb(transfer.id, success, error);
        }
        self.report_progress(transfer);

        if let Some(dir_id) = transfer.dir_transfer_id {
            self.on_dir_member_finished(dir_id, transfer, success);
        }
    }

    fn report_progress(&self, transfer: &Arc<Transfer>) {
        if let Some(cb) = self.callbacks.progress.read().clone() {
            cb(&transfer.snapshot());
        }
    }

    fn get(&self, id: Uuid) -> Result<Arc<Transfer>, TransferError> {
        self.transfers
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound)
    }

    fn send_control(&self, peer: &PeerId, msg: &ControlMessage) -> Result<(), TransferError> {
        self.client.send_control(peer, &msg.to_value())?;
        Ok(())
    }

    async fn meter_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TRANSFER_METER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let transfers: Vec<Arc<Transfer>> =
                        self.transfers.read().values().cloned().collect();
                    for transfer in transfers {
                        let mut st = transfer.state.lock();
                        if st.status.is_active() {
                            let bytes = st.bytes_transferred;
                            st.rate.sample(bytes);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Directory plumbing
    // ------------------------------------------------------------------

    /// Streams a directory's files to the peer, capped by the semaphore.
    async fn dir_send_task(self: Arc<Self>, dir: Arc<DirTransfer>) {
        let entries = dir.file_entries();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_files));

        for entry in entries {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if dir.snapshot().status.is_terminal() {
                break;
            }

            let local = dir.root_local.join(&entry.relative_path);
            dir.set_current_file(&entry.relative_path);
            self.report_dir_progress(&dir);

            let result = self
                .start_send(
                    dir.peer_id,
                    local,
                    entry.relative_path.clone(),
                    Uuid::new_v4(),
                    Some(dir.id),
                    Some(permit),
                )
                .await;

            if let Err(e) = result {
                warn!(dir_id = %dir.id, file = %entry.relative_path, error = %e, "dir member failed to start");
                dir.record_member_done(entry.size, false);
            }
        }

        // Covers the empty-manifest case; otherwise the last member's
        // completion closes the transfer.
        self.maybe_complete_dir(&dir);
    }

    fn on_dir_member_finished(&self, dir_id: Uuid, transfer: &Arc<Transfer>, success: bool) {
        let Some(dir) = self.dirs.read().get(&dir_id).cloned() else {
            return;
        };

        let size = transfer.state.lock().metadata.file_size;
        dir.record_member_done(size, success);
        self.report_dir_progress(&dir);
        self.maybe_complete_dir(&dir);
    }

    fn maybe_complete_dir(&self, dir: &Arc<DirTransfer>) {
        if !dir.all_members_done() {
            return;
        }
        let Some(failed) = dir.finish() else {
            return;
        };

        if dir.direction == DirDirection::Sending {
            let _ = self.send_control(
                &dir.peer_id,
                &ControlMessage::DirComplete { transfer_id: dir.id },
            );
        }
        info!(dir_id = %dir.id, failed, "directory transfer finished");
        self.report_dir_progress(dir);
    }

    fn report_dir_progress(&self, dir: &Arc<DirTransfer>) {
        if let Some(cb) = self.callbacks.dir_progress.read().clone() {
            cb(&dir.snapshot());
        }
    }

    /// Answers an inbound `dir_offer`: policy, root creation, accept.
    async fn handle_dir_offer(
        self: Arc<Self>,
        peer: PeerId,
        id: Uuid,
        directory_name: String,
        total_files: u64,
        total_bytes: u64,
        recursive: bool,
    ) {
        // A pull we initiated is pre-registered and already accepted.
        let pre_registered = self.dirs.read().get(&id).cloned();

        let dir = match pre_registered {
            Some(dir) => dir,
            None => {
                let accepted = match self.callbacks.dir_request_policy.read().clone() {
                    Some(policy) => policy(peer, &directory_name, recursive, id),
                    None => true,
                };
                if !accepted {
                    let _ = self.send_control(
                        &peer,
                        &ControlMessage::DirReject {
                            transfer_id: id,
                            reason: "declined".to_string(),
                        },
                    );
                    return;
                }

                let Some(name) = sanitize_relative(&directory_name) else {
                    let _ = self.send_control(
                        &peer,
                        &ControlMessage::DirReject {
                            transfer_id: id,
                            reason: "unsafe path".to_string(),
                        },
                    );
                    return;
                };
                let dir = DirTransfer::new(
                    id,
                    peer,
                    DirDirection::Receiving,
                    self.config.download_dir.join(name),
                    directory_name,
                    recursive,
                );
                self.dirs.write().insert(id, dir.clone());
                dir
            }
        };

        dir.set_expected_totals(total_files, total_bytes);
        if let Err(e) = tokio::fs::create_dir_all(&dir.root_local).await {
            warn!(dir_id = %id, error = %e, "failed to create directory root");
            let _ = self.send_control(
                &peer,
                &ControlMessage::DirReject {
                    transfer_id: id,
                    reason: format!("local error: {}", e),
                },
            );
            return;
        }

        let _ = self.send_control(&peer, &ControlMessage::DirAccept { transfer_id: id });
    }

    /// Pre-creates the directory skeleton named by the manifest.
    async fn handle_dir_manifest(self: Arc<Self>, id: Uuid, entries: Vec<ManifestEntry>) {
        let Some(dir) = self.dirs.read().get(&id).cloned() else {
            return;
        };
        dir.set_entries(&entries);

        for entry in entries.iter().filter(|e| e.is_dir) {
            let Some(relative) = sanitize_relative(&entry.relative_path) else {
                continue;
            };
            let path = dir.root_local.join(relative);
            if let Err(e) = tokio::fs::create_dir_all(&path).await {
                warn!(dir_id = %id, path = %path.display(), error = %e, "mkdir failed");
            }
        }
    }

    /// Answers a peer-initiated directory pull.
    async fn handle_dir_request(
        self: Arc<Self>,
        peer: PeerId,
        id: Uuid,
        remote_path: String,
        recursive: bool,
    ) {
        let accepted = match self.callbacks.dir_request_policy.read().clone() {
            Some(policy) => policy(peer, &remote_path, recursive, id),
            None => true,
        };
        let path = PathBuf::from(&remote_path);
        if !accepted || !path.is_dir() {
            let _ = self.send_control(
                &peer,
                &ControlMessage::DirReject {
                    transfer_id: id,
                    reason: "declined".to_string(),
                },
            );
            return;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "directory".to_string());

        let entries = match build_manifest(&path, recursive).await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::DirReject {
                        transfer_id: id,
                        reason: format!("walk failed: {}", e),
                    },
                );
                return;
            }
        };

        let dir = DirTransfer::new(id, peer, DirDirection::Sending, path, name.clone(), recursive);
        dir.set_entries(&entries);
        self.dirs.write().insert(id, dir.clone());

        let (total_files, total_bytes) = dir.totals();
        let _ = self.send_control(
            &peer,
            &ControlMessage::DirOffer {
                transfer_id: id,
                directory_name: name,
                total_files,
                total_bytes,
                recursive,
            },
        );
    }

    /// Answers a peer-initiated file pull.
    async fn handle_file_request(self: Arc<Self>, peer: PeerId, id: Uuid, remote_path: String) {
        let accepted = match self.callbacks.file_request_policy.read().clone() {
            Some(policy) => policy(peer, &remote_path, id),
            None => true,
        };
        let path = PathBuf::from(&remote_path);
        if !accepted || !path.is_file() {
            let _ = self.send_control(
                &peer,
                &ControlMessage::FileReject {
                    transfer_id: id,
                    reason: "declined".to_string(),
                },
            );
            return;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| remote_path.clone());

        if let Err(e) = self.start_send(peer, path, name, id, None, None).await {
            warn!(transfer_id = %id, error = %e, "file request failed");
            let _ = self.send_control(
                &peer,
                &ControlMessage::FileReject {
                    transfer_id: id,
                    reason: format!("local error: {}", e),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Inbound control dispatch
    // ------------------------------------------------------------------

    fn handle_control(self: &Arc<Self>, peer: PeerId, msg: ControlMessage) {
        match msg {
            ControlMessage::FileOffer {
                transfer_id,
                metadata,
                dir_transfer_id,
            } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .handle_offer(peer, transfer_id, metadata, dir_transfer_id)
                        .await;
                });
            }
            ControlMessage::FileAccept { transfer_id } => {
                let Ok(transfer) = self.get(transfer_id) else {
                    return;
                };
                if transfer.direction != TransferDirection::Sending {
                    return;
                }
                {
                    let mut st = transfer.state.lock();
                    if !st.status.can_transition(TransferStatus::InProgress) {
                        return;
                    }
                    st.status = TransferStatus::InProgress;
                }
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.sender_task(transfer).await;
                });
            }
            ControlMessage::FileReject {
                transfer_id,
                reason,
            } => {
                if let Ok(transfer) = self.get(transfer_id) {
                    self.fail_transfer(&transfer, format!("rejected: {}", reason));
                }
            }
            ControlMessage::FileChunkAck { transfer_id, index } => {
                let Ok(transfer) = self.get(transfer_id) else {
                    return;
                };
                let progressed = {
                    let mut st = transfer.state.lock();
                    match st.inflight.remove(&index) {
                        Some(fl) if !st.acked[index as usize] => {
                            st.acked[index as usize] = true;
                            st.acked_count += 1;
                            st.chunks_completed += 1;
                            st.bytes_transferred += fl.len as u64;
                            true
                        }
                        _ => false,
                    }
                };
                if progressed {
                    self.report_progress(&transfer);
                }
                transfer.wake();
            }
            ControlMessage::FileChunkNack { transfer_id, index } => {
                let Ok(transfer) = self.get(transfer_id) else {
                    return;
                };
                {
                    let mut st = transfer.state.lock();
                    if let Some(fl) = st.inflight.get_mut(&index) {
                        fl.nacked = true;
                    }
                }
                transfer.wake();
            }
            ControlMessage::FilePause { transfer_id } => {
                if let Ok(transfer) = self.get(transfer_id) {
                    let mut st = transfer.state.lock();
                    if matches!(
                        st.status,
                        TransferStatus::InProgress | TransferStatus::Resuming
                    ) {
                        st.status = TransferStatus::Paused;
                    }
                }
            }
            ControlMessage::FileResume {
                transfer_id,
                first_missing_index,
            } => {
                let Ok(transfer) = self.get(transfer_id) else {
                    return;
                };
                {
                    let mut st = transfer.state.lock();
                    if !st.status.can_transition(TransferStatus::InProgress) {
                        return;
                    }
                    if transfer.direction == TransferDirection::Sending {
                        rewind_sender(&mut st, first_missing_index);
                    }
                    st.status = TransferStatus::InProgress;
                }
                transfer.wake();
            }
            ControlMessage::FileCancel { transfer_id } => {
                if let Ok(transfer) = self.get(transfer_id) {
                    self.finish(
                        &transfer,
                        TransferStatus::Cancelled,
                        Some("cancelled by peer".to_string()),
                    );
                }
            }
            ControlMessage::FileComplete {
                transfer_id,
                file_checksum,
            } => {
                if let Ok(transfer) = self.get(transfer_id) {
                    transfer.state.lock().remote_checksum = Some(file_checksum);
                    transfer.wake();
                }
            }
            ControlMessage::FileRequest {
                transfer_id,
                remote_path,
            } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.handle_file_request(peer, transfer_id, remote_path).await;
                });
            }
            ControlMessage::DirOffer {
                transfer_id,
                directory_name,
                total_files,
                total_bytes,
                recursive,
            } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .handle_dir_offer(
                            peer,
                            transfer_id,
                            directory_name,
                            total_files,
                            total_bytes,
                            recursive,
                        )
                        .await;
                });
            }
            ControlMessage::DirAccept { transfer_id } => {
                let Some(dir) = self.dirs.read().get(&transfer_id).cloned() else {
                    return;
                };
                if dir.direction != DirDirection::Sending {
                    return;
                }
                let entries = dir.entries();
                let _ = self.send_control(
                    &peer,
                    &ControlMessage::DirManifest {
                        transfer_id,
                        entries,
                    },
                );
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.dir_send_task(dir).await;
                });
            }
            ControlMessage::DirReject {
                transfer_id,
                reason,
            } => {
                if let Some(dir) = self.dirs.read().get(&transfer_id).cloned() {
                    dir.fail(&reason);
                    self.report_dir_progress(&dir);
                }
            }
            ControlMessage::DirManifest {
                transfer_id,
                entries,
            } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.handle_dir_manifest(transfer_id, entries).await;
                });
            }
            ControlMessage::DirRequest {
                transfer_id,
                remote_path,
                recursive,
            } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .handle_dir_request(peer, transfer_id, remote_path, recursive)
                        .await;
                });
            }
            ControlMessage::DirComplete { transfer_id } => {
                if let Some(dir) = self.dirs.read().get(&transfer_id).cloned() {
                    if dir.direction == DirDirection::Receiving {
                        self.maybe_complete_dir(&dir);
                    }
                }
            }
        }
    }
}

impl ReservedHandler for FileTransferManager {
    fn on_control(&self, peer: PeerId, msg: serde_json::Value) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        match ControlMessage::from_value(msg) {
            Ok(control) => engine.handle_control(peer, control),
            Err(e) => {
                debug!(peer = %peer, error = %e, "ignoring malformed transfer message");
            }
        }
    }

    fn on_binary(&self, _peer: PeerId, payload: Bytes) -> bool {
        let Ok(chunk) = ChunkFrame::decode(payload) else {
            return false;
        };

        let transfer = self.transfers.read().get(&chunk.transfer_id).cloned();
        match transfer.and_then(|t| t.chunk_tx.clone()) {
            Some(tx) => {
                let _ = tx.send(chunk);
                true
            }
            None => false,
        }
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        let affected: Vec<Arc<Transfer>> = self
            .transfers
            .read()
            .values()
            .filter(|t| t.peer_id == peer)
            .cloned()
            .collect();

        for transfer in affected {
            self.fail_transfer(&transfer, "peer disconnected".to_string());
        }
    }
}

/// Resets the sender's window to resend everything from
/// `first_missing_index` onward.
fn rewind_sender(st: &mut TransferState, first_missing_index: u32) {
    let total = st.metadata.total_chunks;
    let fmi = first_missing_index.min(total);

    st.next_index = fmi;
    st.inflight.clear();

    let mut acked_count = 0;
    let mut bytes = 0u64;
    for idx in 0..total {
        let before = idx < fmi;
        st.acked[idx as usize] = before;
        if before {
            acked_count += 1;
            bytes += st.metadata.chunk_len(idx) as u64;
        }
    }
    st.acked_count = acked_count;
    st.chunks_completed = acked_count;
    st.bytes_transferred = bytes;
}

/// Lowest index not yet received.
fn first_missing_index(received: &[bool]) -> u32 {
    received
        .iter()
        .position(|r| !r)
        .map(|p| p as u32)
        .unwrap_or(received.len() as u32)
}

/// Accepts only relative paths with plain components; anything absolute
/// or containing `..` is refused.
fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let path = path.replace('\\', "/");
    let candidate = Path::new(&path);
    let mut clean = PathBuf::new();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_sanitize_relative() {
        assert_eq!(
            sanitize_relative("a/b/c.txt"),
            Some(PathBuf::from("a/b/c.txt"))
        );
        assert_eq!(sanitize_relative("./x"), Some(PathBuf::from("x")));
        assert_eq!(sanitize_relative("../etc/passwd"), None);
        assert_eq!(sanitize_relative("/etc/passwd"), None);
        assert_eq!(sanitize_relative("a/../../b"), None);
        assert_eq!(sanitize_relative(""), None);
    }

    #[test]
    fn test_first_missing_index() {
        assert_eq!(first_missing_index(&[]), 0);
        assert_eq!(first_missing_index(&[true, true, false, true]), 2);
        assert_eq!(first_missing_index(&[false]), 0);
        assert_eq!(first_missing_index(&[true, true]), 2);
    }
}
