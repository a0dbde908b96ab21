use thiserror::Error;

/// Errors that can occur in the file transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Disk or socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer session layer refused the send.
    #[error("peer error: {0}")]
    Peer(#[from] crate::peer::PeerError),

    /// No transfer with the given id.
    #[error("transfer not found")]
    NotFound,

    /// The operation is not allowed in the transfer's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The remote side declined the offer or request.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// Chunk retransmits were exhausted or the checksum never matched.
    #[error("transfer failed: {0}")]
    Failed(String),

    /// A malformed transfer control or chunk message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The path exists but is not the expected kind of entry.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}
