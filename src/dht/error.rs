use thiserror::Error;

/// Errors that can occur in the DHT node.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bencode decode failure.
    #[error("bencode error: {0}")]
    Bencode(#[from] super::bencode::BencodeError),

    /// A KRPC message was structurally invalid.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A node id was not 20 bytes.
    #[error("invalid node id length")]
    InvalidNodeId,

    /// The query exhausted all its attempts without a response.
    #[error("query timed out")]
    Timeout,

    /// Too many queries already outstanding.
    #[error("too many pending queries")]
    Backpressure,

    /// The remote node answered with a KRPC error.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}
