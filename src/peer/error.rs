use thiserror::Error;

/// Errors that can occur in the peer client.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Name lookup returned no usable addresses.
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// Every resolved candidate failed to connect.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The hello exchange timed out, was malformed, or presented a
    /// duplicate peer id.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated the framing or dispatch rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A keepalive or read deadline expired.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// No live session with the given peer id.
    #[error("peer not found")]
    NotFound,

    /// A peer id string was not 40 hex characters.
    #[error("invalid peer id")]
    InvalidPeerId,

    /// The client is not running, or is already running.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Why a session ended, as reported to `on_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    Closed,
    /// Keepalive or read deadline expired.
    Timeout,
    /// The peer violated the protocol.
    ProtocolError,
    /// Unrecoverable socket error.
    IoError,
    /// We disconnected it locally (explicit disconnect or shutdown).
    Local,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ProtocolError => "protocol_error",
            DisconnectReason::IoError => "io_error",
            DisconnectReason::Local => "local",
        };
        f.write_str(s)
    }
}
