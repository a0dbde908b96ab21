//! Peer sessions over TCP.
//!
//! The peer client is the session manager: it listens on both address
//! families, dials outbound peers through dual-stack resolution, runs the
//! hello handshake that exchanges 40-hex peer identities, and multiplexes
//! framed messages to registered callbacks.
//!
//! # Wire format
//!
//! Every frame is a 4-byte big-endian total length (at most 16 MiB), one
//! kind byte (`0x00` control JSON, `0x01` binary chunk), and the payload.
//! Control payloads are UTF-8 JSON objects dispatched on their top-level
//! `type` field; `hello`, `ping`, `pong`, `message`, and the `file_*` /
//! `dir_*` space are reserved.
//!
//! # Callback model
//!
//! Callbacks are serialized per peer: each session has exactly one read
//! task and it dispatches inline, so at most one callback runs for a
//! given peer at any time. Different peers dispatch in parallel.

mod client;
mod error;
mod message;
mod peer_id;
mod session;
mod transport;

pub use client::PeerClient;
pub(crate) use client::ReservedHandler;
pub use error::{DisconnectReason, PeerError};
pub use message::{Frame, FrameKind};
pub use peer_id::PeerId;
pub use session::{Direction, PeerInfo, PeerSession};
