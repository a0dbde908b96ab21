//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the peer session
//! protocol, the DHT, and the file transfer engine: timeouts, frame and
//! window sizes, and maintenance intervals.

use std::time::Duration;

// ============================================================================
// Peer session protocol
// ============================================================================

/// Protocol version carried in the hello frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum total frame length (4-byte length prefix covers kind + payload).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Both sides must deliver a hello within this window or the session dies.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-candidate dial timeout for outbound connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A ping is sent after this much outbound silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A pong must arrive within this window after a ping.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for `stop()` to join all spawned tasks.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// DHT
// ============================================================================

/// Nodes per routing table bucket.
pub const DHT_K: usize = 8;

/// Buckets in the routing table (one per bit of the 160-bit ID space).
pub const DHT_NUM_BUCKETS: usize = 160;

/// Concurrent queries per lookup round.
pub const DHT_ALPHA: usize = 3;

/// Total send attempts per query (initial send plus two retries).
pub const DHT_QUERY_ATTEMPTS: u32 = 3;

/// Wait after each non-final query attempt.
pub const DHT_RETRY_SPACING: Duration = Duration::from_secs(4);

/// Wait after the final query attempt.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Buckets untouched for this long are refreshed with a random lookup.
pub const DHT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Token secrets rotate on this interval; current + previous are accepted,
/// which gives issued tokens a ten minute validity window.
pub const DHT_TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Stored peer announcements expire after this long.
pub const DHT_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Active announcements are refreshed on this interval.
pub const DHT_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Largest UDP datagram we will parse; bigger ones are dropped.
pub const DHT_MAX_DATAGRAM: usize = 1472;

/// Upper bound on outstanding queries before new ones are refused.
pub const DHT_MAX_PENDING_QUERIES: usize = 256;

// ============================================================================
// Auto discovery
// ============================================================================

/// Seed string hashed (SHA-1) into the well-known rendezvous info-hash.
pub const DISCOVERY_SEED: &str = "rats_peer_discovery_v1";

/// How often we announce ourselves under the rendezvous hash.
pub const DISCOVERY_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often we look up other peers under the rendezvous hash.
pub const DISCOVERY_LOOKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Minimum spacing between dial attempts to the same endpoint.
pub const DISCOVERY_DIAL_COOLDOWN: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// File transfer
// ============================================================================

/// Default chunk size (64 KiB).
pub const TRANSFER_CHUNK_SIZE: u32 = 64 * 1024;

/// Unacknowledged chunks allowed in flight per transfer.
pub const TRANSFER_WINDOW: usize = 16;

/// A chunk missing its ack for this long is retransmitted.
pub const TRANSFER_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retransmits per chunk before the transfer fails.
pub const TRANSFER_MAX_RETRIES: u32 = 3;

/// Files transferred in parallel within one directory transfer.
pub const TRANSFER_MAX_PARALLEL_FILES: usize = 4;

/// Rate meter tick.
pub const TRANSFER_METER_TICK: Duration = Duration::from_secs(1);

/// Width of the sliding window behind `instant_rate_bps`.
pub const TRANSFER_RATE_WINDOW: Duration = Duration::from_secs(5);
