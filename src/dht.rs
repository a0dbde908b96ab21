//! Kademlia distributed hash table.
//!
//! The DHT provides decentralized content discovery: nodes are identified
//! by 160-bit ids, content by 20-byte info-hashes, and closeness is XOR
//! distance. The wire protocol is mainline-compatible KRPC (bencoded
//! dictionaries over UDP) with the four standard methods:
//!
//! - **ping** — liveness check
//! - **find_node** — nodes close to a target id
//! - **get_peers** — peers announced under an info-hash
//! - **announce_peer** — register ourselves under an info-hash
//!
//! # Getting started
//!
//! ```no_run
//! use rats::dht::DhtNode;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dht = DhtNode::bind(6881).await?;
//! dht.start();
//! dht.bootstrap(&[("dht.example.org".to_string(), 6881)]).await?;
//!
//! let info_hash = [0u8; 20];
//! dht.announce(info_hash, 8080).await;
//! let peers = dht.get_peers(info_hash).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Routing table
//!
//! 160 insertion-ordered buckets of up to eight nodes, one per bit of
//! distance from our id. A full bucket triggers the ping-evict policy:
//! the least-recently-seen occupant is pinged, and only if it stays
//! silent is it replaced by the newcomer. Buckets untouched for fifteen
//! minutes are refreshed with a lookup on a random in-range id.

pub mod bencode;

mod error;
mod message;
mod node;
mod routing;
mod server;

pub use error::DhtError;
pub use message::{KrpcMessage, Query, Reply, TransactionId};
pub use node::{Node, NodeId};
pub use routing::{InsertOutcome, RoutingTable};
pub use server::DhtNode;

#[cfg(test)]
mod tests;
