//! rats - a peer-to-peer networking client
//!
//! Nodes discover one another over a Kademlia DHT, establish direct TCP
//! sessions over IPv4 and IPv6, exchange framed application messages,
//! and transfer files and whole directories with progress reporting,
//! pause/resume, and cancellation.
//!
//! # Modules
//!
//! - [`peer`] - TCP session manager: dual-stack listen/dial, handshake,
//!   framed message dispatch, keepalive
//! - [`dht`] - Kademlia node speaking mainline-compatible KRPC over UDP
//! - [`discovery`] - automatic peer rendezvous on a well-known info-hash
//! - [`transfer`] - chunked file and directory transfer with windowed
//!   acknowledgement
//! - [`net`] - name resolution, address validation, socket helpers
//! - [`constants`] - protocol constants and tuning parameters
//!
//! # A minimal node
//!
//! ```no_run
//! use rats::peer::PeerClient;
//! use rats::dht::DhtNode;
//! use rats::discovery::{AutoDiscovery, DiscoveryConfig};
//! use rats::transfer::{FileTransferManager, TransferConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PeerClient::new();
//! let engine = FileTransferManager::new(client.clone(), TransferConfig::default());
//! client.start(8080).await?;
//!
//! let dht = DhtNode::bind(6881).await?;
//! dht.start();
//! dht.bootstrap(&[("router.example.org".to_string(), 6881)]).await?;
//!
//! let discovery = AutoDiscovery::new(client.clone(), dht.clone(), DiscoveryConfig::default());
//! discovery.start();
//!
//! client.on_string_data(|peer, data| println!("{}: {}", peer, data));
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod dht;
pub mod discovery;
pub mod net;
pub mod peer;
pub mod transfer;

pub use dht::{DhtError, DhtNode, NodeId};
pub use discovery::{discovery_hash, AutoDiscovery, DiscoveryConfig};
pub use net::NetError;
pub use peer::{DisconnectReason, PeerClient, PeerError, PeerId, PeerInfo};
pub use transfer::{
    FileMetadata, FileTransferManager, TransferConfig, TransferError, TransferProgress,
    TransferStatus,
};
