//! Automatic peer rendezvous over the DHT.
//!
//! Every client that enables discovery announces itself under the same
//! well-known info-hash, `SHA1("rats_peer_discovery_v1")`, and
//! periodically looks the hash up to find others. Discovered endpoints
//! are dialed through the peer client unless they are already connected,
//! are one of our own addresses, or were dialed too recently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::constants::{
    DISCOVERY_ANNOUNCE_INTERVAL, DISCOVERY_DIAL_COOLDOWN, DISCOVERY_LOOKUP_INTERVAL,
    DISCOVERY_SEED,
};
use crate::dht::DhtNode;
use crate::net;
use crate::peer::PeerClient;

/// The well-known rendezvous info-hash.
pub fn discovery_hash() -> [u8; 20] {
    let digest = Sha1::digest(DISCOVERY_SEED.as_bytes());
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Timer configuration, overridable so tests can run in milliseconds.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub announce_interval: Duration,
    pub lookup_interval: Duration,
    pub dial_cooldown: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval: DISCOVERY_ANNOUNCE_INTERVAL,
            lookup_interval: DISCOVERY_LOOKUP_INTERVAL,
            dial_cooldown: DISCOVERY_DIAL_COOLDOWN,
        }
    }
}

/// Periodic announce-and-lookup on the rendezvous hash.
pub struct AutoDiscovery {
    client: Arc<PeerClient>,
    dht: Arc<DhtNode>,
    config: DiscoveryConfig,
    recent_dials: Mutex<HashMap<SocketAddr, Instant>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AutoDiscovery {
    pub fn new(client: Arc<PeerClient>, dht: Arc<DhtNode>, config: DiscoveryConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            client,
            dht,
            config,
            recent_dials: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawns the discovery timer task.
    pub fn start(self: &Arc<Self>) {
        let discovery = self.clone();
        tokio::spawn(async move {
            discovery.run().await;
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut lookup = tokio::time::interval(self.config.lookup_interval);
        announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        lookup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(hash = %hex::encode(discovery_hash()), "auto discovery running");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = announce.tick() => {
                    let port = self.client.listen_port();
                    self.dht.announce(discovery_hash(), port).await;
                }
                _ = lookup.tick() => {
                    self.lookup_and_dial().await;
                }
            }
        }
    }

    async fn lookup_and_dial(&self) {
        let found = self.dht.get_peers(discovery_hash()).await;
        if found.is_empty() {
            return;
        }
        debug!(count = found.len(), "discovery lookup returned endpoints");

        for endpoint in found {
            if !self.should_dial(&endpoint) {
                continue;
            }

            self.recent_dials.lock().insert(endpoint, Instant::now());
            match self
                .client
                .connect_to_peer(&endpoint.ip().to_string(), endpoint.port())
                .await
            {
                Ok(peer_id) => info!(%endpoint, %peer_id, "connected to discovered peer"),
                Err(e) => debug!(%endpoint, error = %e, "discovered peer did not connect"),
            }
        }
    }

    /// Filters out ourselves, peers we already have, and endpoints inside
    /// their dial cooldown.
    fn should_dial(&self, endpoint: &SocketAddr) -> bool {
        if endpoint.port() == self.client.listen_port() {
            let own = net::local_addresses();
            if endpoint.ip().is_loopback() || own.contains(&endpoint.ip()) {
                return false;
            }
        }

        if self.client.is_connected_to(endpoint) {
            return false;
        }

        let mut recent = self.recent_dials.lock();
        recent.retain(|_, at| at.elapsed() < self.config.dial_cooldown);
        !recent.contains_key(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_hash_is_stable() {
        let a = discovery_hash();
        let b = discovery_hash();
        assert_eq!(a, b);
        // SHA1("rats_peer_discovery_v1") pinned so every client meets at
        // the same key.
        assert_eq!(
            hex::encode(a),
            hex::encode(Sha1::digest(b"rats_peer_discovery_v1"))
        );
    }

    #[tokio::test]
    async fn test_rendezvous_connects_two_clients() {
        let seed = DhtNode::bind(0).await.unwrap();
        seed.start();

        let fast = DiscoveryConfig {
            announce_interval: Duration::from_millis(100),
            lookup_interval: Duration::from_millis(150),
            dial_cooldown: Duration::from_secs(60),
        };

        let client_a = PeerClient::new();
        client_a.start(0).await.unwrap();
        let dht_a = DhtNode::bind(0).await.unwrap();
        dht_a.start();
        dht_a
            .bootstrap(&[("127.0.0.1".to_string(), seed.port())])
            .await
            .unwrap();

        let client_b = PeerClient::new();
        client_b.start(0).await.unwrap();
        let dht_b = DhtNode::bind(0).await.unwrap();
        dht_b.start();
        dht_b
            .bootstrap(&[("127.0.0.1".to_string(), seed.port())])
            .await
            .unwrap();

        let disc_a = AutoDiscovery::new(client_a.clone(), dht_a.clone(), fast.clone());
        let disc_b = AutoDiscovery::new(client_b.clone(), dht_b.clone(), fast);
        disc_a.start();
        disc_b.start();

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if client_a.get_peer_count() >= 1 && client_b.get_peer_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(client_a.get_peer_count() >= 1, "A never met B");
        assert!(client_b.get_peer_count() >= 1, "B never met A");

        disc_a.shutdown();
        disc_b.shutdown();
        dht_a.shutdown();
        dht_b.shutdown();
        seed.shutdown();
        client_a.stop().await;
        client_b.stop().await;
    }
}
