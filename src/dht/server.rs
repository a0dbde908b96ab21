use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use sha1::Sha1;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::message::{KrpcMessage, Query, Reply, TransactionId};
use super::node::{Node, NodeId};
use super::routing::{InsertOutcome, RoutingTable};
use crate::constants::{
    DHT_ANNOUNCE_LIFETIME, DHT_K, DHT_MAX_DATAGRAM, DHT_MAX_PENDING_QUERIES, DHT_QUERY_ATTEMPTS,
    DHT_QUERY_TIMEOUT, DHT_REANNOUNCE_INTERVAL, DHT_RETRY_SPACING, DHT_TOKEN_ROTATION_INTERVAL,
};

/// Lookup rounds are bounded as a backstop against pathological node sets.
const MAX_LOOKUP_ROUNDS: usize = 16;

/// How often the maintenance task wakes to check its timers.
const MAINTENANCE_TICK: std::time::Duration = std::time::Duration::from_secs(30);

/// Cap on peers remembered per info-hash.
const MAX_PEERS_PER_HASH: usize = 512;

struct PendingQuery {
    sender: mpsc::Sender<Reply>,
}

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers other nodes have announced to us, per info-hash.
#[derive(Default)]
struct AnnouncementStore {
    peers: HashMap<[u8; 20], Vec<AnnouncedPeer>>,
}

impl AnnouncementStore {
    fn add(&mut self, info_hash: [u8; 20], addr: SocketAddr) {
        let peers = self.peers.entry(info_hash).or_default();
        let now = Instant::now();
        peers.retain(|p| now.duration_since(p.announced_at) < DHT_ANNOUNCE_LIFETIME);
        peers.retain(|p| p.addr != addr);
        if peers.len() < MAX_PEERS_PER_HASH {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    fn get(&mut self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        let now = Instant::now();
        match self.peers.get_mut(info_hash) {
            Some(peers) => {
                peers.retain(|p| now.duration_since(p.announced_at) < DHT_ANNOUNCE_LIFETIME);
                peers.iter().map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.duration_since(p.announced_at) < DHT_ANNOUNCE_LIFETIME);
            !peers.is_empty()
        });
    }
}

/// A Kademlia DHT node speaking the mainline KRPC protocol over UDP.
///
/// Used both for content discovery (`find_peers` / `announce`) and as the
/// rendezvous substrate for automatic peer discovery. Queries carry
/// two-byte random transaction ids; outstanding queries are correlated by
/// id in a pending map.
///
/// # Examples
///
/// ```no_run
/// use rats::dht::DhtNode;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtNode::bind(6881).await?;
/// dht.start();
/// dht.bootstrap(&[("router.example.org".to_string(), 6881)]).await?;
///
/// let info_hash = [0u8; 20];
/// let peers = dht.get_peers(info_hash).await;
/// # Ok(())
/// # }
/// ```
pub struct DhtNode {
    socket: Arc<UdpSocket>,
    our_id: NodeId,
    port: u16,
    routing: Arc<RoutingTable>,
    pending: Arc<RwLock<HashMap<TransactionId, PendingQuery>>>,
    token_secrets: RwLock<TokenSecrets>,
    announcements: RwLock<AnnouncementStore>,
    /// Our own announcements, refreshed by the maintenance task.
    active_announcements: RwLock<HashMap<[u8; 20], u16>>,
    /// Eviction pings in flight, so each oldest node is probed once.
    evicting: Arc<Mutex<HashSet<NodeId>>>,
    malformed: AtomicU64,
    oversized: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DhtNode {
    /// Binds the UDP socket and generates a fresh node id.
    pub async fn bind(port: u16) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let port = socket.local_addr()?.port();
        let our_id = NodeId::generate();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(%our_id, port, "dht node bound");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            our_id,
            port,
            routing: Arc::new(RoutingTable::new(our_id)),
            pending: Arc::new(RwLock::new(HashMap::new())),
            token_secrets: RwLock::new(TokenSecrets::new()),
            announcements: RwLock::new(AnnouncementStore::default()),
            active_announcements: RwLock::new(HashMap::new()),
            evicting: Arc::new(Mutex::new(HashSet::new())),
            malformed: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Spawns the receive task and the maintenance task.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            node.receive_loop().await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.maintenance_loop().await;
        });
    }

    /// Signals both background tasks to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing.node_count()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    /// Malformed KRPC datagrams dropped so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Oversized datagrams dropped so far.
    pub fn oversized_count(&self) -> u64 {
        self.oversized.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "dht recv failed");
                            continue;
                        }
                    };

                    if n > DHT_MAX_DATAGRAM {
                        self.oversized.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    match KrpcMessage::parse(&buf[..n]) {
                        Ok(msg) => self.handle_message(msg, from).await,
                        Err(e) => {
                            self.malformed.fetch_add(1, Ordering::Relaxed);
                            debug!(%from, error = %e, "dropped malformed krpc message");
                        }
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut tick = tokio::time::interval(MAINTENANCE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_rotation = Instant::now();
        let mut last_reannounce = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if last_rotation.elapsed() >= DHT_TOKEN_ROTATION_INTERVAL {
                        last_rotation = Instant::now();
                        self.rotate_token_secret();
                    }

                    self.refresh_stale_buckets().await;
                    self.announcements.write().prune();

                    if last_reannounce.elapsed() >= DHT_REANNOUNCE_INTERVAL {
                        last_reannounce = Instant::now();
                        self.reannounce_all().await;
                    }
                }
            }
        }
    }

    async fn refresh_stale_buckets(&self) {
        let stale = self.routing.stale_buckets();
        if stale.is_empty() {
            return;
        }

        debug!(count = stale.len(), "refreshing stale dht buckets");
        for bucket_idx in stale {
            let target = self.our_id.random_in_bucket(bucket_idx);
            let _ = self.lookup_nodes(target).await;
        }
    }

    async fn reannounce_all(&self) {
        let active: Vec<([u8; 20], u16)> = {
            let map = self.active_announcements.read();
            map.iter().map(|(h, p)| (*h, *p)).collect()
        };

        for (info_hash, port) in active {
            debug!(info_hash = %hex::encode(info_hash), "re-announcing");
            self.announce(info_hash, port).await;
        }
    }

    pub fn rotate_token_secret(&self) {
        self.token_secrets.write().rotate();
        debug!("dht token secret rotated");
    }

    // ------------------------------------------------------------------
    // Outbound queries
    // ------------------------------------------------------------------

    /// Sends one query with retries: three sends spaced four seconds
    /// apart, eight seconds of patience after the last.
    async fn send_query(&self, addr: SocketAddr, query: Query) -> Result<Reply, DhtError> {
        let tid: TransactionId = Bytes::copy_from_slice(&rand::random::<[u8; 2]>());
        let (tx, mut rx) = mpsc::channel(1);

        {
            let mut pending = self.pending.write();
            if pending.len() >= DHT_MAX_PENDING_QUERIES {
                return Err(DhtError::Backpressure);
            }
            pending.insert(tid.clone(), PendingQuery { sender: tx });
        }

        let msg = KrpcMessage::Query {
            transaction_id: tid.clone(),
            sender: self.our_id,
            query,
        };
        let data = msg.encode();

        let mut outcome = Err(DhtError::Timeout);
        for attempt in 0..DHT_QUERY_ATTEMPTS {
            if let Err(e) = self.socket.send_to(&data, addr).await {
                outcome = Err(DhtError::Io(e));
                break;
            }

            let wait = if attempt + 1 == DHT_QUERY_ATTEMPTS {
                DHT_QUERY_TIMEOUT
            } else {
                DHT_RETRY_SPACING
            };

            match timeout(wait, rx.recv()).await {
                Ok(Some(Reply::Error { code, message })) => {
                    outcome = Err(DhtError::Remote { code, message });
                    break;
                }
                Ok(Some(reply)) => {
                    outcome = Ok(reply);
                    break;
                }
                Ok(None) => {
                    outcome = Err(DhtError::Timeout);
                    break;
                }
                Err(_) => {}
            }
        }

        self.pending.write().remove(&tid);
        outcome
    }

    /// Pings a node; used for liveness and the bucket eviction policy.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Reply, DhtError> {
        self.send_query(addr, Query::Ping).await
    }

    // ------------------------------------------------------------------
    // Bootstrap and lookups
    // ------------------------------------------------------------------

    /// Seeds the routing table: `find_node(self)` against every seed, then
    /// an iterative self-lookup to fill the nearby buckets.
    pub async fn bootstrap(&self, seeds: &[(String, u16)]) -> Result<(), DhtError> {
        info!(seeds = seeds.len(), "dht bootstrap starting");

        for (host, port) in seeds {
            let addrs = match crate::net::resolve_dual(host, *port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(host = %host, error = %e, "failed to resolve bootstrap seed");
                    continue;
                }
            };

            for addr in addrs {
                match self
                    .send_query(addr, Query::FindNode { target: self.our_id })
                    .await
                {
                    Ok(reply) => self.integrate_reply_nodes(&reply),
                    Err(e) => debug!(%addr, error = %e, "bootstrap seed did not answer"),
                }
            }
        }

        self.lookup_nodes(self.our_id).await;

        info!(
            nodes = self.routing.node_count(),
            "dht bootstrap complete"
        );
        Ok(())
    }

    fn integrate_reply_nodes(&self, reply: &Reply) {
        let nodes = match reply {
            Reply::FoundNodes { nodes, .. } => nodes,
            Reply::Peers { nodes, .. } => nodes,
            _ => return,
        };
        for node in nodes {
            self.offer_node(node.clone());
        }
    }

    /// Iterative `find_node`: walks toward `target` and returns the
    /// closest nodes found. Populates the routing table as it goes.
    pub async fn lookup_nodes(&self, target: NodeId) -> Vec<Node> {
        let (closest, _, _) = self.iterative_lookup(target, false, |_| {}).await;
        closest
    }

    /// Iterative `get_peers` for `info_hash`, emitting discovered peer
    /// endpoints through `emit` as replies arrive.
    pub async fn find_peers<F>(&self, info_hash: [u8; 20], emit: F) -> Vec<SocketAddr>
    where
        F: Fn(Vec<SocketAddr>),
    {
        let target = NodeId(info_hash);
        let (_, _, peers) = self.iterative_lookup(target, true, emit).await;
        peers
    }

    /// Collecting variant of [`find_peers`](Self::find_peers).
    pub async fn get_peers(&self, info_hash: [u8; 20]) -> Vec<SocketAddr> {
        self.find_peers(info_hash, |_| {}).await
    }

    /// Announces that we serve `info_hash` on `port`: iterative lookup,
    /// then `announce_peer` to the closest nodes that issued us a token.
    /// Re-announced every thirty minutes until [`Self::stop_announcing`].
    pub async fn announce(&self, info_hash: [u8; 20], port: u16) -> usize {
        self.active_announcements.write().insert(info_hash, port);

        let target = NodeId(info_hash);
        let (closest, tokens, _) = self.iterative_lookup(target, true, |_| {}).await;

        let mut announced = 0;
        for node in closest.iter().take(DHT_K) {
            let Some(token) = tokens.get(&node.id) else {
                continue;
            };

            let query = Query::AnnouncePeer {
                info_hash,
                port,
                token: token.clone(),
                implied_port: false,
            };
            match self.send_query(node.addr, query).await {
                Ok(_) => announced += 1,
                Err(e) => debug!(addr = %node.addr, error = %e, "announce_peer failed"),
            }
        }

        info!(
            info_hash = %hex::encode(info_hash),
            announced,
            "dht announce complete"
        );
        announced
    }

    /// Drops an info-hash from the periodic re-announce set.
    pub fn stop_announcing(&self, info_hash: &[u8; 20]) {
        self.active_announcements.write().remove(info_hash);
    }

    /// The iterative lookup at the heart of `find_node`, `get_peers`, and
    /// `announce`: an α-wide shortlist walk ordered by XOR distance.
    ///
    /// Terminates when the K closest known nodes have all been queried or
    /// a round brings nothing closer. Returns the closest responsive
    /// nodes, the tokens they issued, and any peer endpoints collected.
    async fn iterative_lookup<F>(
        &self,
        target: NodeId,
        want_peers: bool,
        emit: F,
    ) -> (Vec<Node>, HashMap<NodeId, Bytes>, Vec<SocketAddr>)
    where
        F: Fn(Vec<SocketAddr>),
    {
        let mut shortlist: Vec<Node> = self.routing.find_closest(&target, DHT_K);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut tokens: HashMap<NodeId, Bytes> = HashMap::new();
        let mut peers: Vec<SocketAddr> = Vec::new();
        let mut best_distance: Option<[u8; 20]> = None;

        for _ in 0..MAX_LOOKUP_ROUNDS {
            shortlist.sort_by_key(|n| n.id.distance(&target));
            shortlist.dedup_by_key(|n| n.id);

            let round: Vec<Node> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(crate::constants::DHT_ALPHA)
                .cloned()
                .collect();

            if round.is_empty() {
                break;
            }

            let queries = round.iter().map(|node| {
                let query = if want_peers {
                    Query::GetPeers {
                        info_hash: target.0,
                    }
                } else {
                    Query::FindNode { target }
                };
                queried.insert(node.id);
                async move { (node.clone(), self.send_query(node.addr, query).await) }
            });

            let results = futures::future::join_all(queries).await;

            let mut round_improved = false;
            for (node, result) in results {
                match result {
                    Ok(reply) => {
                        self.routing.mark_seen(&node.id);

                        if let Reply::Peers {
                            token,
                            peers: found,
                            ..
                        } = &reply
                        {
                            if let Some(token) = token {
                                tokens.insert(node.id, token.clone());
                            }
                            if !found.is_empty() {
                                emit(found.clone());
                                peers.extend(found.iter().copied());
                            }
                        }

                        let new_nodes = match &reply {
                            Reply::FoundNodes { nodes, .. } => nodes.clone(),
                            Reply::Peers { nodes, .. } => nodes.clone(),
                            _ => Vec::new(),
                        };

                        for new_node in new_nodes {
                            if new_node.id == self.our_id {
                                continue;
                            }
                            self.offer_node(new_node.clone());

                            let dist = new_node.id.distance(&target);
                            if best_distance.map(|d| dist < d).unwrap_or(true) {
                                best_distance = Some(dist);
                                round_improved = true;
                            }
                            shortlist.push(new_node);
                        }
                    }
                    Err(e) => {
                        debug!(addr = %node.addr, error = %e, "lookup query failed");
                        self.routing.mark_questionable(&node.id);
                    }
                }
            }

            shortlist.sort_by_key(|n| n.id.distance(&target));
            shortlist.dedup_by_key(|n| n.id);

            let k_closest_all_queried = shortlist
                .iter()
                .take(DHT_K)
                .all(|n| queried.contains(&n.id));
            if k_closest_all_queried && !round_improved {
                break;
            }
        }

        shortlist.retain(|n| queried.contains(&n.id));
        shortlist.truncate(DHT_K);
        (shortlist, tokens, peers)
    }

    // ------------------------------------------------------------------
    // Routing table insertion with ping-evict
    // ------------------------------------------------------------------

    /// Offers a node to the routing table, running the ping-evict policy
    /// when its bucket is full: the least-recently-seen occupant gets one
    /// ping; if it answers the newcomer is discarded, otherwise it is
    /// evicted and the newcomer takes its place. The probe runs detached
    /// so inserts never block on a slow node.
    fn offer_node(&self, node: Node) {
        match self.routing.offer(node.clone()) {
            InsertOutcome::Added | InsertOutcome::Refreshed | InsertOutcome::Ignored => {}
            InsertOutcome::BucketFull { oldest } => {
                {
                    let mut evicting = self.evicting.lock();
                    if !evicting.insert(oldest.id) {
                        return;
                    }
                }

                let tid: TransactionId = Bytes::copy_from_slice(&rand::random::<[u8; 2]>());
                let (tx, mut rx) = mpsc::channel(1);
                self.pending
                    .write()
                    .insert(tid.clone(), PendingQuery { sender: tx });

                let msg = KrpcMessage::Query {
                    transaction_id: tid.clone(),
                    sender: self.our_id,
                    query: Query::Ping,
                };
                let data = msg.encode();

                let socket = self.socket.clone();
                let routing = self.routing.clone();
                let pending = self.pending.clone();
                let evicting = self.evicting.clone();

                tokio::spawn(async move {
                    let _ = socket.send_to(&data, oldest.addr).await;
                    let answered = timeout(DHT_QUERY_TIMEOUT, rx.recv())
                        .await
                        .ok()
                        .flatten()
                        .is_some();

                    pending.write().remove(&tid);
                    evicting.lock().remove(&oldest.id);

                    if answered {
                        routing.mark_seen(&oldest.id);
                    } else {
                        debug!(evicted = %oldest.id, "bucket occupant unresponsive, replaced");
                        routing.evict_and_insert(&oldest.id, node);
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound handling
    // ------------------------------------------------------------------

    async fn handle_message(&self, msg: KrpcMessage, from: SocketAddr) {
        match msg {
            KrpcMessage::Reply {
                transaction_id,
                reply,
            } => {
                if let Some(id) = reply.sender() {
                    self.offer_node(Node::new(id, from));
                }
                let pending = self.pending.read();
                if let Some(query) = pending.get(&transaction_id) {
                    let _ = query.sender.try_send(reply);
                }
            }
            KrpcMessage::Query {
                transaction_id,
                sender,
                query,
            } => {
                self.offer_node(Node::new(sender, from));
                let reply = self.answer_query(query, from);
                let msg = KrpcMessage::Reply {
                    transaction_id,
                    reply,
                };
                let _ = self.socket.send_to(&msg.encode(), from).await;
            }
        }
    }

    fn answer_query(&self, query: Query, from: SocketAddr) -> Reply {
        match query {
            Query::Ping => Reply::Pong { id: self.our_id },
            Query::FindNode { target } => Reply::FoundNodes {
                id: self.our_id,
                nodes: self.routing.find_closest(&target, DHT_K),
            },
            Query::GetPeers { info_hash } => {
                let nodes = self.routing.find_closest(&NodeId(info_hash), DHT_K);
                let token = self.issue_token(&from, &info_hash);
                let peers = self.announcements.write().get(&info_hash);
                Reply::Peers {
                    id: self.our_id,
                    token: Some(token),
                    peers,
                    nodes,
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.validate_token(&from, &info_hash, &token) {
                    debug!(%from, "rejected announce_peer with invalid token");
                    return Reply::Error {
                        code: 203,
                        message: "invalid token".to_string(),
                    };
                }

                let peer_port = if implied_port { from.port() } else { port };
                let peer_addr = SocketAddr::new(from.ip(), peer_port);
                self.announcements.write().add(info_hash, peer_addr);
                debug!(
                    %peer_addr,
                    info_hash = %hex::encode(info_hash),
                    "stored announced peer"
                );
                Reply::Announced { id: self.our_id }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Tokens are HMAC-SHA1 over the requester endpoint and the info-hash,
    /// truncated to eight bytes. No per-issuer state: validation just
    /// recomputes under the current and previous secrets.
    fn issue_token(&self, addr: &SocketAddr, info_hash: &[u8; 20]) -> Bytes {
        let secret = self.token_secrets.read().current;
        token_for(&secret, addr, info_hash)
    }

    fn validate_token(&self, addr: &SocketAddr, info_hash: &[u8; 20], token: &Bytes) -> bool {
        let (current, previous) = {
            let secrets = self.token_secrets.read();
            (secrets.current, secrets.previous)
        };

        token_for(&current, addr, info_hash) == *token
            || token_for(&previous, addr, info_hash) == *token
    }

}

fn token_for(secret: &[u8; 16], addr: &SocketAddr, info_hash: &[u8; 20]) -> Bytes {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(addr.to_string().as_bytes());
    mac.update(info_hash);
    let digest = mac.finalize().into_bytes();
    Bytes::copy_from_slice(&digest[..8])
}
