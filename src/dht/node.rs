use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use super::error::DhtError;
use crate::constants::DHT_NUM_BUCKETS;

/// A 160-bit DHT node identity; distance is XOR.
///
/// Independent of the peer session identity: the same process carries one
/// of each, drawn separately at random.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the bucket `other` falls into relative to `self`: the
    /// position of the most significant differing bit.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);
        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        DHT_NUM_BUCKETS - 1
    }

    /// A random id that would land in bucket `index` of `self`'s table,
    /// used for refreshing stale buckets.
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        if index >= DHT_NUM_BUCKETS {
            return NodeId::generate();
        }

        let mut id = self.0;
        let byte_idx = index / 8;
        let bit_idx = 7 - (index % 8);

        // Flip the bucket bit, randomize everything below it.
        id[byte_idx] ^= 1 << bit_idx;
        if bit_idx > 0 {
            let random: u8 = rand::random();
            let mask = (1u8 << bit_idx) - 1;
            id[byte_idx] = (id[byte_idx] & !mask) | (random & mask);
        }
        for b in id.iter_mut().skip(byte_idx + 1) {
            *b = rand::random();
        }

        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A known remote DHT node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    /// Set once the node fails a query; cleared when it answers again.
    pub questionable: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            questionable: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.questionable = false;
    }

    pub fn mark_questionable(&mut self) {
        self.questionable = true;
    }

    /// Parses the 26-byte compact node encoding (20-byte id, 4-byte IPv4,
    /// 2-byte big-endian port).
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    pub fn to_compact(&self) -> Option<[u8; 26]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };
        let mut compact = [0u8; 26];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..24].copy_from_slice(&v4.ip().octets());
        compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
        Some(compact)
    }
}

/// Parses the 6-byte compact peer encoding used in `values` lists.
pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encodes a peer endpoint in the 6-byte compact form; IPv6 has no
/// compact form in this message family.
pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; 6]> {
    let SocketAddr::V4(v4) = addr else {
        return None;
    };
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&v4.ip().octets());
    out[4..].copy_from_slice(&v4.port().to_be_bytes());
    Some(out)
}
