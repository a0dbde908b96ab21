use super::node::peer_from_compact;
use super::routing::InsertOutcome;
use super::*;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

fn addr(last_octet: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
}

#[test]
fn test_node_id_generate_is_random() {
    assert_ne!(NodeId::generate().0, NodeId::generate().0);
}

#[test]
fn test_node_id_from_bytes_length() {
    assert!(NodeId::from_bytes(&[1u8; 20]).is_ok());
    assert!(NodeId::from_bytes(&[1u8; 19]).is_err());
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_xor_distance() {
    let zero = NodeId([0u8; 20]);
    let ones = NodeId([0xFF; 20]);

    assert_eq!(zero.distance(&ones), [0xFF; 20]);
    assert_eq!(zero.distance(&zero), [0u8; 20]);
    assert_eq!(zero.distance(&ones), ones.distance(&zero));
}

#[test]
fn test_bucket_index_msb() {
    let zero = NodeId([0u8; 20]);

    let mut high = [0u8; 20];
    high[0] = 0x80;
    assert_eq!(zero.bucket_index(&NodeId(high)), 0);

    let mut low = [0u8; 20];
    low[19] = 0x01;
    assert_eq!(zero.bucket_index(&NodeId(low)), 159);

    let mut mid = [0u8; 20];
    mid[1] = 0x10;
    assert_eq!(zero.bucket_index(&NodeId(mid)), 11);
}

#[test]
fn test_random_in_bucket_lands_in_bucket() {
    let id = NodeId::generate();
    for bucket in [0usize, 7, 80, 159] {
        let random = id.random_in_bucket(bucket);
        assert_eq!(id.bucket_index(&random), bucket);
    }
}

#[test]
fn test_compact_node_roundtrip() {
    let node = Node::new(NodeId([3u8; 20]), addr(7, 6881));
    let compact = node.to_compact().unwrap();
    let parsed = Node::from_compact(&compact).unwrap();

    assert_eq!(parsed.id, node.id);
    assert_eq!(parsed.addr, node.addr);
}

#[test]
fn test_compact_node_rejects_v6() {
    let v6: SocketAddr = "[::1]:6881".parse().unwrap();
    let node = Node::new(NodeId([3u8; 20]), v6);
    assert!(node.to_compact().is_none());
}

#[test]
fn test_compact_peer_roundtrip() {
    let peer = addr(9, 4242);
    let compact = super::node::peer_to_compact(&peer).unwrap();
    assert_eq!(peer_from_compact(&compact), Some(peer));
    assert_eq!(peer_from_compact(&compact[..5]), None);
}

#[test]
fn test_routing_offer_and_refresh() {
    let our_id = NodeId([0u8; 20]);
    let table = RoutingTable::new(our_id);

    let node = Node::new(NodeId([0x80; 20]), addr(1, 1000));
    assert!(matches!(table.offer(node.clone()), InsertOutcome::Added));
    assert!(matches!(table.offer(node), InsertOutcome::Refreshed));
    assert_eq!(table.node_count(), 1);
}

#[test]
fn test_routing_ignores_self() {
    let our_id = NodeId([7u8; 20]);
    let table = RoutingTable::new(our_id);
    assert!(matches!(
        table.offer(Node::new(our_id, addr(1, 1000))),
        InsertOutcome::Ignored
    ));
    assert_eq!(table.node_count(), 0);
}

#[test]
fn test_bucket_capacity_and_evict_flow() {
    let our_id = NodeId([0u8; 20]);
    let table = RoutingTable::new(our_id);

    // Fill one bucket: ids sharing the same leading bit land together.
    let mut first = None;
    for i in 0..8u8 {
        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = i;
        let node = Node::new(NodeId(id), addr(i, 1000 + i as u16));
        if first.is_none() {
            first = Some(node.id);
        }
        assert!(matches!(table.offer(node), InsertOutcome::Added));
    }

    let mut extra_id = [0u8; 20];
    extra_id[0] = 0x80;
    extra_id[19] = 99;
    let extra = Node::new(NodeId(extra_id), addr(99, 2000));

    let outcome = table.offer(extra.clone());
    let InsertOutcome::BucketFull { oldest } = outcome else {
        panic!("expected full bucket");
    };
    assert_eq!(Some(oldest.id), first);
    assert_eq!(table.node_count(), 8);

    // Unresponsive oldest: evicted, newcomer inserted, capacity holds.
    table.evict_and_insert(&oldest.id, extra.clone());
    assert_eq!(table.node_count(), 8);
    assert!(table.contains(&extra.id));
    assert!(!table.contains(&oldest.id));
}

#[test]
fn test_buckets_never_exceed_k() {
    let our_id = NodeId([0u8; 20]);
    let table = RoutingTable::new(our_id);

    for i in 0..100u8 {
        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = i;
        let _ = table.offer(Node::new(NodeId(id), addr(i, 1000)));
    }

    assert!(table.node_count() <= 8);
}

#[test]
fn test_find_closest_orders_by_distance() {
    let our_id = NodeId([0u8; 20]);
    let table = RoutingTable::new(our_id);

    for i in 1..=20u8 {
        let mut id = [0u8; 20];
        id[0] = i;
        table.offer(Node::new(NodeId(id), addr(i, 1000)));
    }

    let target = NodeId([0u8; 20]);
    let closest = table.find_closest(&target, 8);
    assert_eq!(closest.len(), 8);
    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
}

#[test]
fn test_stale_bucket_detection() {
    let our_id = NodeId([0u8; 20]);
    let table = RoutingTable::new(our_id);

    let mut id = [0u8; 20];
    id[0] = 0x80;
    table.offer(Node::new(NodeId(id), addr(1, 1000)));

    assert!(table.stale_buckets_since(Duration::ZERO).len() == 1);
    assert!(table.stale_buckets_since(Duration::from_secs(3600)).is_empty());
}

#[test]
fn test_krpc_ping_roundtrip() {
    let our_id = NodeId::generate();
    let msg = KrpcMessage::Query {
        transaction_id: Bytes::from_static(b"aa"),
        sender: our_id,
        query: Query::Ping,
    };

    let parsed = KrpcMessage::parse(&msg.encode()).unwrap();
    let KrpcMessage::Query { transaction_id, sender, query } = parsed else {
        panic!("expected query");
    };
    assert_eq!(transaction_id, Bytes::from_static(b"aa"));
    assert_eq!(sender, our_id);
    assert!(matches!(query, Query::Ping));
}

#[test]
fn test_krpc_get_peers_roundtrip() {
    let our_id = NodeId::generate();
    let info_hash = [0xAB; 20];
    let msg = KrpcMessage::Query {
        transaction_id: Bytes::from_static(b"bb"),
        sender: our_id,
        query: Query::GetPeers { info_hash },
    };

    let parsed = KrpcMessage::parse(&msg.encode()).unwrap();
    let KrpcMessage::Query { query, .. } = parsed else {
        panic!("expected query");
    };
    let Query::GetPeers { info_hash: parsed_hash } = query else {
        panic!("expected get_peers");
    };
    assert_eq!(parsed_hash, info_hash);
}

#[test]
fn test_krpc_announce_roundtrip() {
    let msg = KrpcMessage::Query {
        transaction_id: Bytes::from_static(b"cc"),
        sender: NodeId::generate(),
        query: Query::AnnouncePeer {
            info_hash: [1u8; 20],
            port: 8080,
            token: Bytes::from_static(b"tokentok"),
            implied_port: false,
        },
    };

    let parsed = KrpcMessage::parse(&msg.encode()).unwrap();
    let KrpcMessage::Query { query, .. } = parsed else {
        panic!("expected query");
    };
    let Query::AnnouncePeer { port, token, implied_port, .. } = query else {
        panic!("expected announce_peer");
    };
    assert_eq!(port, 8080);
    assert_eq!(token, Bytes::from_static(b"tokentok"));
    assert!(!implied_port);
}

#[test]
fn test_krpc_peers_reply_roundtrip() {
    let our_id = NodeId::generate();
    let peers = vec![addr(1, 1111), addr(2, 2222)];
    let nodes = vec![Node::new(NodeId([5u8; 20]), addr(5, 5555))];

    let msg = KrpcMessage::Reply {
        transaction_id: Bytes::from_static(b"dd"),
        reply: Reply::Peers {
            id: our_id,
            token: Some(Bytes::from_static(b"12345678")),
            peers: peers.clone(),
            nodes: nodes.clone(),
        },
    };

    let parsed = KrpcMessage::parse(&msg.encode()).unwrap();
    let KrpcMessage::Reply { reply, .. } = parsed else {
        panic!("expected reply");
    };
    let Reply::Peers { id, token, peers: parsed_peers, nodes: parsed_nodes } = reply else {
        panic!("expected peers reply");
    };
    assert_eq!(id, our_id);
    assert_eq!(token, Some(Bytes::from_static(b"12345678")));
    assert_eq!(parsed_peers, peers);
    assert_eq!(parsed_nodes.len(), 1);
    assert_eq!(parsed_nodes[0].id, nodes[0].id);
}

#[test]
fn test_krpc_error_reply() {
    let msg = KrpcMessage::Reply {
        transaction_id: Bytes::from_static(b"ee"),
        reply: Reply::Error {
            code: 203,
            message: "invalid token".to_string(),
        },
    };

    let parsed = KrpcMessage::parse(&msg.encode()).unwrap();
    let KrpcMessage::Reply { reply, .. } = parsed else {
        panic!("expected reply");
    };
    let Reply::Error { code, message } = reply else {
        panic!("expected error reply");
    };
    assert_eq!(code, 203);
    assert_eq!(message, "invalid token");
}

#[test]
fn test_krpc_rejects_garbage() {
    assert!(KrpcMessage::parse(b"not bencode").is_err());
    assert!(KrpcMessage::parse(b"i42e").is_err());
    assert!(KrpcMessage::parse(b"d1:yl1:qee").is_err());
}

// ----------------------------------------------------------------------
// Two-node integration over loopback
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_bootstrap_populates_both_tables() {
    let a = DhtNode::bind(0).await.unwrap();
    let b = DhtNode::bind(0).await.unwrap();
    a.start();
    b.start();

    b.bootstrap(&[("127.0.0.1".to_string(), a.port())])
        .await
        .unwrap();

    // B learned A from the find_node reply; A learned B from the query.
    assert!(b.routing_table_size() >= 1);
    assert!(a.routing_table_size() >= 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_announce_then_get_peers() {
    let a = DhtNode::bind(0).await.unwrap();
    let b = DhtNode::bind(0).await.unwrap();
    a.start();
    b.start();

    b.bootstrap(&[("127.0.0.1".to_string(), a.port())])
        .await
        .unwrap();

    let info_hash = [0x42; 20];
    let announced = b.announce(info_hash, 9999).await;
    assert!(announced >= 1);

    let found = tokio::time::timeout(Duration::from_secs(2), b.get_peers(info_hash))
        .await
        .expect("lookup finished in time");
    assert!(found.iter().any(|p| p.port() == 9999));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_announce_with_bad_token_rejected() {
    let a = DhtNode::bind(0).await.unwrap();
    a.start();

    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", a.port()).parse().unwrap();

    let msg = KrpcMessage::Query {
        transaction_id: Bytes::from_static(b"xx"),
        sender: NodeId::generate(),
        query: Query::AnnouncePeer {
            info_hash: [9u8; 20],
            port: 1234,
            token: Bytes::from_static(b"bogustok"),
            implied_port: false,
        },
    };
    sock.send_to(&msg.encode(), target).await.unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let parsed = KrpcMessage::parse(&buf[..n]).unwrap();
    let KrpcMessage::Reply { reply: Reply::Error { code, .. }, .. } = parsed else {
        panic!("expected error reply");
    };
    assert_eq!(code, 203);

    a.shutdown();
}

#[tokio::test]
async fn test_oversized_datagram_dropped() {
    let a = DhtNode::bind(0).await.unwrap();
    a.start();

    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", a.port()).parse().unwrap();
    sock.send_to(&vec![b'x'; 1600], target).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.oversized_count(), 1);
    assert_eq!(a.routing_table_size(), 0);

    a.shutdown();
}

#[tokio::test]
async fn test_malformed_datagram_counted() {
    let a = DhtNode::bind(0).await.unwrap();
    a.start();

    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{}", a.port()).parse().unwrap();
    sock.send_to(b"definitely not bencode", target).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.malformed_count(), 1);

    a.shutdown();
}
