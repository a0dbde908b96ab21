use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::bencode::{decode, encode, Value};
use super::error::DhtError;
use super::node::{self, Node, NodeId};

pub type TransactionId = Bytes;

/// A KRPC query, the `q`/`a` side of the protocol.
#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// A KRPC reply, the `r` (or `e`) side of the protocol.
#[derive(Debug, Clone)]
pub enum Reply {
    Pong {
        id: NodeId,
    },
    FoundNodes {
        id: NodeId,
        nodes: Vec<Node>,
    },
    Peers {
        id: NodeId,
        token: Option<Bytes>,
        peers: Vec<SocketAddr>,
        nodes: Vec<Node>,
    },
    Announced {
        id: NodeId,
    },
    Error {
        code: i64,
        message: String,
    },
}

impl Reply {
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            Reply::Pong { id }
            | Reply::FoundNodes { id, .. }
            | Reply::Peers { id, .. }
            | Reply::Announced { id } => Some(*id),
            Reply::Error { .. } => None,
        }
    }
}

/// One KRPC datagram, either a query or a reply, correlated by its
/// two-byte transaction id.
#[derive(Debug, Clone)]
pub enum KrpcMessage {
    Query {
        transaction_id: TransactionId,
        sender: NodeId,
        query: Query,
    },
    Reply {
        transaction_id: TransactionId,
        reply: Reply,
    },
}

impl KrpcMessage {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            KrpcMessage::Query { transaction_id, .. } => transaction_id,
            KrpcMessage::Reply { transaction_id, .. } => transaction_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            KrpcMessage::Query {
                transaction_id,
                sender,
                query,
            } => {
                dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
                dict.insert(key("y"), Value::string("q"));
                dict.insert(key("q"), Value::string(query.name()));

                let mut args = BTreeMap::new();
                args.insert(key("id"), Value::bytes(sender.as_bytes()));
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => {
                        args.insert(key("target"), Value::bytes(target.as_bytes()));
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(key("info_hash"), Value::bytes(info_hash));
                    }
                    Query::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => {
                        args.insert(key("info_hash"), Value::bytes(info_hash));
                        args.insert(key("port"), Value::Integer(*port as i64));
                        args.insert(key("token"), Value::Bytes(token.clone()));
                        if *implied_port {
                            args.insert(key("implied_port"), Value::Integer(1));
                        }
                    }
                }
                dict.insert(key("a"), Value::Dict(args));
            }
            KrpcMessage::Reply {
                transaction_id,
                reply,
            } => {
                dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
                if let Reply::Error { code, message } = reply {
                    dict.insert(key("y"), Value::string("e"));
                    dict.insert(
                        key("e"),
                        Value::List(vec![Value::Integer(*code), Value::string(message)]),
                    );
                } else {
                    dict.insert(key("y"), Value::string("r"));
                    let mut body = BTreeMap::new();
                    match reply {
                        Reply::Pong { id } | Reply::Announced { id } => {
                            body.insert(key("id"), Value::bytes(id.as_bytes()));
                        }
                        Reply::FoundNodes { id, nodes } => {
                            body.insert(key("id"), Value::bytes(id.as_bytes()));
                            body.insert(key("nodes"), Value::Bytes(compact_nodes(nodes)));
                        }
                        Reply::Peers {
                            id,
                            token,
                            peers,
                            nodes,
                        } => {
                            body.insert(key("id"), Value::bytes(id.as_bytes()));
                            if let Some(token) = token {
                                body.insert(key("token"), Value::Bytes(token.clone()));
                            }
                            if !peers.is_empty() {
                                let values = peers
                                    .iter()
                                    .filter_map(node::peer_to_compact)
                                    .map(|c| Value::bytes(&c))
                                    .collect();
                                body.insert(key("values"), Value::List(values));
                            }
                            if !nodes.is_empty() {
                                body.insert(key("nodes"), Value::Bytes(compact_nodes(nodes)));
                            }
                        }
                        Reply::Error { .. } => unreachable!(),
                    }
                    dict.insert(key("r"), Value::Dict(body));
                }
            }
        }

        encode(&Value::Dict(dict))
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("top level is not a dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidMessage("missing message kind".into()))?;

        match kind {
            "q" => parse_query(transaction_id, &value),
            "r" => parse_reply(transaction_id, &value),
            "e" => parse_error(transaction_id, &value),
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message kind: {}",
                other
            ))),
        }
    }
}

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn compact_nodes(nodes: &[Node]) -> Bytes {
    let compact: Vec<u8> = nodes
        .iter()
        .filter_map(|n| n.to_compact())
        .flatten()
        .collect();
    Bytes::from(compact)
}

fn info_hash_from(value: Option<&Value>) -> Result<[u8; 20], DhtError> {
    value
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 20)
        .map(|b| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(b);
            hash
        })
        .ok_or_else(|| DhtError::InvalidMessage("missing info_hash".into()))
}

fn parse_query(transaction_id: TransactionId, value: &Value) -> Result<KrpcMessage, DhtError> {
    let name = value
        .get(b"q")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;
    let args = value
        .get(b"a")
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let sender = args
        .get(b"id")
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::InvalidMessage("missing sender id".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let query = match name {
        "ping" => Query::Ping,
        "find_node" => {
            let target = args
                .get(b"target")
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| DhtError::InvalidMessage("missing target".into()))
                .and_then(|b| NodeId::from_bytes(b))?;
            Query::FindNode { target }
        }
        "get_peers" => Query::GetPeers {
            info_hash: info_hash_from(args.get(b"info_hash"))?,
        },
        "announce_peer" => {
            let port = args
                .get(b"port")
                .and_then(|v| v.as_integer())
                .filter(|p| (0..=u16::MAX as i64).contains(p))
                .ok_or_else(|| DhtError::InvalidMessage("missing port".into()))?;
            let token = args
                .get(b"token")
                .and_then(|v| v.as_bytes())
                .cloned()
                .ok_or_else(|| DhtError::InvalidMessage("missing token".into()))?;
            let implied_port = args
                .get(b"implied_port")
                .and_then(|v| v.as_integer())
                .map(|v| v == 1)
                .unwrap_or(false);
            Query::AnnouncePeer {
                info_hash: info_hash_from(args.get(b"info_hash"))?,
                port: port as u16,
                token,
                implied_port,
            }
        }
        other => {
            return Err(DhtError::InvalidMessage(format!(
                "unknown query: {}",
                other
            )))
        }
    };

    Ok(KrpcMessage::Query {
        transaction_id,
        sender,
        query,
    })
}

fn parse_reply(transaction_id: TransactionId, value: &Value) -> Result<KrpcMessage, DhtError> {
    let body = value
        .get(b"r")
        .ok_or_else(|| DhtError::InvalidMessage("missing reply body".into()))?;

    let id = body
        .get(b"id")
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::InvalidMessage("missing id in reply".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let nodes: Vec<Node> = body
        .get(b"nodes")
        .and_then(|v| v.as_bytes())
        .map(|data| data.chunks_exact(26).filter_map(Node::from_compact).collect())
        .unwrap_or_default();

    let peers: Option<Vec<SocketAddr>> = body.get(b"values").and_then(|v| v.as_list()).map(|list| {
        list.iter()
            .filter_map(|v| v.as_bytes())
            .filter_map(|b| node::peer_from_compact(b))
            .collect()
    });

    let token = body.get(b"token").and_then(|v| v.as_bytes()).cloned();

    // The reply body doesn't name the query it answers; classify from the
    // fields present, like every mainline implementation does.
    let reply = if peers.is_some() || token.is_some() {
        Reply::Peers {
            id,
            token,
            peers: peers.unwrap_or_default(),
            nodes,
        }
    } else if !nodes.is_empty() {
        Reply::FoundNodes { id, nodes }
    } else {
        Reply::Pong { id }
    };

    Ok(KrpcMessage::Reply {
        transaction_id,
        reply,
    })
}

fn parse_error(transaction_id: TransactionId, value: &Value) -> Result<KrpcMessage, DhtError> {
    let list = value
        .get(b"e")
        .and_then(|v| v.as_list())
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let message = list
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    Ok(KrpcMessage::Reply {
        transaction_id,
        reply: Reply::Error { code, message },
    })
}
