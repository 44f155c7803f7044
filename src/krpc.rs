//! KRPC message layer: the BEP-5 wire schema over bencode.
//!
//! Every datagram decodes into one tagged [`Message`]; the server loop
//! dispatches on the [`Body`] variant. Anything that fails to decode is
//! dropped by the caller without a reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::bencode::{self, Dict, Value};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::node::{Contact, COMPACT_V4_LEN, COMPACT_V6_LEN};

pub type TransactionId = Bytes;

/// Builds a 4-byte transaction id: a 2-byte owner tag (0 for queries
/// the server issues on its own behalf) followed by a sequence number.
pub(crate) fn make_tid(tag: u16, seq: u16) -> TransactionId {
    let tag = tag.to_be_bytes();
    let seq = seq.to_be_bytes();
    Bytes::copy_from_slice(&[tag[0], tag[1], seq[0], seq[1]])
}

/// Compact ip+port: 4+2 bytes for v4, 16+2 for v6.
const COMPACT_ADDR_V4_LEN: usize = 6;
const COMPACT_ADDR_V6_LEN: usize = 18;

/// One KRPC datagram.
#[derive(Debug, Clone)]
pub struct Message {
    pub tid: TransactionId,
    /// The requester's address as seen by the responder (the top-level
    /// `ip` field, BEP-42). Replies we send carry it; replies we
    /// receive vote on our external address.
    pub external_ip: Option<SocketAddr>,
    pub body: Body,
}

/// Message payload, tagged by kind.
#[derive(Debug, Clone)]
pub enum Body {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    PingReply {
        id: NodeId,
    },
    FindNodeReply {
        id: NodeId,
        nodes: Vec<Contact>,
        nodes6: Vec<Contact>,
    },
    GetPeersReply {
        id: NodeId,
        token: Option<Bytes>,
        values: Vec<SocketAddr>,
        nodes: Vec<Contact>,
        nodes6: Vec<Contact>,
    },
    ErrorReply {
        code: i64,
        message: String,
    },
}

impl Body {
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            Body::Ping { id }
            | Body::FindNode { id, .. }
            | Body::GetPeers { id, .. }
            | Body::AnnouncePeer { id, .. }
            | Body::PingReply { id }
            | Body::FindNodeReply { id, .. }
            | Body::GetPeersReply { id, .. } => Some(*id),
            Body::ErrorReply { .. } => None,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Body::Ping { .. }
                | Body::FindNode { .. }
                | Body::GetPeers { .. }
                | Body::AnnouncePeer { .. }
        )
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| malformed("top level is not a dictionary"))?;

        let tid = dict
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| malformed("missing transaction id"))?;

        let external_ip = dict
            .get(b"ip".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| parse_compact_addr(b));

        let body = match dict
            .get(b"y".as_slice())
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing message type"))?
        {
            "q" => decode_query(dict)?,
            "r" => decode_reply(dict)?,
            "e" => decode_error(dict)?,
            other => return Err(malformed(&format!("unknown message type {other:?}"))),
        };

        Ok(Self {
            tid,
            external_ip,
            body,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut root = Dict::new();
        root.insert(Bytes::from_static(b"t"), Value::Bytes(self.tid.clone()));
        if let Some(addr) = &self.external_ip {
            root.insert(Bytes::from_static(b"ip"), Value::Bytes(compact_addr(addr)));
        }

        match &self.body {
            Body::Ping { id } => encode_query(&mut root, "ping", |args| {
                put_id(args, b"id", id);
            }),
            Body::FindNode { id, target } => encode_query(&mut root, "find_node", |args| {
                put_id(args, b"id", id);
                put_id(args, b"target", target);
            }),
            Body::GetPeers { id, info_hash } => encode_query(&mut root, "get_peers", |args| {
                put_id(args, b"id", id);
                args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
            }),
            Body::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => encode_query(&mut root, "announce_peer", |args| {
                put_id(args, b"id", id);
                args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
                args.insert(Bytes::from_static(b"port"), Value::Int(i64::from(*port)));
                args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                if *implied_port {
                    args.insert(Bytes::from_static(b"implied_port"), Value::Int(1));
                }
            }),
            Body::PingReply { id } => encode_reply(&mut root, |resp| {
                put_id(resp, b"id", id);
            }),
            Body::FindNodeReply { id, nodes, nodes6 } => encode_reply(&mut root, |resp| {
                put_id(resp, b"id", id);
                put_contacts(resp, nodes, nodes6);
            }),
            Body::GetPeersReply {
                id,
                token,
                values,
                nodes,
                nodes6,
            } => encode_reply(&mut root, |resp| {
                put_id(resp, b"id", id);
                if let Some(token) = token {
                    resp.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                }
                if !values.is_empty() {
                    let list = values
                        .iter()
                        .map(|addr| Value::Bytes(compact_addr(addr)))
                        .collect();
                    resp.insert(Bytes::from_static(b"values"), Value::List(list));
                }
                put_contacts(resp, nodes, nodes6);
            }),
            Body::ErrorReply { code, message } => {
                root.insert(Bytes::from_static(b"y"), Value::bytes(b"e"));
                root.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Int(*code), Value::bytes(message.as_bytes())]),
                );
            }
        }

        bencode::encode(&Value::Dict(root))
    }
}

fn malformed(what: &str) -> DhtError {
    DhtError::Malformed(what.to_string())
}

fn put_id(dict: &mut Dict, key: &'static [u8], id: &NodeId) {
    dict.insert(Bytes::from_static(key), Value::bytes(id.as_bytes()));
}

fn encode_query(root: &mut Dict, name: &str, fill: impl FnOnce(&mut Dict)) {
    root.insert(Bytes::from_static(b"y"), Value::bytes(b"q"));
    root.insert(Bytes::from_static(b"q"), Value::bytes(name.as_bytes()));
    let mut args = Dict::new();
    fill(&mut args);
    root.insert(Bytes::from_static(b"a"), Value::Dict(args));
}

fn encode_reply(root: &mut Dict, fill: impl FnOnce(&mut Dict)) {
    root.insert(Bytes::from_static(b"y"), Value::bytes(b"r"));
    let mut resp = Dict::new();
    fill(&mut resp);
    root.insert(Bytes::from_static(b"r"), Value::Dict(resp));
}

fn put_contacts(dict: &mut Dict, nodes: &[Contact], nodes6: &[Contact]) {
    if !nodes.is_empty() {
        let mut packed = Vec::with_capacity(nodes.len() * COMPACT_V4_LEN);
        for contact in nodes.iter().filter(|c| c.addr.is_ipv4()) {
            contact.push_compact(&mut packed);
        }
        dict.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(packed)));
    }
    if !nodes6.is_empty() {
        let mut packed = Vec::with_capacity(nodes6.len() * COMPACT_V6_LEN);
        for contact in nodes6.iter().filter(|c| c.addr.is_ipv6()) {
            contact.push_compact(&mut packed);
        }
        dict.insert(Bytes::from_static(b"nodes6"), Value::Bytes(Bytes::from(packed)));
    }
}

fn decode_query(dict: &Dict) -> Result<Body, DhtError> {
    let name = dict
        .get(b"q".as_slice())
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing query name"))?;
    let args = dict
        .get(b"a".as_slice())
        .and_then(Value::as_dict)
        .ok_or_else(|| malformed("missing query arguments"))?;
    let id = required_id(args, b"id")?;

    match name {
        "ping" => Ok(Body::Ping { id }),
        "find_node" => Ok(Body::FindNode {
            id,
            target: required_id(args, b"target")?,
        }),
        "get_peers" => Ok(Body::GetPeers {
            id,
            info_hash: required_hash(args)?,
        }),
        "announce_peer" => {
            let port = args
                .get(b"port".as_slice())
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| malformed("missing or invalid port"))?;
            let token = args
                .get(b"token".as_slice())
                .and_then(Value::as_bytes)
                .cloned()
                .ok_or_else(|| malformed("missing token"))?;
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(Value::as_int)
                .is_some_and(|v| v != 0);
            Ok(Body::AnnouncePeer {
                id,
                info_hash: required_hash(args)?,
                port,
                token,
                implied_port,
            })
        }
        other => Err(malformed(&format!("unknown query {other:?}"))),
    }
}

fn decode_reply(dict: &Dict) -> Result<Body, DhtError> {
    let resp = dict
        .get(b"r".as_slice())
        .and_then(Value::as_dict)
        .ok_or_else(|| malformed("missing response dictionary"))?;
    let id = required_id(resp, b"id")?;

    let nodes = resp
        .get(b"nodes".as_slice())
        .and_then(Value::as_bytes)
        .map(|b| {
            b.chunks_exact(COMPACT_V4_LEN)
                .filter_map(Contact::from_compact_v4)
                .collect::<Vec<_>>()
        });
    let nodes6 = resp
        .get(b"nodes6".as_slice())
        .and_then(Value::as_bytes)
        .map(|b| {
            b.chunks_exact(COMPACT_V6_LEN)
                .filter_map(Contact::from_compact_v6)
                .collect::<Vec<_>>()
        });
    let token = resp
        .get(b"token".as_slice())
        .and_then(Value::as_bytes)
        .cloned();
    let values = resp.get(b"values".as_slice()).and_then(Value::as_list).map(|list| {
        list.iter()
            .filter_map(Value::as_bytes)
            .filter_map(|b| parse_compact_addr(b))
            .collect::<Vec<_>>()
    });

    // Shape decides the kind: a token or values means get_peers, bare
    // nodes mean find_node, a lone id is a ping/announce acknowledgment.
    let body = if token.is_some() || values.is_some() {
        Body::GetPeersReply {
            id,
            token,
            values: values.unwrap_or_default(),
            nodes: nodes.unwrap_or_default(),
            nodes6: nodes6.unwrap_or_default(),
        }
    } else if nodes.is_some() || nodes6.is_some() {
        Body::FindNodeReply {
            id,
            nodes: nodes.unwrap_or_default(),
            nodes6: nodes6.unwrap_or_default(),
        }
    } else {
        Body::PingReply { id }
    };
    Ok(body)
}

fn decode_error(dict: &Dict) -> Result<Body, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(Value::as_list)
        .ok_or_else(|| malformed("missing error list"))?;
    let code = list.first().and_then(Value::as_int).unwrap_or(0);
    let message = list
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Ok(Body::ErrorReply { code, message })
}

fn required_id(dict: &Dict, key: &[u8]) -> Result<NodeId, DhtError> {
    dict.get(key)
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_slice(b).ok())
        .ok_or_else(|| malformed("missing or invalid node id"))
}

fn required_hash(dict: &Dict) -> Result<[u8; 20], DhtError> {
    dict.get(b"info_hash".as_slice())
        .and_then(Value::as_bytes)
        .filter(|b| b.len() == 20)
        .map(|b| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(b);
            hash
        })
        .ok_or_else(|| malformed("missing or invalid info_hash"))
}

fn compact_addr(addr: &SocketAddr) -> Bytes {
    let mut buf = Vec::with_capacity(COMPACT_ADDR_V6_LEN);
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    Bytes::from(buf)
}

fn parse_compact_addr(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        COMPACT_ADDR_V4_LEN => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        COMPACT_ADDR_V6_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TransactionId {
        Bytes::from_static(b"\x00\x01\x00\x02")
    }

    #[test]
    fn tids_encode_tag_and_sequence() {
        assert_eq!(make_tid(1, 2), tid());
        assert_ne!(make_tid(1, 2), make_tid(1, 3));
        assert_ne!(make_tid(1, 2), make_tid(2, 2));
    }

    fn roundtrip(msg: &Message) -> Message {
        Message::decode(&msg.encode()).unwrap()
    }

    #[test]
    fn ping_query_roundtrip() {
        let id = NodeId::random();
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::Ping { id },
        };
        let back = roundtrip(&msg);
        assert_eq!(back.tid, tid());
        assert!(matches!(back.body, Body::Ping { id: got } if got == id));
    }

    #[test]
    fn find_node_query_roundtrip() {
        let target = NodeId::random();
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::FindNode {
                id: NodeId::random(),
                target,
            },
        };
        assert!(matches!(
            roundtrip(&msg).body,
            Body::FindNode { target: got, .. } if got == target
        ));
    }

    #[test]
    fn announce_query_roundtrip() {
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::AnnouncePeer {
                id: NodeId::random(),
                info_hash: [0xab; 20],
                port: 6881,
                token: Bytes::from_static(b"tok"),
                implied_port: true,
            },
        };
        match roundtrip(&msg).body {
            Body::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                assert_eq!(info_hash, [0xab; 20]);
                assert_eq!(port, 6881);
                assert_eq!(token, Bytes::from_static(b"tok"));
                assert!(implied_port);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn find_node_reply_roundtrip_carries_both_families() {
        let v4 = Contact::new(NodeId([1; 20]), "1.2.3.4:6881".parse().unwrap());
        let v6 = Contact::new(NodeId([2; 20]), "[2001:db8::2]:6881".parse().unwrap());
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::FindNodeReply {
                id: NodeId::random(),
                nodes: vec![v4],
                nodes6: vec![v6],
            },
        };
        match roundtrip(&msg).body {
            Body::FindNodeReply { nodes, nodes6, .. } => {
                assert_eq!(nodes, vec![v4]);
                assert_eq!(nodes6, vec![v6]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn get_peers_reply_with_values() {
        let peers = vec![
            "1.2.3.4:6881".parse().unwrap(),
            "[2001:db8::7]:9000".parse().unwrap(),
        ];
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::GetPeersReply {
                id: NodeId::random(),
                token: Some(Bytes::from_static(b"tt")),
                values: peers.clone(),
                nodes: vec![],
                nodes6: vec![],
            },
        };
        match roundtrip(&msg).body {
            Body::GetPeersReply { token, values, .. } => {
                assert_eq!(token, Some(Bytes::from_static(b"tt")));
                assert_eq!(values, peers);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn reply_shape_disambiguation() {
        // token but no values is still a get_peers reply
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::GetPeersReply {
                id: NodeId::random(),
                token: Some(Bytes::from_static(b"t")),
                values: vec![],
                nodes: vec![Contact::new(NodeId([3; 20]), "5.6.7.8:1".parse().unwrap())],
                nodes6: vec![],
            },
        };
        assert!(matches!(roundtrip(&msg).body, Body::GetPeersReply { .. }));

        // a bare id decodes as a ping acknowledgment
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::PingReply { id: NodeId::random() },
        };
        assert!(matches!(roundtrip(&msg).body, Body::PingReply { .. }));
    }

    #[test]
    fn error_reply_roundtrip() {
        let msg = Message {
            tid: tid(),
            external_ip: None,
            body: Body::ErrorReply {
                code: 203,
                message: "Announce_peer with wrong token".into(),
            },
        };
        match roundtrip(&msg).body {
            Body::ErrorReply { code, message } => {
                assert_eq!(code, 203);
                assert_eq!(message, "Announce_peer with wrong token");
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn external_ip_field_roundtrip() {
        let seen: SocketAddr = "9.8.7.6:1234".parse().unwrap();
        let msg = Message {
            tid: tid(),
            external_ip: Some(seen),
            body: Body::PingReply { id: NodeId::random() },
        };
        assert_eq!(roundtrip(&msg).external_ip, Some(seen));
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(Message::decode(b"garbage").is_err());
        assert!(Message::decode(b"i42e").is_err());
        // dictionary without a message type
        assert!(Message::decode(b"d1:t2:aae").is_err());
        // ping query without a node id
        assert!(Message::decode(b"d1:ad2:hi1:xe1:q4:ping1:t2:aa1:y1:qe").is_err());
        // announce with out-of-range port
        let bad_port = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa9:info_hash20:bbbbbbbbbbbbbbbbbbbb4:porti70000e5:token2:tke1:q13:announce_peer1:t2:aa1:y1:qe";
        assert!(Message::decode(bad_port).is_err());
    }

    #[test]
    fn truncated_compact_node_entries_are_skipped() {
        // 26 valid bytes followed by a 10-byte tail: one contact parses
        let contact = Contact::new(NodeId([5; 20]), "1.1.1.1:80".parse().unwrap());
        let mut packed = Vec::new();
        contact.push_compact(&mut packed);
        packed.extend_from_slice(&[0u8; 10]);

        let mut resp = Dict::new();
        resp.insert(Bytes::from_static(b"id"), Value::bytes([9u8; 20]));
        resp.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(packed)));
        let mut root = Dict::new();
        root.insert(Bytes::from_static(b"t"), Value::bytes(b"aa"));
        root.insert(Bytes::from_static(b"y"), Value::bytes(b"r"));
        root.insert(Bytes::from_static(b"r"), Value::Dict(resp));

        let msg = Message::decode(&bencode::encode(&Value::Dict(root))).unwrap();
        match msg.body {
            Body::FindNodeReply { nodes, .. } => assert_eq!(nodes, vec![contact]),
            other => panic!("wrong body: {other:?}"),
        }
    }
}
