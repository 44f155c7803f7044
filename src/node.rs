//! Per-peer state: contact info, liveness tracking, compact wire forms.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::id::{NodeId, ID_LEN};

/// Window in which activity keeps a node good (BEP-5).
const ACTIVITY_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Consecutive unanswered queries before a node is bad.
pub const MAX_FAILED_QUERIES: u32 = 5;

/// Compact v4 node info: 20-byte id + 4-byte ip + 2-byte port.
pub const COMPACT_V4_LEN: usize = 26;

/// Compact v6 node info: 20-byte id + 16-byte ip + 2-byte port.
pub const COMPACT_V6_LEN: usize = 38;

/// Identity and address of a DHT node as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Parses one 26-byte entry from a `nodes` string.
    pub fn from_compact_v4(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_V4_LEN {
            return None;
        }
        let id = NodeId::from_slice(&data[..ID_LEN]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// Parses one 38-byte entry from a `nodes6` string.
    pub fn from_compact_v6(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_V6_LEN {
            return None;
        }
        let id = NodeId::from_slice(&data[..ID_LEN]).ok()?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[20..36]);
        let port = u16::from_be_bytes([data[36], data[37]]);
        Some(Self::new(id, SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
    }

    /// Appends the compact form matching this contact's address family.
    pub fn push_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.addr.port().to_be_bytes());
    }
}

/// Liveness class of a known node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Good,
    Questionable,
    Bad,
}

/// Observed interaction with a node, fed into its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    QueryReceived,
    ResponseReceived,
    QuerySent,
    QueryTimeout,
}

/// A node tracked by the routing table.
///
/// Status is derived, not stored: a node is good when it has responded
/// within the last 15 minutes, or has ever responded and queried us
/// within the last 15 minutes; bad after five consecutive unanswered
/// queries; questionable otherwise.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addr: SocketAddr,
    last_query_rcv: Option<Instant>,
    last_response_rcv: Option<Instant>,
    last_query_sent: Option<Instant>,
    failed_queries: u32,
}

impl NodeRecord {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_query_rcv: None,
            last_response_rcv: None,
            last_query_sent: None,
            failed_queries: 0,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.addr)
    }

    pub fn record(&mut self, event: NodeEvent) {
        self.record_at(event, Instant::now());
    }

    pub fn record_at(&mut self, event: NodeEvent, now: Instant) {
        match event {
            NodeEvent::QueryReceived => self.last_query_rcv = Some(now),
            NodeEvent::ResponseReceived => {
                self.last_response_rcv = Some(now);
                self.failed_queries = 0;
            }
            NodeEvent::QuerySent => self.last_query_sent = Some(now),
            NodeEvent::QueryTimeout => {
                self.failed_queries = self.failed_queries.saturating_add(1)
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> NodeStatus {
        if self.failed_queries >= MAX_FAILED_QUERIES {
            return NodeStatus::Bad;
        }
        let recent = |at: Option<Instant>| {
            at.is_some_and(|t| now.saturating_duration_since(t) < ACTIVITY_WINDOW)
        };
        if recent(self.last_response_rcv)
            || (self.last_response_rcv.is_some() && recent(self.last_query_rcv))
        {
            NodeStatus::Good
        } else {
            NodeStatus::Questionable
        }
    }

    pub fn failed_queries(&self) -> u32 {
        self.failed_queries
    }

    /// Most recent moment this node talked to us, if it ever did.
    pub fn last_heard(&self) -> Option<Instant> {
        match (self.last_query_rcv, self.last_response_rcv) {
            (Some(q), Some(r)) => Some(q.max(r)),
            (q, r) => q.or(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        NodeRecord::new(NodeId::random(), "127.0.0.1:6881".parse().unwrap())
    }

    #[test]
    fn fresh_node_is_questionable() {
        assert_eq!(record().status(), NodeStatus::Questionable);
    }

    #[test]
    fn recent_response_makes_good() {
        let mut n = record();
        n.record(NodeEvent::ResponseReceived);
        assert_eq!(n.status(), NodeStatus::Good);
    }

    #[test]
    fn stale_response_plus_recent_query_stays_good() {
        let mut n = record();
        let start = Instant::now();
        n.record_at(NodeEvent::ResponseReceived, start);

        let later = start + Duration::from_secs(20 * 60);
        assert_eq!(n.status_at(later), NodeStatus::Questionable);

        n.record_at(NodeEvent::QueryReceived, later);
        assert_eq!(n.status_at(later), NodeStatus::Good);
    }

    #[test]
    fn query_without_any_response_is_not_good() {
        let mut n = record();
        n.record(NodeEvent::QueryReceived);
        assert_eq!(n.status(), NodeStatus::Questionable);
    }

    #[test]
    fn five_timeouts_make_bad_and_a_response_resets() {
        let mut n = record();
        for _ in 0..MAX_FAILED_QUERIES - 1 {
            n.record(NodeEvent::QueryTimeout);
        }
        assert_ne!(n.status(), NodeStatus::Bad);

        n.record(NodeEvent::QueryTimeout);
        assert_eq!(n.status(), NodeStatus::Bad);

        n.record(NodeEvent::ResponseReceived);
        assert_eq!(n.failed_queries(), 0);
        assert_eq!(n.status(), NodeStatus::Good);
    }

    #[test]
    fn compact_v4_roundtrip() {
        let contact = Contact::new(NodeId([7u8; 20]), "1.2.3.4:6881".parse().unwrap());
        let mut buf = Vec::new();
        contact.push_compact(&mut buf);
        assert_eq!(buf.len(), COMPACT_V4_LEN);
        assert_eq!(Contact::from_compact_v4(&buf), Some(contact));
    }

    #[test]
    fn compact_v6_roundtrip() {
        let contact = Contact::new(NodeId([9u8; 20]), "[2001:db8::1]:6881".parse().unwrap());
        let mut buf = Vec::new();
        contact.push_compact(&mut buf);
        assert_eq!(buf.len(), COMPACT_V6_LEN);
        assert_eq!(Contact::from_compact_v6(&buf), Some(contact));
    }

    #[test]
    fn compact_rejects_wrong_length() {
        assert!(Contact::from_compact_v4(&[0u8; 25]).is_none());
        assert!(Contact::from_compact_v6(&[0u8; 26]).is_none());
    }
}
