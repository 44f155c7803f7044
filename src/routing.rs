//! Kademlia routing table: a binary tree of k-buckets over the XOR metric.
//!
//! Buckets tile the 160-bit space without overlap; each holds up to
//! [`K`] nodes sharing a bit prefix. Only the bucket whose range covers
//! the local node ID may split, which keeps the tree depth proportional
//! to the density of IDs near our own. One table serves one address
//! family; a dual-stack node runs two.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::id::{NodeId, ID_BITS};
use crate::node::{NodeEvent, NodeRecord, NodeStatus};

/// Bucket capacity.
pub const K: usize = 8;

/// A bucket unchanged for this long is stale and due for a refresh.
const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// The ID range covered by a bucket: all IDs sharing the first `len`
/// bits of `bits`. Bits past `len` are kept at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    bits: NodeId,
    len: u32,
}

impl Prefix {
    /// The whole ID space.
    pub const ALL: Prefix = Prefix {
        bits: NodeId([0u8; 20]),
        len: 0,
    };

    pub fn covers(&self, id: &NodeId) -> bool {
        self.bits.common_prefix(id) >= self.len
    }

    /// Halves the range: the lower child keeps the next bit at zero,
    /// the upper child sets it. `None` once single-ID granularity is
    /// reached.
    fn split(self) -> Option<(Prefix, Prefix)> {
        if self.len >= ID_BITS {
            return None;
        }
        let lower = Prefix {
            bits: self.bits,
            len: self.len + 1,
        };
        let upper = Prefix {
            bits: self.bits.with_bit(self.len),
            len: self.len + 1,
        };
        Some((lower, upper))
    }

    /// A uniformly random ID inside this range, used as a refresh
    /// lookup target.
    pub fn random_id(&self) -> NodeId {
        self.bits.random_in_prefix(self.len)
    }
}

#[derive(Debug)]
struct Bucket {
    prefix: Prefix,
    nodes: Vec<NodeRecord>,
    last_changed: Instant,
}

impl Bucket {
    fn new(prefix: Prefix, last_changed: Instant) -> Self {
        Self {
            prefix,
            nodes: Vec::with_capacity(K),
            last_changed,
        }
    }
}

/// Outcome of [`RoutingTable::insert`].
#[derive(Debug)]
pub enum Insert {
    /// The node was appended or replaced a bad entry.
    Added,
    /// The node was already known; its address was refreshed.
    Updated,
    /// The bucket is full with no bad entry. The caller should ping
    /// `probe` and, if it stays silent, hand the newcomer to
    /// [`RoutingTable::replace`].
    Pending { probe: NodeRecord },
    /// Dropped: our own ID, or a full bucket of good nodes.
    Ignored,
}

/// The bucket tree for one address family.
///
/// The table does no I/O of its own; callers serialize access (the
/// server holds it behind a lock) and perform the probe pings that the
/// [`Insert::Pending`] outcome asks for.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(Prefix::ALL, Instant::now())],
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.prefix.covers(id))
            .expect("buckets tile the id space")
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.buckets[self.bucket_index(id)]
            .nodes
            .iter()
            .find(|n| n.id == *id)
    }

    /// Inserts or refreshes a node we just heard from.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) -> Insert {
        if id == self.local_id {
            return Insert::Ignored;
        }
        loop {
            let idx = self.bucket_index(&id);
            let now = Instant::now();
            {
                let bucket = &mut self.buckets[idx];
                if let Some(rec) = bucket.nodes.iter_mut().find(|n| n.id == id) {
                    rec.addr = addr;
                    bucket.last_changed = now;
                    return Insert::Updated;
                }
                if bucket.nodes.len() < K {
                    bucket.nodes.push(NodeRecord::new(id, addr));
                    bucket.last_changed = now;
                    return Insert::Added;
                }
            }

            if self.buckets[idx].prefix.covers(&self.local_id) && self.split_bucket(idx) {
                continue;
            }

            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket
                .nodes
                .iter()
                .position(|n| n.status_at(now) == NodeStatus::Bad)
            {
                bucket.nodes[pos] = NodeRecord::new(id, addr);
                bucket.last_changed = now;
                return Insert::Added;
            }

            let probe = bucket
                .nodes
                .iter()
                .filter(|n| n.status_at(now) == NodeStatus::Questionable)
                .min_by_key(|n| n.last_heard())
                .cloned();
            return match probe {
                Some(probe) => Insert::Pending { probe },
                None => Insert::Ignored,
            };
        }
    }

    fn split_bucket(&mut self, idx: usize) -> bool {
        let Some((lo, hi)) = self.buckets[idx].prefix.split() else {
            return false;
        };
        let old = self.buckets.remove(idx);
        let mut lower = Bucket::new(lo, old.last_changed);
        let mut upper = Bucket::new(hi, old.last_changed);
        for node in old.nodes {
            if upper.prefix.covers(&node.id) {
                upper.nodes.push(node);
            } else {
                lower.nodes.push(node);
            }
        }
        // lower sorts before upper, keeping the tiling in ID order
        self.buckets.insert(idx, upper);
        self.buckets.insert(idx, lower);
        true
    }

    /// Settles an [`Insert::Pending`] probe that went unanswered:
    /// swaps the silent node for the newcomer unless it has come back
    /// good in the meantime.
    pub fn replace(&mut self, silent: &NodeId, id: NodeId, addr: SocketAddr) -> bool {
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.nodes.iter().position(|n| n.id == *silent) else {
            return false;
        };
        if bucket.nodes[pos].status() == NodeStatus::Good {
            return false;
        }
        bucket.nodes[pos] = NodeRecord::new(id, addr);
        bucket.last_changed = Instant::now();
        true
    }

    /// Feeds a liveness event into the node's record, if known.
    pub fn touch(&mut self, id: &NodeId, event: NodeEvent) {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        if let Some(rec) = bucket.nodes.iter_mut().find(|n| n.id == *id) {
            rec.record(event);
            if matches!(event, NodeEvent::QueryReceived | NodeEvent::ResponseReceived) {
                bucket.last_changed = Instant::now();
            }
        }
    }

    /// Up to `n` non-bad nodes sorted ascending by distance to
    /// `target`, drawn from the target's bucket outward.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        let now = Instant::now();
        let center = self.bucket_index(target);

        let mut order = vec![center];
        for step in 1..self.buckets.len() {
            if let Some(below) = center.checked_sub(step) {
                order.push(below);
            }
            if center + step < self.buckets.len() {
                order.push(center + step);
            }
        }

        let mut picked: Vec<&NodeRecord> = Vec::new();
        for idx in order {
            if picked.len() >= n {
                break;
            }
            picked.extend(
                self.buckets[idx]
                    .nodes
                    .iter()
                    .filter(|r| r.status_at(now) != NodeStatus::Bad),
            );
        }

        picked.sort_by(|a, b| {
            target
                .distance(&a.id)
                .cmp(&target.distance(&b.id))
                .then_with(|| status_rank(a.status_at(now)).cmp(&status_rank(b.status_at(now))))
                .then_with(|| a.failed_queries().cmp(&b.failed_queries()))
                .then_with(|| a.id.cmp(&b.id))
        });
        picked.truncate(n);
        picked.into_iter().cloned().collect()
    }

    /// Random lookup targets, one per bucket unchanged for 15 minutes.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        let now = Instant::now();
        self.buckets
            .iter()
            .filter(|b| now.saturating_duration_since(b.last_changed) >= STALE_AFTER)
            .map(|b| b.prefix.random_id())
            .collect()
    }
}

fn status_rank(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Good => 0,
        NodeStatus::Questionable => 1,
        NodeStatus::Bad => 2,
    }
}
