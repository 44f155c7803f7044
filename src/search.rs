//! Iterative α-parallel lookups.
//!
//! A lookup keeps a shortlist of the closest known candidates, holds at
//! most [`ALPHA`] queries in flight, and converges once no unqueried
//! candidate is closer than the K-th best responder. A `get_peers`
//! lookup can finish with an announce round to the closest responders
//! that handed out tokens.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::id::{Distance, NodeId};
use crate::krpc::{make_tid, Body, Message, TransactionId};
use crate::node::{Contact, NodeEvent};
use crate::routing::K;
use crate::server::{Family, Inner};

/// Lookup parallelism.
pub const ALPHA: usize = 3;

/// Overall wall-clock budget for one lookup.
const SEARCH_BUDGET: Duration = Duration::from_secs(120);

/// Shortlist capacity: the closest candidates worth keeping.
const SHORTLIST_LIMIT: usize = K;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchKind {
    FindNode,
    GetPeers,
}

/// How to fill the port field of the closing announce.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AnnouncePort {
    /// `implied_port 1`: responders use our observed source port.
    Implied,
    Fixed(u16),
}

pub(crate) struct SearchConfig {
    pub kind: SearchKind,
    pub target: NodeId,
    pub announce: Option<AnnouncePort>,
}

#[derive(Debug, Default)]
pub(crate) struct SearchOutcome {
    pub queried: usize,
    pub peers_found: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    Pending,
    Responded,
}

#[derive(Debug)]
struct Candidate {
    /// Unknown for bootstrap seeds until they respond.
    id: Option<NodeId>,
    addr: SocketAddr,
    state: CandidateState,
    token: Option<Bytes>,
}

/// The candidate set of one lookup.
///
/// Holds the [`SHORTLIST_LIMIT`] closest known candidates plus whatever
/// is in flight; failed candidates are dropped but stay in the seen
/// sets so they are never re-queried.
pub(crate) struct Shortlist {
    target: NodeId,
    local_id: NodeId,
    entries: Vec<Candidate>,
    seen_ids: HashSet<NodeId>,
    seen_addrs: HashSet<SocketAddr>,
}

impl Shortlist {
    pub(crate) fn new(
        target: NodeId,
        local_id: NodeId,
        seeds: impl IntoIterator<Item = (Option<NodeId>, SocketAddr)>,
    ) -> Self {
        let mut shortlist = Self {
            target,
            local_id,
            entries: Vec::new(),
            seen_ids: HashSet::new(),
            seen_addrs: HashSet::new(),
        };
        for (id, addr) in seeds {
            match id {
                Some(id) => shortlist.insert(Contact::new(id, addr)),
                None => {
                    if shortlist.seen_addrs.insert(addr) {
                        shortlist.entries.push(Candidate {
                            id: None,
                            addr,
                            state: CandidateState::Fresh,
                            token: None,
                        });
                    }
                }
            }
        }
        shortlist
    }

    /// Merges a referred contact; duplicates and our own ID are ignored
    /// and anything farther than the K'-th best is shed again.
    pub(crate) fn insert(&mut self, contact: Contact) {
        if contact.id == self.local_id {
            return;
        }
        if !self.seen_ids.insert(contact.id) {
            return;
        }
        if !self.seen_addrs.insert(contact.addr) {
            return;
        }
        self.entries.push(Candidate {
            id: Some(contact.id),
            addr: contact.addr,
            state: CandidateState::Fresh,
            token: None,
        });
        self.shed();
    }

    fn shed(&mut self) {
        let target = self.target;
        loop {
            let fresh = self
                .entries
                .iter()
                .filter(|c| c.state == CandidateState::Fresh && c.id.is_some())
                .count();
            if fresh <= SHORTLIST_LIMIT {
                return;
            }
            let farthest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, c)| c.state == CandidateState::Fresh)
                .filter_map(|(i, c)| c.id.map(|id| (i, target.distance(&id))))
                .max_by_key(|(_, d)| *d);
            match farthest {
                Some((idx, _)) => {
                    self.entries.remove(idx);
                }
                None => return,
            }
        }
    }

    /// Closest eligible fresh candidate, flipped to pending.
    ///
    /// Unknown-ID seeds are always eligible and go first; a known
    /// candidate is eligible while fewer than K nodes responded or its
    /// distance beats the K-th best responder.
    pub(crate) fn next_candidate(&mut self) -> Option<(Option<NodeId>, SocketAddr)> {
        if let Some(c) = self
            .entries
            .iter_mut()
            .find(|c| c.state == CandidateState::Fresh && c.id.is_none())
        {
            c.state = CandidateState::Pending;
            return Some((None, c.addr));
        }

        let target = self.target;
        let (idx, dist) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state == CandidateState::Fresh)
            .filter_map(|(i, c)| c.id.map(|id| (i, target.distance(&id))))
            .min_by_key(|(_, d)| *d)?;

        if let Some(kth) = self.kth_responded_distance() {
            if dist >= kth {
                return None;
            }
        }
        let c = &mut self.entries[idx];
        c.state = CandidateState::Pending;
        Some((c.id, c.addr))
    }

    pub(crate) fn mark_responded(&mut self, addr: SocketAddr, id: NodeId, token: Option<Bytes>) {
        self.seen_ids.insert(id);
        if let Some(c) = self.entries.iter_mut().find(|c| c.addr == addr) {
            c.state = CandidateState::Responded;
            c.id = Some(id);
            if token.is_some() {
                c.token = token;
            }
        }
    }

    pub(crate) fn mark_failed(&mut self, addr: SocketAddr) {
        self.entries.retain(|c| c.addr != addr);
    }

    /// Up to `n` closest responders that handed out an announce token.
    pub(crate) fn closest_responded_with_token(
        &self,
        n: usize,
    ) -> Vec<(NodeId, SocketAddr, Bytes)> {
        let target = self.target;
        let mut responded: Vec<_> = self
            .entries
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| {
                let id = c.id?;
                let token = c.token.clone()?;
                Some((target.distance(&id), id, c.addr, token))
            })
            .collect();
        responded.sort_by(|a, b| a.0.cmp(&b.0));
        responded
            .into_iter()
            .take(n)
            .map(|(_, id, addr, token)| (id, addr, token))
            .collect()
    }

    fn kth_responded_distance(&self) -> Option<Distance> {
        let target = self.target;
        let mut dists: Vec<Distance> = self
            .entries
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.id.map(|id| target.distance(&id)))
            .collect();
        if dists.len() < SHORTLIST_LIMIT {
            return None;
        }
        dists.sort_unstable();
        Some(dists[SHORTLIST_LIMIT - 1])
    }
}

/// Drives one lookup on one address family to convergence, the budget
/// ceiling, or exhaustion, then runs the optional announce round.
pub(crate) async fn run<F>(
    inner: Arc<Inner>,
    family: Family,
    config: SearchConfig,
    seeds: Vec<(Option<NodeId>, SocketAddr)>,
    mut on_peer: F,
) -> SearchOutcome
where
    F: FnMut(SocketAddr),
{
    let local_id = inner.local_id();
    let tag = inner.next_search_tag();
    let mut seq: u16 = 0;
    let mut shortlist = Shortlist::new(config.target, local_id, seeds);
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
    let mut outcome = SearchOutcome::default();
    let mut timed_out = false;
    let mut inflight = FuturesUnordered::new();

    let budget = tokio::time::sleep(SEARCH_BUDGET);
    tokio::pin!(budget);

    loop {
        while inflight.len() < ALPHA {
            let Some((id, addr)) = shortlist.next_candidate() else {
                break;
            };
            let body = match config.kind {
                SearchKind::FindNode => Body::FindNode {
                    id: local_id,
                    target: config.target,
                },
                SearchKind::GetPeers => Body::GetPeers {
                    id: local_id,
                    info_hash: config.target.0,
                },
            };
            let tid = make_tid(tag, seq);
            seq = seq.wrapping_add(1);
            outcome.queried += 1;
            if let Some(id) = &id {
                inner.touch(family, id, NodeEvent::QuerySent);
            }
            inflight.push(issue(inner.clone(), family, addr, id, body, tid));
        }
        if inflight.is_empty() {
            break;
        }

        tokio::select! {
            _ = &mut budget => {
                debug!(lookup = %config.target, "lookup budget exhausted");
                timed_out = true;
                break;
            }
            Some((addr, id, result)) = inflight.next() => match result {
                Ok(msg) => absorb_reply(
                    family,
                    &config,
                    &mut shortlist,
                    &mut seen_peers,
                    &mut outcome,
                    &mut on_peer,
                    addr,
                    msg,
                ),
                Err(err) => {
                    trace!(%addr, error = %err, "lookup query failed");
                    if let Some(id) = &id {
                        inner.touch(family, id, NodeEvent::QueryTimeout);
                    }
                    shortlist.mark_failed(addr);
                }
            },
        }
    }

    if !timed_out && config.kind == SearchKind::GetPeers {
        if let Some(port) = config.announce {
            announce(&inner, family, &config, &shortlist, port, tag, &mut seq).await;
        }
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
fn absorb_reply<F>(
    family: Family,
    config: &SearchConfig,
    shortlist: &mut Shortlist,
    seen_peers: &mut HashSet<SocketAddr>,
    outcome: &mut SearchOutcome,
    on_peer: &mut F,
    addr: SocketAddr,
    msg: Message,
) where
    F: FnMut(SocketAddr),
{
    match msg.body {
        Body::FindNodeReply { id, nodes, nodes6 } => {
            // a find_node-shaped reply to a get_peers lookup is fine:
            // it just carries no token, so the announce skips this node
            shortlist.mark_responded(addr, id, None);
            merge_contacts(shortlist, family, nodes, nodes6);
        }
        Body::GetPeersReply {
            id,
            token,
            values,
            nodes,
            nodes6,
        } => {
            shortlist.mark_responded(addr, id, token);
            merge_contacts(shortlist, family, nodes, nodes6);
            if config.kind == SearchKind::GetPeers {
                for peer in values.into_iter().filter(|p| family.matches(p)) {
                    if seen_peers.insert(peer) {
                        outcome.peers_found += 1;
                        on_peer(peer);
                    }
                }
            }
        }
        Body::PingReply { id } => {
            shortlist.mark_responded(addr, id, None);
        }
        Body::ErrorReply { code, message } => {
            debug!(%addr, code, %message, "error reply during lookup");
            shortlist.mark_failed(addr);
        }
        // queries cannot arrive through the pending-transaction map
        _ => {}
    }
}

fn merge_contacts(
    shortlist: &mut Shortlist,
    family: Family,
    nodes: Vec<Contact>,
    nodes6: Vec<Contact>,
) {
    let referred = match family {
        Family::V4 => nodes,
        Family::V6 => nodes6,
    };
    for contact in referred.into_iter().filter(|c| family.matches(&c.addr)) {
        shortlist.insert(contact);
    }
}

async fn announce(
    inner: &Arc<Inner>,
    family: Family,
    config: &SearchConfig,
    shortlist: &Shortlist,
    port: AnnouncePort,
    tag: u16,
    seq: &mut u16,
) {
    let (port, implied_port) = match port {
        AnnouncePort::Implied => (inner.port(), true),
        AnnouncePort::Fixed(p) => (p, false),
    };
    let targets = shortlist.closest_responded_with_token(K);
    debug!(
        lookup = %config.target,
        count = targets.len(),
        "announcing to closest responders"
    );
    for (_, addr, token) in targets {
        let tid: TransactionId = make_tid(tag, *seq);
        *seq = seq.wrapping_add(1);
        let msg = Message {
            tid,
            external_ip: None,
            body: Body::AnnouncePeer {
                id: inner.local_id(),
                info_hash: config.target.0,
                port,
                token,
                implied_port,
            },
        };
        // fire and forget: announce replies are not awaited
        inner.send_oneway(family, addr, &msg).await;
    }
}

async fn issue(
    inner: Arc<Inner>,
    family: Family,
    addr: SocketAddr,
    id: Option<NodeId>,
    body: Body,
    tid: TransactionId,
) -> (SocketAddr, Option<NodeId>, Result<Message, DhtError>) {
    let result = inner.query(family, addr, body, tid).await;
    (addr, id, result)
}
