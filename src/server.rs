//! The DHT server: sockets, datagram dispatch, timers, and the public
//! lookup API.
//!
//! One task owns the receive side of both sockets and the three
//! periodic timers (secret rotation, bucket refresh, store prune).
//! Outbound queries are correlated to replies through the transaction
//! id; each lookup runs as its own task and owns its state.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::id::NodeId;
use crate::krpc::{make_tid, Body, Message, TransactionId};
use crate::node::{Contact, NodeEvent, NodeRecord};
use crate::routing::{Insert, RoutingTable, K};
use crate::search::{self, AnnouncePort, SearchConfig, SearchKind};
use crate::security::{self, AddressVotes};
use crate::store::{AnnounceStore, TokenSecrets};

/// Deadline for a single outbound query.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// In-flight queries the server will track at once.
const MAX_PENDING_QUERIES: usize = 1024;

const SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const STORE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const RECV_BUFFER_LEN: usize = 65535;

/// KRPC protocol error for a bad announce token.
const ERR_BAD_TOKEN: i64 = 203;

/// Address family of a socket and its routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

struct FamilyState {
    socket: Arc<UdpSocket>,
    table: RwLock<RoutingTable>,
}

pub(crate) struct Inner {
    id: RwLock<NodeId>,
    port: u16,
    config: DhtConfig,
    v4: Option<FamilyState>,
    v6: Option<FamilyState>,
    pending: RwLock<HashMap<TransactionId, mpsc::Sender<Message>>>,
    secrets: RwLock<TokenSecrets>,
    store: RwLock<AnnounceStore>,
    /// Nodes currently being probed for eviction.
    probes: Mutex<HashSet<NodeId>>,
    votes: Mutex<AddressVotes>,
    next_tag: AtomicU16,
    server_seq: AtomicU16,
}

/// A Mainline DHT node.
///
/// Binds one UDP socket per enabled address family and keeps an
/// independent routing table for each. Clones share the same node.
///
/// # Examples
///
/// ```no_run
/// use rdht::{DhtConfig, DhtServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(DhtConfig::default()).await?;
///
/// let runner = dht.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// dht.bootstrap().await;
///
/// let info_hash = [0u8; 20]; // the torrent you are looking for
/// dht.search(info_hash, |peer| println!("found peer {peer}")).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DhtServer {
    inner: Arc<Inner>,
}

impl DhtServer {
    /// Binds the configured sockets and picks a random node ID.
    ///
    /// Fails when no address family is enabled or a socket cannot be
    /// bound.
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        config.validate()?;
        let id = NodeId::random();

        let v4 = if config.ipv4 {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
            Some(FamilyState {
                socket: Arc::new(socket),
                table: RwLock::new(RoutingTable::new(id)),
            })
        } else {
            None
        };
        let v6 = if config.ipv6 {
            let socket = bind_v6_only(config.port)?;
            Some(FamilyState {
                socket: Arc::new(socket),
                table: RwLock::new(RoutingTable::new(id)),
            })
        } else {
            None
        };

        let port = match (&v4, &v6) {
            (Some(state), _) | (_, Some(state)) => state.socket.local_addr()?.port(),
            _ => unreachable!("validate guarantees an enabled family"),
        };
        info!(%id, port, "dht node bound");

        Ok(Self {
            inner: Arc::new(Inner {
                id: RwLock::new(id),
                port,
                config,
                v4,
                v6,
                pending: RwLock::new(HashMap::new()),
                secrets: RwLock::new(TokenSecrets::new()),
                store: RwLock::new(AnnounceStore::new()),
                probes: Mutex::new(HashSet::new()),
                votes: Mutex::new(AddressVotes::new()),
                next_tag: AtomicU16::new(1),
                server_seq: AtomicU16::new(0),
            }),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id()
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Nodes across both routing tables.
    pub fn node_count(&self) -> usize {
        [Family::V4, Family::V6]
            .iter()
            .filter_map(|f| self.inner.family(*f))
            .map(|st| st.table.read().node_count())
            .sum()
    }

    /// Our external address, once enough peers agree on it.
    pub fn external_ip(&self) -> Option<IpAddr> {
        self.inner.votes.lock().confirmed()
    }

    /// Serves queries and routes replies until a socket fails.
    ///
    /// Dropping the future (or closing the sockets) cancels every
    /// lookup still in flight.
    pub async fn run(&self) -> Result<(), DhtError> {
        let inner = &self.inner;
        let mut buf4 = vec![0u8; RECV_BUFFER_LEN];
        let mut buf6 = vec![0u8; RECV_BUFFER_LEN];

        let mut rotate = tokio::time::interval(SECRET_ROTATION_INTERVAL);
        let mut refresh = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
        let mut prune = tokio::time::interval(STORE_PRUNE_INTERVAL);
        for interval in [&mut rotate, &mut refresh, &mut prune] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.reset();
        }

        loop {
            tokio::select! {
                result = recv_on(inner.v4.as_ref(), &mut buf4) => {
                    let (len, src) = result?;
                    Inner::handle_datagram(inner, Family::V4, &buf4[..len], src).await;
                }
                result = recv_on(inner.v6.as_ref(), &mut buf6) => {
                    let (len, src) = result?;
                    Inner::handle_datagram(inner, Family::V6, &buf6[..len], src).await;
                }
                _ = rotate.tick() => {
                    inner.secrets.write().rotate();
                    debug!("announce token secret rotated");
                }
                _ = refresh.tick() => Inner::spawn_refreshes(inner),
                _ = prune.tick() => inner.store.write().prune(),
            }
        }
    }

    /// Populates the routing tables from the configured bootstrap
    /// nodes. Idempotent: calling it again restarts the bootstrap
    /// search on top of whatever the tables already hold.
    pub async fn bootstrap(&self) {
        Inner::bootstrap(&self.inner).await;
    }

    /// Looks up peers for `info_hash`, invoking `on_peer` for each one
    /// discovered, and returns once the lookups converge or exhaust
    /// their budget.
    pub async fn search<F>(&self, info_hash: [u8; 20], on_peer: F)
    where
        F: FnMut(SocketAddr),
    {
        self.lookup(info_hash, None, on_peer).await;
    }

    /// Like [`search`](Self::search), then announces us as a peer for
    /// `info_hash` to the closest responders. `port: None` announces
    /// with `implied_port`, letting responders record our observed
    /// source port (the right choice behind NAT).
    pub async fn search_announce<F>(&self, info_hash: [u8; 20], port: Option<u16>, on_peer: F)
    where
        F: FnMut(SocketAddr),
    {
        let announce = Some(port.map_or(AnnouncePort::Implied, AnnouncePort::Fixed));
        self.lookup(info_hash, announce, on_peer).await;
    }

    /// Convenience collector over [`search`](Self::search).
    pub async fn get_peers(&self, info_hash: [u8; 20]) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        self.search(info_hash, |peer| peers.push(peer)).await;
        peers
    }

    async fn lookup<F>(&self, info_hash: [u8; 20], announce: Option<AnnouncePort>, mut on_peer: F)
    where
        F: FnMut(SocketAddr),
    {
        let target = NodeId(info_hash);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut jobs = Vec::new();
        for family in [Family::V4, Family::V6] {
            if self.inner.family(family).is_none() {
                continue;
            }
            let seeds = self.inner.closest_seeds(family, &target);
            if seeds.is_empty() {
                debug!(?family, "lookup has no seeds");
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let tx = tx.clone();
            jobs.push(tokio::spawn(async move {
                let config = SearchConfig {
                    kind: SearchKind::GetPeers,
                    target,
                    announce,
                };
                let outcome = search::run(inner, family, config, seeds, move |peer| {
                    let _ = tx.send(peer);
                })
                .await;
                debug!(
                    ?family,
                    queried = outcome.queried,
                    peers = outcome.peers_found,
                    "lookup finished"
                );
            }));
        }
        drop(tx);

        // peers arrive interleaved across families, in discovery order
        while let Some(peer) = rx.recv().await {
            on_peer(peer);
        }
        for job in jobs {
            let _ = job.await;
        }
    }
}

impl Inner {
    pub(crate) fn local_id(&self) -> NodeId {
        *self.id.read()
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    fn family(&self, family: Family) -> Option<&FamilyState> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    /// Tag 0 belongs to the server; lookups get the rest.
    pub(crate) fn next_search_tag(&self) -> u16 {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != 0 {
                return tag;
            }
        }
    }

    fn server_tid(&self) -> TransactionId {
        make_tid(0, self.server_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn touch(&self, family: Family, id: &NodeId, event: NodeEvent) {
        if let Some(state) = self.family(family) {
            state.table.write().touch(id, event);
        }
    }

    /// Sends without tracking a reply.
    pub(crate) async fn send_oneway(&self, family: Family, addr: SocketAddr, msg: &Message) {
        if let Some(state) = self.family(family) {
            if let Err(err) = state.socket.send_to(&msg.encode(), addr).await {
                trace!(%addr, error = %err, "send failed");
            }
        }
    }

    /// Sends a query and awaits its reply via the transaction map.
    pub(crate) async fn query(
        &self,
        family: Family,
        addr: SocketAddr,
        body: Body,
        tid: TransactionId,
    ) -> Result<Message, DhtError> {
        let state = self
            .family(family)
            .ok_or(DhtError::Config("address family not enabled"))?;

        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut pending = self.pending.write();
            if pending.len() >= MAX_PENDING_QUERIES {
                return Err(DhtError::RateLimited);
            }
            pending.insert(tid.clone(), tx);
        }

        let msg = Message {
            tid: tid.clone(),
            external_ip: None,
            body,
        };
        let result = async {
            state.socket.send_to(&msg.encode(), addr).await?;
            match timeout(QUERY_TIMEOUT, rx.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                _ => Err(DhtError::Timeout),
            }
        }
        .await;
        self.pending.write().remove(&tid);
        result
    }

    async fn handle_datagram(inner: &Arc<Inner>, family: Family, data: &[u8], src: SocketAddr) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                // no reply either: answering junk invites amplification
                debug!(%src, error = %err, "dropping malformed datagram");
                return;
            }
        };

        if let Some(id) = msg.body.sender_id() {
            let event = if msg.body.is_query() {
                NodeEvent::QueryReceived
            } else {
                NodeEvent::ResponseReceived
            };
            Inner::note_seen(inner, family, id, src, event);
        }

        if msg.body.is_query() {
            inner.answer_query(family, msg.tid, src, msg.body).await;
            return;
        }

        // only solicited traffic gets a say on our external address
        if let Some(observed) = msg.external_ip {
            Inner::vote_external(inner, observed.ip(), src.ip());
        }
        if let Body::ErrorReply { code, ref message } = msg.body {
            debug!(%src, code, message = %message, "error reply");
        }
        inner.route_reply(msg);
    }

    /// Inserts or refreshes the sender in its family's table, kicking
    /// off an eviction probe when its bucket is full.
    pub(crate) fn note_seen(
        inner: &Arc<Inner>,
        family: Family,
        id: NodeId,
        addr: SocketAddr,
        event: NodeEvent,
    ) {
        if !family.matches(&addr) {
            return;
        }
        let Some(state) = inner.family(family) else {
            return;
        };
        let probe = {
            let mut table = state.table.write();
            let outcome = table.insert(id, addr);
            table.touch(&id, event);
            match outcome {
                Insert::Pending { probe } => Some(probe),
                _ => None,
            }
        };
        if let Some(probe) = probe {
            Inner::spawn_probe(inner, family, probe, Contact::new(id, addr));
        }
    }

    /// Pings the least-recently-heard questionable occupant of a full
    /// bucket; silence gets it replaced by the newcomer.
    fn spawn_probe(inner: &Arc<Inner>, family: Family, probe: NodeRecord, newcomer: Contact) {
        if !inner.probes.lock().insert(probe.id) {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let tid = inner.server_tid();
            inner.touch(family, &probe.id, NodeEvent::QuerySent);
            let ping = Body::Ping {
                id: inner.local_id(),
            };
            if inner.query(family, probe.addr, ping, tid).await.is_err() {
                inner.touch(family, &probe.id, NodeEvent::QueryTimeout);
                if let Some(state) = inner.family(family) {
                    if state
                        .table
                        .write()
                        .replace(&probe.id, newcomer.id, newcomer.addr)
                    {
                        debug!(old = %probe.id, new = %newcomer.id, "replaced unresponsive node");
                    }
                }
            }
            inner.probes.lock().remove(&probe.id);
        });
    }

    async fn answer_query(&self, family: Family, tid: TransactionId, src: SocketAddr, body: Body) {
        let reply = match body {
            Body::Ping { .. } => Body::PingReply {
                id: self.local_id(),
            },
            Body::FindNode { target, .. } => {
                let contacts = self.closest_contacts(family, &target);
                let (nodes, nodes6) = split_by_family(family, contacts);
                Body::FindNodeReply {
                    id: self.local_id(),
                    nodes,
                    nodes6,
                }
            }
            Body::GetPeers { info_hash, .. } => {
                let token = self.secrets.read().mint(&src);
                let peers: Vec<SocketAddr> = self
                    .store
                    .write()
                    .get(&info_hash)
                    .into_iter()
                    .filter(|p| family.matches(p))
                    .collect();
                if peers.is_empty() {
                    let contacts = self.closest_contacts(family, &NodeId(info_hash));
                    let (nodes, nodes6) = split_by_family(family, contacts);
                    Body::GetPeersReply {
                        id: self.local_id(),
                        token: Some(token),
                        values: Vec::new(),
                        nodes,
                        nodes6,
                    }
                } else {
                    Body::GetPeersReply {
                        id: self.local_id(),
                        token: Some(token),
                        values: peers,
                        nodes: Vec::new(),
                        nodes6: Vec::new(),
                    }
                }
            }
            Body::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                if self.secrets.read().validate(&src, &token) {
                    let peer_port = if implied_port { src.port() } else { port };
                    let peer = SocketAddr::new(src.ip(), peer_port);
                    self.store.write().put(info_hash, peer);
                    debug!(%peer, "stored announced peer");
                    Body::PingReply {
                        id: self.local_id(),
                    }
                } else {
                    debug!(%src, "announce with wrong token");
                    Body::ErrorReply {
                        code: ERR_BAD_TOKEN,
                        message: "Announce_peer with wrong token".into(),
                    }
                }
            }
            _ => return,
        };

        let msg = Message {
            tid,
            external_ip: Some(src),
            body: reply,
        };
        self.send_oneway(family, src, &msg).await;
    }

    fn route_reply(&self, msg: Message) {
        let sender = self.pending.read().get(&msg.tid).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.try_send(msg);
            }
            None => trace!("reply with unknown transaction id dropped"),
        }
    }

    fn closest_contacts(&self, family: Family, target: &NodeId) -> Vec<Contact> {
        self.family(family)
            .map(|state| {
                state
                    .table
                    .read()
                    .closest(target, K)
                    .iter()
                    .map(NodeRecord::contact)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn closest_seeds(
        &self,
        family: Family,
        target: &NodeId,
    ) -> Vec<(Option<NodeId>, SocketAddr)> {
        self.family(family)
            .map(|state| {
                state
                    .table
                    .read()
                    .closest(target, K)
                    .into_iter()
                    .map(|rec| (Some(rec.id), rec.addr))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn resolve_bootstrap_seeds(&self, family: Family) -> Vec<(Option<NodeId>, SocketAddr)> {
        let mut seeds = Vec::new();
        for entry in &self.config.bootstrap_nodes {
            match tokio::net::lookup_host((entry.host.as_str(), entry.port)).await {
                Ok(addrs) => {
                    seeds.extend(addrs.filter(|a| family.matches(a)).map(|a| (entry.id, a)));
                }
                Err(err) => {
                    warn!(host = %entry.host, error = %err, "skipping unresolvable bootstrap node");
                }
            }
        }
        // a restart also reuses whatever the table already holds
        let local = self.local_id();
        seeds.extend(self.closest_seeds(family, &local));
        seeds
    }

    pub(crate) async fn bootstrap(inner: &Arc<Inner>) {
        let mut jobs = Vec::new();
        for family in [Family::V4, Family::V6] {
            if inner.family(family).is_none() {
                continue;
            }
            let inner = Arc::clone(inner);
            jobs.push(async move {
                let seeds = inner.resolve_bootstrap_seeds(family).await;
                if seeds.is_empty() {
                    warn!(?family, "bootstrap has no reachable seeds");
                    return;
                }
                let config = SearchConfig {
                    kind: SearchKind::FindNode,
                    target: inner.local_id(),
                    announce: None,
                };
                let outcome = search::run(Arc::clone(&inner), family, config, seeds, |_| {}).await;
                let nodes = inner
                    .family(family)
                    .map(|st| st.table.read().node_count())
                    .unwrap_or(0);
                info!(?family, queried = outcome.queried, nodes, "bootstrap finished");
            });
        }
        futures::future::join_all(jobs).await;
    }

    /// One find_node lookup per stale bucket, off the receive path.
    fn spawn_refreshes(inner: &Arc<Inner>) {
        for family in [Family::V4, Family::V6] {
            let Some(state) = inner.family(family) else {
                continue;
            };
            let targets = state.table.read().refresh_targets();
            if targets.is_empty() {
                continue;
            }
            debug!(?family, count = targets.len(), "refreshing stale buckets");
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                for target in targets {
                    let seeds = inner.closest_seeds(family, &target);
                    if seeds.is_empty() {
                        continue;
                    }
                    let config = SearchConfig {
                        kind: SearchKind::FindNode,
                        target,
                        announce: None,
                    };
                    search::run(Arc::clone(&inner), family, config, seeds, |_| {}).await;
                }
            });
        }
    }

    /// A confirmed external address we do not conform to triggers a
    /// BEP-42 identity change and a fresh bootstrap.
    fn vote_external(inner: &Arc<Inner>, observed: IpAddr, voter: IpAddr) {
        let Some(ip) = inner.votes.lock().vote(observed, voter) else {
            return;
        };
        info!(%ip, "external address confirmed by peers");
        if security::is_exempt(&ip) || security::id_matches_ip(&inner.local_id(), ip) {
            return;
        }
        let new_id = security::node_id_for_ip(ip);
        info!(old = %inner.local_id(), new = %new_id, "adopting ip-bound node id");
        *inner.id.write() = new_id;
        for family in [Family::V4, Family::V6] {
            if let Some(state) = inner.family(family) {
                *state.table.write() = RoutingTable::new(new_id);
            }
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Inner::bootstrap(&inner).await;
        });
    }
}

async fn recv_on(
    state: Option<&FamilyState>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match state {
        Some(state) => state.socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn split_by_family(family: Family, contacts: Vec<Contact>) -> (Vec<Contact>, Vec<Contact>) {
    match family {
        Family::V4 => (contacts, Vec::new()),
        Family::V6 => (Vec::new(), contacts),
    }
}

/// The v6 socket refuses v4-mapped traffic so the two overlays stay
/// independent.
fn bind_v6_only(port: u16) -> Result<UdpSocket, DhtError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn test_server() -> DhtServer {
        let config = DhtConfig {
            ipv4: true,
            ipv6: false,
            port: 0,
            bootstrap_nodes: Vec::new(),
        };
        let server = DhtServer::bind(config).await.unwrap();
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        server
    }

    fn v4_addr(server: &DhtServer) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.port())
    }

    #[tokio::test]
    async fn ping_teaches_both_sides() {
        let a = test_server().await;
        let b = test_server().await;

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::Ping { id: a.local_id() },
                a.inner.server_tid(),
            )
            .await
            .unwrap();

        assert!(matches!(reply.body, Body::PingReply { id } if id == b.local_id()));
        assert_eq!(a.node_count(), 1);
        assert_eq!(b.node_count(), 1);
    }

    #[tokio::test]
    async fn find_node_returns_known_nodes() {
        let a = test_server().await;
        let b = test_server().await;

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::FindNode {
                    id: a.local_id(),
                    target: NodeId::random(),
                },
                a.inner.server_tid(),
            )
            .await
            .unwrap();

        match reply.body {
            Body::FindNodeReply { nodes, nodes6, .. } => {
                // b learned about us from the query itself
                assert!(nodes.iter().any(|c| c.id == a.local_id()));
                assert!(nodes6.is_empty());
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn announce_then_get_peers_returns_the_peer() {
        let a = test_server().await;
        let b = test_server().await;
        let info_hash = [0xaa; 20];

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::GetPeers {
                    id: a.local_id(),
                    info_hash,
                },
                a.inner.server_tid(),
            )
            .await
            .unwrap();
        let token = match reply.body {
            Body::GetPeersReply {
                token: Some(token),
                values,
                ..
            } => {
                assert!(values.is_empty());
                token
            }
            other => panic!("wrong reply: {other:?}"),
        };

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::AnnouncePeer {
                    id: a.local_id(),
                    info_hash,
                    port: 7777,
                    token,
                    implied_port: false,
                },
                a.inner.server_tid(),
            )
            .await
            .unwrap();
        assert!(matches!(reply.body, Body::PingReply { .. }));

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::GetPeers {
                    id: a.local_id(),
                    info_hash,
                },
                a.inner.server_tid(),
            )
            .await
            .unwrap();
        match reply.body {
            Body::GetPeersReply { values, .. } => {
                assert_eq!(values, vec!["127.0.0.1:7777".parse().unwrap()]);
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_with_203() {
        let a = test_server().await;
        let b = test_server().await;
        let info_hash = [0xbb; 20];

        let reply = a
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::AnnouncePeer {
                    id: a.local_id(),
                    info_hash,
                    port: 7777,
                    token: Bytes::from_static(b"bogus"),
                    implied_port: false,
                },
                a.inner.server_tid(),
            )
            .await
            .unwrap();

        match reply.body {
            Body::ErrorReply { code, .. } => assert_eq!(code, ERR_BAD_TOKEN),
            other => panic!("wrong reply: {other:?}"),
        }
        assert!(!b.inner.store.write().has_peers(&info_hash));
    }

    #[tokio::test]
    async fn search_finds_an_announced_peer() {
        let a = test_server().await;
        let b = test_server().await;
        let c = test_server().await;
        let info_hash = [0xcc; 20];

        // c announces itself to b
        let reply = c
            .inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::GetPeers {
                    id: c.local_id(),
                    info_hash,
                },
                c.inner.server_tid(),
            )
            .await
            .unwrap();
        let token = match reply.body {
            Body::GetPeersReply { token: Some(t), .. } => t,
            other => panic!("wrong reply: {other:?}"),
        };
        c.inner
            .query(
                Family::V4,
                v4_addr(&b),
                Body::AnnouncePeer {
                    id: c.local_id(),
                    info_hash,
                    port: 9999,
                    token,
                    implied_port: false,
                },
                c.inner.server_tid(),
            )
            .await
            .unwrap();

        // a only knows b; the lookup must route through it
        Inner::note_seen(
            &a.inner,
            Family::V4,
            b.local_id(),
            v4_addr(&b),
            NodeEvent::ResponseReceived,
        );

        let peers = a.get_peers(info_hash).await;
        assert_eq!(peers, vec!["127.0.0.1:9999".parse().unwrap()]);
    }

    #[tokio::test]
    async fn search_on_unknown_infohash_finds_nothing_and_terminates() {
        let a = test_server().await;
        let b = test_server().await;
        Inner::note_seen(
            &a.inner,
            Family::V4,
            b.local_id(),
            v4_addr(&b),
            NodeEvent::ResponseReceived,
        );

        let mut fired = 0usize;
        let done = tokio::time::timeout(
            Duration::from_secs(30),
            a.search([0xdd; 20], |_| fired += 1),
        )
        .await;
        assert!(done.is_ok(), "search did not terminate");
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn search_announce_registers_us_with_the_responder() {
        let a = test_server().await;
        let b = test_server().await;
        let info_hash = [0xee; 20];
        Inner::note_seen(
            &a.inner,
            Family::V4,
            b.local_id(),
            v4_addr(&b),
            NodeEvent::ResponseReceived,
        );

        a.search_announce(info_hash, Some(4321), |_| {}).await;

        // the announce is fire-and-forget; give it a moment to land
        let mut stored = false;
        for _ in 0..50 {
            if b.inner.store.write().has_peers(&info_hash) {
                stored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(stored, "announce never reached the responder");
        assert_eq!(
            b.inner.store.write().get(&info_hash),
            vec!["127.0.0.1:4321".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn bootstrap_populates_the_table_from_a_seed() {
        let seed = test_server().await;
        let config = DhtConfig {
            ipv4: true,
            ipv6: false,
            port: 0,
            bootstrap_nodes: vec![crate::config::BootstrapNode::new("127.0.0.1", seed.port())],
        };
        let node = DhtServer::bind(config).await.unwrap();
        let runner = node.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        node.bootstrap().await;
        assert!(node.node_count() >= 1, "bootstrap learned nothing");
        assert!(seed.node_count() >= 1, "seed never heard from us");
    }

    #[tokio::test]
    async fn unresolvable_bootstrap_hosts_are_skipped() {
        let config = DhtConfig {
            ipv4: true,
            ipv6: false,
            port: 0,
            bootstrap_nodes: vec![crate::config::BootstrapNode::new(
                "does-not-exist.invalid",
                6881,
            )],
        };
        let node = DhtServer::bind(config).await.unwrap();
        // must not hang or panic, just come back empty
        node.bootstrap().await;
        assert_eq!(node.node_count(), 0);
    }
}
