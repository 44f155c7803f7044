//! Peer-announce storage and the announce-token lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};

/// How long an announced peer stays listed.
const PEER_TTL: Duration = Duration::from_secs(30 * 60);

/// Cap per infohash so a single torrent cannot grow the map unbounded.
const MAX_PEERS_PER_INFOHASH: usize = 1000;

const SECRET_LEN: usize = 20;

/// Peers that announced themselves for each infohash.
///
/// Entries expire 30 minutes after their announce; expired entries are
/// dropped lazily on read and by the server's periodic prune.
#[derive(Debug, Default)]
pub struct AnnounceStore {
    peers: HashMap<[u8; 20], HashMap<SocketAddr, Instant>>,
}

impl AnnounceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts an announced peer; re-announcing refreshes the expiry.
    pub fn put(&mut self, info_hash: [u8; 20], addr: SocketAddr) {
        self.put_at(info_hash, addr, Instant::now());
    }

    fn put_at(&mut self, info_hash: [u8; 20], addr: SocketAddr, now: Instant) {
        let entry = self.peers.entry(info_hash).or_default();
        entry.retain(|_, expiry| *expiry > now);
        if entry.len() < MAX_PEERS_PER_INFOHASH || entry.contains_key(&addr) {
            entry.insert(addr, now + PEER_TTL);
        }
    }

    /// Live peers for an infohash.
    pub fn get(&mut self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.get_at(info_hash, Instant::now())
    }

    fn get_at(&mut self, info_hash: &[u8; 20], now: Instant) -> Vec<SocketAddr> {
        match self.peers.get_mut(info_hash) {
            Some(entry) => {
                entry.retain(|_, expiry| *expiry > now);
                entry.keys().copied().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn has_peers(&mut self, info_hash: &[u8; 20]) -> bool {
        !self.get(info_hash).is_empty()
    }

    /// Drops every expired entry and every emptied infohash.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.peers.retain(|_, entry| {
            entry.retain(|_, expiry| *expiry > now);
            !entry.is_empty()
        });
    }
}

/// The two active announce-token secrets.
///
/// Tokens are the SHA-1 of ip ∥ port ∥ secret. The current secret
/// mints; the previous one is still accepted, so a token stays valid
/// across one rotation (5–10 minutes of life).
pub struct TokenSecrets {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

impl TokenSecrets {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    /// Token tying an announce to the requester's address.
    pub fn mint(&self, addr: &SocketAddr) -> Bytes {
        hash_token(addr, &self.current)
    }

    /// Accepts tokens minted from either active secret.
    pub fn validate(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        hash_token(addr, &self.current).as_ref() == token
            || hash_token(addr, &self.previous).as_ref() == token
    }
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_token(addr: &SocketAddr, secret: &[u8; SECRET_LEN]) -> Bytes {
    let mut hasher = Sha1::new();
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());
    hasher.update(secret);
    Bytes::copy_from_slice(&hasher.finalize())
}
