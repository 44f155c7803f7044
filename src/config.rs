//! Node configuration.

use crate::error::DhtError;
use crate::id::NodeId;

/// Conventional BitTorrent DHT port.
pub const DEFAULT_PORT: u16 = 6881;

/// Well-known routers used when the config lists no bootstrap nodes.
pub const DEFAULT_ROUTERS: &[&str] = &[
    "router.bittorrent.com",
    "dht.transmissionbt.com",
    "router.utorrent.com",
];

/// A bootstrap entry. The ID is usually unknown until the node answers.
#[derive(Debug, Clone)]
pub struct BootstrapNode {
    pub id: Option<NodeId>,
    pub host: String,
    pub port: u16,
}

impl BootstrapNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            host: host.into(),
            port,
        }
    }
}

/// Which sockets to open and where to bootstrap from.
///
/// Both enabled families bind the same port number; the IPv6 socket is
/// v6-only, so the two stacks stay independent.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub ipv4: bool,
    pub ipv6: bool,
    pub port: u16,
    pub bootstrap_nodes: Vec<BootstrapNode>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
            port: DEFAULT_PORT,
            bootstrap_nodes: DEFAULT_ROUTERS
                .iter()
                .map(|host| BootstrapNode::new(*host, DEFAULT_PORT))
                .collect(),
        }
    }
}

impl DhtConfig {
    pub(crate) fn validate(&self) -> Result<(), DhtError> {
        if !self.ipv4 && !self.ipv6 {
            return Err(DhtError::Config("no address family enabled"));
        }
        Ok(())
    }
}
