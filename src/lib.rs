//! rdht - a Mainline DHT node
//!
//! This library implements the Kademlia-based distributed hash table
//! used by BitTorrent for trackerless peer discovery ([BEP-5]), with
//! the [BEP-42] node-ID hardening on top.
//!
//! # Overview
//!
//! The DHT is a distributed database mapping 20-byte infohashes to the
//! peers that announced them. Nodes carry 160-bit IDs; closeness is the
//! XOR of two IDs, and every lookup walks greedily toward the K closest
//! nodes to its target.
//!
//! # Getting Started
//!
//! ```no_run
//! use rdht::{DhtConfig, DhtServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Bind the configured sockets (IPv4 on port 6881 by default)
//! let dht = DhtServer::bind(DhtConfig::default()).await?;
//!
//! // The server loop runs as its own task
//! let runner = dht.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! // Populate the routing table from the well-known routers
//! dht.bootstrap().await;
//!
//! // Find peers for a torrent
//! let info_hash = [0u8; 20]; // your torrent's info hash
//! dht.search(info_hash, |peer| println!("found peer: {peer}")).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`DhtServer`] - sockets, dispatch loop, timers, the public API
//! - [`RoutingTable`] - splitting k-bucket tree over the XOR metric
//! - [`search`] - iterative α-parallel lookups with an announce phase
//! - [`store`] - peer-announce storage and token lifecycle
//! - [`krpc`] / [`bencode`] - the BEP-5 wire protocol
//!
//! Queries served: **ping**, **find_node**, **get_peers**,
//! **announce_peer**. IPv4 and IPv6 run as two independent overlays;
//! enable either or both through [`DhtConfig`].
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

pub mod bencode;
pub mod config;
pub mod error;
pub mod id;
pub mod krpc;
pub mod node;
pub mod routing;
pub mod search;
pub mod security;
pub mod server;
pub mod store;

pub use bencode::{BencodeError, Value};
pub use config::{BootstrapNode, DhtConfig};
pub use error::DhtError;
pub use id::{Distance, NodeId};
pub use krpc::{Body, Message};
pub use node::{Contact, NodeRecord, NodeStatus};
pub use routing::RoutingTable;
pub use server::DhtServer;
