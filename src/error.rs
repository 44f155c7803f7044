use thiserror::Error;

/// Errors surfaced by the DHT node.
///
/// Peer-level failures (timeouts, malformed replies) never escape the
/// search machinery; the variants here are what callers of the public
/// API can actually observe.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("query timed out")]
    Timeout,

    #[error("too many in-flight queries")]
    RateLimited,

    #[error("configuration error: {0}")]
    Config(&'static str),
}
