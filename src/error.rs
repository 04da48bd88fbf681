use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid network prefix `{0}`, expected a.b.c.d/len")]
    InvalidPrefix(String),

    #[error("network prefix length {0} out of range (1..=24)")]
    PrefixLength(u8),

    #[error("cannot resolve peer `{peer}`")]
    UnresolvablePeer {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer `{0}` has no IPv4 address")]
    NoIpv4Peer(String),

    #[error("{0} capacity must be at least 1")]
    ZeroCapacity(&'static str),
}

/// Errors that abort network construction. Nothing after construction is fatal.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot bind relay socket on port {port}")]
    RelayBind {
        port: u16,
        #[source]
        source: Errno,
    },
}
