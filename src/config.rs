use mac_address::MacAddress;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::resolver::DEFAULT_RESOLV_CONF;

pub const DEFAULT_NETWORK: &str = "10.0.0.0/8";
pub const GATEWAY_MAC: [u8; 6] = [0x60, 0x50, 0x40, 0x30, 0x20, 0x10];
/// Host part of the gateway's address within the simulated network.
const GATEWAY_HOST: u32 = 254;

pub const DEFAULT_TCP_CAPACITY: usize = 100;
pub const DEFAULT_UDP_CAPACITY: usize = 100;
pub const DEFAULT_RETRANSMIT_ROUNDS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    /// Host bits of `network` are cleared.
    pub fn new(network: Ipv4Addr, len: u8) -> Result<Self, ConfigError> {
        if !(1..=24).contains(&len) {
            return Err(ConfigError::PrefixLength(len));
        }
        let mask = u32::MAX << (32 - len);
        Ok(Ipv4Prefix {
            network: Ipv4Addr::from(u32::from(network) & mask),
            len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn mask(&self) -> u32 {
        u32::MAX << (32 - self.len)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network)
    }

    /// The address with host part `host` inside this prefix.
    pub fn host(&self, host: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | (host & !self.mask()))
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPrefix(s.to_string());
        let (addr, len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let len: u8 = len.parse().map_err(|_| invalid())?;
        Ipv4Prefix::new(addr, len)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

/// Everything needed to build one simulated network.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub network: Ipv4Prefix,
    /// Remote emulator instances, as `host:port`.
    pub peers: Vec<String>,
    /// Local UDP port for the distributed relay.
    pub relay_port: Option<u16>,
    pub resolv_conf: PathBuf,
    pub tcp_capacity: usize,
    pub udp_capacity: usize,
    /// Poll rounds without an ACK before buffered TCP data is resent.
    pub retransmit_rounds: u32,
}

impl GatewayConfig {
    pub fn new(network: Ipv4Prefix) -> Self {
        GatewayConfig {
            network,
            peers: Vec::new(),
            relay_port: None,
            resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
            tcp_capacity: DEFAULT_TCP_CAPACITY,
            udp_capacity: DEFAULT_UDP_CAPACITY,
            retransmit_rounds: DEFAULT_RETRANSMIT_ROUNDS,
        }
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.network.host(GATEWAY_HOST)
    }

    pub fn gateway_mac(&self) -> MacAddress {
        MacAddress::new(GATEWAY_MAC)
    }

    /// TCP and UDP table sizes, both non-zero.
    pub fn capacities(&self) -> Result<(NonZeroUsize, NonZeroUsize), ConfigError> {
        let tcp = NonZeroUsize::new(self.tcp_capacity).ok_or(ConfigError::ZeroCapacity("TCP"))?;
        let udp = NonZeroUsize::new(self.udp_capacity).ok_or(ConfigError::ZeroCapacity("UDP"))?;
        Ok((tcp, udp))
    }

    /// Resolves every peer to its first IPv4 address.
    pub fn resolve_peers(&self) -> Result<Vec<SocketAddrV4>, ConfigError> {
        self.peers.iter().map(|peer| resolve_peer(peer)).collect()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig::new(Ipv4Prefix {
            network: Ipv4Addr::new(10, 0, 0, 0),
            len: 8,
        })
    }
}

fn resolve_peer(peer: &str) -> Result<SocketAddrV4, ConfigError> {
    let addrs = peer.to_socket_addrs().map_err(|source| ConfigError::UnresolvablePeer {
        peer: peer.to_string(),
        source,
    })?;
    addrs
        .into_iter()
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ConfigError::NoIpv4Peer(peer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_network() {
        let prefix: Ipv4Prefix = DEFAULT_NETWORK.parse().unwrap();
        assert_eq!(prefix.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(prefix.prefix_len(), 8);
        assert!(prefix.contains(Ipv4Addr::new(10, 200, 3, 4)));
        assert!(!prefix.contains(Ipv4Addr::new(11, 0, 0, 1)));
        assert_eq!(prefix.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn host_bits_are_masked() {
        let prefix: Ipv4Prefix = "192.168.7.99/24".parse().unwrap();
        assert_eq!(prefix.network(), Ipv4Addr::new(192, 168, 7, 0));
        assert_eq!(prefix.host(254), Ipv4Addr::new(192, 168, 7, 254));
    }

    #[test]
    fn rejects_bad_prefixes() {
        assert!(matches!("10.0.0.0".parse::<Ipv4Prefix>(), Err(ConfigError::InvalidPrefix(_))));
        assert!(matches!("10.0.0/8".parse::<Ipv4Prefix>(), Err(ConfigError::InvalidPrefix(_))));
        assert!(matches!("10.0.0.0/x".parse::<Ipv4Prefix>(), Err(ConfigError::InvalidPrefix(_))));
        assert!(matches!("10.0.0.0/0".parse::<Ipv4Prefix>(), Err(ConfigError::PrefixLength(0))));
        assert!(matches!("10.0.0.0/30".parse::<Ipv4Prefix>(), Err(ConfigError::PrefixLength(30))));
    }

    #[test]
    fn default_gateway_is_dot_254() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway_ip(), Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(config.gateway_mac().bytes(), GATEWAY_MAC);
    }

    #[test]
    fn resolves_literal_peers() {
        let mut config = GatewayConfig::default();
        config.peers = vec!["127.0.0.1:4001".to_string()];
        assert_eq!(config.resolve_peers().unwrap(), vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4001)]);

        config.peers = vec!["no-port-here".to_string()];
        assert!(matches!(config.resolve_peers(), Err(ConfigError::UnresolvablePeer { .. })));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = GatewayConfig::default();
        config.udp_capacity = 0;
        assert!(matches!(config.capacities(), Err(ConfigError::ZeroCapacity("UDP"))));
        config.udp_capacity = 1;
        let (tcp, udp) = config.capacities().unwrap();
        assert_eq!((tcp.get(), udp.get()), (DEFAULT_TCP_CAPACITY, 1));
    }
}
