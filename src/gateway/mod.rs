//! The gateway a simulated network's controllers talk to.
//!
//! Controllers hand raw Ethernet frames to [`NetworkContext::transmit`]. ARP,
//! RARP and ICMP echo aimed at the gateway are answered on the spot; TCP and
//! UDP bound for the outside world are carried over real host sockets, NAT
//! style. Replies and data from those sockets are turned back into frames by
//! [`NetworkContext::poll`] and queued until the owning controller picks them
//! up with [`NetworkContext::poll_and_receive`].

mod arp;
mod icmp;
mod relay;
mod tcp;
mod udp;

pub use arp::rarp_address;
pub use icmp::ECHO_REPLY_TTL;
pub use tcp::TcpState;
pub use udp::{fragment, MAX_FRAGMENT_PAYLOAD};

use byte::{BytesExt, TryRead};
use mac_address::MacAddress;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, trace, warn};

use crate::checksum;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::queue::{FrameQueue, OwnerToken};
use crate::resolver::HostResolver;
use crate::socket::{poll_readiness, Interest};
use crate::table::{ConnectionTable, FourTuple};
use crate::wire::ethernet::{self, EthernetHeader};
use crate::wire::ipv4::{self, Ipv4Header};
use relay::Relay;
use tcp::TcpConnection;
use udp::UdpConnection;

/// Shortest frame worth looking at: Ethernet plus a bare IPv4 header.
pub const MIN_FRAME_LEN: usize = EthernetHeader::LEN + Ipv4Header::LEN;
/// 1518 plus an optional 802.1Q tag.
pub const MAX_FRAME_LEN: usize = 1522;

/// TTL on every frame the gateway synthesizes.
const TTL: u8 = 64;

#[derive(Clone, Copy, Debug)]
struct Nic {
    owner: OwnerToken,
    mac: MacAddress,
}

/// Frames produced while handling one event, addressed on behalf of the gateway.
struct Outbox<'a> {
    queue: &'a mut FrameQueue,
    gateway_mac: MacAddress,
    now: u64,
    sent: usize,
}

impl<'a> Outbox<'a> {
    fn new(queue: &'a mut FrameQueue, gateway_mac: MacAddress, now: u64) -> Self {
        Outbox { queue, gateway_mac, now, sent: 0 }
    }

    fn push(&mut self, owner: OwnerToken, frame: Vec<u8>) {
        self.queue.push(owner, frame);
        self.sent += 1;
    }
}

/// One simulated network: its gateway, its proxied connections, and the
/// frames waiting for its controllers.
pub struct NetworkContext {
    config: GatewayConfig,
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddress,
    resolver: HostResolver,
    timestamp: u64,
    tcp: ConnectionTable<TcpConnection>,
    udp: ConnectionTable<UdpConnection>,
    queue: FrameQueue,
    nics: Vec<Nic>,
    relay: Option<Relay>,
}

impl NetworkContext {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let (tcp_capacity, udp_capacity) = config.capacities()?;
        let peers = config.resolve_peers()?;
        let relay = match (config.relay_port, peers.is_empty()) {
            (None, true) => None,
            (port, _) => Some(Relay::bind(port.unwrap_or(0), peers)?),
        };
        let resolver = HostResolver::load(&config.resolv_conf);

        let context = NetworkContext {
            gateway_ip: config.gateway_ip(),
            gateway_mac: config.gateway_mac(),
            resolver,
            timestamp: 0,
            tcp: ConnectionTable::new(tcp_capacity),
            udp: ConnectionTable::new(udp_capacity),
            queue: FrameQueue::new(),
            nics: Vec::new(),
            relay,
            config,
        };

        info!(
            network = %context.config.network,
            gateway = %context.gateway_ip,
            nameserver = ?context.resolver.nameserver,
            domain = ?context.resolver.domain,
            relay = context.relay.is_some(),
            "network created"
        );
        Ok(context)
    }

    /// Attaches a controller. Registering a known token again updates its MAC.
    pub fn register_nic(&mut self, owner: OwnerToken, mac: MacAddress) {
        match self.nics.iter_mut().find(|nic| nic.owner == owner) {
            Some(nic) => nic.mac = mac,
            None => self.nics.push(Nic { owner, mac }),
        }
        info!(%owner, %mac, "controller registered");
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    pub fn gateway_mac(&self) -> MacAddress {
        self.gateway_mac
    }

    pub fn nameserver(&self) -> Option<Ipv4Addr> {
        self.resolver.nameserver
    }

    pub fn search_domain(&self) -> Option<&str> {
        self.resolver.domain.as_deref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_mapping_count(&self) -> usize {
        self.udp.len()
    }

    /// State of the TCP connection between the given guest and outside endpoints.
    pub fn tcp_state(&self, guest: SocketAddrV4, outside: SocketAddrV4) -> Option<TcpState> {
        let key = FourTuple::new(*guest.ip(), guest.port(), *outside.ip(), outside.port());
        self.tcp.get(&key).map(TcpConnection::state)
    }

    pub fn nic_mac(&self, owner: OwnerToken) -> Option<MacAddress> {
        self.nics.iter().find(|nic| nic.owner == owner).map(|nic| nic.mac)
    }

    fn tick(&mut self) -> u64 {
        self.timestamp += 1;
        self.timestamp
    }

    /// Accepts one raw Ethernet frame (no CRC) sent by `owner`.
    pub fn transmit(&mut self, owner: OwnerToken, frame: &[u8]) {
        if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
            debug!(%owner, len = frame.len(), "dropping frame of unusable size");
            return;
        }
        self.tick();

        // Everyone else on the segment sees the frame unmodified.
        for nic in self.nics.iter().filter(|nic| nic.owner != owner) {
            self.queue.push(nic.owner, frame.to_vec());
        }
        if let Some(relay) = &self.relay {
            relay.broadcast(frame);
        }

        let header: EthernetHeader = match frame.read(&mut 0) {
            Ok(header) => header,
            Err(err) => {
                debug!(%owner, ?err, "dropping malformed ethernet frame");
                return;
            }
        };
        if header.mac_dest.bytes() != self.gateway_mac.bytes() && !header.is_group_addressed() {
            trace!(%owner, dest = %header.mac_dest, "frame not for the gateway");
            return;
        }
        trace!("{header}");

        let payload = &frame[EthernetHeader::LEN..];
        let result = match header.ether_type {
            ethernet::ETHERTYPE_IPV4 => self.handle_ipv4(owner, &header, payload),
            ethernet::ETHERTYPE_ARP => self.handle_arp(owner, &header, payload),
            ethernet::ETHERTYPE_RARP => self.handle_rarp(owner, &header, payload),
            ethernet::ETHERTYPE_IPV6 => {
                debug!(%owner, "unimplemented: IPv6");
                Ok(())
            }
            other => {
                debug!(%owner, ether_type = format_args!("0x{other:04x}"), "unimplemented ethertype");
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(%owner, ?err, "dropping malformed frame");
        }
    }

    fn handle_ipv4(&mut self, owner: OwnerToken, ethernet: &EthernetHeader, packet: &[u8]) -> byte::Result<()> {
        let (ip, header_len) = Ipv4Header::try_read(packet, ())?;
        if !checksum::verify_ip_checksum(packet, header_len) {
            debug!(src = %ip.src, dst = %ip.dst, "dropping IPv4 packet with bad header checksum");
            return Ok(());
        }
        trace!("{ip}");

        if ip.dst.is_broadcast() || ip.dst.is_multicast() {
            debug!(dst = %ip.dst, "unimplemented: broadcast/multicast IPv4");
            return Ok(());
        }
        if ip.dst != self.gateway_ip && self.config.network.contains(ip.dst) {
            trace!(dst = %ip.dst, "local traffic, left to the other controllers");
            return Ok(());
        }

        let payload = &packet[header_len..usize::from(ip.total_len)];
        match ip.protocol {
            ipv4::PROTO_ICMP => self.handle_icmp(owner, ethernet, &ip, payload),
            ipv4::PROTO_TCP => self.handle_tcp(owner, ethernet, &ip, payload),
            ipv4::PROTO_UDP => self.handle_udp(owner, ethernet, &ip, payload),
            protocol => {
                debug!(protocol, dst = %ip.dst, "unimplemented IP protocol");
                Ok(())
            }
        }
    }

    /// Services every proxied socket once: one readiness pass, then UDP
    /// mappings, TCP connections and the relay, in that order.
    pub fn poll(&mut self) {
        let udp_keys = self.udp.keys();
        let tcp_keys = self.tcp.keys();

        let mut interests = Vec::with_capacity(udp_keys.len() + tcp_keys.len() + 1);
        interests.extend(udp_keys.iter().filter_map(|key| self.udp.get(key)).map(|mapping| Interest {
            fd: mapping.socket().as_raw_fd(),
            read: true,
            write: false,
        }));
        interests.extend(tcp_keys.iter().filter_map(|key| self.tcp.get(key)).map(|conn| Interest {
            fd: conn.socket().as_raw_fd(),
            read: true,
            write: true,
        }));
        if let Some(relay) = &self.relay {
            interests.push(Interest {
                fd: relay.socket().as_raw_fd(),
                read: true,
                write: false,
            });
        }

        let readiness = match poll_readiness(&interests) {
            Ok(readiness) => readiness,
            Err(err) => {
                warn!(%err, "readiness poll failed");
                return;
            }
        };

        let (udp_ready, rest) = readiness.split_at(udp_keys.len());
        let (tcp_ready, relay_ready) = rest.split_at(tcp_keys.len());
        for (key, ready) in udp_keys.iter().zip(udp_ready) {
            self.service_udp(key, *ready);
        }
        for (key, ready) in tcp_keys.iter().zip(tcp_ready) {
            self.service_tcp(key, *ready);
        }
        if relay_ready.first().map_or(false, |ready| ready.readable) {
            self.service_relay();
        }
    }

    /// Services sockets, then hands out the oldest frame queued for `owner`.
    pub fn poll_and_receive(&mut self, owner: OwnerToken) -> Option<Vec<u8>> {
        self.poll();
        self.queue.pop_for(owner)
    }

    /// Like [`NetworkContext::poll_and_receive`] but leaves the frame queued.
    pub fn receive_available(&mut self, owner: OwnerToken) -> bool {
        self.poll();
        self.queue.has_frame_for(owner)
    }
}
