#![allow(dead_code)]

use byte::{BytesExt, TryRead};
use mac_address::MacAddress;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

use netgate::wire::arp::ArpHeader;
use netgate::wire::ethernet::{self, EthernetHeader};
use netgate::wire::ipv4::{self, Ipv4Header};
use netgate::wire::tcp::TcpHeader;
use netgate::wire::udp::UdpHeader;
use netgate::{GatewayConfig, NetworkContext, OwnerToken};

pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const GUEST_NIC: OwnerToken = OwnerToken(1);

pub fn guest_mac() -> MacAddress {
    MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01])
}

pub fn resolv_conf(contents: &str) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), contents).unwrap();
    file
}

/// A 10.0.0.0/8 network with one guest controller attached. The returned
/// file keeps the resolver configuration alive.
pub fn network_with(resolv: &str, tweak: impl FnOnce(&mut GatewayConfig)) -> (NetworkContext, NamedTempFile) {
    let file = resolv_conf(resolv);
    let mut config = GatewayConfig::default();
    config.resolv_conf = file.path().to_path_buf();
    tweak(&mut config);
    let mut network = NetworkContext::new(config).unwrap();
    network.register_nic(GUEST_NIC, guest_mac());
    (network, file)
}

pub fn network() -> (NetworkContext, NamedTempFile) {
    network_with("", |_| {})
}

pub fn to_gateway(network: &NetworkContext, ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let header = EthernetHeader::new(network.gateway_mac(), guest_mac(), ether_type);
    netgate::wire::ethernet_frame(header, payload).unwrap()
}

pub fn arp_frame(dest: MacAddress, ether_type: u16, request: ArpHeader) -> Vec<u8> {
    let mut payload = [0u8; ArpHeader::LEN];
    payload.write(&mut 0, request).unwrap();
    netgate::wire::ethernet_frame(EthernetHeader::new(dest, guest_mac(), ether_type), &payload).unwrap()
}

pub fn ipv4_to_gateway(network: &NetworkContext, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let ethernet = EthernetHeader::new(network.gateway_mac(), guest_mac(), ethernet::ETHERTYPE_IPV4);
    let ip = Ipv4Header::new(GUEST_IP, dst, protocol, 1, 64);
    netgate::wire::ipv4_frame(ethernet, ip, payload).unwrap()
}

pub fn tcp_frame(network: &NetworkContext, src_port: u16, dst: SocketAddrV4, seq: u32, ack: u32, flags: u8, data: &[u8]) -> Vec<u8> {
    let header = TcpHeader::new(src_port, dst.port(), seq, ack, flags, 0x7210);
    let segment = netgate::wire::tcp_segment(GUEST_IP, *dst.ip(), header, &[], data).unwrap();
    ipv4_to_gateway(network, *dst.ip(), ipv4::PROTO_TCP, &segment)
}

pub fn udp_frame(network: &NetworkContext, src_port: u16, dst: SocketAddrV4, data: &[u8]) -> Vec<u8> {
    let datagram = netgate::wire::udp_datagram(GUEST_IP, *dst.ip(), UdpHeader::new(src_port, dst.port()), data).unwrap();
    ipv4_to_gateway(network, *dst.ip(), ipv4::PROTO_UDP, &datagram)
}

pub struct Packet {
    pub ethernet: EthernetHeader,
    pub ip: Ipv4Header,
    pub payload: Vec<u8>,
}

pub fn parse_ipv4(frame: &[u8]) -> Packet {
    let ethernet: EthernetHeader = frame.read(&mut 0).unwrap();
    assert_eq!(ethernet.ether_type, ethernet::ETHERTYPE_IPV4);
    let packet = &frame[EthernetHeader::LEN..];
    assert!(netgate::checksum::verify_ip_checksum(packet, Ipv4Header::LEN));
    let (ip, len) = Ipv4Header::try_read(packet, ()).unwrap();
    Packet { ethernet, ip, payload: packet[len..usize::from(ip.total_len)].to_vec() }
}

pub fn parse_tcp(frame: &[u8]) -> (Packet, TcpHeader, Vec<u8>) {
    let packet = parse_ipv4(frame);
    assert_eq!(packet.ip.protocol, ipv4::PROTO_TCP);
    assert!(netgate::checksum::verify_tcp_udp_checksum(
        &packet.payload,
        packet.payload.len(),
        packet.ip.src,
        packet.ip.dst,
        false
    ));
    let (header, len) = TcpHeader::try_read(&packet.payload, ()).unwrap();
    let data = packet.payload[len..].to_vec();
    (packet, header, data)
}

/// Polls until `owner` receives a frame, giving the host sockets time to act.
pub fn next_frame(network: &mut NetworkContext, owner: OwnerToken) -> Option<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(frame) = network.poll_and_receive(owner) {
            return Some(frame);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    None
}

/// Everything `owner` receives over a few quiet poll rounds.
pub fn drain(network: &mut NetworkContext, owner: OwnerToken) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for _ in 0..20 {
        while let Some(frame) = network.poll_and_receive(owner) {
            frames.push(frame);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    frames
}
