//! Header structs for the frames the gateway parses and synthesizes.
//!
//! Every header reads from and writes to a plain byte slice through `byte`'s
//! `TryRead`/`TryWrite`. The builder functions below lay headers and payloads
//! out back to back and fill in lengths and checksums.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use byte::{ctx::Bytes, BytesExt};
use mac_address::MacAddress;
use std::net::Ipv4Addr;

use crate::checksum;
use ethernet::EthernetHeader;
use ipv4::Ipv4Header;
use tcp::TcpHeader;
use udp::UdpHeader;

pub(crate) fn read_mac(bytes: &[u8], offset: &mut usize) -> byte::Result<MacAddress> {
    let raw = bytes.read_with::<&[u8]>(offset, Bytes::Len(6))?;
    let octets: [u8; 6] = raw.try_into().map_err(|_| byte::Error::Incomplete)?;
    Ok(MacAddress::new(octets))
}

pub(crate) fn write_mac(bytes: &mut [u8], offset: &mut usize, mac: MacAddress) -> byte::Result<()> {
    bytes.write_with::<&[u8]>(offset, &mac.bytes(), ())
}

pub fn ethernet_frame(header: EthernetHeader, payload: &[u8]) -> byte::Result<Vec<u8>> {
    let mut frame = vec![0u8; EthernetHeader::LEN + payload.len()];
    let offset = &mut 0;
    frame.write(offset, header)?;
    frame[*offset..].copy_from_slice(payload);
    Ok(frame)
}

/// Builds an IPv4 packet, filling in total length and header checksum.
pub fn ipv4_packet(mut header: Ipv4Header, payload: &[u8]) -> byte::Result<Vec<u8>> {
    let total_len = Ipv4Header::LEN + payload.len();
    header.total_len = u16::try_from(total_len).map_err(|_| byte::Error::BadInput { err: "IPv4 packet too large" })?;
    header.checksum = 0;

    let mut packet = vec![0u8; total_len];
    packet.write(&mut 0, header)?;
    checksum::ip_checksum(&mut packet, Ipv4Header::CHECKSUM_OFFSET, Ipv4Header::LEN);
    packet[Ipv4Header::LEN..].copy_from_slice(payload);
    Ok(packet)
}

pub fn ipv4_frame(ethernet: EthernetHeader, ip: Ipv4Header, payload: &[u8]) -> byte::Result<Vec<u8>> {
    ethernet_frame(ethernet, &ipv4_packet(ip, payload)?)
}

/// Builds a TCP segment. `options` must be padded to a multiple of four bytes.
pub fn tcp_segment(src: Ipv4Addr, dst: Ipv4Addr, mut header: TcpHeader, options: &[u8], payload: &[u8]) -> byte::Result<Vec<u8>> {
    if options.len() % 4 != 0 || options.len() > 40 {
        return Err(byte::Error::BadInput { err: "TCP options not padded to 32 bits" });
    }
    header.header_len = TcpHeader::LEN + options.len();
    header.checksum = 0;

    let len = header.header_len + payload.len();
    let mut segment = vec![0u8; len];
    segment.write(&mut 0, header)?;
    segment[TcpHeader::LEN..header.header_len].copy_from_slice(options);
    segment[header.header_len..].copy_from_slice(payload);
    checksum::tcp_udp_checksum(&mut segment, TcpHeader::CHECKSUM_OFFSET, len, src, dst, false);
    Ok(segment)
}

pub fn udp_datagram(src: Ipv4Addr, dst: Ipv4Addr, mut header: UdpHeader, payload: &[u8]) -> byte::Result<Vec<u8>> {
    let len = UdpHeader::LEN + payload.len();
    header.length = u16::try_from(len).map_err(|_| byte::Error::BadInput { err: "UDP datagram too large" })?;
    header.checksum = 0;

    let mut datagram = vec![0u8; len];
    datagram.write(&mut 0, header)?;
    datagram[UdpHeader::LEN..].copy_from_slice(payload);
    checksum::tcp_udp_checksum(&mut datagram, UdpHeader::CHECKSUM_OFFSET, len, src, dst, true);
    Ok(datagram)
}
