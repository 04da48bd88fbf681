//! Internet checksums for IPv4 headers, ICMP, and TCP/UDP with pseudo-header.

use internet_checksum::Checksum;
use std::net::Ipv4Addr;

use crate::wire::ipv4::{PROTO_TCP, PROTO_UDP};

/// Computes the one's-complement checksum over `buffer[..length]`, treating
/// the two bytes at `checksum_offset` as zero, and stores it there big-endian.
pub fn ip_checksum(buffer: &mut [u8], checksum_offset: usize, length: usize) -> u16 {
    let length = length.min(buffer.len());
    if checksum_offset + 2 > length {
        return 0;
    }

    buffer[checksum_offset..checksum_offset + 2].fill(0);
    let mut sum = Checksum::new();
    sum.add_bytes(&buffer[..length]);
    let result = sum.checksum();
    buffer[checksum_offset..checksum_offset + 2].copy_from_slice(&result);
    u16::from_be_bytes(result)
}

/// TCP/UDP checksum over `buffer[..segment_length]` plus the 12-byte
/// pseudo-header. An odd trailing byte is padded with zero for summing only.
pub fn tcp_udp_checksum(
    buffer: &mut [u8],
    checksum_offset: usize,
    segment_length: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    is_udp: bool,
) -> u16 {
    let length = segment_length.min(buffer.len());
    if checksum_offset + 2 > length {
        return 0;
    }

    buffer[checksum_offset..checksum_offset + 2].fill(0);
    let mut sum = Checksum::new();
    sum.add_bytes(&pseudo_header(src, dst, is_udp, length));
    sum.add_bytes(&buffer[..length]);
    let mut result = sum.checksum();
    // zero means "no checksum" for UDP
    if is_udp && result == [0, 0] {
        result = [0xff, 0xff];
    }
    buffer[checksum_offset..checksum_offset + 2].copy_from_slice(&result);
    u16::from_be_bytes(result)
}

pub fn verify_ip_checksum(buffer: &[u8], length: usize) -> bool {
    if length > buffer.len() {
        return false;
    }
    let mut sum = Checksum::new();
    sum.add_bytes(&buffer[..length]);
    sum.checksum() == [0, 0]
}

pub fn verify_tcp_udp_checksum(buffer: &[u8], segment_length: usize, src: Ipv4Addr, dst: Ipv4Addr, is_udp: bool) -> bool {
    if segment_length > buffer.len() {
        return false;
    }
    let mut sum = Checksum::new();
    sum.add_bytes(&pseudo_header(src, dst, is_udp, segment_length));
    sum.add_bytes(&buffer[..segment_length]);
    sum.checksum() == [0, 0]
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, is_udp: bool, length: usize) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[..4].copy_from_slice(&src.octets());
    header[4..8].copy_from_slice(&dst.octets());
    header[9] = if is_udp { PROTO_UDP } else { PROTO_TCP };
    header[10..12].copy_from_slice(&(length as u16).to_be_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_ipv4_header_checksum() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01,
            0xc0, 0xa8, 0x00, 0xc7,
        ];
        let checksum = ip_checksum(&mut header, 10, 20);
        assert_eq!(checksum, 0xb861);
        assert_eq!(&header[10..12], &[0xb8, 0x61]);
        assert!(verify_ip_checksum(&header, 20));
    }

    #[test]
    fn existing_checksum_bytes_are_ignored() {
        let mut a = [0x45, 0x00, 0x00, 0x14, 0x12, 0x34, 0x00, 0x00, 0x40, 0x06, 0xde, 0xad, 10, 0, 0, 1, 1, 2, 3, 4];
        let mut b = a;
        b[10] = 0;
        b[11] = 0;
        assert_eq!(ip_checksum(&mut a, 10, 20), ip_checksum(&mut b, 10, 20));
    }

    #[test]
    fn odd_length_segment_is_zero_padded() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 254);
        let mut odd = vec![0x12, 0x34, 0x00, 0x35, 0x00, 0x09, 0x00, 0x00, 0xab];
        let mut even = odd.clone();
        even.push(0);
        let a = tcp_udp_checksum(&mut odd, 6, 9, src, dst, true);
        // Same bytes summed, but the pseudo-header length differs by one.
        let b = tcp_udp_checksum(&mut even, 6, 10, src, dst, true);
        assert_ne!(a, b);
        assert!(verify_tcp_udp_checksum(&odd, 9, src, dst, true));
        assert!(verify_tcp_udp_checksum(&even, 10, src, dst, true));
    }

    #[test]
    fn offset_past_length_leaves_buffer_alone() {
        let mut buffer = [1u8, 2, 3];
        assert_eq!(ip_checksum(&mut buffer, 2, 3), 0);
        assert_eq!(buffer, [1, 2, 3]);
    }

    proptest! {
        #[test]
        fn header_checksum_verifies(mut header in proptest::collection::vec(any::<u8>(), 20)) {
            ip_checksum(&mut header, 10, 20);
            prop_assert!(verify_ip_checksum(&header, 20));
        }

        #[test]
        fn corrupting_one_byte_breaks_verification(
            mut segment in proptest::collection::vec(any::<u8>(), 8..200),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
            is_udp in any::<bool>(),
        ) {
            let src = Ipv4Addr::new(10, 0, 0, 1);
            let dst = Ipv4Addr::new(93, 184, 216, 34);
            let len = segment.len();
            tcp_udp_checksum(&mut segment, 6, len, src, dst, is_udp);
            prop_assert!(verify_tcp_udp_checksum(&segment, len, src, dst, is_udp));

            segment[index.index(len)] ^= flip;
            prop_assert!(!verify_tcp_udp_checksum(&segment, len, src, dst, is_udp));
        }
    }
}
