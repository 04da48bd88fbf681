//! UDP proxy: one host socket per guest 4-tuple, no protocol state.

use byte::TryRead;
use mac_address::MacAddress;
use nix::errno::Errno;
use std::net::SocketAddrV4;
use tracing::{debug, trace, warn};

use super::{NetworkContext, TTL};
use crate::checksum;
use crate::queue::OwnerToken;
use crate::socket::{Readiness, Socket};
use crate::table::FourTuple;
use crate::wire::ethernet::{self, EthernetHeader};
use crate::wire::ipv4::{self, Ipv4Header, FLAG_MORE_FRAGMENTS};
use crate::wire::udp::UdpHeader;

/// IP payload carried per frame before a reply is fragmented (1500 MTU
/// minus the IPv4 header).
pub const MAX_FRAGMENT_PAYLOAD: usize = 1480;
const MAX_DATAGRAM: usize = 65535;

pub(super) struct UdpConnection {
    owner: OwnerToken,
    guest_mac: MacAddress,
    socket: Socket,
    datagram_id: u16,
    /// Sent to the host nameserver on behalf of the gateway address.
    fake_ns: bool,
    target: SocketAddrV4,
}

impl UdpConnection {
    pub(super) fn socket(&self) -> &Socket {
        &self.socket
    }
}

/// Splits one IP payload into frames of at most `max` payload bytes each.
/// Offsets are multiples of eight and every fragment but the last carries
/// the more-fragments flag.
pub fn fragment(ethernet: EthernetHeader, ip: Ipv4Header, payload: &[u8], max: usize) -> byte::Result<Vec<Vec<u8>>> {
    if payload.len() <= max {
        return Ok(vec![crate::wire::ipv4_frame(ethernet, ip, payload)?]);
    }

    let chunk = max & !7;
    if chunk == 0 {
        return Err(byte::Error::BadInput { err: "fragment size below 8 bytes" });
    }
    let count = (payload.len() + chunk - 1) / chunk;
    payload
        .chunks(chunk)
        .enumerate()
        .map(|(index, piece)| {
            let mut header = ip;
            header.flags_fragment = ((index * chunk / 8) as u16) & 0x1fff;
            if index + 1 < count {
                header.flags_fragment |= FLAG_MORE_FRAGMENTS;
            }
            crate::wire::ipv4_frame(ethernet, header, piece)
        })
        .collect()
}

/// Frames a reply from the outside so it appears to come from the address
/// the guest originally sent to.
fn reply_frames(gateway_mac: MacAddress, guest_mac: MacAddress, key: &FourTuple, id: u16, payload: &[u8]) -> byte::Result<Vec<Vec<u8>>> {
    let header = UdpHeader::new(key.outside_port, key.guest_port);
    let datagram = crate::wire::udp_datagram(key.outside_ip, key.guest_ip, header, payload)?;

    let ethernet = EthernetHeader::new(guest_mac, gateway_mac, ethernet::ETHERTYPE_IPV4);
    let ip = Ipv4Header::new(key.outside_ip, key.guest_ip, ipv4::PROTO_UDP, id, TTL);
    fragment(ethernet, ip, &datagram, MAX_FRAGMENT_PAYLOAD)
}

impl NetworkContext {
    pub(super) fn handle_udp(
        &mut self,
        owner: OwnerToken,
        frame: &EthernetHeader,
        ip: &Ipv4Header,
        datagram: &[u8],
    ) -> byte::Result<()> {
        if ip.is_fragment() {
            debug!(src = %ip.src, dst = %ip.dst, offset = ip.fragment_offset(), "unimplemented: fragmented UDP");
            return Ok(());
        }
        let (header, _) = UdpHeader::try_read(datagram, ())?;
        trace!("{header}");
        let datagram = &datagram[..usize::from(header.length)];
        if header.checksum != 0 && !checksum::verify_tcp_udp_checksum(datagram, datagram.len(), ip.src, ip.dst, true) {
            debug!(src = %ip.src, dst = %ip.dst, "dropping UDP datagram with bad checksum");
            return Ok(());
        }
        let payload = &datagram[UdpHeader::LEN..];
        let key = FourTuple::new(ip.src, header.src_port, ip.dst, header.dst_port);

        if !self.udp.contains(&key) {
            let fake_ns = ip.dst == self.gateway_ip;
            let target = if fake_ns {
                match self.resolver.nameserver {
                    Some(nameserver) => SocketAddrV4::new(nameserver, header.dst_port),
                    None => {
                        debug!(%key, "no host nameserver, dropping query to the gateway");
                        return Ok(());
                    }
                }
            } else {
                key.outside()
            };

            let socket = match Socket::udp() {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%key, %err, "cannot open UDP socket");
                    return Ok(());
                }
            };
            let mapping = UdpConnection {
                owner,
                guest_mac: frame.mac_src,
                socket,
                datagram_id: 0,
                fake_ns,
                target,
            };
            debug!(%key, %target, fake_ns, "new UDP mapping");
            if let Some((evicted, _)) = self.udp.insert_evicting(key, mapping) {
                debug!(%evicted, "UDP mapping evicted");
            }
        }

        self.udp.touch(&key);
        if let Some(mapping) = self.udp.get(&key) {
            match mapping.socket.send_to(payload, mapping.target) {
                Ok(_) => trace!(%key, len = payload.len(), "datagram out"),
                Err(Errno::EAGAIN) => debug!(%key, "send buffer full, datagram dropped"),
                Err(err) => debug!(%key, %err, "sendto failed"),
            }
        }
        Ok(())
    }

    pub(super) fn service_udp(&mut self, key: &FourTuple, ready: Readiness) {
        if !ready.readable {
            return;
        }
        let gateway_mac = self.gateway_mac;
        let Some(mapping) = self.udp.get_mut(key) else {
            return;
        };

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = match mapping.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!(%key, len, ?from, fake_ns = mapping.fake_ns, "datagram in");
                len
            }
            Err(Errno::EAGAIN) => return,
            Err(err) => {
                debug!(%key, %err, "recvfrom failed");
                return;
            }
        };

        let id = mapping.datagram_id;
        mapping.datagram_id = mapping.datagram_id.wrapping_add(1);
        let owner = mapping.owner;
        match reply_frames(gateway_mac, mapping.guest_mac, key, id, &buf[..len]) {
            Ok(frames) => {
                self.timestamp += 1;
                for frame in frames {
                    self.queue.push(owner, frame);
                }
                self.udp.touch(key);
            }
            Err(err) => warn!(%key, ?err, "cannot build UDP reply"),
        }
    }
}
