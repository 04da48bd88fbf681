use byte::BytesExt;
use mac_address::MacAddress;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

use super::NetworkContext;
use crate::config::Ipv4Prefix;
use crate::queue::OwnerToken;
use crate::wire::arp::{self, ArpHeader};
use crate::wire::ethernet::{self, EthernetHeader};

/// Address handed out to a RARP requester: 8 host bits taken from the low
/// nibble of the fifth MAC octet and the high nibble of the sixth, so a MAC
/// ending in `00:10` becomes host 1.
pub fn rarp_address(network: &Ipv4Prefix, mac: MacAddress) -> Ipv4Addr {
    let octets = mac.bytes();
    let host = (u32::from(octets[4] & 0x0f) << 4) | u32::from(octets[5] >> 4);
    network.host(host)
}

fn reply_frame(ether_type: u16, dest: MacAddress, src: MacAddress, reply: ArpHeader) -> byte::Result<Vec<u8>> {
    let mut payload = [0u8; ArpHeader::LEN];
    payload.write(&mut 0, reply)?;
    crate::wire::ethernet_frame(EthernetHeader::new(dest, src, ether_type), &payload)
}

impl NetworkContext {
    pub(super) fn handle_arp(&mut self, owner: OwnerToken, frame: &EthernetHeader, payload: &[u8]) -> byte::Result<()> {
        let request: ArpHeader = payload.read(&mut 0)?;
        trace!("{request}");
        if !request.is_ethernet_ipv4() {
            debug!(htype = request.htype, ptype = request.ptype, "unimplemented: non Ethernet/IPv4 ARP");
            return Ok(());
        }

        match request.oper {
            arp::OP_REQUEST if request.tpa == self.gateway_ip => {
                let reply = ArpHeader::ethernet_ipv4(
                    arp::OP_REPLY,
                    self.gateway_mac,
                    self.gateway_ip,
                    request.sha,
                    request.spa,
                );
                let frame = reply_frame(ethernet::ETHERTYPE_ARP, frame.mac_src, self.gateway_mac, reply)?;
                debug!(%owner, asker = %request.spa, "{} is-at {}", self.gateway_ip, self.gateway_mac);
                self.queue.push(owner, frame);
            }
            arp::OP_REQUEST => trace!(target_ip = %request.tpa, "ARP request for another host"),
            oper => debug!(%owner, oper, "unimplemented ARP opcode"),
        }
        Ok(())
    }

    pub(super) fn handle_rarp(&mut self, owner: OwnerToken, frame: &EthernetHeader, payload: &[u8]) -> byte::Result<()> {
        let request: ArpHeader = payload.read(&mut 0)?;
        trace!("{request}");

        if request.oper != arp::OP_RARP_REQUEST || !request.is_ethernet_ipv4() {
            debug!(%owner, oper = request.oper, "unimplemented RARP opcode");
            return Ok(());
        }

        let assigned = rarp_address(&self.config.network, request.tha);
        let reply = ArpHeader::ethernet_ipv4(
            arp::OP_RARP_REPLY,
            self.gateway_mac,
            self.gateway_ip,
            request.tha,
            assigned,
        );
        let frame = reply_frame(ethernet::ETHERTYPE_RARP, frame.mac_src, self.gateway_mac, reply)?;
        debug!(%owner, mac = %request.tha, %assigned, "RARP reply");
        self.queue.push(owner, frame);
        Ok(())
    }
}
