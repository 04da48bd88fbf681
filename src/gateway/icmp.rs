use byte::{BytesExt, TryRead};
use tracing::{debug, trace};

use super::NetworkContext;
use crate::checksum;
use crate::queue::OwnerToken;
use crate::wire::ethernet::{self, EthernetHeader};
use crate::wire::icmp::{self, IcmpHeader};
use crate::wire::ipv4::{self, Ipv4Header};

/// Echo replies leave with a TTL this low so traceroutes end at the gateway.
pub const ECHO_REPLY_TTL: u8 = 2;

impl NetworkContext {
    pub(super) fn handle_icmp(
        &mut self,
        owner: OwnerToken,
        frame: &EthernetHeader,
        ip: &Ipv4Header,
        message: &[u8],
    ) -> byte::Result<()> {
        if ip.dst != self.gateway_ip {
            debug!(dst = %ip.dst, "unimplemented: ICMP beyond the gateway");
            return Ok(());
        }
        let (header, _) = IcmpHeader::try_read(message, ())?;
        trace!("{header}");
        if !checksum::verify_ip_checksum(message, message.len()) {
            debug!(src = %ip.src, "dropping ICMP message with bad checksum");
            return Ok(());
        }
        if header.icmp_type != icmp::ECHO_REQUEST {
            debug!(icmp_type = header.icmp_type, code = header.code, "unimplemented ICMP type");
            return Ok(());
        }

        // Identifier, sequence number and data are echoed back untouched.
        let mut reply = message.to_vec();
        let header = IcmpHeader { icmp_type: icmp::ECHO_REPLY, code: 0, checksum: 0 };
        reply.write(&mut 0, header)?;
        let len = reply.len();
        checksum::ip_checksum(&mut reply, IcmpHeader::CHECKSUM_OFFSET, len);

        let ethernet = EthernetHeader::new(frame.mac_src, self.gateway_mac, ethernet::ETHERTYPE_IPV4);
        let ip_reply = Ipv4Header::new(self.gateway_ip, ip.src, ipv4::PROTO_ICMP, ip.identification, ECHO_REPLY_TTL);
        let frame = crate::wire::ipv4_frame(ethernet, ip_reply, &reply)?;
        debug!(%owner, to = %ip.src, "echo reply");
        self.queue.push(owner, frame);
        Ok(())
    }
}
