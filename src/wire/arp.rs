use byte::{BE, BytesExt, TryRead, TryWrite};
use mac_address::MacAddress;
use std::{fmt, net::Ipv4Addr};

use super::{read_mac, write_mac};

pub const HTYPE_ETHERNET: u16 = 0x0001;
pub const PTYPE_IPV4: u16 = 0x0800;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;
pub const OP_RARP_REQUEST: u16 = 3;
pub const OP_RARP_REPLY: u16 = 4;

/// ARP and RARP share this layout; only the ethertype and opcodes differ.
#[derive(Clone, Copy, Debug)]
pub struct ArpHeader {
    pub htype: u16,
    pub ptype: u16,
    pub hlen: u8,
    pub plen: u8,
    pub oper: u16,
    pub sha: MacAddress,
    pub spa: Ipv4Addr,
    pub tha: MacAddress,
    pub tpa: Ipv4Addr,
}

impl ArpHeader {
    pub const LEN: usize = 28;

    pub fn ethernet_ipv4(oper: u16, sha: MacAddress, spa: Ipv4Addr, tha: MacAddress, tpa: Ipv4Addr) -> Self {
        ArpHeader {
            htype: HTYPE_ETHERNET,
            ptype: PTYPE_IPV4,
            hlen: 6,
            plen: 4,
            oper,
            sha,
            spa,
            tha,
            tpa,
        }
    }

    pub fn is_ethernet_ipv4(&self) -> bool {
        self.htype == HTYPE_ETHERNET && self.ptype == PTYPE_IPV4 && self.hlen == 6 && self.plen == 4
    }
}

impl TryRead<'_> for ArpHeader {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let header = ArpHeader {
            htype: bytes.read_with::<u16>(offset, BE)?,
            ptype: bytes.read_with::<u16>(offset, BE)?,
            hlen: bytes.read(offset)?,
            plen: bytes.read(offset)?,
            oper: bytes.read_with::<u16>(offset, BE)?,
            sha: read_mac(bytes, offset)?,
            spa: Ipv4Addr::from(bytes.read_with::<u32>(offset, BE)?),
            tha: read_mac(bytes, offset)?,
            tpa: Ipv4Addr::from(bytes.read_with::<u32>(offset, BE)?),
        };

        Ok((header, *offset))
    }
}

impl TryWrite for ArpHeader {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        bytes.write_with(offset, self.htype, BE)?;
        bytes.write_with(offset, self.ptype, BE)?;
        bytes.write(offset, self.hlen)?;
        bytes.write(offset, self.plen)?;
        bytes.write_with(offset, self.oper, BE)?;
        write_mac(bytes, offset, self.sha)?;
        bytes.write_with::<u32>(offset, self.spa.into(), BE)?;
        write_mac(bytes, offset, self.tha)?;
        bytes.write_with::<u32>(offset, self.tpa.into(), BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for ArpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arp header:\n\thtype: 0x{:x}\n\tptype: 0x{:x}\n\thlen: 0x{:x}\n\t\
        plen: 0x{:x}\n\toper: 0x{:x}\n\tsha: {}\n\tspa: {}\n\ttha: {}\n\ttpa: {}",
        self.htype, self.ptype, self.hlen, self.plen, self.oper, self.sha, self.spa, self.tha, self.tpa)
    }
}
