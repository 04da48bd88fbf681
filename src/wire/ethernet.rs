use byte::{BE, BytesExt, TryRead, TryWrite};
use mac_address::MacAddress;
use std::fmt;

use super::{read_mac, write_mac};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_RARP: u16 = 0x8035;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const BROADCAST: [u8; 6] = [0xff; 6];

#[derive(Clone, Copy, Debug)]
pub struct EthernetHeader {
    pub mac_dest: MacAddress,
    pub mac_src: MacAddress,
    pub ether_type: u16,
}

impl EthernetHeader {
    pub const LEN: usize = 14;

    pub fn new(mac_dest: MacAddress, mac_src: MacAddress, ether_type: u16) -> Self {
        EthernetHeader { mac_dest, mac_src, ether_type }
    }

    /// Group addresses (broadcast included) have the low bit of the first octet set.
    pub fn is_group_addressed(&self) -> bool {
        self.mac_dest.bytes()[0] & 0x01 != 0
    }
}

impl TryRead<'_> for EthernetHeader {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let header = EthernetHeader {
            mac_dest: read_mac(bytes, offset)?,
            mac_src: read_mac(bytes, offset)?,
            ether_type: bytes.read_with::<u16>(offset, BE)?,
        };

        Ok((header, *offset))
    }
}

impl TryWrite for EthernetHeader {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        write_mac(bytes, offset, self.mac_dest)?;
        write_mac(bytes, offset, self.mac_src)?;
        bytes.write_with::<u16>(offset, self.ether_type, BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for EthernetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ethernet header:\n\tmac dest: {}\n\tmac src: {}\n\tether_type: 0x{:x}", self.mac_dest, self.mac_src, self.ether_type)
    }
}
