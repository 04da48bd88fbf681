use byte::{BE, BytesExt, TryRead, TryWrite};
use std::{fmt, net::Ipv4Addr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

/// IPv4 header. Reading accepts options (and skips them); writing always emits
/// a bare 20-byte header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub const LEN: usize = 20;
    pub const CHECKSUM_OFFSET: usize = 10;

    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, identification: u16, ttl: u8) -> Self {
        Ipv4Header {
            tos: 0,
            total_len: 0,
            identification,
            flags_fragment: 0,
            ttl,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Fragment offset in bytes.
    pub fn fragment_offset(&self) -> usize {
        usize::from(self.flags_fragment & FRAGMENT_OFFSET_MASK) * 8
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_fragment & FLAG_MORE_FRAGMENTS != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }
}

impl TryRead<'_> for Ipv4Header {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let version_ihl: u8 = bytes.read(offset)?;
        if version_ihl >> 4 != 4 {
            return Err(byte::Error::BadInput { err: "not an IPv4 header" });
        }
        let header_len = usize::from(version_ihl & 0x0f) * 4;
        if header_len < Self::LEN {
            return Err(byte::Error::BadInput { err: "IPv4 header length below minimum" });
        }

        let header = Ipv4Header {
            tos: bytes.read(offset)?,
            total_len: bytes.read_with::<u16>(offset, BE)?,
            identification: bytes.read_with::<u16>(offset, BE)?,
            flags_fragment: bytes.read_with::<u16>(offset, BE)?,
            ttl: bytes.read(offset)?,
            protocol: bytes.read(offset)?,
            checksum: bytes.read_with::<u16>(offset, BE)?,
            src: Ipv4Addr::from(bytes.read_with::<u32>(offset, BE)?),
            dst: Ipv4Addr::from(bytes.read_with::<u32>(offset, BE)?),
        };

        if bytes.len() < header_len {
            return Err(byte::Error::Incomplete);
        }
        if usize::from(header.total_len) < header_len || usize::from(header.total_len) > bytes.len() {
            return Err(byte::Error::BadInput { err: "IPv4 total length out of range" });
        }

        Ok((header, header_len))
    }
}

impl TryWrite for Ipv4Header {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        bytes.write(offset, 0x45u8)?;
        bytes.write(offset, self.tos)?;
        bytes.write_with(offset, self.total_len, BE)?;
        bytes.write_with(offset, self.identification, BE)?;
        bytes.write_with(offset, self.flags_fragment, BE)?;
        bytes.write(offset, self.ttl)?;
        bytes.write(offset, self.protocol)?;
        bytes.write_with(offset, self.checksum, BE)?;
        bytes.write_with::<u32>(offset, self.src.into(), BE)?;
        bytes.write_with::<u32>(offset, self.dst.into(), BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for Ipv4Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipv4 header:\n\tsrc: {}\n\tdst: {}\n\tprotocol: {}\n\ttotal_len: {}\n\tid: 0x{:x}\n\t\
        flags/fragment: 0x{:x}\n\tttl: {}",
        self.src, self.dst, self.protocol, self.total_len, self.identification, self.flags_fragment, self.ttl)
    }
}
