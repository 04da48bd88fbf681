use byte::{BE, BytesExt, TryRead, TryWrite};
use std::fmt;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// The fixed part of an ICMP message; everything after it (identifier,
/// sequence number, data) is carried through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
}

impl IcmpHeader {
    pub const LEN: usize = 4;
    pub const CHECKSUM_OFFSET: usize = 2;
}

impl TryRead<'_> for IcmpHeader {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let header = IcmpHeader {
            icmp_type: bytes.read(offset)?,
            code: bytes.read(offset)?,
            checksum: bytes.read_with::<u16>(offset, BE)?,
        };

        Ok((header, *offset))
    }
}

impl TryWrite for IcmpHeader {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        bytes.write(offset, self.icmp_type)?;
        bytes.write(offset, self.code)?;
        bytes.write_with(offset, self.checksum, BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for IcmpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "icmp header:\n\ttype: {}\n\tcode: {}", self.icmp_type, self.code)
    }
}
