use byte::{BE, BytesExt, TryRead, TryWrite};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub const LEN: usize = 8;
    pub const CHECKSUM_OFFSET: usize = 6;

    pub fn new(src_port: u16, dst_port: u16) -> Self {
        UdpHeader { src_port, dst_port, length: 0, checksum: 0 }
    }
}

impl TryRead<'_> for UdpHeader {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let header = UdpHeader {
            src_port: bytes.read_with::<u16>(offset, BE)?,
            dst_port: bytes.read_with::<u16>(offset, BE)?,
            length: bytes.read_with::<u16>(offset, BE)?,
            checksum: bytes.read_with::<u16>(offset, BE)?,
        };

        let length = usize::from(header.length);
        if length < Self::LEN || length > bytes.len() {
            return Err(byte::Error::BadInput { err: "UDP length out of range" });
        }

        Ok((header, *offset))
    }
}

impl TryWrite for UdpHeader {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        bytes.write_with(offset, self.src_port, BE)?;
        bytes.write_with(offset, self.dst_port, BE)?;
        bytes.write_with(offset, self.length, BE)?;
        bytes.write_with(offset, self.checksum, BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for UdpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp header:\n\tsrc port: {}\n\tdst port: {}\n\tlength: {}", self.src_port, self.dst_port, self.length)
    }
}
