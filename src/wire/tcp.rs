use byte::{BE, BytesExt, TryRead, TryWrite};
use std::fmt;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_TIMESTAMP: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, options included.
    pub header_len: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub const LEN: usize = 20;
    pub const CHECKSUM_OFFSET: usize = 16;

    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            header_len: Self::LEN,
            flags,
            window,
            checksum: 0,
            urgent: 0,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl TryRead<'_> for TcpHeader {
    fn try_read(bytes: &[u8], _ctx: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let src_port = bytes.read_with::<u16>(offset, BE)?;
        let dst_port = bytes.read_with::<u16>(offset, BE)?;
        let seq = bytes.read_with::<u32>(offset, BE)?;
        let ack = bytes.read_with::<u32>(offset, BE)?;
        let data_offset: u8 = bytes.read(offset)?;
        let header_len = usize::from(data_offset >> 4) * 4;
        if header_len < Self::LEN {
            return Err(byte::Error::BadInput { err: "TCP data offset below minimum" });
        }

        let header = TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            header_len,
            flags: bytes.read(offset)?,
            window: bytes.read_with::<u16>(offset, BE)?,
            checksum: bytes.read_with::<u16>(offset, BE)?,
            urgent: bytes.read_with::<u16>(offset, BE)?,
        };

        if bytes.len() < header_len {
            return Err(byte::Error::Incomplete);
        }

        Ok((header, header_len))
    }
}

impl TryWrite for TcpHeader {
    fn try_write(self, bytes: &mut [u8], _ctx: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        bytes.write_with(offset, self.src_port, BE)?;
        bytes.write_with(offset, self.dst_port, BE)?;
        bytes.write_with(offset, self.seq, BE)?;
        bytes.write_with(offset, self.ack, BE)?;
        bytes.write(offset, ((self.header_len / 4) as u8) << 4)?;
        bytes.write(offset, self.flags)?;
        bytes.write_with(offset, self.window, BE)?;
        bytes.write_with(offset, self.checksum, BE)?;
        bytes.write_with(offset, self.urgent, BE)?;

        Ok(*offset)
    }
}

impl fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp header:\n\tsrc port: {}\n\tdst port: {}\n\tseq: {}\n\tack: {}\n\tflags: {}\n\twindow: {}",
        self.src_port, self.dst_port, self.seq, self.ack, FlagNames(self.flags), self.window)
    }
}

struct FlagNames(u8);

impl fmt::Display for FlagNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(SYN, "SYN"), (ACK, "ACK"), (PSH, "PSH"), (FIN, "FIN"), (RST, "RST")];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Returns the (TSval, TSecr) pair from a TCP option block, if present.
pub fn timestamp_option(options: &[u8]) -> Option<(u32, u32)> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPT_END => return None,
            OPT_NOP => i += 1,
            kind => {
                let len = usize::from(*options.get(i + 1)?);
                if len < 2 || i + len > options.len() {
                    return None;
                }
                if kind == OPT_TIMESTAMP && len == 10 {
                    let value = &options[i + 2..i + 10];
                    let tsval = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    let tsecr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
                    return Some((tsval, tsecr));
                }
                i += len;
            }
        }
    }
    None
}

/// The option block attached to every synthesized segment: MSS 1460,
/// window scale 0 and a timestamp echoing the peer's last TSval.
pub fn gateway_options(tsval: u32, tsecr: u32) -> [u8; 20] {
    let mut options = [0u8; 20];
    options[..4].copy_from_slice(&[2, 4, 0x05, 0xb4]);
    options[4..8].copy_from_slice(&[OPT_NOP, 3, 3, 0]);
    options[8..10].copy_from_slice(&[OPT_NOP, OPT_NOP]);
    options[10] = OPT_TIMESTAMP;
    options[11] = 10;
    options[12..16].copy_from_slice(&tsval.to_be_bytes());
    options[16..20].copy_from_slice(&tsecr.to_be_bytes());
    options
}
