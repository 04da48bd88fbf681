//! TCP proxy: one real non-blocking stream socket per guest connection.
//!
//! The guest talks TCP to what it believes is the outside host; the gateway
//! terminates that conversation, relays the byte stream through a host socket
//! and synthesizes every segment the guest sees. Sequence numbers on the
//! guest side are the gateway's own (`outside_seqnr`) and the guest's
//! (`outside_acknr` is the next guest byte expected).

use byte::TryRead;
use mac_address::MacAddress;
use nix::errno::Errno;
use tracing::{debug, trace, warn};

use super::{NetworkContext, Outbox, TTL};
use crate::checksum;
use crate::queue::OwnerToken;
use crate::socket::{Readiness, Socket};
use crate::table::FourTuple;
use crate::wire::ethernet::{self, EthernetHeader};
use crate::wire::ipv4::{self, Ipv4Header};
use crate::wire::tcp::{gateway_options, timestamp_option, TcpHeader, ACK, FIN, PSH, RST, SYN};

/// Largest chunk read from a socket and kept for retransmission.
pub(crate) const READ_CHUNK: usize = 1024;
const WINDOW: u16 = 0x4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    TryingToConnect,
    Connected,
    /// The outside peer closed or failed; our FIN is due or sent.
    OutsideDisconnected,
    /// The guest closed too.
    OutsideDisconnected2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Verdict {
    Keep,
    Free,
}

#[derive(Clone, Copy, Debug)]
enum Reply<'a> {
    SynAck,
    Reset,
    Ack,
    Data(&'a [u8]),
}

/// `a >= b` in sequence space.
fn seq_ge(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

pub(super) struct TcpConnection {
    owner: OwnerToken,
    guest_mac: MacAddress,
    key: FourTuple,
    socket: Socket,
    state: TcpState,
    inside_seqnr: u32,
    inside_acknr: u32,
    outside_seqnr: u32,
    outside_acknr: u32,
    fin_sent: bool,
    unacked: Vec<u8>,
    unacked_seqnr: u32,
    unacked_rounds: u32,
    frame_id: u16,
    inside_timestamp: u32,
}

impl TcpConnection {
    fn new(owner: OwnerToken, guest_mac: MacAddress, key: FourTuple, socket: Socket, syn: &TcpHeader, options: &[u8]) -> Self {
        let isn: u32 = rand::random();
        TcpConnection {
            owner,
            guest_mac,
            key,
            socket,
            state: TcpState::TryingToConnect,
            inside_seqnr: syn.seq,
            inside_acknr: isn,
            outside_seqnr: isn,
            outside_acknr: syn.seq.wrapping_add(1),
            fin_sent: false,
            unacked: Vec::new(),
            unacked_seqnr: isn,
            unacked_rounds: 0,
            frame_id: 0,
            inside_timestamp: timestamp_option(options).map_or(0, |(tsval, _)| tsval),
        }
    }

    pub(super) fn state(&self) -> TcpState {
        self.state
    }

    pub(super) fn socket(&self) -> &Socket {
        &self.socket
    }

    fn build(&self, gateway_mac: MacAddress, now: u64, flags: u8, seq: u32, payload: &[u8]) -> byte::Result<Vec<u8>> {
        let header = TcpHeader::new(self.key.outside_port, self.key.guest_port, seq, self.outside_acknr, flags, WINDOW);
        let options = gateway_options(now as u32, self.inside_timestamp);
        let segment = crate::wire::tcp_segment(self.key.outside_ip, self.key.guest_ip, header, &options, payload)?;

        let ethernet = EthernetHeader::new(self.guest_mac, gateway_mac, ethernet::ETHERTYPE_IPV4);
        let ip = Ipv4Header::new(self.key.outside_ip, self.key.guest_ip, ipv4::PROTO_TCP, self.frame_id, TTL);
        crate::wire::ipv4_frame(ethernet, ip, &segment)
    }

    fn emit(&mut self, out: &mut Outbox<'_>, flags: u8, seq: u32, payload: &[u8]) {
        match self.build(out.gateway_mac, out.now, flags, seq, payload) {
            Ok(frame) => {
                trace!(key = %self.key, seq, ack = self.outside_acknr, len = payload.len(), flags, "segment to guest");
                out.push(self.owner, frame);
            }
            Err(err) => warn!(key = %self.key, ?err, "cannot build TCP segment"),
        }
        self.frame_id = self.frame_id.wrapping_add(1);
    }

    /// Sends one segment with control bits derived from the connection state
    /// and advances `outside_seqnr` past whatever it carries.
    fn reply(&mut self, out: &mut Outbox<'_>, reply: Reply<'_>) {
        let seq = self.outside_seqnr;
        match reply {
            Reply::SynAck => {
                self.emit(out, SYN | ACK, seq, &[]);
                self.outside_seqnr = seq.wrapping_add(1);
            }
            Reply::Reset => self.emit(out, RST | ACK, seq, &[]),
            Reply::Ack | Reply::Data(_) => {
                let payload: &[u8] = match reply {
                    Reply::Data(payload) => payload,
                    _ => &[],
                };
                let mut flags = ACK;
                let mut advance = payload.len() as u32;
                if self.state == TcpState::Connected && !payload.is_empty() {
                    flags |= PSH;
                }
                if self.state >= TcpState::OutsideDisconnected && !self.fin_sent && payload.is_empty() {
                    flags |= FIN;
                    advance += 1;
                    self.fin_sent = true;
                }
                self.emit(out, flags, seq, payload);
                self.outside_seqnr = seq.wrapping_add(advance);
            }
        }
    }

    fn retransmit(&mut self, out: &mut Outbox<'_>) {
        debug!(key = %self.key, seq = self.unacked_seqnr, len = self.unacked.len(), "retransmitting");
        let payload = std::mem::take(&mut self.unacked);
        self.emit(out, PSH | ACK, self.unacked_seqnr, &payload);
        self.unacked = payload;
    }

    fn disconnect(&mut self, out: &mut Outbox<'_>, reason: &str) {
        debug!(key = %self.key, reason, guest_seq = self.inside_seqnr, "outside disconnected");
        if self.state < TcpState::OutsideDisconnected {
            self.state = TcpState::OutsideDisconnected;
        }
        self.reply(out, Reply::Ack);
    }

    /// A segment from the guest on this connection.
    fn on_segment(&mut self, out: &mut Outbox<'_>, header: &TcpHeader, options: &[u8], data: &[u8]) -> Verdict {
        let fin = header.has(FIN);
        if (fin || !data.is_empty()) && header.seq != self.outside_acknr {
            trace!(key = %self.key, seq = header.seq, expected = self.outside_acknr, "out-of-order segment dropped");
            return Verdict::Keep;
        }

        self.inside_seqnr = header.seq;
        if header.has(ACK) {
            self.inside_acknr = header.ack;
        }
        if let Some((tsval, _)) = timestamp_option(options) {
            self.inside_timestamp = tsval;
        }

        if header.has(RST) {
            debug!(key = %self.key, "guest reset");
            self.reply(out, Reply::Reset);
            return Verdict::Free;
        }
        if header.has(SYN) {
            trace!(key = %self.key, "duplicate SYN ignored");
            return Verdict::Keep;
        }

        if header.has(ACK)
            && !self.unacked.is_empty()
            && seq_ge(header.ack, self.unacked_seqnr.wrapping_add(self.unacked.len() as u32))
        {
            self.unacked.clear();
            self.unacked_rounds = 0;
        }

        let mut fin = fin;
        if !data.is_empty() {
            if !matches!(self.state, TcpState::Connected | TcpState::OutsideDisconnected) {
                debug!(key = %self.key, state = ?self.state, "data in unexpected state dropped");
                return Verdict::Keep;
            }
            if !self.socket.is_writable() {
                trace!(key = %self.key, "socket not writable, guest will retransmit");
                return Verdict::Keep;
            }
            match self.socket.send(data) {
                Ok(written) => {
                    self.outside_acknr = self.outside_acknr.wrapping_add(written as u32);
                    // A FIN behind unwritten bytes is not ours to accept yet.
                    fin = fin && written == data.len();
                    if !fin {
                        self.reply(out, Reply::Ack);
                    }
                }
                Err(Errno::EAGAIN) => return Verdict::Keep,
                Err(err) => {
                    warn!(key = %self.key, %err, "write to outside failed");
                    self.disconnect(out, "write error");
                    return Verdict::Keep;
                }
            }
        }

        if fin {
            let our_fin_acked = self.fin_sent && header.has(ACK) && header.ack == self.outside_seqnr;
            self.outside_acknr = self.outside_acknr.wrapping_add(1);
            if let Err(err) = self.socket.shutdown_write() {
                debug!(key = %self.key, %err, "shutdown failed");
            }
            self.state = TcpState::OutsideDisconnected2;
            self.reply(out, Reply::Ack);
            if our_fin_acked {
                debug!(key = %self.key, "closed");
                return Verdict::Free;
            }
            return Verdict::Keep;
        }

        if self.state == TcpState::OutsideDisconnected2
            && self.fin_sent
            && header.has(ACK)
            && header.ack == self.outside_seqnr
        {
            debug!(key = %self.key, "closed");
            return Verdict::Free;
        }
        Verdict::Keep
    }

    /// One poll round for this connection.
    fn service(&mut self, out: &mut Outbox<'_>, ready: Readiness, retransmit_rounds: u32) -> Verdict {
        match self.state {
            TcpState::TryingToConnect => {
                if !(ready.writable || ready.error) {
                    return Verdict::Keep;
                }
                match self.socket.take_error() {
                    Ok(None) => {
                        debug!(key = %self.key, "connected");
                        self.state = TcpState::Connected;
                        self.reply(out, Reply::SynAck);
                        Verdict::Keep
                    }
                    Ok(Some(err)) | Err(err) => {
                        debug!(key = %self.key, %err, "connect failed");
                        self.reply(out, Reply::Reset);
                        Verdict::Free
                    }
                }
            }
            TcpState::Connected => {
                if ready.error {
                    if let Ok(Some(err)) = self.socket.take_error() {
                        self.disconnect(out, err.desc());
                        return Verdict::Keep;
                    }
                }

                if !self.unacked.is_empty() {
                    self.unacked_rounds += 1;
                    if self.unacked_rounds >= retransmit_rounds {
                        self.unacked_rounds = 0;
                        self.retransmit(out);
                    }
                    return Verdict::Keep;
                }
                if self.inside_acknr != self.outside_seqnr || !(ready.readable || ready.error) {
                    return Verdict::Keep;
                }

                let mut buf = [0u8; READ_CHUNK];
                match self.socket.recv(&mut buf) {
                    Ok(0) => self.disconnect(out, "end of stream"),
                    Ok(len) => {
                        self.unacked = buf[..len].to_vec();
                        self.unacked_seqnr = self.outside_seqnr;
                        self.unacked_rounds = 0;
                        self.reply(out, Reply::Data(&buf[..len]));
                    }
                    Err(Errno::EAGAIN) => {}
                    Err(err) => self.disconnect(out, err.desc()),
                }
                Verdict::Keep
            }
            TcpState::OutsideDisconnected | TcpState::OutsideDisconnected2 => Verdict::Keep,
        }
    }
}

/// RST|ACK answering a segment that has no connection behind it.
fn reset_frame(gateway_mac: MacAddress, guest_mac: MacAddress, ip: &Ipv4Header, header: &TcpHeader, data_len: usize) -> byte::Result<Vec<u8>> {
    let seq = if header.has(ACK) { header.ack } else { 0 };
    let consumed = data_len as u32 + u32::from(header.has(SYN)) + u32::from(header.has(FIN));
    let reply = TcpHeader::new(header.dst_port, header.src_port, seq, header.seq.wrapping_add(consumed), RST | ACK, 0);
    let segment = crate::wire::tcp_segment(ip.dst, ip.src, reply, &[], &[])?;

    let ethernet = EthernetHeader::new(guest_mac, gateway_mac, ethernet::ETHERTYPE_IPV4);
    crate::wire::ipv4_frame(ethernet, Ipv4Header::new(ip.dst, ip.src, ipv4::PROTO_TCP, 0, TTL), &segment)
}

impl NetworkContext {
    fn refuse_tcp(&mut self, owner: OwnerToken, guest_mac: MacAddress, ip: &Ipv4Header, header: &TcpHeader, data_len: usize) {
        match reset_frame(self.gateway_mac, guest_mac, ip, header, data_len) {
            Ok(frame) => self.queue.push(owner, frame),
            Err(err) => warn!(?err, "cannot build TCP reset"),
        }
    }

    fn open_tcp(&mut self, owner: OwnerToken, frame: &EthernetHeader, ip: &Ipv4Header, key: FourTuple, syn: &TcpHeader, options: &[u8]) {
        if self.tcp.is_full() {
            warn!(%key, capacity = self.tcp.capacity(), "TCP connection table full, refusing");
            self.refuse_tcp(owner, frame.mac_src, ip, syn, 0);
            return;
        }
        if key.outside_ip == self.gateway_ip {
            debug!(%key, "nothing listens on the gateway");
            self.refuse_tcp(owner, frame.mac_src, ip, syn, 0);
            return;
        }

        let socket = match Socket::tcp_connect(key.outside()) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%key, %err, "cannot open outside connection");
                self.refuse_tcp(owner, frame.mac_src, ip, syn, 0);
                return;
            }
        };
        let conn = TcpConnection::new(owner, frame.mac_src, key, socket, syn, options);
        if self.tcp.try_insert(key, conn).is_ok() {
            debug!(%key, %owner, "connecting");
        }
    }

    pub(super) fn handle_tcp(
        &mut self,
        owner: OwnerToken,
        frame: &EthernetHeader,
        ip: &Ipv4Header,
        segment: &[u8],
    ) -> byte::Result<()> {
        if ip.is_fragment() {
            debug!(src = %ip.src, dst = %ip.dst, "unimplemented: fragmented TCP");
            return Ok(());
        }
        if !checksum::verify_tcp_udp_checksum(segment, segment.len(), ip.src, ip.dst, false) {
            debug!(src = %ip.src, dst = %ip.dst, "dropping TCP segment with bad checksum");
            return Ok(());
        }
        let (header, header_len) = TcpHeader::try_read(segment, ())?;
        trace!("{header}");
        let options = &segment[TcpHeader::LEN..header_len];
        let data = &segment[header_len..];
        let key = FourTuple::new(ip.src, header.src_port, ip.dst, header.dst_port);

        if header.has(SYN) && !header.has(ACK) && !header.has(RST) {
            if self.tcp.contains(&key) {
                trace!(%key, "duplicate SYN ignored");
            } else {
                self.open_tcp(owner, frame, ip, key, &header, options);
            }
            return Ok(());
        }

        if !self.tcp.contains(&key) {
            if !header.has(RST) {
                debug!(%key, flags = header.flags, "segment for unknown connection");
                self.refuse_tcp(owner, frame.mac_src, ip, &header, data.len());
            }
            return Ok(());
        }

        let now = self.timestamp;
        let Some(conn) = self.tcp.get_mut(&key) else {
            return Ok(());
        };

        let mut out = Outbox::new(&mut self.queue, self.gateway_mac, now);
        match conn.on_segment(&mut out, &header, options, data) {
            Verdict::Keep => self.tcp.touch(&key),
            Verdict::Free => {
                self.tcp.remove(&key);
            }
        }
        Ok(())
    }

    pub(super) fn service_tcp(&mut self, key: &FourTuple, ready: Readiness) {
        let rounds = self.config.retransmit_rounds;
        let now = self.timestamp + 1;
        let Some(conn) = self.tcp.get_mut(key) else {
            return;
        };

        let mut out = Outbox::new(&mut self.queue, self.gateway_mac, now);
        let verdict = conn.service(&mut out, ready, rounds);
        let sent = out.sent;
        if sent > 0 {
            self.timestamp = now;
            self.tcp.touch(key);
        }
        if verdict == Verdict::Free {
            self.tcp.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FrameQueue;
    use byte::TryRead;
    use std::net::Ipv4Addr;

    const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const OUTSIDE: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    fn gateway_mac() -> MacAddress {
        MacAddress::new([0x60, 0x50, 0x40, 0x30, 0x20, 0x10])
    }

    fn connection(state: TcpState) -> TcpConnection {
        connection_over(state, Socket::udp().unwrap())
    }

    fn connection_over(state: TcpState, socket: Socket) -> TcpConnection {
        let key = FourTuple::new(GUEST, 40000, OUTSIDE, 80);
        let syn = TcpHeader::new(40000, 80, 500, 0, SYN, 0x1000);
        let mut conn = TcpConnection::new(
            OwnerToken(1),
            MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            key,
            socket,
            &syn,
            &[],
        );
        conn.state = state;
        conn.outside_seqnr = 1000;
        conn
    }

    /// A connected stream whose peer has already answered with RST.
    fn reset_stream() -> Socket {
        use crate::socket::{poll_readiness, Interest};
        use nix::sys::socket::{setsockopt, sockopt};
        use std::net::{SocketAddrV4, TcpListener};
        use std::os::unix::io::AsRawFd;
        use std::time::{Duration, Instant};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let socket = Socket::tcp_connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let linger = nix::libc::linger { l_onoff: 1, l_linger: 0 };
        setsockopt(accepted.as_raw_fd(), sockopt::Linger, &linger).unwrap();
        drop(accepted);

        let interest = [Interest { fd: socket.as_raw_fd(), read: true, write: false }];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !poll_readiness(&interest).unwrap()[0].readable {
            assert!(Instant::now() < deadline, "peer reset never arrived");
            std::thread::sleep(Duration::from_millis(2));
        }
        socket
    }

    fn parse(frame: &[u8]) -> (TcpHeader, Vec<u8>) {
        let packet = &frame[EthernetHeader::LEN..];
        let (ip, ip_len) = Ipv4Header::try_read(packet, ()).unwrap();
        let segment = &packet[ip_len..usize::from(ip.total_len)];
        assert!(checksum::verify_tcp_udp_checksum(segment, segment.len(), ip.src, ip.dst, false));
        let (header, len) = TcpHeader::try_read(segment, ()).unwrap();
        (header, segment[len..].to_vec())
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_ge(5, 5));
        assert!(seq_ge(6, 5));
        assert!(!seq_ge(4, 5));
        assert!(seq_ge(3, u32::MAX - 2));
        assert!(!seq_ge(u32::MAX - 2, 3));
    }

    #[test]
    fn syn_ack_consumes_one_sequence_number() {
        let mut conn = connection(TcpState::Connected);
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);
        conn.reply(&mut out, Reply::SynAck);

        let (header, _) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        assert_eq!(header.flags, SYN | ACK);
        assert_eq!(header.seq, 1000);
        assert_eq!(header.ack, 501);
        assert_eq!(header.header_len, 40);
        assert_eq!(conn.outside_seqnr, 1001);
    }

    #[test]
    fn data_reply_is_pushed_and_advances() {
        let mut conn = connection(TcpState::Connected);
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);
        conn.reply(&mut out, Reply::Data(b"hello"));

        let (header, payload) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        assert_eq!(header.flags, PSH | ACK);
        assert_eq!(payload, b"hello");
        assert_eq!(conn.outside_seqnr, 1005);
        assert!(!conn.fin_sent);
    }

    #[test]
    fn fin_is_sent_once_after_outside_disconnect() {
        let mut conn = connection(TcpState::OutsideDisconnected);
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);
        conn.reply(&mut out, Reply::Ack);
        conn.reply(&mut out, Reply::Ack);

        let (first, _) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        let (second, _) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        assert_eq!(first.flags, FIN | ACK);
        assert_eq!(second.flags, ACK);
        assert_eq!(second.seq, 1001);
        assert!(conn.fin_sent);
    }

    #[test]
    fn out_of_order_data_leaves_state_untouched() {
        let mut conn = connection(TcpState::Connected);
        let before = (conn.inside_seqnr, conn.inside_acknr, conn.outside_acknr, conn.inside_timestamp);
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);

        let header = TcpHeader::new(40000, 80, 9999, 1000, ACK | PSH, 0x1000);
        assert_eq!(conn.on_segment(&mut out, &header, &[], b"late"), Verdict::Keep);
        assert_eq!(out.sent, 0);
        assert_eq!(before, (conn.inside_seqnr, conn.inside_acknr, conn.outside_acknr, conn.inside_timestamp));
    }

    #[test]
    fn write_error_disconnects_the_outside() {
        // An unconnected datagram socket is writable but every send fails.
        let mut conn = connection(TcpState::Connected);
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);

        let header = TcpHeader::new(40000, 80, 501, 1000, ACK | PSH, 0x1000);
        assert_eq!(conn.on_segment(&mut out, &header, &[], b"hello"), Verdict::Keep);
        assert_eq!(conn.state, TcpState::OutsideDisconnected);
        assert_eq!(conn.outside_acknr, 501);

        let (reply, _) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        assert_eq!(reply.flags, FIN | ACK);
        assert_eq!(reply.seq, 1000);
        assert!(conn.fin_sent);
    }

    #[test]
    fn read_error_disconnects_the_outside() {
        let mut conn = connection_over(TcpState::Connected, reset_stream());
        conn.inside_acknr = conn.outside_seqnr;
        let mut queue = FrameQueue::new();
        let mut out = Outbox::new(&mut queue, gateway_mac(), 7);

        // Readable without the error bit, so the reset surfaces from recv.
        let ready = Readiness { readable: true, writable: false, error: false };
        assert_eq!(conn.service(&mut out, ready, 100), Verdict::Keep);
        assert_eq!(conn.state, TcpState::OutsideDisconnected);

        let (reply, payload) = parse(&queue.pop_for(OwnerToken(1)).unwrap());
        assert_eq!(reply.flags, FIN | ACK);
        assert!(payload.is_empty());
        assert!(queue.pop_for(OwnerToken(1)).is_none());
    }

    #[test]
    fn reset_for_unknown_segment_acknowledges_its_data() {
        let ip = Ipv4Header::new(GUEST, OUTSIDE, ipv4::PROTO_TCP, 1, 64);
        let header = TcpHeader::new(40000, 80, 77, 1234, ACK | PSH, 0x1000);
        let frame = reset_frame(gateway_mac(), MacAddress::new([2; 6]), &ip, &header, 10).unwrap();

        let (reply, _) = parse(&frame);
        assert_eq!(reply.flags, RST | ACK);
        assert_eq!(reply.seq, 1234);
        assert_eq!(reply.ack, 87);
        assert_eq!((reply.src_port, reply.dst_port), (80, 40000));
    }
}
