//! Non-blocking host sockets backing the proxied connections.
//!
//! All I/O here returns immediately. Readiness for every open socket is
//! gathered with a single zero-timeout `poll(2)` per gateway tick.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    self, bind, connect, getsockopt, recv, recvfrom, send, sendto, sockopt, AddressFamily, MsgFlags, Shutdown,
    SockFlag, SockType, SockaddrIn,
};
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::trace;

// Writes to a peer-reset stream must not raise SIGPIPE in the emulator.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// An owned, non-blocking IPv4 socket. Closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    fn open(ty: SockType) -> nix::Result<Self> {
        let raw = socket::socket(AddressFamily::Inet, ty, SockFlag::empty(), None)?;
        // SAFETY: `raw` was just returned by socket(2) and has no other owner.
        let sock = Socket { fd: unsafe { OwnedFd::from_raw_fd(raw) } };
        fcntl(sock.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        Ok(sock)
    }

    /// Starts a non-blocking connect. Completion is observed later through
    /// write readiness and [`Socket::take_error`].
    pub fn tcp_connect(addr: SocketAddrV4) -> nix::Result<Self> {
        let sock = Self::open(SockType::Stream)?;
        match connect(sock.as_raw_fd(), &SockaddrIn::from(addr)) {
            Ok(()) | Err(Errno::EINPROGRESS) => {
                trace!(fd = sock.as_raw_fd(), %addr, "connect in progress");
                Ok(sock)
            }
            Err(err) => Err(err),
        }
    }

    pub fn udp() -> nix::Result<Self> {
        Self::open(SockType::Datagram)
    }

    pub fn udp_bound(port: u16) -> nix::Result<Self> {
        let sock = Self::open(SockType::Datagram)?;
        bind(sock.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, port))?;
        Ok(sock)
    }

    /// Pending socket error (`SO_ERROR`), cleared by reading it.
    pub fn take_error(&self) -> nix::Result<Option<Errno>> {
        let code = getsockopt(self.as_raw_fd(), sockopt::SocketError)?;
        Ok((code != 0).then(|| Errno::from_i32(code)))
    }

    pub fn send(&self, buf: &[u8]) -> nix::Result<usize> {
        send(self.as_raw_fd(), buf, SEND_FLAGS)
    }

    pub fn recv(&self, buf: &mut [u8]) -> nix::Result<usize> {
        recv(self.as_raw_fd(), buf, MsgFlags::empty())
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> nix::Result<usize> {
        sendto(self.as_raw_fd(), buf, &SockaddrIn::from(addr), SEND_FLAGS)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> nix::Result<(usize, Option<SocketAddrV4>)> {
        let (len, from) = recvfrom::<SockaddrIn>(self.as_raw_fd(), buf)?;
        Ok((len, from.map(SocketAddrV4::from)))
    }

    pub fn shutdown_write(&self) -> nix::Result<()> {
        socket::shutdown(self.as_raw_fd(), Shutdown::Write)
    }

    pub fn is_writable(&self) -> bool {
        let mut fds = [PollFd::new(self.as_raw_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, 0) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map_or(false, |revents| revents.contains(PollFlags::POLLOUT)),
            _ => false,
        }
    }

    pub fn local_port(&self) -> nix::Result<u16> {
        let addr: SockaddrIn = socket::getsockname(self.as_raw_fd())?;
        Ok(addr.port())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Readiness reported for one socket by [`poll_readiness`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    fn from_revents(revents: Option<PollFlags>) -> Self {
        let revents = revents.unwrap_or(PollFlags::empty());
        Readiness {
            readable: revents.intersects(PollFlags::POLLIN),
            writable: revents.intersects(PollFlags::POLLOUT),
            error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL),
        }
    }
}

/// Interest registered for one socket.
#[derive(Clone, Copy, Debug)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// One zero-timeout `poll(2)` over every socket of interest. Results are
/// returned in the order of `interests`.
pub fn poll_readiness(interests: &[Interest]) -> nix::Result<Vec<Readiness>> {
    if interests.is_empty() {
        return Ok(Vec::new());
    }

    let mut fds: Vec<PollFd> = interests
        .iter()
        .map(|interest| {
            let mut events = PollFlags::empty();
            if interest.read {
                events |= PollFlags::POLLIN;
            }
            if interest.write {
                events |= PollFlags::POLLOUT;
            }
            PollFd::new(interest.fd, events)
        })
        .collect();

    loop {
        match poll(&mut fds, 0) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(fds.iter().map(|fd| Readiness::from_revents(fd.revents())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener, UdpSocket};
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn non_blocking_connect_becomes_writable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let sock = Socket::tcp_connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();

        assert!(wait_until(|| sock.is_writable()));
        assert_eq!(sock.take_error().unwrap(), None);
    }

    #[test]
    fn dropping_the_socket_closes_the_connection() {
        use std::io::Read;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let sock = Socket::tcp_connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();
        assert!(wait_until(|| sock.is_writable()));

        drop(sock);
        accepted.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(accepted.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn empty_udp_socket_reports_would_block() {
        let sock = Socket::udp_bound(0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sock.recv_from(&mut buf).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn poll_readiness_reports_each_socket() {
        let idle = Socket::udp_bound(0).unwrap();
        let busy = Socket::udp_bound(0).unwrap();
        let port = busy.local_port().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let interests = [
            Interest { fd: idle.as_raw_fd(), read: true, write: false },
            Interest { fd: busy.as_raw_fd(), read: true, write: false },
        ];
        assert!(wait_until(|| poll_readiness(&interests).unwrap()[1].readable));
        assert!(!poll_readiness(&interests).unwrap()[0].readable);

        let mut buf = [0u8; 16];
        let (len, from) = busy.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, sender.local_addr().unwrap().port())));
    }

    #[test]
    fn poll_readiness_of_nothing_is_empty() {
        assert!(poll_readiness(&[]).unwrap().is_empty());
    }
}
