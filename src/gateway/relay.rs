//! Raw frame relay between emulator instances sharing one simulated network.

use nix::errno::Errno;
use std::net::SocketAddrV4;
use tracing::{debug, info, trace};

use super::NetworkContext;
use crate::error::GatewayError;
use crate::socket::Socket;
use crate::wire::ethernet::EthernetHeader;

const MAX_RELAYED_FRAME: usize = 2048;

pub(super) struct Relay {
    socket: Socket,
    peers: Vec<SocketAddrV4>,
}

impl Relay {
    pub(super) fn bind(port: u16, peers: Vec<SocketAddrV4>) -> Result<Self, GatewayError> {
        let socket = Socket::udp_bound(port).map_err(|source| GatewayError::RelayBind { port, source })?;
        let local = socket.local_port().unwrap_or(port);
        info!(port = local, peers = ?peers, "frame relay listening");
        Ok(Relay { socket, peers })
    }

    pub(super) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(super) fn local_port(&self) -> Option<u16> {
        self.socket.local_port().ok()
    }

    /// Best effort: a peer that is down just misses the frame.
    pub(super) fn broadcast(&self, frame: &[u8]) {
        for peer in &self.peers {
            if let Err(err) = self.socket.send_to(frame, *peer) {
                debug!(%peer, %err, "relay send failed");
            }
        }
    }
}

impl NetworkContext {
    /// Local UDP port of the frame relay, if this network has one.
    pub fn relay_port(&self) -> Option<u16> {
        self.relay.as_ref().and_then(Relay::local_port)
    }

    /// Queues every frame waiting on the relay socket to all local controllers.
    pub(super) fn service_relay(&mut self) {
        let Some(relay) = &self.relay else {
            return;
        };

        let mut buf = [0u8; MAX_RELAYED_FRAME];
        loop {
            match relay.socket.recv_from(&mut buf) {
                Ok((len, from)) if len >= EthernetHeader::LEN => {
                    trace!(len, ?from, "relayed frame in");
                    for nic in &self.nics {
                        self.queue.push(nic.owner, buf[..len].to_vec());
                    }
                }
                Ok((len, from)) => debug!(len, ?from, "runt relayed frame dropped"),
                Err(Errno::EAGAIN) => break,
                Err(err) => {
                    debug!(%err, "relay receive failed");
                    break;
                }
            }
        }
    }
}
