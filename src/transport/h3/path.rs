//! Where QUIC datagrams travel: straight to the peer or through a relay.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::proxy::Socks5UdpRelay;

pub enum DatagramPath {
    Direct { socket: UdpSocket, peer: SocketAddr },
    Relay(Arc<Socks5UdpRelay>),
}

impl std::fmt::Debug for DatagramPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { peer, .. } => f.debug_struct("Direct").field("peer", peer).finish(),
            Self::Relay(relay) => f.debug_tuple("Relay").field(relay).finish(),
        }
    }
}

impl DatagramPath {
    /// Bind an ephemeral UDP socket of `peer`'s address family.
    pub async fn direct(peer: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        }
        .parse()
        .map_err(|_| Error::connection("invalid local bind address"))?;
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::Direct { socket, peer })
    }

    pub fn relay(relay: Arc<Socks5UdpRelay>) -> Self {
        Self::Relay(relay)
    }

    /// Address quiche sees as the peer.
    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Direct { peer, .. } => *peer,
            Self::Relay(relay) => relay.target(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::Direct { socket, .. } => Ok(socket.local_addr()?),
            Self::Relay(relay) => relay.local_addr(),
        }
    }

    pub async fn send(&self, datagram: &[u8]) -> Result<()> {
        match self {
            Self::Direct { socket, peer } => {
                socket.send_to(datagram, *peer).await?;
            }
            Self::Relay(relay) => {
                relay.send(datagram).await?;
            }
        }
        Ok(())
    }

    /// Next datagram from the peer. Strays from other addresses are skipped.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match self {
            Self::Direct { socket, peer } => loop {
                let (len, from) = socket.recv_from(buf).await?;
                if from == *peer {
                    return Ok((len, from));
                }
            },
            Self::Relay(relay) => relay.recv(buf).await,
        }
    }

    pub fn close(&self) {
        if let Self::Relay(relay) = self {
            relay.close();
        }
    }
}
