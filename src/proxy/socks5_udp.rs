//! SOCKS5 UDP ASSOCIATE relay carrying QUIC datagrams.
//!
//! The TCP control connection must stay open for the lifetime of the
//! association; a watchdog task owns it and tears the relay down as soon as
//! the proxy closes it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Invalidation, Result};
use crate::timeouts::{deadline, Timeouts};
use crate::transport::tcp;

use super::socks::{socks5_command, socks5_handshake, TargetAddr, CMD_UDP_ASSOCIATE};
use super::{udp, ProxyEndpoint};

/// Largest UDP request header: IPv4/IPv6/domain(255) plus RSV FRAG ATYP PORT.
const MAX_HEADER_LEN: usize = 4 + 1 + 255 + 2;

struct RelayState {
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl RelayState {
    /// Returns true for the caller that actually closed the relay.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        true
    }
}

/// An established UDP association through a SOCKS5 proxy.
pub struct Socks5UdpRelay {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    target: SocketAddr,
    proxy: String,
    state: Arc<RelayState>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Socks5UdpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5UdpRelay")
            .field("proxy", &self.proxy)
            .field("relay_addr", &self.relay_addr)
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socks5UdpRelay {
    /// Negotiate UDP ASSOCIATE with `endpoint` for datagrams to `target`.
    pub async fn associate(
        endpoint: &ProxyEndpoint,
        target: SocketAddr,
        timeouts: &Timeouts,
    ) -> Result<Arc<Self>> {
        if !endpoint.scheme.is_socks5() {
            return Err(crate::error::ProxyError::UnsupportedProxyForQuic(
                endpoint.scheme.as_str().to_string(),
            )
            .into());
        }

        let mut control = tcp::connect(&endpoint.host, endpoint.port, timeouts.connect).await?;
        let proxy_ip = control
            .peer_addr()
            .map_err(|e| Error::socks(format!("control connection has no peer: {}", e)))?
            .ip();

        let (bound, bound_port) = deadline("proxy", timeouts.proxy, async {
            socks5_handshake(&mut control, endpoint.credentials.as_ref()).await?;
            socks5_command(
                &mut control,
                CMD_UDP_ASSOCIATE,
                &TargetAddr::Ip(target.ip()),
                target.port(),
            )
            .await
        })
        .await?;

        let relay_ip = match bound {
            TargetAddr::Ip(ip) if ip.is_unspecified() => proxy_ip,
            TargetAddr::Ip(ip) => ip,
            TargetAddr::Domain(name) => tokio::net::lookup_host((name.as_str(), bound_port))
                .await
                .map_err(|e| Error::socks(format!("failed to resolve relay {}: {}", name, e)))?
                .next()
                .map(|addr| addr.ip())
                .ok_or_else(|| Error::socks(format!("relay {} has no address", name)))?,
        };
        let relay_addr = SocketAddr::new(relay_ip, bound_port);

        let bind_addr: SocketAddr = match relay_ip {
            IpAddr::V4(_) => "0.0.0.0:0",
            IpAddr::V6(_) => "[::]:0",
        }
        .parse()
        .map_err(|_| Error::socks("invalid local bind address"))?;
        let socket = UdpSocket::bind(bind_addr).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RelayState {
            closed: AtomicBool::new(false),
            shutdown,
        });
        let proxy = endpoint.to_string();
        let watchdog = tokio::spawn(watch_control(
            control,
            shutdown_rx,
            state.clone(),
            proxy.clone(),
        ));

        tracing::debug!(
            proxy = %proxy,
            relay = %relay_addr,
            target = %target,
            "SOCKS5: UDP association established"
        );

        Ok(Arc::new(Self {
            socket,
            relay_addr,
            target,
            proxy,
            state,
            watchdog: Mutex::new(Some(watchdog)),
        }))
    }

    /// Send one datagram to the associated target.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::SessionInvalidated(Invalidation::ConnClosed));
        }
        let packet = udp::wrap(&TargetAddr::Ip(self.target.ip()), self.target.port(), payload)?;
        self.socket.send_to(&packet, self.relay_addr).await?;
        Ok(payload.len())
    }

    /// Receive one datagram, returning the payload length and its source.
    ///
    /// Datagrams from anything but the relay, fragments and malformed headers
    /// are dropped silently.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut shutdown = self.state.shutdown.subscribe();
        let mut scratch = vec![0u8; buf.len() + MAX_HEADER_LEN];
        loop {
            if *shutdown.borrow() {
                return Err(Error::SessionInvalidated(Invalidation::ConnClosed));
            }
            let (len, from) = tokio::select! {
                received = self.socket.recv_from(&mut scratch) => received?,
                _ = shutdown.changed() => continue,
            };
            if from != self.relay_addr {
                tracing::trace!(from = %from, "SOCKS5: datagram from unexpected peer dropped");
                continue;
            }
            let (addr, port, payload) = match udp::unwrap(&scratch[..len]) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::trace!(error = %e, "SOCKS5: relayed datagram dropped");
                    continue;
                }
            };
            let source = match addr {
                TargetAddr::Ip(ip) => SocketAddr::new(ip, port),
                TargetAddr::Domain(_) => self.target,
            };
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok((n, source));
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Tear down the association. Safe to call any number of times.
    pub fn close(&self) {
        if !self.state.close() {
            return;
        }
        if let Ok(mut watchdog) = self.watchdog.lock() {
            if let Some(handle) = watchdog.take() {
                handle.abort();
            }
        }
        tracing::debug!(proxy = %self.proxy, relay = %self.relay_addr, "SOCKS5: UDP relay closed");
    }
}

impl Drop for Socks5UdpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watch_control(
    mut control: TcpStream,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<RelayState>,
    proxy: String,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = control.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::warn!(proxy = %proxy, "SOCKS5: control connection closed by proxy");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(proxy = %proxy, error = %e, "SOCKS5: control connection failed");
                    break;
                }
            },
        }
    }
    state.close();
}
