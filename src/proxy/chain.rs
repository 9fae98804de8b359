//! Unified proxy dialer: direct, SOCKS, or a chain of HTTP/HTTPS hops.
//!
//! For a chain `[h1, h2, .., hn]` and destination `D`:
//!
//! 1. TCP to `h1` (TLS on top when `h1` is https)
//! 2. CONNECT `h(i)` through `h(i-1)`, over HTTP/2 when `h(i-1)` negotiated
//!    `h2`, HTTP/1.1 otherwise; TLS upgrade right after when `h(i)` is https
//! 3. CONNECT `D` through `hn`
//!
//! When the last hop speaks HTTP/2 its session is kept and later dials open a
//! fresh CONNECT stream on it instead of rebuilding the chain.

use std::sync::{Arc, Mutex};

use crate::error::{ProxyError, Result};
use crate::fingerprint::{ClientHelloSpec, Http2Fingerprint};
use crate::timeouts::{deadline, Timeouts};
use crate::transport::connector::{AlpnProtocol, TlsConnector};
use crate::transport::h2::H2Handle;
use crate::transport::{h1, h2, tcp, BoxedStream};

use super::{authority, socks, ProxyConfig, ProxyEndpoint, ProxyScheme};

/// ALPN offered to HTTPS proxy hops.
const PROXY_ALPN: [&str; 2] = ["h2", "http/1.1"];

/// A stream positioned at some hop, plus what that hop negotiated.
struct Link {
    stream: BoxedStream,
    h2: bool,
}

/// Dials destinations through a [`ProxyConfig`].
pub struct ProxyDialer {
    config: ProxyConfig,
    tls: Arc<TlsConnector>,
    http2: Http2Fingerprint,
    timeouts: Timeouts,
    user_agent: Option<String>,
    last_hop: Mutex<Option<H2Handle>>,
}

impl std::fmt::Debug for ProxyDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDialer")
            .field("route", &self.config.route_id())
            .finish()
    }
}

impl ProxyDialer {
    pub fn new(
        config: ProxyConfig,
        tls: Arc<TlsConnector>,
        http2: Http2Fingerprint,
        timeouts: Timeouts,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            config,
            tls,
            http2,
            timeouts,
            user_agent,
            last_hop: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Fingerprint for HTTP/2 sessions with the hops.
    pub fn http2(&self) -> &Http2Fingerprint {
        &self.http2
    }

    /// Open a byte stream to `host:port`. TLS to the destination is the
    /// caller's business; `hello` shapes the handshakes with HTTPS hops.
    pub async fn dial(&self, host: &str, port: u16, hello: &ClientHelloSpec) -> Result<BoxedStream> {
        let hops = self.config.hops();
        if hops.is_empty() {
            let stream = tcp::connect(host, port, self.timeouts.connect).await?;
            return Ok(Box::new(stream));
        }
        if hops.iter().any(|hop| hop.scheme.is_socks()) {
            if hops.len() > 1 {
                return Err(ProxyError::UnsupportedProxyChain(format!(
                    "SOCKS proxies cannot be chained ({})",
                    self.config.route_id()
                ))
                .into());
            }
            return self.dial_socks(&hops[0], host, port).await;
        }
        self.dial_chain(hops, host, port, hello).await
    }

    /// Drop the cached last-hop session.
    pub fn close(&self) {
        if let Some(session) = self.take_cached() {
            session.close();
        }
    }

    async fn dial_socks(&self, hop: &ProxyEndpoint, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = tcp::connect(&hop.host, hop.port, self.timeouts.connect).await?;
        deadline(
            "proxy",
            self.timeouts.proxy,
            socks::connect(&mut stream, hop, host, port),
        )
        .await?;
        tracing::debug!(hop = %hop, target = %authority(host, port), "proxy: SOCKS tunnel established");
        Ok(Box::new(stream))
    }

    async fn dial_chain(
        &self,
        hops: &[ProxyEndpoint],
        host: &str,
        port: u16,
        hello: &ClientHelloSpec,
    ) -> Result<BoxedStream> {
        let target = authority(host, port);
        let last = &hops[hops.len() - 1];

        if let Some(session) = self.cached() {
            match self.open_h2_tunnel(&session, last, &target).await {
                Ok(stream) => {
                    tracing::trace!(hop = %last, target = %target, "proxy: reused last-hop session");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(hop = %last, error = %e, "proxy: cached session failed, rebuilding chain");
                    self.invalidate(&session);
                }
            }
        }

        let mut sessions = Vec::new();
        let result = self
            .build_chain(hops, &target, hello, &mut sessions)
            .await;
        match result {
            Ok((stream, final_session)) => {
                if let Some(session) = final_session {
                    if let Ok(mut cached) = self.last_hop.lock() {
                        *cached = Some(session);
                    }
                }
                Ok(stream)
            }
            Err(e) => {
                for session in &sessions {
                    session.close();
                }
                tracing::debug!(route = %self.config.route_id(), error = %e, "proxy: chain failed");
                Err(e)
            }
        }
    }

    /// Build the whole chain. Every HTTP/2 session opened along the way is
    /// pushed to `sessions` so the caller can close them on failure.
    async fn build_chain(
        &self,
        hops: &[ProxyEndpoint],
        target: &str,
        hello: &ClientHelloSpec,
        sessions: &mut Vec<H2Handle>,
    ) -> Result<(BoxedStream, Option<H2Handle>)> {
        let first = &hops[0];
        let tcp = tcp::connect(&first.host, first.port, self.timeouts.connect).await?;
        let mut link = Link {
            stream: Box::new(tcp),
            h2: false,
        };
        if first.scheme == ProxyScheme::Https {
            link = self.upgrade(link.stream, first, hello).await?;
        }

        for pair in hops.windows(2) {
            let (via, next) = (&pair[0], &pair[1]);
            let (stream, session) = self.connect_through(link, via, &next.authority()).await?;
            sessions.extend(session);
            tracing::debug!(via = %via, hop = %next, "proxy: hop reached");
            link = if next.scheme == ProxyScheme::Https {
                self.upgrade(stream, next, hello).await?
            } else {
                Link { stream, h2: false }
            };
        }

        let last = &hops[hops.len() - 1];
        let (stream, session) = self.connect_through(link, last, target).await?;
        if let Some(session) = &session {
            sessions.push(session.clone());
        }
        tracing::debug!(hop = %last, target, "proxy: tunnel established");
        Ok((stream, session))
    }

    /// TLS with an HTTPS hop, offering h2 and http/1.1.
    async fn upgrade(
        &self,
        stream: BoxedStream,
        hop: &ProxyEndpoint,
        hello: &ClientHelloSpec,
    ) -> Result<Link> {
        let alpn: Vec<String> = PROXY_ALPN.iter().map(|p| p.to_string()).collect();
        let tls = deadline(
            "proxy",
            self.timeouts.proxy,
            self.tls.connect(hello, &hop.host, stream, Some(&alpn)),
        )
        .await?;
        let h2 = AlpnProtocol::of(tls.ssl()).is_h2();
        tracing::trace!(hop = %hop, h2, "proxy: TLS to hop complete");
        Ok(Link {
            stream: Box::new(tls),
            h2,
        })
    }

    /// CONNECT `target` through `via`, the hop `link` currently ends at.
    async fn connect_through(
        &self,
        link: Link,
        via: &ProxyEndpoint,
        target: &str,
    ) -> Result<(BoxedStream, Option<H2Handle>)> {
        if link.h2 {
            let session = deadline(
                "proxy",
                self.timeouts.proxy,
                h2::connect(link.stream, &self.http2, self.timeouts.handshake),
            )
            .await?;
            match self.open_h2_tunnel(&session, via, target).await {
                Ok(stream) => Ok((stream, Some(session))),
                Err(e) => {
                    session.close();
                    Err(e)
                }
            }
        } else {
            let headers = self.connect_headers(via);
            let stream = deadline(
                "proxy",
                self.timeouts.proxy,
                h1::connect_tunnel(link.stream, target, &headers),
            )
            .await?;
            Ok((stream, None))
        }
    }

    async fn open_h2_tunnel(
        &self,
        session: &H2Handle,
        via: &ProxyEndpoint,
        target: &str,
    ) -> Result<BoxedStream> {
        let headers = self.connect_headers(via);
        let tunnel = deadline(
            "proxy",
            self.timeouts.proxy,
            session.open_tunnel(target, &headers),
        )
        .await?;
        Ok(Box::new(tunnel))
    }

    /// `User-Agent` always, `Proxy-Authorization` when `via` has credentials.
    fn connect_headers(&self, via: &ProxyEndpoint) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(2);
        if let Some(ua) = &self.user_agent {
            headers.push(("User-Agent".to_string(), ua.clone()));
        }
        if let Some(creds) = &via.credentials {
            headers.push(("Proxy-Authorization".to_string(), creds.basic_auth()));
        }
        headers
    }

    fn cached(&self) -> Option<H2Handle> {
        let mut cached = self.last_hop.lock().ok()?;
        match cached.as_ref() {
            Some(session) if session.is_accepting() => Some(session.clone()),
            Some(_) => {
                *cached = None;
                None
            }
            None => None,
        }
    }

    fn take_cached(&self) -> Option<H2Handle> {
        self.last_hop.lock().ok()?.take()
    }

    fn invalidate(&self, session: &H2Handle) {
        session.close();
        if let Ok(mut cached) = self.last_hop.lock() {
            if cached.as_ref().is_some_and(|c| c.same_session(session)) {
                *cached = None;
            }
        }
    }
}
