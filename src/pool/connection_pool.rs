//! Per-host connection pool.
//!
//! One slot per [`PoolKey`]. Lookups take the map's read lock; a miss inserts
//! an empty slot under the write lock (double-checked), then the slot's own
//! handshake mutex serializes dialing so concurrent callers for one key share
//! a single handshake while other keys proceed independently.
//!
//! - HTTP/1.1: one keep-alive connection behind an async mutex, reused serially
//! - HTTP/2 and HTTP/3: one multiplexed session, dispatch without locking

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as SyncRwLock};
use std::time::Instant;

use bytes::Bytes;
use http::{Method, Uri};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, FormatError, Invalidation, Result};
use crate::proxy::authority;
use crate::response::TransportResponse;
use crate::transport::h1::H1Connection;
use crate::transport::h2::H2Handle;
use crate::transport::h3::H3Handle;
use crate::version::HttpVersion;

/// Connection pool key: normalized `host:port`, plus the proxy route when a
/// request overrides the engine's proxy. QUIC sessions live under their own
/// keys next to the TCP ones.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub route: Option<String>,
    pub quic: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            route: None,
            quic: false,
        }
    }

    /// Key for `uri`; the port defaults to 443 for https/wss and 80 for http/ws.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| FormatError::InvalidFormat(format!("URI `{}` has no host", uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = match uri.port_u16() {
            Some(port) => port,
            None => default_port(uri.scheme_str().unwrap_or("https"))?,
        };
        Ok(Self::new(host, port))
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn quic(mut self) -> Self {
        self.quic = true;
        self
    }

    /// `host:port`, the form pins and Alt-Svc entries are keyed by.
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.authority())?;
        if self.quic {
            f.write_str(" (h3)")?;
        }
        match &self.route {
            Some(route) => write!(f, " via {}", route),
            None => Ok(()),
        }
    }
}

pub(crate) fn default_port(scheme: &str) -> Result<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "https" | "wss" => Ok(443),
        "http" | "ws" => Ok(80),
        other => Err(FormatError::InvalidFormat(format!("unsupported scheme `{}`", other)).into()),
    }
}

enum Session {
    Http1 {
        conn: Mutex<Option<H1Connection>>,
        open: AtomicBool,
    },
    Http2(H2Handle),
    Http3(H3Handle),
}

/// A live connection owned by the pool.
pub struct PooledConnection {
    session: Session,
    expires_at: Option<Instant>,
    created_at: Instant,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("protocol", &self.protocol())
            .field("usable", &self.is_usable())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl PooledConnection {
    pub fn http1(conn: H1Connection, expires_at: Option<Instant>) -> Self {
        Self::with_session(
            Session::Http1 {
                conn: Mutex::new(Some(conn)),
                open: AtomicBool::new(true),
            },
            expires_at,
        )
    }

    pub fn http2(handle: H2Handle, expires_at: Option<Instant>) -> Self {
        Self::with_session(Session::Http2(handle), expires_at)
    }

    pub fn http3(handle: H3Handle) -> Self {
        Self::with_session(Session::Http3(handle), None)
    }

    fn with_session(session: Session, expires_at: Option<Instant>) -> Self {
        Self {
            session,
            expires_at,
            created_at: Instant::now(),
        }
    }

    pub fn protocol(&self) -> HttpVersion {
        match self.session {
            Session::Http1 { .. } => HttpVersion::Http1_1,
            Session::Http2(_) => HttpVersion::Http2,
            Session::Http3(_) => HttpVersion::Http3,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Earliest `notAfter` of the peer's certificates.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// True while the connection may serve another request.
    pub fn is_usable(&self) -> bool {
        if self.is_expired() {
            return false;
        }
        match &self.session {
            Session::Http1 { open, .. } => open.load(Ordering::Acquire),
            Session::Http2(handle) => handle.is_accepting(),
            Session::Http3(handle) => handle.is_accepting(),
        }
    }

    /// Send one request. HTTP/1.1 requests queue on the connection mutex.
    pub async fn send(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<TransportResponse> {
        match &self.session {
            Session::Http1 { conn, open } => {
                let mut guard = conn.lock().await;
                let h1 = guard
                    .as_mut()
                    .ok_or(Error::SessionInvalidated(Invalidation::ConnUnusable))?;
                let result = h1.send_request(method, uri, headers, body.as_ref()).await;
                if result.is_err() || !h1.is_reusable() {
                    open.store(false, Ordering::Release);
                    if let Some(mut h1) = guard.take() {
                        h1.shutdown().await;
                    }
                }
                result
            }
            Session::Http2(handle) => handle.send_request(method, uri, headers, body).await,
            Session::Http3(handle) => handle.send_request(method, uri, headers, body).await,
        }
    }

    pub async fn close(&self) {
        match &self.session {
            Session::Http1 { conn, open } => {
                open.store(false, Ordering::Release);
                if let Some(mut h1) = conn.lock().await.take() {
                    h1.shutdown().await;
                }
            }
            Session::Http2(handle) => handle.close(),
            Session::Http3(handle) => handle.close(),
        }
    }
}

#[derive(Default)]
struct Slot {
    handshake: Mutex<()>,
    conn: SyncRwLock<Option<Arc<PooledConnection>>>,
}

impl Slot {
    /// The slot's connection if still usable. A dead one is swapped out and
    /// returned as the second value for closing.
    fn live(&self) -> (Option<Arc<PooledConnection>>, Option<Arc<PooledConnection>>) {
        {
            let conn = self.conn.read().unwrap_or_else(|e| e.into_inner());
            match conn.as_ref() {
                Some(c) if c.is_usable() => return (Some(c.clone()), None),
                None => return (None, None),
                Some(_) => {}
            }
        }
        let mut conn = self.conn.write().unwrap_or_else(|e| e.into_inner());
        match conn.as_ref() {
            Some(c) if c.is_usable() => (Some(c.clone()), None),
            _ => (None, conn.take()),
        }
    }

    fn store(&self, conn: Arc<PooledConnection>) {
        *self.conn.write().unwrap_or_else(|e| e.into_inner()) = Some(conn);
    }
}

/// Counters since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub handshakes: u64,
    pub reuses: u64,
    /// Slots currently holding a connection.
    pub live: usize,
}

#[derive(Default)]
pub struct ConnectionPool {
    slots: RwLock<HashMap<PoolKey, Arc<Slot>>>,
    handshakes: AtomicU64,
    reuses: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("handshakes", &self.handshakes.load(Ordering::Relaxed))
            .field("reuses", &self.reuses.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pooled connection for `key`, running `dial` only when the slot is
    /// empty or dead. At most one `dial` per key is in flight.
    pub async fn acquire<F, Fut>(&self, key: &PoolKey, dial: F) -> Result<Arc<PooledConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PooledConnection>>,
    {
        let slot = self.slot(key).await;

        if let Some(conn) = self.reuse(&slot, key).await {
            return Ok(conn);
        }

        let _handshake = slot.handshake.lock().await;
        if let Some(conn) = self.reuse(&slot, key).await {
            return Ok(conn);
        }

        let started = Instant::now();
        let conn = Arc::new(dial().await?);
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            key = %key,
            protocol = %conn.protocol(),
            elapsed = ?started.elapsed(),
            "Pool: new connection"
        );
        slot.store(conn.clone());
        Ok(conn)
    }

    async fn slot(&self, key: &PoolKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots.entry(key.clone()).or_default().clone()
    }

    async fn reuse(&self, slot: &Slot, key: &PoolKey) -> Option<Arc<PooledConnection>> {
        let (live, dead) = slot.live();
        if let Some(dead) = dead {
            tracing::debug!(key = %key, expired = dead.is_expired(), "Pool: discarding dead connection");
            dead.close().await;
        }
        if live.is_some() {
            self.reuses.fetch_add(1, Ordering::Relaxed);
        }
        live
    }

    /// Remove `conn` from `key`'s slot if it is still the slot's connection,
    /// then close it.
    pub async fn invalidate(&self, key: &PoolKey, conn: &Arc<PooledConnection>) {
        let slot = match self.slots.read().await.get(key) {
            Some(slot) => slot.clone(),
            None => return,
        };
        let removed = {
            let mut current = slot.conn.write().unwrap_or_else(|e| e.into_inner());
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, conn) => current.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::debug!(key = %key, "Pool: connection invalidated");
        }
        conn.close().await;
    }

    pub async fn stats(&self) -> PoolStats {
        let live = self
            .slots
            .read()
            .await
            .values()
            .filter(|slot| {
                slot.conn
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some()
            })
            .count();
        PoolStats {
            handshakes: self.handshakes.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            live,
        }
    }

    /// Close and forget every connection.
    pub async fn close(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            let conn = slot.conn.write().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(conn) = conn {
                conn.close().await;
            }
        }
    }
}
