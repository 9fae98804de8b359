//! Alt-Svc advertisements (RFC 7838), used to discover HTTP/3.
//!
//! Entries are keyed by origin `host:port`. A response's `Alt-Svc` header
//! replaces what was stored for its origin; `clear` forgets the origin.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Freshness when the header carries no `ma` parameter.
const DEFAULT_MAX_AGE: u64 = 86_400;

/// One advertised alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltService {
    /// ALPN token (`h3`, `h3-29`, `h2`).
    pub protocol: String,
    /// Alternative host; `None` means the origin's own host.
    pub host: Option<String>,
    pub port: u16,
    pub max_age: Duration,
}

impl AltService {
    pub fn is_h3(&self) -> bool {
        self.protocol == "h3" || self.protocol.starts_with("h3-")
    }
}

/// Parsed `Alt-Svc` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltSvc {
    /// `clear`: drop every alternative of the origin.
    Clear,
    Services(Vec<AltService>),
}

#[derive(Debug)]
struct Stored {
    service: AltService,
    expires_at: Instant,
}

/// Per-origin Alt-Svc cache.
#[derive(Debug, Default)]
pub struct AltSvcCache {
    origins: RwLock<HashMap<String, Vec<Stored>>>,
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an `Alt-Svc` header received from `origin`.
    pub async fn record(&self, origin: &str, header: &str) {
        match parse_alt_svc(header) {
            AltSvc::Clear => self.clear(origin).await,
            AltSvc::Services(services) if services.is_empty() => {}
            AltSvc::Services(services) => {
                let now = Instant::now();
                let stored = services
                    .into_iter()
                    .map(|service| Stored {
                        expires_at: now + service.max_age,
                        service,
                    })
                    .collect();
                tracing::trace!(origin, "Alt-Svc: recorded");
                self.origins
                    .write()
                    .await
                    .insert(origin.to_string(), stored);
            }
        }
    }

    /// A fresh HTTP/3 alternative for `origin`, if one was advertised.
    pub async fn h3_alternative(&self, origin: &str) -> Option<AltService> {
        let now = Instant::now();
        let origins = self.origins.read().await;
        origins.get(origin).and_then(|entries| {
            entries
                .iter()
                .find(|e| e.service.is_h3() && e.expires_at > now)
                .map(|e| e.service.clone())
        })
    }

    pub async fn clear(&self, origin: &str) {
        self.origins.write().await.remove(origin);
    }

    /// Drop expired alternatives and origins left without any.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut origins = self.origins.write().await;
        for entries in origins.values_mut() {
            entries.retain(|e| e.expires_at > now);
        }
        origins.retain(|_, entries| !entries.is_empty());
    }
}

/// Parse an `Alt-Svc` header value. Malformed alternatives are skipped.
pub fn parse_alt_svc(header: &str) -> AltSvc {
    let header = header.trim();
    if header.eq_ignore_ascii_case("clear") {
        return AltSvc::Clear;
    }

    let services = header
        .split(',')
        .filter_map(|alternative| {
            let mut parts = alternative.split(';');
            let (protocol, value) = parts.next()?.trim().split_once('=')?;
            let protocol = protocol.trim();
            if protocol.is_empty() {
                return None;
            }
            let (host, port) = parse_authority(value)?;
            let max_age = parts
                .filter_map(|param| param.trim().split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("ma"))
                .and_then(|(_, value)| value.trim().trim_matches('"').parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_AGE);
            Some(AltService {
                protocol: protocol.to_string(),
                host,
                port,
                max_age: Duration::from_secs(max_age),
            })
        })
        .collect();
    AltSvc::Services(services)
}

/// `":443"` -> `(None, 443)`, `"alt.example:8443"` -> `(Some(alt.example), 8443)`.
fn parse_authority(value: &str) -> Option<(Option<String>, u16)> {
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .trim();
    let (host, port) = value.rsplit_once(':')?;
    let port = port.trim().parse::<u16>().ok()?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    Some(((!host.is_empty()).then(|| host.to_string()), port))
}
