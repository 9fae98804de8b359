//! # Veil
//!
//! Transport engine that makes HTTP traffic look like a chosen browser.
//!
//! Veil dials HTTP/1.1, HTTP/2, and HTTP/3 connections whose TLS ClientHello,
//! HTTP/2 SETTINGS/PRIORITY shape, and QUIC transport parameters follow a
//! browser preset or an explicit JA3 / Akamai fingerprint. Connections are
//! pooled per host, optionally pinned, and can travel through proxy chains
//! (HTTP, HTTPS, SOCKS4/4a/5/5h, SOCKS5 UDP for QUIC).

pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod pin;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod timeouts;
pub mod transport;
pub mod version;

// Re-exports
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, ErrorKind, FormatError, Invalidation, ProxyError, Result};
pub use fingerprint::{Browser, ClientHelloSpec, Http2Fingerprint, Http3Fingerprint};
pub use pin::{PinSet, PinStore};
pub use pool::{ConnectionPool, PoolKey, PoolStats};
pub use proxy::{ProxyConfig, ProxyEndpoint, ProxyScheme};
pub use request::TransportRequest;
pub use response::TransportResponse;
pub use timeouts::Timeouts;
pub use version::HttpVersion;
