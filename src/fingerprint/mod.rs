//! TLS, HTTP/2 and HTTP/3 fingerprint descriptions and browser presets.

pub mod http2;
pub mod http3;
pub mod ja3;
pub mod profiles;
pub mod tls;

pub use http2::{Http2Fingerprint, PriorityData, PseudoHeader, PseudoHeaderOrder, StreamPriority};
pub use http3::{Http3Fingerprint, Http3Setting};
pub use profiles::{Browser, TlsDefaults};
pub use tls::{CertCompression, ClientHelloSpec, TlsExtension, GREASE_PLACEHOLDER};
