//! Native HTTP/2 implementation with full fingerprint control.
//!
//! This module provides HTTP/2 support with complete control over:
//! - **SETTINGS frame ordering**: entries are sent exactly as the fingerprint lists them
//! - **WINDOW_UPDATE behavior**: the connection increment follows the preface in the same write
//! - **PRIORITY frames**: optional dependency tree announced up front
//! - **Pseudo-header ordering**: Chrome uses `:method, :authority, :scheme, :path` (m,a,s,p)
//!
//! ## Akamai HTTP/2 Fingerprint Format
//!
//! `settings|window_update|priority|pseudo_headers`, for example
//! `1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use veil::fingerprint::profiles::{http2_fingerprint, Browser};
//! use veil::transport::h2;
//!
//! let session = h2::connect(tls_stream, &http2_fingerprint(Browser::Chrome), timeout).await?;
//! let response = session.send_request(&Method::GET, &uri, &headers, None).await?;
//! let tunnel = session.open_tunnel("target.example:443", &proxy_headers).await?;
//! ```

mod connection;
mod driver;
pub mod frame;
mod handle;
mod tunnel;

pub use connection::connect;
pub use handle::{request_headers, H2Handle};
pub use tunnel::H2Tunnel;
