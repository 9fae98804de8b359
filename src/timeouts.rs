//! Per-phase deadlines.
//!
//! # Timeout Types
//!
//! - **connect**: TCP connect to the origin or the first proxy hop
//! - **handshake**: TLS or QUIC handshake, HTTP/2 session setup
//! - **proxy**: every stage of a proxy tunnel (hop dial, CONNECT, SOCKS)
//! - **total**: absolute deadline for one request, retry included
//!
//! ```rust,ignore
//! use veil::{Engine, Timeouts};
//! use std::time::Duration;
//!
//! let engine = Engine::builder()
//!     .timeouts(Timeouts::default().handshake(Duration::from_secs(5)))
//!     .build()?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Deadlines for the phases of a request. None of them reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect. Default: 10s
    pub connect: Duration,
    /// TLS / QUIC handshake and HTTP/2 preface exchange. Default: 10s
    pub handshake: Duration,
    /// Each proxy tunnel stage. Default: 15s
    pub proxy: Duration,
    /// Whole request including the transparent retry. Default: 60s
    pub total: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            proxy: Duration::from_secs(15),
            total: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = timeout;
        self
    }

    pub fn handshake(mut self, timeout: Duration) -> Self {
        self.handshake = timeout;
        self
    }

    pub fn proxy(mut self, timeout: Duration) -> Self {
        self.proxy = timeout;
        self
    }

    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = timeout;
        self
    }
}

/// Run `fut` under a deadline, mapping expiry to `Error::Timeout { stage }`.
pub async fn deadline<T, F>(stage: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(stage, after)),
    }
}
