//! Wire transports.
//!
//! - HTTP/1.1 over any byte stream
//! - HTTP/2 via the native frame engine in [`h2`]
//! - HTTP/3 via quiche in [`h3`]

use tokio::io::{AsyncRead, AsyncWrite};

pub mod connector;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod tcp;

/// Byte stream a connection can run over: TCP, TLS, a SOCKS tunnel or an
/// HTTP/2 CONNECT stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn Io>;
