//! TCP dialing.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Connect to `host:port` within `timeout`, with Nagle disabled.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", socket_host(host), port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout("connect", timeout))?
        .map_err(|e| Error::connection(format!("failed to connect to {}: {}", addr, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(addr = %addr, error = %e, "TCP: set_nodelay failed");
    }
    Ok(stream)
}

/// Host part of a `host:port` socket address; IPv6 literals are bracketed.
fn socket_host(host: &str) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.contains(':') {
        format!("[{}]", bare)
    } else {
        bare.to_string()
    }
}
