//! Error types for the veil transport engine.
//!
//! Every failure maps onto one [`ErrorKind`] so callers can tell format bugs,
//! handshake failures, proxy failures, invalidated sessions and timeouts apart
//! without inspecting messages.

use std::io;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which numeric field of a JA3 string failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ja3Field {
    Version,
    Cipher,
    Extension,
    Curve,
    PointFormat,
}

impl std::fmt::Display for Ja3Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Version => "version",
            Self::Cipher => "cipher",
            Self::Extension => "extension",
            Self::Curve => "curve",
            Self::PointFormat => "point format",
        };
        f.write_str(name)
    }
}

/// Malformed fingerprint or proxy strings. Always a caller bug, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Wrong number of fields or an empty mandatory field.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A token that should be an unsigned integer is not.
    #[error("invalid {kind} at index {index}")]
    InvalidField { kind: Ja3Field, index: usize },

    /// Malformed HTTP/2 or HTTP/3 SETTINGS / PRIORITY entry.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Pseudo-header order is not a permutation of m, s, a, p.
    #[error("invalid pseudo-header order: {0}")]
    InvalidPseudoHeader(String),

    /// Proxy URL could not be parsed.
    #[error("invalid proxy url: {0}")]
    InvalidProxyUrl(String),
}

/// Proxy tunnel failures. Surfaced immediately, no retry at this layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("unsupported proxy scheme `{0}`")]
    UnsupportedProxyScheme(String),

    /// Proxy answered CONNECT with something other than 200.
    #[error("proxy tunnel failed: {status_line}")]
    ProxyTunnelFailed { status_line: String },

    /// SOCKS hops cannot be chained, and QUIC cannot run over a chain.
    #[error("unsupported proxy chain: {0}")]
    UnsupportedProxyChain(String),

    #[error("proxy scheme `{0}` cannot carry QUIC")]
    UnsupportedProxyForQuic(String),

    /// SOCKS negotiation failure (bad version, refused auth, reply code).
    #[error("SOCKS error: {0}")]
    Socks(String),
}

/// Why a pooled session can no longer be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The peer closed the transport.
    ConnClosed,
    /// The session refuses new streams (draining, failed or shut down).
    ConnUnusable,
    /// The peer sent GOAWAY; streams above `last_stream_id` were not processed.
    GoAway { last_stream_id: u32, code: u32 },
}

impl std::fmt::Display for Invalidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnClosed => f.write_str("connection closed"),
            Self::ConnUnusable => f.write_str("connection unusable"),
            Self::GoAway {
                last_stream_id,
                code,
            } => write!(f, "GOAWAY (last stream {}, code {:#x})", last_stream_id, code),
        }
    }
}

/// Coarse classification of every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Handshake,
    ProxyTunnel,
    SessionInvalidated,
    Timeout,
    Transport,
}

/// Errors produced by the transport engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),

    /// TLS or QUIC handshake failure.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// None of the presented certificates matched the host's pin set.
    #[error("certificate pin verification failed for {host}")]
    PinMismatch { host: String },

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Peer-initiated closure of a pooled session.
    #[error("session invalidated: {0}")]
    SessionInvalidated(Invalidation),

    /// A deadline fired during `stage`.
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    /// HTTP/3 was requested but is not enabled on this engine.
    #[error("HTTP/3 is not enabled")]
    Http3NotEnabled,

    /// Peer violated HTTP framing.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a handshake error.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a QUIC error.
    pub fn quic(message: impl Into<String>) -> Self {
        Self::Quic(message.into())
    }

    /// Create a timeout error for a named stage.
    pub fn timeout(stage: &'static str, after: Duration) -> Self {
        Self::Timeout { stage, after }
    }

    /// Create a SOCKS negotiation error.
    pub fn socks(message: impl Into<String>) -> Self {
        Self::Proxy(ProxyError::Socks(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format(_) => ErrorKind::Format,
            Self::Handshake(_) | Self::PinMismatch { .. } => ErrorKind::Handshake,
            Self::Proxy(_) => ErrorKind::ProxyTunnel,
            Self::SessionInvalidated(_) => ErrorKind::SessionInvalidated,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Http3NotEnabled
            | Self::HttpProtocol(_)
            | Self::Connection(_)
            | Self::Quic(_)
            | Self::UrlParse(_)
            | Self::Io(_) => ErrorKind::Transport,
        }
    }

    /// True for the errors that trigger the single transparent re-dial.
    pub fn is_session_invalidated(&self) -> bool {
        matches!(self, Self::SessionInvalidated(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let format: Error = FormatError::InvalidFormat("x".into()).into();
        assert_eq!(format.kind(), ErrorKind::Format);

        let pin = Error::PinMismatch {
            host: "example.com:443".into(),
        };
        assert_eq!(pin.kind(), ErrorKind::Handshake);

        let tunnel: Error = ProxyError::ProxyTunnelFailed {
            status_line: "HTTP/1.1 407 Proxy Authentication Required".into(),
        }
        .into();
        assert_eq!(tunnel.kind(), ErrorKind::ProxyTunnel);
        assert!(tunnel.to_string().contains("407"));

        let goaway = Error::SessionInvalidated(Invalidation::GoAway {
            last_stream_id: 3,
            code: 0,
        });
        assert!(goaway.is_session_invalidated());

        let timeout = Error::timeout("handshake", Duration::from_secs(1));
        assert!(timeout.is_timeout());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn invalid_field_names_kind_and_index() {
        let err = FormatError::InvalidField {
            kind: Ja3Field::Cipher,
            index: 2,
        };
        assert_eq!(err.to_string(), "invalid cipher at index 2");
    }
}
