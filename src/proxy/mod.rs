//! Proxy configuration and dialing.
//!
//! A single proxy is a chain of length one; [`ProxyDialer`] handles both.
//!
//! Accepted forms for [`ProxyEndpoint::parse`]:
//! - `scheme://[user:pass@]host[:port]` with scheme http, https, socks4,
//!   socks4a, socks5 or socks5h
//! - `host:port` and `host:port:user:pass`, both treated as `http://`

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{FormatError, ProxyError, Result};

mod chain;
pub mod socks;
pub mod socks5_udp;
pub mod udp;

pub use chain::ProxyDialer;
pub use socks::TargetAddr;
pub use socks5_udp::Socks5UdpRelay;

/// Proxy protocol of one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    /// SOCKS5 with hostname resolution on the proxy.
    Socks5h,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
            Self::Socks5 => "socks5",
            Self::Socks5h => "socks5h",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            _ => 1080,
        }
    }

    pub fn is_socks(&self) -> bool {
        !matches!(self, Self::Http | Self::Https)
    }

    pub fn is_socks5(&self) -> bool {
        matches!(self, Self::Socks5 | Self::Socks5h)
    }
}

impl FromStr for ProxyScheme {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks4" => Ok(Self::Socks4),
            "socks4a" => Ok(Self::Socks4a),
            "socks5" => Ok(Self::Socks5),
            "socks5h" => Ok(Self::Socks5h),
            other => Err(ProxyError::UnsupportedProxyScheme(other.to_string())),
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// `Proxy-Authorization` value.
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// One proxy hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ProxyEndpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(FormatError::InvalidProxyUrl("empty proxy".into()).into());
        }

        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            let parts: Vec<&str> = raw.split(':').collect();
            match parts.as_slice() {
                [host, port] => format!("http://{}:{}", host, port),
                [host, port, user, pass] => format!("http://{}:{}@{}:{}", user, pass, host, port),
                _ => return Err(FormatError::InvalidProxyUrl(raw.to_string()).into()),
            }
        };

        let scheme_end = normalized.find("://").unwrap_or(0);
        let scheme: ProxyScheme = normalized[..scheme_end].parse()?;

        let url = Url::parse(&normalized)
            .map_err(|e| FormatError::InvalidProxyUrl(format!("{}: {}", raw, e)))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FormatError::InvalidProxyUrl(format!("{}: missing host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() {
            None
        } else {
            let password = url.password().ok_or_else(|| {
                FormatError::InvalidProxyUrl(format!("{}: password is empty", raw))
            })?;
            Some(Credentials {
                username: decode_userinfo(url.username(), raw)?,
                password: decode_userinfo(password, raw)?,
            })
        };

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
        })
    }

    /// `host:port`, IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Percent-decoded user or password, which must be UTF-8.
fn decode_userinfo(encoded: &str, raw: &str) -> Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| {
            FormatError::InvalidProxyUrl(format!("{}: credentials are not valid UTF-8", raw)).into()
        })
}

/// `host:port` with IPv6 literals bracketed.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Proxy route for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ProxyConfig {
    #[default]
    NoProxy,
    Single(ProxyEndpoint),
    Chain(Vec<ProxyEndpoint>),
}

impl ProxyConfig {
    /// Empty input means no proxy; one URL is a single proxy.
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        let mut hops = urls
            .iter()
            .map(|u| ProxyEndpoint::parse(u.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(match hops.len() {
            0 => Self::NoProxy,
            1 => Self::Single(hops.remove(0)),
            _ => Self::Chain(hops),
        })
    }

    pub fn hops(&self) -> &[ProxyEndpoint] {
        match self {
            Self::NoProxy => &[],
            Self::Single(hop) => std::slice::from_ref(hop),
            Self::Chain(hops) => hops,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.hops().is_empty()
    }

    /// Stable identity of the route, used to keep pooled connections of
    /// different routes apart.
    pub fn route_id(&self) -> String {
        if self.is_direct() {
            return "direct".to_string();
        }
        self.hops()
            .iter()
            .map(|hop| hop.to_string())
            .collect::<Vec<_>>()
            .join(">")
    }
}
