//! SOCKS4, SOCKS4a and SOCKS5 client handshakes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::{Credentials, ProxyEndpoint, ProxyScheme};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

pub(crate) const CMD_CONNECT: u8 = 0x01;
pub(crate) const CMD_UDP_ASSOCIATE: u8 = 0x03;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Destination as carried in SOCKS5 requests and UDP headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddr {
    /// IP literal when `host` parses as one, otherwise a domain.
    pub fn from_host(host: &str) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Domain(bare.to_string()),
        }
    }

    /// `ATYP ADDR` as used by SOCKS5.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Ip(IpAddr::V4(ip)) => {
                buf.put_u8(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Self::Ip(IpAddr::V6(ip)) => {
                buf.put_u8(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Self::Domain(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| Error::socks(format!("hostname `{}` longer than 255 bytes", name)))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Domain(name) => f.write_str(name),
        }
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

fn io_err(stage: &'static str) -> impl Fn(std::io::Error) -> Error {
    move |e| Error::socks(format!("{}: {}", stage, e))
}

/// Resolve `host:port` locally, preferring IPv4 when `v4_only`.
async fn resolve(host: &str, port: u16, v4_only: bool) -> Result<IpAddr> {
    if let TargetAddr::Ip(ip) = TargetAddr::from_host(host) {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::connection(format!("failed to resolve {}: {}", host, e)))?;
    addrs
        .map(|a| a.ip())
        .find(|ip| !v4_only || ip.is_ipv4())
        .ok_or_else(|| Error::connection(format!("no usable address for {}", host)))
}

/// Run the CONNECT handshake of `endpoint` for `host:port` over `stream`.
pub async fn connect<S>(stream: &mut S, endpoint: &ProxyEndpoint, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = endpoint
        .credentials
        .as_ref()
        .map(|c| c.username.as_str())
        .unwrap_or("");
    match endpoint.scheme {
        ProxyScheme::Socks4 => {
            let ip = match resolve(host, port, true).await? {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => return Err(Error::socks("SOCKS4 cannot reach IPv6 targets")),
            };
            socks4_connect(stream, ip, None, port, user).await
        }
        ProxyScheme::Socks4a => {
            let target = TargetAddr::from_host(host);
            match target {
                TargetAddr::Ip(IpAddr::V4(ip)) => socks4_connect(stream, ip, None, port, user).await,
                TargetAddr::Ip(IpAddr::V6(_)) => {
                    Err(Error::socks("SOCKS4a cannot reach IPv6 targets"))
                }
                TargetAddr::Domain(name) => {
                    socks4_connect(stream, Ipv4Addr::new(0, 0, 0, 1), Some(&name), port, user).await
                }
            }
        }
        ProxyScheme::Socks5 => {
            let ip = resolve(host, port, false).await?;
            socks5_handshake(stream, endpoint.credentials.as_ref()).await?;
            socks5_command(stream, CMD_CONNECT, &TargetAddr::Ip(ip), port).await?;
            Ok(())
        }
        ProxyScheme::Socks5h => {
            socks5_handshake(stream, endpoint.credentials.as_ref()).await?;
            socks5_command(stream, CMD_CONNECT, &TargetAddr::from_host(host), port).await?;
            Ok(())
        }
        ProxyScheme::Http | ProxyScheme::Https => Err(Error::socks(format!(
            "{} is not a SOCKS proxy",
            endpoint
        ))),
    }
}

async fn socks4_connect<S>(
    stream: &mut S,
    ip: Ipv4Addr,
    domain: Option<&str>,
    port: u16,
    user: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(9 + user.len() + domain.map_or(0, |d| d.len() + 1));
    request.put_u8(SOCKS4_VERSION);
    request.put_u8(CMD_CONNECT);
    request.put_u16(port);
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(user.as_bytes());
    request.put_u8(0);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.put_u8(0);
    }
    stream
        .write_all(&request)
        .await
        .map_err(io_err("failed to send SOCKS4 request"))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(io_err("failed to read SOCKS4 reply"))?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(Error::socks(format!(
            "SOCKS4 request rejected (code {:#x})",
            reply[1]
        )));
    }
    Ok(())
}

/// Method negotiation plus username/password sub-negotiation (RFC 1929).
pub(crate) async fn socks5_handshake<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS5_VERSION, 1, METHOD_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(io_err("failed to send SOCKS5 greeting"))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(io_err("failed to read SOCKS5 greeting reply"))?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::socks(format!("invalid SOCKS version {:#x}", reply[0])));
    }

    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS => {
            let creds = credentials.ok_or_else(|| {
                Error::socks("proxy requires username/password but none were given")
            })?;
            let user = u8::try_from(creds.username.len())
                .map_err(|_| Error::socks("SOCKS5 username longer than 255 bytes"))?;
            let pass = u8::try_from(creds.password.len())
                .map_err(|_| Error::socks("SOCKS5 password longer than 255 bytes"))?;

            let mut request = Vec::with_capacity(3 + user as usize + pass as usize);
            request.put_u8(AUTH_VERSION);
            request.put_u8(user);
            request.extend_from_slice(creds.username.as_bytes());
            request.put_u8(pass);
            request.extend_from_slice(creds.password.as_bytes());
            stream
                .write_all(&request)
                .await
                .map_err(io_err("failed to send SOCKS5 credentials"))?;

            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .map_err(io_err("failed to read SOCKS5 auth reply"))?;
            if status[0] != AUTH_VERSION || status[1] != 0 {
                return Err(Error::socks("SOCKS5 authentication failed"));
            }
            Ok(())
        }
        METHOD_NONE_ACCEPTABLE => Err(Error::socks("no acceptable SOCKS5 authentication method")),
        other => Err(Error::socks(format!(
            "proxy selected unknown auth method {:#x}",
            other
        ))),
    }
}

/// Send a SOCKS5 request and return the bound address from the reply.
pub(crate) async fn socks5_command<S>(
    stream: &mut S,
    command: u8,
    target: &TargetAddr,
    port: u16,
) -> Result<(TargetAddr, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS5_VERSION, command, 0x00];
    target.encode(&mut request)?;
    request.put_u16(port);
    stream
        .write_all(&request)
        .await
        .map_err(io_err("failed to send SOCKS5 request"))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(io_err("failed to read SOCKS5 reply"))?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::socks(format!("invalid SOCKS version {:#x}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(Error::socks(format!(
            "SOCKS5 request failed: {} ({:#x})",
            reply_message(head[1]),
            head[1]
        )));
    }

    let bound = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(io_err("failed to read bound address"))?;
            TargetAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(io_err("failed to read bound address"))?;
            TargetAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = stream
                .read_u8()
                .await
                .map_err(io_err("failed to read bound address"))?;
            let mut name = vec![0u8; len as usize];
            stream
                .read_exact(&mut name)
                .await
                .map_err(io_err("failed to read bound address"))?;
            TargetAddr::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        other => {
            return Err(Error::socks(format!("unsupported address type {:#x}", other)));
        }
    };
    let bound_port = stream
        .read_u16()
        .await
        .map_err(io_err("failed to read bound port"))?;
    Ok((bound, bound_port))
}
