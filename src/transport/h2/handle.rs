//! HTTP/2 session handle - non-blocking interface for sending requests and
//! opening CONNECT tunnels.
//!
//! The handle sends commands to the driver task and receives responses via
//! oneshot channels. Clones share the same driver, so concurrent requests are
//! multiplexed over one connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Uri};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::error::{Error, Invalidation, Result};
use crate::fingerprint::http2::{PseudoHeader, PseudoHeaderOrder};
use crate::response::TransportResponse;

use super::connection::SessionState;
use super::driver::{Command, HeaderList};
use super::tunnel::{H2Tunnel, TUNNEL_SEND_BUFFER};

/// Connection-specific headers that must not appear in HTTP/2 (RFC 9113
/// Section 8.2.2). `host` is replaced by `:authority`.
const FORBIDDEN_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// HTTP/2 session handle.
#[derive(Clone)]
pub struct H2Handle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SessionState>,
    pseudo_order: PseudoHeaderOrder,
}

impl std::fmt::Debug for H2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Handle")
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl H2Handle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: Arc<SessionState>,
        pseudo_order: PseudoHeaderOrder,
    ) -> Self {
        Self {
            commands,
            state,
            pseudo_order,
        }
    }

    /// True while the session can take new streams.
    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Send a request and wait for the complete response.
    pub async fn send_request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<TransportResponse> {
        let headers = request_headers(method, uri, headers, &self.pseudo_order)?;
        let (respond, response) = oneshot::channel();
        self.dispatch(Command::Request {
            headers,
            body,
            respond,
        })?;
        response
            .await
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))?
    }

    /// Open a CONNECT stream to `authority`. A non-200 answer fails with
    /// `ProxyTunnelFailed`.
    pub async fn open_tunnel(
        &self,
        authority: &str,
        headers: &[(String, String)],
    ) -> Result<H2Tunnel> {
        let headers = connect_headers(authority, headers);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(TUNNEL_SEND_BUFFER));
        let (respond, opened) = oneshot::channel();
        self.dispatch(Command::Connect {
            headers,
            inbound: inbound_tx,
            credit: credit.clone(),
            respond,
        })?;
        let stream_id = opened
            .await
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))??;
        Ok(H2Tunnel::new(stream_id, self.commands.clone(), inbound_rx, credit))
    }

    /// True when both handles drive the same connection.
    pub fn same_session(&self, other: &H2Handle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Ask the driver to send GOAWAY and close. In-flight streams fail.
    pub fn close(&self) {
        self.state.accepting.store(false, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        if !self.is_accepting() {
            return Err(Error::SessionInvalidated(Invalidation::ConnUnusable));
        }
        self.commands
            .send(command)
            .map_err(|_| Error::SessionInvalidated(Invalidation::ConnUnusable))
    }
}

/// Build the request header list: pseudo-headers in fingerprint order, then
/// the caller's headers in their order, lowercased.
pub fn request_headers(
    method: &Method,
    uri: &Uri,
    headers: &[(String, String)],
    order: &PseudoHeaderOrder,
) -> Result<HeaderList> {
    let authority = uri
        .authority()
        .ok_or_else(|| Error::http_protocol(format!("request URI `{}` has no authority", uri)))?;
    let scheme = uri.scheme_str().unwrap_or("https");
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    let mut list = Vec::with_capacity(4 + headers.len());
    for pseudo in order.iter() {
        let value = match pseudo {
            PseudoHeader::Method => method.as_str(),
            PseudoHeader::Scheme => scheme,
            PseudoHeader::Authority => authority.as_str(),
            PseudoHeader::Path => path,
        };
        list.push((pseudo.name().as_bytes().to_vec(), value.as_bytes().to_vec()));
    }
    push_regular(&mut list, headers);
    Ok(list)
}

/// CONNECT carries only `:method` and `:authority` (RFC 9113 Section 8.5).
fn connect_headers(authority: &str, headers: &[(String, String)]) -> HeaderList {
    let mut list = vec![
        (b":method".to_vec(), b"CONNECT".to_vec()),
        (b":authority".to_vec(), authority.as_bytes().to_vec()),
    ];
    push_regular(&mut list, headers);
    list
}

fn push_regular(list: &mut HeaderList, headers: &[(String, String)]) {
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if FORBIDDEN_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        list.push((name.into_bytes(), value.as_bytes().to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &HeaderList) -> Vec<String> {
        list.iter()
            .map(|(n, _)| String::from_utf8(n.clone()).unwrap())
            .collect()
    }

    #[test]
    fn pseudo_headers_follow_fingerprint_order() {
        use PseudoHeader::*;
        let uri: Uri = "https://example.com/a?b=1".parse().unwrap();
        let order = PseudoHeaderOrder([Method, Path, Authority, Scheme]);
        let list = request_headers(
            &Method::GET,
            &uri,
            &[
                ("User-Agent".into(), "x".into()),
                ("Host".into(), "example.com".into()),
                ("Connection".into(), "keep-alive".into()),
            ],
            &order,
        )
        .unwrap();
        assert_eq!(
            names(&list),
            vec![":method", ":path", ":authority", ":scheme", "user-agent"]
        );
        assert_eq!(list[1].1, b"/a?b=1".to_vec());
    }

    #[test]
    fn connect_omits_scheme_and_path() {
        let list = connect_headers(
            "target.example:443",
            &[("Proxy-Authorization".into(), "Basic dTpw".into())],
        );
        assert_eq!(
            names(&list),
            vec![":method", ":authority", "proxy-authorization"]
        );
    }

    #[test]
    fn relative_uri_is_rejected() {
        let uri: Uri = "/only/path".parse().unwrap();
        assert!(request_headers(&Method::GET, &uri, &[], &PseudoHeaderOrder::default()).is_err());
    }
}
