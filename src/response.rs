//! Response returned by the transport engine.

use bytes::Bytes;

use crate::version::HttpVersion;

/// Status, ordered headers and the complete body of one exchange.
///
/// Bodies are returned as received; content decoding is left to the caller.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub protocol: HttpVersion,
    body: Bytes,
}

impl TransportResponse {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        protocol: HttpVersion,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            headers,
            protocol,
            body,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every header with this name, in arrival order.
    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
