//! Per-request transport parameters.

use std::time::Duration;

use bytes::Bytes;
use http::Method;

use crate::fingerprint::Browser;
use crate::proxy::ProxyConfig;

/// One request handed to [`Engine::execute`](crate::Engine::execute).
///
/// Fingerprint overrides shape only connections dialed for this request; a
/// pooled connection to the same host keeps the fingerprint it was opened
/// with.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    /// Sent in this order.
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub browser: Option<Browser>,
    pub ja3: Option<String>,
    pub http2_fingerprint: Option<String>,
    /// Replaces the engine's total timeout.
    pub timeout: Option<Duration>,
    /// Replaces the engine's proxy; pooled separately.
    pub proxy: Option<ProxyConfig>,
    pub force_http3: bool,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            browser: None,
            ja3: None,
            http2_fingerprint: None,
            timeout: None,
            proxy: None,
            force_http3: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Append a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set all headers (replaces existing headers).
    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn browser(mut self, browser: Browser) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn ja3(mut self, ja3: impl Into<String>) -> Self {
        self.ja3 = Some(ja3.into());
        self
    }

    /// Akamai-format HTTP/2 fingerprint.
    pub fn http2_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.http2_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Skip Alt-Svc discovery and go straight to HTTP/3.
    pub fn force_http3(mut self, force: bool) -> Self {
        self.force_http3 = force;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_header_order() {
        let request = TransportRequest::post("https://example.com/submit")
            .header("b", "2")
            .header("a", "1")
            .body("payload")
            .force_http3(true);
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers,
            vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())]
        );
        assert_eq!(request.body.as_deref(), Some(&b"payload"[..]));
        assert!(request.force_http3);
        assert!(request.proxy.is_none());
    }
}
