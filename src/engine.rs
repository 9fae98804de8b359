//! The transport engine: fingerprinted dialing, pooling, and protocol
//! selection behind one `execute` call.
//!
//! ```rust,ignore
//! use veil::{Browser, Engine, TransportRequest};
//!
//! let engine = Engine::builder()
//!     .browser(Browser::Chrome)
//!     .proxy_url("socks5h://127.0.0.1:1080")
//!     .http3(true)
//!     .build()?;
//!
//! let response = engine.execute(TransportRequest::get("https://example.com/")).await?;
//! println!("{} over {}", response.status, response.protocol);
//! ```
//!
//! Every request runs under the total deadline. A request that fails because
//! the pooled session went away (`SessionInvalidated`) is sent once more on a
//! freshly dialed connection.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use http::Uri;
use lru::LruCache;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, FormatError, ProxyError, Result};
use crate::fingerprint::profiles::{self, Browser};
use crate::fingerprint::{ja3, ClientHelloSpec, Http2Fingerprint, Http3Fingerprint};
use crate::pin::{presented_certificates, spki_digest, PinSet, PinStore};
use crate::pool::{AltSvcCache, ConnectionPool, PoolKey, PoolStats, PooledConnection};
use crate::proxy::{authority, ProxyConfig, ProxyDialer, Socks5UdpRelay};
use crate::request::TransportRequest;
use crate::response::TransportResponse;
use crate::timeouts::{deadline, Timeouts};
use crate::transport::connector::{earliest_expiry, AlpnProtocol, TlsConnector};
use crate::transport::h1::H1Connection;
use crate::transport::h3::{DatagramPath, H3Connection, QuicConfig};
use crate::transport::{h2, BoxedStream};

/// Dialers kept for per-request proxy or HTTP/2 overrides.
const MAX_ROUTE_DIALERS: NonZeroUsize = NonZeroUsize::MIN.saturating_add(63);

/// Route id plus the Akamai string of the HTTP/2 fingerprint its hops use.
type RouteKey = (String, String);

/// Builder for [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    browser: Browser,
    ja3: Option<String>,
    http2_fingerprint: Option<String>,
    http3_fingerprint: Option<String>,
    proxy: ProxyConfig,
    proxy_urls: Option<Vec<String>>,
    timeouts: Timeouts,
    http3: bool,
    root_certs: Vec<Vec<u8>>,
    verify: bool,
    pins: Vec<(String, PinSet)>,
    user_agent: Option<String>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            browser: Browser::default(),
            ja3: None,
            http2_fingerprint: None,
            http3_fingerprint: None,
            proxy: ProxyConfig::NoProxy,
            proxy_urls: None,
            timeouts: Timeouts::default(),
            http3: false,
            root_certs: Vec::new(),
            verify: true,
            pins: Vec::new(),
            user_agent: None,
        }
    }

    /// Browser preset for everything not overridden below.
    pub fn browser(mut self, browser: Browser) -> Self {
        self.browser = browser;
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

    /// `SETTINGS|pseudo-order` HTTP/3 fingerprint.
    pub fn http3_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.http3_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self.proxy_urls = None;
        self
    }

    /// Single proxy URL, parsed at [`build`](Self::build).
    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_urls = Some(vec![url.into()]);
        self
    }

    /// Ordered proxy chain, first hop first.
    pub fn proxy_chain<S: AsRef<str>>(mut self, urls: &[S]) -> Self {
        self.proxy_urls = Some(urls.iter().map(|u| u.as_ref().to_string()).collect());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enable HTTP/3 (Alt-Svc discovery and `force_http3`).
    pub fn http3(mut self, enabled: bool) -> Self {
        self.http3 = enabled;
        self
    }

    /// Trust an extra root, PEM or DER.
    pub fn add_root_certificate(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.root_certs.push(cert.into());
        self
    }

    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.verify = !accept;
        self
    }

    /// Pin `host:port` to a set of SPKI digests.
    pub fn pin<I, S>(mut self, host_port: impl Into<String>, pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pins.push((host_port.into(), PinSet::new(pins)));
        self
    }

    /// `User-Agent` sent on proxy CONNECT requests.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Validate every fingerprint and proxy URL and build the engine.
    pub fn build(self) -> Result<Engine> {
        let browser = self.browser;
        let ja3 = self
            .ja3
            .as_deref()
            .map(|s| ja3::parse(s, browser))
            .transpose()?;
        let http2 = match self.http2_fingerprint.as_deref() {
            Some(fp) => Http2Fingerprint::parse(fp, browser)?,
            None => profiles::http2_fingerprint(browser),
        };
        let http3 = match self.http3_fingerprint.as_deref() {
            Some(fp) => Http3Fingerprint::parse(fp)?,
            None => profiles::http3_fingerprint(browser),
        };
        let proxy = match self.proxy_urls {
            Some(urls) => ProxyConfig::from_urls(&urls)?,
            None => self.proxy,
        };

        let tls = Arc::new(TlsConnector::new(&self.root_certs, self.verify)?);
        let pins = Arc::new(PinStore::new());
        for (host_port, set) in self.pins {
            pins.add_host(&host_port, set);
        }
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| profiles::user_agent(browser).to_string());
        let dialer = Arc::new(ProxyDialer::new(
            proxy,
            tls.clone(),
            http2.clone(),
            self.timeouts,
            Some(user_agent.clone()),
        ));

        tracing::debug!(
            browser = %browser,
            route = %dialer.config().route_id(),
            http3 = self.http3,
            "Engine: built"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                browser,
                ja3,
                http2,
                http3,
                http3_enabled: self.http3,
                dialer,
                routes: Mutex::new(LruCache::new(MAX_ROUTE_DIALERS)),
                tls,
                pins,
                pool: ConnectionPool::new(),
                alt_svc: AltSvcCache::new(),
                timeouts: self.timeouts,
                user_agent,
            }),
        })
    }
}

struct Inner {
    browser: Browser,
    ja3: Option<ClientHelloSpec>,
    http2: Http2Fingerprint,
    http3: Http3Fingerprint,
    http3_enabled: bool,
    dialer: Arc<ProxyDialer>,
    /// Dialers for per-request proxy or HTTP/2 overrides, least recently
    /// used evicted first.
    routes: Mutex<LruCache<RouteKey, Arc<ProxyDialer>>>,
    tls: Arc<TlsConnector>,
    pins: Arc<PinStore>,
    pool: ConnectionPool,
    alt_svc: AltSvcCache,
    timeouts: Timeouts,
    user_agent: String,
}

/// Fingerprints and route for the connections one request may dial.
struct DialPlan {
    browser: Browser,
    ja3: Option<ClientHelloSpec>,
    http2: Http2Fingerprint,
    http3: Http3Fingerprint,
    dialer: Arc<ProxyDialer>,
}

impl DialPlan {
    /// A fixed JA3 spec, or a fresh preset ClientHello (Chrome's extension
    /// order is reshuffled per connection).
    fn client_hello(&self) -> ClientHelloSpec {
        match &self.ja3 {
            Some(spec) => spec.clone(),
            None => profiles::client_hello(self.browser, &mut rand::thread_rng()),
        }
    }

    fn quic_client_hello(&self) -> ClientHelloSpec {
        profiles::quic_client_hello(self.browser, &mut rand::thread_rng())
    }
}

/// Where one request goes.
struct Target {
    uri: Uri,
    host: String,
    port: u16,
    secure: bool,
    key: PoolKey,
}

/// Fingerprinted HTTP transport. Clones share pools, pins, and caches.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("browser", &self.inner.browser)
            .field("route", &self.inner.dialer.config().route_id())
            .field("http3", &self.inner.http3_enabled)
            .finish()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn browser(&self) -> Browser {
        self.inner.browser
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    pub fn proxy(&self) -> &ProxyConfig {
        self.inner.dialer.config()
    }

    pub fn pins(&self) -> &PinStore {
        &self.inner.pins
    }

    pub fn alt_svc(&self) -> &AltSvcCache {
        &self.inner.alt_svc
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats().await
    }

    /// Send `request` and read the whole response.
    pub async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let total = request.timeout.unwrap_or(self.inner.timeouts.total);
        deadline("total", total, self.execute_inner(request)).await
    }

    async fn execute_inner(&self, request: TransportRequest) -> Result<TransportResponse> {
        let plan = self.plan(&request)?;
        let target = self.target(&request.url, request.proxy.as_ref())?;
        let origin = target.key.authority();

        if request.force_http3 {
            if !self.inner.http3_enabled {
                return Err(Error::Http3NotEnabled);
            }
            if !target.secure {
                return Err(FormatError::InvalidFormat(format!(
                    "HTTP/3 needs an https URL, got `{}`",
                    request.url
                ))
                .into());
            }
            check_quic_route(plan.dialer.config())?;
            let port = target.port;
            return self.send_h3(&request, &target, &plan, port).await;
        }

        if self.inner.http3_enabled && target.secure {
            if let Some(alt) = self.inner.alt_svc.h3_alternative(&origin).await {
                match check_quic_route(plan.dialer.config()) {
                    Ok(()) => match self.send_h3(&request, &target, &plan, alt.port).await {
                        Ok(response) => return Ok(response),
                        Err(e) => {
                            tracing::warn!(origin = %origin, error = %e, "Engine: HTTP/3 failed, falling back to TCP");
                            self.inner.alt_svc.clear(&origin).await;
                        }
                    },
                    Err(e) => {
                        tracing::debug!(origin = %origin, reason = %e, "Engine: route cannot carry QUIC, using TCP");
                    }
                }
            }
        }

        let response = self
            .send_pooled(&request, &target.key, &target.uri, || {
                self.dial_tcp(&target, &plan)
            })
            .await?;
        self.record_alt_svc(&target, &response).await;
        Ok(response)
    }

    async fn send_h3(
        &self,
        request: &TransportRequest,
        target: &Target,
        plan: &DialPlan,
        port: u16,
    ) -> Result<TransportResponse> {
        let key = target.key.clone().quic();
        let response = self
            .send_pooled(request, &key, &target.uri, || {
                self.dial_h3(&target.host, port, plan)
            })
            .await?;
        self.record_alt_svc(target, &response).await;
        Ok(response)
    }

    /// Acquire, send, and on `SessionInvalidated` invalidate and send once
    /// more on a new connection.
    async fn send_pooled<F, Fut>(
        &self,
        request: &TransportRequest,
        key: &PoolKey,
        uri: &Uri,
        dial: F,
    ) -> Result<TransportResponse>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<PooledConnection>>,
    {
        let mut retried = false;
        loop {
            let conn = self.inner.pool.acquire(key, &dial).await?;
            let result = conn
                .send(&request.method, uri, &request.headers, request.body.clone())
                .await;
            match result {
                Err(Error::SessionInvalidated(reason)) => {
                    self.inner.pool.invalidate(key, &conn).await;
                    if retried {
                        return Err(Error::SessionInvalidated(reason));
                    }
                    tracing::debug!(key = %key, reason = %reason, "Engine: session invalidated, retrying once");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn record_alt_svc(&self, target: &Target, response: &TransportResponse) {
        if !self.inner.http3_enabled || !target.secure {
            return;
        }
        let values = response.headers_named("alt-svc");
        if values.is_empty() {
            return;
        }
        self.inner
            .alt_svc
            .record(&target.key.authority(), &values.join(", "))
            .await;
    }

    fn target(&self, url: &str, proxy: Option<&ProxyConfig>) -> Result<Target> {
        let parsed = url::Url::parse(url)?;
        let secure = matches!(parsed.scheme(), "https" | "wss");
        let uri: Uri = parsed
            .as_str()
            .parse()
            .map_err(|e| FormatError::InvalidFormat(format!("invalid URL `{}`: {}", url, e)))?;
        let mut key = PoolKey::from_uri(&uri)?;
        if let Some(proxy) = proxy {
            key = key.with_route(proxy.route_id());
        }
        Ok(Target {
            host: key.host.clone(),
            port: key.port,
            uri,
            secure,
            key,
        })
    }

    fn plan(&self, request: &TransportRequest) -> Result<DialPlan> {
        let inner = &self.inner;
        let browser = request.browser.unwrap_or(inner.browser);
        let overridden = request.browser.is_some_and(|b| b != inner.browser);

        let ja3 = match request.ja3.as_deref() {
            Some(s) => Some(ja3::parse(s, browser)?),
            None if overridden => None,
            None => inner.ja3.clone(),
        };
        let http2 = match request.http2_fingerprint.as_deref() {
            Some(fp) => Http2Fingerprint::parse(fp, browser)?,
            None if overridden => profiles::http2_fingerprint(browser),
            None => inner.http2.clone(),
        };
        let http3 = if overridden {
            profiles::http3_fingerprint(browser)
        } else {
            inner.http3.clone()
        };
        let dialer = match &request.proxy {
            Some(proxy) => self.route_dialer(proxy, &http2),
            None if http2 == inner.http2 => inner.dialer.clone(),
            None if inner.dialer.config().hops().is_empty() => inner.dialer.clone(),
            None => self.route_dialer(inner.dialer.config(), &http2),
        };
        Ok(DialPlan {
            browser,
            ja3,
            http2,
            http3,
            dialer,
        })
    }

    /// Dialer for `proxy` whose HTTP/2 hops speak `http2`. Evicted dialers
    /// are dropped, not closed, so tunnels already riding on them finish.
    fn route_dialer(&self, proxy: &ProxyConfig, http2: &Http2Fingerprint) -> Arc<ProxyDialer> {
        let key: RouteKey = (proxy.route_id(), http2.akamai_string());
        let mut routes = self.inner.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dialer) = routes.get(&key) {
            return dialer.clone();
        }
        let dialer = Arc::new(ProxyDialer::new(
            proxy.clone(),
            self.inner.tls.clone(),
            http2.clone(),
            self.inner.timeouts,
            Some(self.inner.user_agent.clone()),
        ));
        if let Some((evicted, _)) = routes.push(key, dialer.clone()) {
            tracing::debug!(route = %evicted.0, "Engine: evicting idle route dialer");
        }
        dialer
    }

    /// TCP (direct or proxied), then TLS and pin check for https, then an
    /// HTTP/2 session when `h2` was negotiated.
    async fn dial_tcp(&self, target: &Target, plan: &DialPlan) -> Result<PooledConnection> {
        let hello = plan.client_hello();
        let stream = plan.dialer.dial(&target.host, target.port, &hello).await?;
        if !target.secure {
            return Ok(PooledConnection::http1(H1Connection::new(stream), None));
        }

        let timeouts = self.inner.timeouts;
        let mut tls = deadline(
            "handshake",
            timeouts.handshake,
            self.inner.tls.connect(&hello, &target.host, stream, None),
        )
        .await?;

        let host_port = target.key.authority();
        let checked = {
            let certs = presented_certificates(tls.ssl());
            self.inner.pins.check(certs.iter().map(|c| &**c), &host_port)
        };
        if let Err(e) = checked {
            let _ = tls.shutdown().await;
            return Err(e);
        }

        let expires_at = earliest_expiry(tls.ssl());
        let alpn = AlpnProtocol::of(tls.ssl());
        let stream: BoxedStream = Box::new(tls);
        if alpn.is_h2() {
            let handle = h2::connect(stream, &plan.http2, timeouts.handshake).await?;
            Ok(PooledConnection::http2(handle, expires_at))
        } else {
            Ok(PooledConnection::http1(H1Connection::new(stream), expires_at))
        }
    }

    async fn dial_h3(&self, host: &str, port: u16, plan: &DialPlan) -> Result<PooledConnection> {
        let timeouts = self.inner.timeouts;
        let peer = resolve(host, port, &timeouts).await?;
        let path = match plan.dialer.config().hops() {
            [] => DatagramPath::direct(peer).await?,
            [hop] => DatagramPath::relay(Socks5UdpRelay::associate(hop, peer, &timeouts).await?),
            _ => {
                return Err(ProxyError::UnsupportedProxyChain(
                    "QUIC over SOCKS5 is not supported with chained proxies".to_string(),
                )
                .into())
            }
        };

        let hello = plan.quic_client_hello();
        let config = match QuicConfig::new(&self.inner.tls, &hello, &plan.http3) {
            Ok(config) => config,
            Err(e) => {
                path.close();
                return Err(e);
            }
        };
        let handle =
            H3Connection::connect(host, port, config, path, &self.inner.pins, timeouts.handshake)
                .await?;
        Ok(PooledConnection::http3(handle))
    }

    /// Trust on first use: handshake with `url`'s host using the engine's
    /// fingerprint and route, pin every presented certificate, and return
    /// the digests.
    pub async fn learn_pins(&self, url: &str) -> Result<Vec<String>> {
        let target = self.target(url, None)?;
        let plan = self.plan(&TransportRequest::get(url))?;
        let hello = plan.client_hello();
        let timeouts = self.inner.timeouts;

        let stream = plan.dialer.dial(&target.host, target.port, &hello).await?;
        let mut tls = deadline(
            "handshake",
            timeouts.handshake,
            self.inner.tls.connect(&hello, &target.host, stream, None),
        )
        .await?;
        let digests = presented_certificates(tls.ssl())
            .iter()
            .map(|cert| spki_digest(cert))
            .collect::<Result<Vec<_>>>();
        let _ = tls.shutdown().await;
        let digests = digests?;

        let host_port = target.key.authority();
        self.inner.pins.add_pins(&host_port, digests.iter().cloned());
        tracing::debug!(host = %host_port, pins = digests.len(), "Pin: learned");
        Ok(digests)
    }

    /// Close every pooled connection and cached proxy session.
    pub async fn close(&self) {
        self.inner.pool.close().await;
        self.inner.dialer.close();
        let routes: Vec<Arc<ProxyDialer>> = {
            let mut cache = self.inner.routes.lock().unwrap_or_else(|e| e.into_inner());
            let dialers = cache.iter().map(|(_, dialer)| dialer.clone()).collect();
            cache.clear();
            dialers
        };
        for dialer in routes {
            dialer.close();
        }
    }
}

/// QUIC runs direct or through exactly one SOCKS5 hop.
fn check_quic_route(proxy: &ProxyConfig) -> Result<()> {
    match proxy.hops() {
        [] => Ok(()),
        [hop] if hop.scheme.is_socks5() => Ok(()),
        [hop] => Err(ProxyError::UnsupportedProxyForQuic(format!(
            "{} proxy cannot carry QUIC ({})",
            hop.scheme.as_str(),
            hop
        ))
        .into()),
        _ => Err(ProxyError::UnsupportedProxyChain(format!(
            "QUIC cannot cross a proxy chain ({})",
            proxy.route_id()
        ))
        .into()),
    }
}

async fn resolve(host: &str, port: u16, timeouts: &Timeouts) -> Result<SocketAddr> {
    let target = authority(host, port);
    deadline("connect", timeouts.connect, async {
        tokio::net::lookup_host(target.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::connection(format!("no address for {}", target)))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn build_rejects_bad_fingerprints() {
        let err = Engine::builder().ja3("771,4865,0,29").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        let err = Engine::builder()
            .http2_fingerprint("1:65536|0|0")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);

        let err = Engine::builder().proxy_url("ftp://proxy:21").build().unwrap_err();
        assert!(matches!(
            err,
            Error::Proxy(ProxyError::UnsupportedProxyScheme(_))
        ));
    }

    #[test]
    fn user_agent_defaults_to_preset() {
        let engine = Engine::builder().browser(Browser::Firefox).build().unwrap();
        assert_eq!(engine.user_agent(), profiles::user_agent(Browser::Firefox));

        let engine = Engine::builder().user_agent("veil-test/1.0").build().unwrap();
        assert_eq!(engine.user_agent(), "veil-test/1.0");
    }

    #[test]
    fn quic_route_rules() {
        let single = |url: &str| ProxyConfig::from_urls(&[url]).unwrap();
        assert!(check_quic_route(&ProxyConfig::NoProxy).is_ok());
        assert!(check_quic_route(&single("socks5://127.0.0.1:1080")).is_ok());
        assert!(check_quic_route(&single("socks5h://127.0.0.1:1080")).is_ok());
        for url in ["http://p:8080", "https://p:8443", "socks4://p:1080"] {
            assert!(matches!(
                check_quic_route(&single(url)),
                Err(Error::Proxy(ProxyError::UnsupportedProxyForQuic(_)))
            ));
        }
        let chain = ProxyConfig::from_urls(&["socks5://a:1080", "socks5://b:1080"]).unwrap();
        assert!(matches!(
            check_quic_route(&chain),
            Err(Error::Proxy(ProxyError::UnsupportedProxyChain(_)))
        ));
    }

    #[tokio::test]
    async fn force_http3_needs_enablement() {
        let engine = Engine::builder().build().unwrap();
        let err = engine
            .execute(TransportRequest::get("https://example.com/").force_http3(true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http3NotEnabled));
    }

    #[tokio::test]
    async fn force_http3_checks_proxy_before_dialing() {
        let engine = Engine::builder()
            .http3(true)
            .proxy_url("http://127.0.0.1:9")
            .build()
            .unwrap();
        let err = engine
            .execute(TransportRequest::get("https://example.com/").force_http3(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Proxy(ProxyError::UnsupportedProxyForQuic(_))
        ));

        let engine = Engine::builder()
            .http3(true)
            .proxy_chain(&["socks5://127.0.0.1:9", "socks5://127.0.0.1:10"])
            .build()
            .unwrap();
        let err = engine
            .execute(TransportRequest::get("https://example.com/").force_http3(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Proxy(ProxyError::UnsupportedProxyChain(_))
        ));
    }

    #[test]
    fn proxy_override_gets_own_pool_key() {
        let engine = Engine::builder().build().unwrap();
        let proxy = ProxyConfig::from_urls(&["http://p:3128"]).unwrap();
        let plain = engine.target("https://Example.com/a", None).unwrap();
        let routed = engine.target("https://example.com/b", Some(&proxy)).unwrap();
        assert_eq!(plain.key.authority(), "example.com:443");
        assert_ne!(plain.key, routed.key);
        assert_eq!(routed.key.route.as_deref(), Some("http://p:3128"));
    }

    #[test]
    fn route_dialers_follow_the_request_http2_fingerprint() {
        let engine = Engine::builder()
            .browser(Browser::Chrome)
            .proxy_url("https://proxy.test:8443")
            .build()
            .unwrap();
        let firefox_h2 = profiles::http2_fingerprint(Browser::Firefox).akamai_string();

        let default = engine.plan(&TransportRequest::get("https://example.com/")).unwrap();
        assert!(Arc::ptr_eq(&default.dialer, &engine.inner.dialer));

        let overridden = engine
            .plan(&TransportRequest::get("https://example.com/").http2_fingerprint(firefox_h2.clone()))
            .unwrap();
        assert!(!Arc::ptr_eq(&overridden.dialer, &engine.inner.dialer));
        assert_eq!(overridden.dialer.http2().akamai_string(), firefox_h2);
        assert_eq!(overridden.dialer.config(), engine.proxy());

        let again = engine
            .plan(&TransportRequest::get("https://example.com/").http2_fingerprint(firefox_h2))
            .unwrap();
        assert!(Arc::ptr_eq(&overridden.dialer, &again.dialer));
    }

    #[test]
    fn route_dialer_cache_is_bounded() {
        let engine = Engine::builder().build().unwrap();
        let first = ProxyConfig::from_urls(&["http://p0:3128"]).unwrap();
        let first_dialer = engine.plan(&TransportRequest::get("https://a/").proxy(first.clone())).unwrap().dialer;

        for port in 1..=MAX_ROUTE_DIALERS.get() as u16 + 8 {
            let proxy = ProxyConfig::from_urls(&[format!("http://p{}:3128", port)]).unwrap();
            engine.plan(&TransportRequest::get("https://a/").proxy(proxy)).unwrap();
        }
        let cached = engine.inner.routes.lock().unwrap().len();
        assert_eq!(cached, MAX_ROUTE_DIALERS.get());

        // the oldest route was evicted, so it gets a fresh dialer
        let redialed = engine.plan(&TransportRequest::get("https://a/").proxy(first)).unwrap().dialer;
        assert!(!Arc::ptr_eq(&first_dialer, &redialed));
    }

    #[test]
    fn request_overrides_reach_the_plan() {
        let engine = Engine::builder().browser(Browser::Chrome).build().unwrap();
        let plan = engine
            .plan(&TransportRequest::get("https://example.com/").browser(Browser::Firefox))
            .unwrap();
        assert_eq!(plan.browser, Browser::Firefox);
        assert_eq!(plan.http2, profiles::http2_fingerprint(Browser::Firefox));

        let err = engine
            .plan(&TransportRequest::get("https://example.com/").ja3("771,4865"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
