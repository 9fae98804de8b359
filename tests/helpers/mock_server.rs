use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use boring::ssl::SslAcceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// Counters shared with the test body.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
}

impl ServerStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// A simple HTTP/1.1 mock server that handles keep-alive connections,
/// plain or behind TLS.
pub struct MockHttpServer {
    listener: TcpListener,
    port: u16,
    tls: Option<SslAcceptor>,
    headers: Vec<(String, String)>,
    stats: Arc<ServerStats>,
}

impl MockHttpServer {
    /// Create a new mock server bound to a random port.
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            tls: None,
            headers: Vec::new(),
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub async fn with_tls(acceptor: SslAcceptor) -> std::io::Result<Self> {
        let mut server = Self::new().await?;
        server.tls = Some(acceptor);
        Ok(server)
    }

    /// Extra header on every response.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Get the base URL for this server.
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://127.0.0.1:{}", scheme, self.port)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Start the server in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let headers = Arc::new(self.headers);
        let tls = self.tls.map(Arc::new);
        let stats = self.stats;
        let listener = self.listener;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                stats.connections.fetch_add(1, Ordering::SeqCst);
                let headers = headers.clone();
                let stats = stats.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match tokio_boring::accept(&acceptor, stream).await {
                            Ok(stream) => handle_connection(stream, &headers, &stats).await,
                            Err(e) => tracing::debug!("mock TLS accept failed: {}", e),
                        },
                        None => handle_connection(stream, &headers, &stats).await,
                    }
                });
            }
        })
    }
}

/// Serve requests until the client closes. Each response body is
/// `<method> <path>`.
async fn handle_connection<S>(mut stream: S, headers: &[(String, String)], stats: &ServerStats)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let end = loop {
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buffer[..end]).into_owned();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let content_length = lines
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buffer.len() < end + content_length {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
        buffer.drain(..end + content_length);
        stats.requests.fetch_add(1, Ordering::SeqCst);

        let mut parts = request_line.split_whitespace();
        let body = format!(
            "{} {}",
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default()
        );
        let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", body.len());
        for (name, value) in headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        response.push_str(&body);
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}
