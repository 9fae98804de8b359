use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use boring::ssl::SslAcceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use super::mock_h2_server::{self as h2, RawFrame};

/// A CONNECT request as a proxy saw it.
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub proxy: &'static str,
    pub authority: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Ordered events from every proxy sharing the log, e.g. `hop1: accept`,
/// `hop2: tls`, `hop1: CONNECT 127.0.0.1:4000`.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
    connects: Arc<Mutex<Vec<ConnectRecord>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, proxy: &str, event: impl AsRef<str>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}: {}", proxy, event.as_ref()));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.connects.lock().unwrap().clone()
    }
}

/// HTTP CONNECT proxy, plain or behind TLS (HTTP/1.1 only).
pub struct MockHttpProxy {
    listener: TcpListener,
    port: u16,
    name: &'static str,
    tls: Option<SslAcceptor>,
    reject: Option<String>,
    log: EventLog,
}

impl MockHttpProxy {
    pub async fn new(name: &'static str, log: EventLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            name,
            tls: None,
            reject: None,
            log,
        })
    }

    pub fn with_tls(mut self, acceptor: SslAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Answer every CONNECT with `status_line` instead of tunnelling.
    pub fn reject_with(mut self, status_line: &str) -> Self {
        self.reject = Some(status_line.to_string());
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://127.0.0.1:{}", scheme, self.port)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let tls = self.tls.map(Arc::new);
        let reject = Arc::new(self.reject);
        let (name, log, listener) = (self.name, self.log, self.listener);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                log.push(name, "accept");
                let (tls, reject, log) = (tls.clone(), reject.clone(), log.clone());
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match tokio_boring::accept(&acceptor, stream).await {
                            Ok(stream) => {
                                log.push(name, "tls");
                                handle_connect(stream, name, reject.as_deref(), &log).await;
                            }
                            Err(e) => tracing::debug!("mock proxy TLS accept failed: {}", e),
                        },
                        None => handle_connect(stream, name, reject.as_deref(), &log).await,
                    }
                });
            }
        })
    }
}

async fn handle_connect<S>(mut client: S, name: &'static str, reject: Option<&str>, log: &EventLog)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match client.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    if !matches!(request.parse(&buffer[..end]), Ok(httparse::Status::Complete(_))) {
        return;
    }
    let authority = request.path.unwrap_or_default().to_string();
    let record = ConnectRecord {
        proxy: name,
        authority: authority.clone(),
        headers: request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    };
    log.push(name, format!("CONNECT {}", authority));
    log.connects.lock().unwrap().push(record);

    if let Some(status_line) = reject {
        let reply = format!("{}\r\nContent-Length: 0\r\n\r\n", status_line);
        let _ = client.write_all(reply.as_bytes()).await;
        let _ = client.flush().await;
        return;
    }

    let mut upstream = match TcpStream::connect(authority.as_str()).await {
        Ok(upstream) => upstream,
        Err(_) => {
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await;
            return;
        }
    };
    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
        || client.flush().await.is_err()
    {
        return;
    }
    if end < buffer.len() && upstream.write_all(&buffer[end..]).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

/// HTTPS proxy that only speaks HTTP/2 (ALPN `h2`) and serves every
/// CONNECT stream as a tunnel to the requested authority.
pub struct MockH2Proxy {
    listener: TcpListener,
    port: u16,
    name: &'static str,
    acceptor: SslAcceptor,
    log: EventLog,
}

impl MockH2Proxy {
    pub async fn new(name: &'static str, acceptor: SslAcceptor, log: EventLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            name,
            acceptor,
            log,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let acceptor = Arc::new(self.acceptor);
        let (name, log, listener) = (self.name, self.log, self.listener);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                log.push(name, "accept");
                let (acceptor, log) = (acceptor.clone(), log.clone());
                tokio::spawn(async move {
                    match tokio_boring::accept(&acceptor, stream).await {
                        Ok(stream) => {
                            log.push(name, "tls");
                            if let Err(e) = serve_h2_tunnels(stream, name, &log).await {
                                tracing::debug!("mock h2 proxy session ended: {}", e);
                            }
                        }
                        Err(e) => tracing::debug!("mock h2 proxy TLS accept failed: {}", e),
                    }
                });
            }
        })
    }
}

/// Header block of a HEADERS frame without padding and priority fields.
fn header_block(frame: &RawFrame) -> &[u8] {
    let mut block = &frame.payload[..];
    let mut pad = 0;
    if frame.flags & h2::PADDED != 0 && !block.is_empty() {
        pad = block[0] as usize;
        block = &block[1..];
    }
    if frame.flags & h2::PRIORITY_FLAG != 0 && block.len() >= 5 {
        block = &block[5..];
    }
    &block[..block.len().saturating_sub(pad)]
}

async fn serve_h2_tunnels<S>(stream: S, name: &'static str, log: &EventLog) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut preface = [0u8; 24];
    reader.read_exact(&mut preface).await?;
    if &preface[..] != h2::PREFACE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad preface"));
    }
    h2::write_frame(&mut writer, h2::SETTINGS, 0, 0, &[]).await?;
    writer.flush().await?;

    let (frame_tx, mut frames) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(frame) = h2::read_frame(&mut reader).await {
            if frame_tx.send(frame).is_err() {
                break;
            }
        }
    });

    // upstream bytes per stream; None marks EOF
    let (up_tx, mut upstream) = mpsc::unbounded_channel::<(u32, Option<Vec<u8>>)>();
    let mut tunnels: HashMap<u32, OwnedWriteHalf> = HashMap::new();
    let mut decoder = hpack::Decoder::new();
    let mut encoder = hpack::Encoder::new();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                match frame.frame_type {
                    h2::SETTINGS if frame.flags & h2::ACK == 0 => {
                        h2::write_frame(&mut writer, h2::SETTINGS, h2::ACK, 0, &[]).await?;
                    }
                    h2::PING if frame.flags & h2::ACK == 0 => {
                        h2::write_frame(&mut writer, h2::PING, h2::ACK, 0, &frame.payload).await?;
                    }
                    h2::HEADERS => {
                        let fields = decoder.decode(header_block(&frame)).map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{:?}", e))
                        })?;
                        let text = |v: &[u8]| String::from_utf8_lossy(v).into_owned();
                        let authority = fields
                            .iter()
                            .find(|(n, _)| n.as_slice() == b":authority")
                            .map(|(_, v)| text(v.as_slice()))
                            .unwrap_or_default();
                        log.push(name, format!("CONNECT {}", authority));
                        log.connects.lock().unwrap().push(ConnectRecord {
                            proxy: name,
                            authority: authority.clone(),
                            headers: fields
                                .iter()
                                .filter(|(n, _)| !n.starts_with(b":"))
                                .map(|(n, v)| (text(n.as_slice()), text(v.as_slice())))
                                .collect(),
                        });

                        let id = frame.stream_id;
                        match TcpStream::connect(authority.as_str()).await {
                            Ok(target) => {
                                let (mut target_read, target_write) = target.into_split();
                                tunnels.insert(id, target_write);
                                let up_tx = up_tx.clone();
                                tokio::spawn(async move {
                                    let mut chunk = vec![0u8; 16 * 1024];
                                    loop {
                                        match target_read.read(&mut chunk).await {
                                            Ok(0) | Err(_) => {
                                                let _ = up_tx.send((id, None));
                                                return;
                                            }
                                            Ok(n) => {
                                                if up_tx.send((id, Some(chunk[..n].to_vec()))).is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                    }
                                });
                                let block = encoder.encode(vec![(&b":status"[..], &b"200"[..])]);
                                h2::write_frame(&mut writer, h2::HEADERS, h2::END_HEADERS, id, &block).await?;
                            }
                            Err(_) => {
                                let block = encoder.encode(vec![(&b":status"[..], &b"502"[..])]);
                                h2::write_frame(
                                    &mut writer,
                                    h2::HEADERS,
                                    h2::END_HEADERS | h2::END_STREAM,
                                    id,
                                    &block,
                                )
                                .await?;
                            }
                        }
                    }
                    h2::DATA => {
                        let id = frame.stream_id;
                        if let Some(target) = tunnels.get_mut(&id) {
                            if !frame.payload.is_empty() {
                                target.write_all(&frame.payload).await?;
                            }
                            if frame.flags & h2::END_STREAM != 0 {
                                let _ = target.shutdown().await;
                            }
                        }
                        if !frame.payload.is_empty() {
                            let increment = (frame.payload.len() as u32).to_be_bytes();
                            h2::write_frame(&mut writer, h2::WINDOW_UPDATE, 0, 0, &increment).await?;
                            h2::write_frame(&mut writer, h2::WINDOW_UPDATE, 0, id, &increment).await?;
                        }
                    }
                    h2::RST_STREAM => {
                        tunnels.remove(&frame.stream_id);
                    }
                    h2::GOAWAY => return Ok(()),
                    _ => {}
                }
            }
            chunk = upstream.recv() => match chunk {
                Some((id, Some(bytes))) => {
                    for piece in bytes.chunks(16 * 1024) {
                        h2::write_frame(&mut writer, h2::DATA, 0, id, piece).await?;
                    }
                }
                Some((id, None)) => {
                    if tunnels.remove(&id).is_some() {
                        h2::write_frame(&mut writer, h2::DATA, h2::END_STREAM, id, &[]).await?;
                    }
                }
                None => return Ok(()),
            },
        }
        writer.flush().await?;
    }
}

/// SOCKS5 proxy without authentication: CONNECT, plus UDP ASSOCIATE with
/// an IPv4 relay on loopback.
pub struct MockSocks5Proxy {
    listener: TcpListener,
    port: u16,
    log: EventLog,
}

impl MockSocks5Proxy {
    pub async fn new(log: EventLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            log,
        })
    }

    pub fn url(&self, scheme: &str) -> String {
        format!("{}://127.0.0.1:{}", scheme, self.port)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let (log, listener) = (self.log, self.listener);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                log.push("socks5", "accept");
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = handle_socks5(stream, &log).await;
                });
            }
        })
    }
}

async fn handle_socks5(mut client: TcpStream, log: &EventLog) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let authority = format!("{}:{}", host, u16::from_be_bytes(port));
    if request[1] == 0x03 {
        return udp_associate(client, log).await;
    }
    log.push("socks5", format!("CONNECT {}", authority));

    let mut upstream = match TcpStream::connect(authority.as_str()).await {
        Ok(upstream) => upstream,
        Err(_) => {
            client
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    };
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Relay datagrams between the client and their destinations until the
/// control connection closes.
async fn udp_associate(mut control: TcpStream, log: &EventLog) -> std::io::Result<()> {
    let relay = UdpSocket::bind("127.0.0.1:0").await?;
    let outbound = UdpSocket::bind("127.0.0.1:0").await?;
    let port = relay.local_addr()?.port().to_be_bytes();
    control
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
        .await?;
    log.push("socks5", "UDP ASSOCIATE");

    let log = log.clone();
    let forward = tokio::spawn(async move {
        let mut client = None;
        let mut from_client = vec![0u8; 65535];
        let mut from_target = vec![0u8; 65535];
        let mut relayed = 0usize;
        loop {
            tokio::select! {
                received = relay.recv_from(&mut from_client) => {
                    let Ok((len, from)) = received else { return };
                    let datagram = &from_client[..len];
                    // RSV RSV FRAG ATYP=1 ADDR(4) PORT(2)
                    if len < 10 || datagram[2] != 0 || datagram[3] != 0x01 {
                        continue;
                    }
                    client = Some(from);
                    let ip = Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
                    let port = u16::from_be_bytes([datagram[8], datagram[9]]);
                    if relayed == 0 {
                        log.push("socks5", format!("UDP to {}:{}", ip, port));
                    }
                    relayed += 1;
                    let _ = outbound.send_to(&datagram[10..], (ip, port)).await;
                }
                received = outbound.recv_from(&mut from_target) => {
                    let Ok((len, from)) = received else { return };
                    let (Some(client), SocketAddr::V4(source)) = (client, from) else { continue };
                    let mut packet = vec![0x00, 0x00, 0x00, 0x01];
                    packet.extend_from_slice(&source.ip().octets());
                    packet.extend_from_slice(&source.port().to_be_bytes());
                    packet.extend_from_slice(&from_target[..len]);
                    let _ = relay.send_to(&packet, client).await;
                }
            }
        }
    });

    let mut sink = [0u8; 64];
    while control.read(&mut sink).await.unwrap_or(0) > 0 {}
    forward.abort();
    Ok(())
}
