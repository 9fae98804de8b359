use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boring::ssl::SslAcceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const PRIORITY: u8 = 0x2;
pub const SETTINGS: u8 = 0x4;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const RST_STREAM: u8 = 0x3;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;
pub const PADDED: u8 = 0x8;
pub const PRIORITY_FLAG: u8 = 0x20;

/// What the server does with requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2Behavior {
    /// Answer every request with `200` and body `ok`.
    Respond,
    /// The first connection answers its first request with GOAWAY
    /// (last stream 0); later connections respond normally.
    GoAwayOnFirstConnection,
    /// Every connection answers with GOAWAY.
    AlwaysGoAway,
}

/// A frame received before the first HEADERS of a connection.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct H2Stats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    /// Frames the first connection sent after the preface, up to its first
    /// HEADERS.
    pub opening: Mutex<Vec<RawFrame>>,
}

impl H2Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn opening_frames(&self) -> Vec<RawFrame> {
        self.opening.lock().unwrap().clone()
    }
}

/// A scripted HTTP/2 server behind TLS (ALPN `h2`).
pub struct MockH2Server {
    listener: TcpListener,
    port: u16,
    acceptor: SslAcceptor,
    stats: Arc<H2Stats>,
}

impl MockH2Server {
    /// Create a new mock H2 server bound to a random port.
    pub async fn new(acceptor: SslAcceptor) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            acceptor,
            stats: Arc::new(H2Stats::default()),
        })
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> Arc<H2Stats> {
        self.stats.clone()
    }

    pub fn start(self, behavior: H2Behavior) -> tokio::task::JoinHandle<()> {
        let acceptor = Arc::new(self.acceptor);
        let stats = self.stats;
        let listener = self.listener;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = stats.connections.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    match tokio_boring::accept(&acceptor, stream).await {
                        Ok(stream) => {
                            let goaway = match behavior {
                                H2Behavior::Respond => false,
                                H2Behavior::GoAwayOnFirstConnection => index == 0,
                                H2Behavior::AlwaysGoAway => true,
                            };
                            let _ = serve(stream, goaway, index == 0, &stats).await;
                        }
                        Err(e) => tracing::debug!("mock h2 TLS accept failed: {}", e),
                    }
                });
            }
        })
    }
}

async fn serve<S>(mut stream: S, goaway: bool, record: bool, stats: &H2Stats) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).await?;
    if &preface[..] != PREFACE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad preface",
        ));
    }
    write_frame(&mut stream, SETTINGS, 0, 0, &[]).await?;
    stream.flush().await?;

    let mut encoder = hpack::Encoder::new();
    let mut opening = record;
    loop {
        let frame = read_frame(&mut stream).await?;
        if opening {
            if frame.frame_type == HEADERS {
                opening = false;
            } else {
                stats.opening.lock().unwrap().push(frame.clone());
            }
        }
        match frame.frame_type {
            SETTINGS if frame.flags & ACK == 0 => {
                write_frame(&mut stream, SETTINGS, ACK, 0, &[]).await?;
                stream.flush().await?;
            }
            PING if frame.flags & ACK == 0 => {
                write_frame(&mut stream, PING, ACK, 0, &frame.payload).await?;
            }
            HEADERS | DATA if frame.flags & END_STREAM != 0 => {
                stats.requests.fetch_add(1, Ordering::SeqCst);
                if goaway {
                    // last stream 0, NO_ERROR
                    write_frame(&mut stream, GOAWAY, 0, 0, &[0; 8]).await?;
                    stream.flush().await?;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return Ok(());
                }
                let block = encoder.encode(vec![
                    (&b":status"[..], &b"200"[..]),
                    (&b"content-length"[..], &b"2"[..]),
                ]);
                write_frame(&mut stream, HEADERS, END_HEADERS, frame.stream_id, &block).await?;
                write_frame(&mut stream, DATA, END_STREAM, frame.stream_id, b"ok").await?;
                stream.flush().await?;
            }
            GOAWAY => return Ok(()),
            _ => {}
        }
    }
}

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<RawFrame> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(RawFrame {
        frame_type: header[3],
        flags: header[4],
        stream_id,
        payload,
    })
}

pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.extend_from_slice(&len[1..]);
    frame.push(frame_type);
    frame.push(flags);
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

/// `(id, value)` pairs of a SETTINGS payload.
pub fn settings_pairs(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect()
}
