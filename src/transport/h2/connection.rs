//! HTTP/2 session establishment and the inbound frame reader.
//!
//! `connect` writes the connection preface, the fingerprinted SETTINGS frame,
//! the optional connection WINDOW_UPDATE and any PRIORITY frames in one write,
//! waits for the server's first SETTINGS, then hands the socket to a reader
//! task and a driver task.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;

use crate::error::{Error, Invalidation, Result};
use crate::fingerprint::http2::Http2Fingerprint;
use crate::timeouts::deadline;
use crate::transport::BoxedStream;

use super::driver::Driver;
use super::frame::*;
use super::handle::H2Handle;

/// Inbound frame queue depth between the reader and the driver.
const INBOUND_QUEUE: usize = 64;

/// State visible to every handle of one session.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Cleared on GOAWAY, EOF, write failure or shutdown.
    pub accepting: AtomicBool,
}

/// Settings announced by the server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerSettings {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl PeerSettings {
    /// Apply one SETTINGS frame. Returns the change in initial window size.
    pub fn apply(&mut self, settings: &[(u16, u32)]) -> Result<i64> {
        let mut delta = 0i64;
        for &(id, value) in settings {
            match id {
                settings_id::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
                settings_id::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(Error::http_protocol("INITIAL_WINDOW_SIZE above 2^31-1"));
                    }
                    delta += value as i64 - self.initial_window_size as i64;
                    self.initial_window_size = value;
                }
                settings_id::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=0x00ff_ffff).contains(&value) {
                        return Err(Error::http_protocol("MAX_FRAME_SIZE out of range"));
                    }
                    self.max_frame_size = value;
                }
                _ => {}
            }
        }
        Ok(delta)
    }
}

/// Reads whole frames off the socket.
///
/// HEADERS and PUSH_PROMISE frames are merged with their CONTINUATION frames
/// so the driver always sees complete header blocks. For HEADERS the payload
/// is the bare header block and only END_STREAM / END_HEADERS remain set; for
/// PUSH_PROMISE it is the promised stream id followed by the block.
pub(crate) struct FrameReader {
    io: ReadHalf<BoxedStream>,
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameReader {
    pub fn new(io: ReadHalf<BoxedStream>, max_frame_size: u32) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(16 * 1024),
            max_frame_size,
        }
    }

    /// Next frame, or `None` on clean EOF at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<(FrameHeader, Bytes)>> {
        let Some((header, payload)) = self.raw_frame().await? else {
            return Ok(None);
        };
        match header.frame_type {
            FrameType::Headers => {
                let fragment = HeadersFrame::fragment(&header, payload)?;
                self.complete_block(header, fragment).await.map(Some)
            }
            FrameType::PushPromise => {
                let mut payload = payload;
                if header.has_flag(flags::PADDED) {
                    let pad_len = payload.first().copied().unwrap_or(0) as usize;
                    if payload.len() < pad_len + 1 {
                        return Err(Error::http_protocol("PUSH_PROMISE padding exceeds payload"));
                    }
                    payload.advance(1);
                    payload.truncate(payload.len() - pad_len);
                }
                self.complete_block(header, payload).await.map(Some)
            }
            FrameType::Continuation => {
                Err(Error::http_protocol("CONTINUATION without a header block"))
            }
            _ => Ok(Some((header, payload))),
        }
    }

    async fn complete_block(
        &mut self,
        mut header: FrameHeader,
        first: Bytes,
    ) -> Result<(FrameHeader, Bytes)> {
        let mut block = BytesMut::from(first.as_ref());
        let mut end_headers = header.has_flag(flags::END_HEADERS);
        while !end_headers {
            let (next, payload) = self
                .raw_frame()
                .await?
                .ok_or(Error::SessionInvalidated(Invalidation::ConnClosed))?;
            if next.frame_type != FrameType::Continuation || next.stream_id != header.stream_id {
                return Err(Error::http_protocol("expected CONTINUATION frame"));
            }
            block.extend_from_slice(&payload);
            end_headers = next.has_flag(flags::END_HEADERS);
        }
        header.flags = (header.flags & flags::END_STREAM) | flags::END_HEADERS;
        header.length = block.len() as u32;
        Ok((header, block.freeze()))
    }

    async fn raw_frame(&mut self) -> Result<Option<(FrameHeader, Bytes)>> {
        loop {
            if let Some(header) = FrameHeader::parse(&self.buf) {
                if header.length > self.max_frame_size {
                    return Err(Error::http_protocol(format!(
                        "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE",
                        header.length
                    )));
                }
                let total = FRAME_HEADER_SIZE + header.length as usize;
                if self.buf.len() >= total {
                    self.buf.advance(FRAME_HEADER_SIZE);
                    let payload = self.buf.split_to(header.length as usize).freeze();
                    return Ok(Some((header, payload)));
                }
            }
            let n = self
                .io
                .read_buf(&mut self.buf)
                .await
                .map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::SessionInvalidated(Invalidation::ConnClosed));
            }
        }
    }
}

/// First request stream id: odd and above every PRIORITY stream the
/// fingerprint opens.
fn first_stream_id(fingerprint: &Http2Fingerprint) -> Result<u32> {
    let Some(max) = fingerprint.priorities.iter().map(|p| p.stream_id).max() else {
        return Ok(1);
    };
    (max | 1)
        .checked_add(2)
        .filter(|id| *id <= MAX_STREAM_ID)
        .ok_or_else(|| {
            Error::http_protocol(format!(
                "no request stream ids left after PRIORITY stream {}",
                max
            ))
        })
}

/// Establish an HTTP/2 session over `stream` with `fingerprint`.
///
/// Fails with `Timeout { stage: "handshake" }` when the server's SETTINGS
/// does not arrive within `handshake_timeout`.
pub async fn connect(
    stream: BoxedStream,
    fingerprint: &Http2Fingerprint,
    handshake_timeout: Duration,
) -> Result<H2Handle> {
    let first_stream_id = first_stream_id(fingerprint)?;
    let (read_half, mut write_half) = tokio::io::split(stream);

    let local_max_frame = fingerprint
        .setting(settings_id::MAX_FRAME_SIZE)
        .unwrap_or(DEFAULT_MAX_FRAME_SIZE);
    let local_stream_window = fingerprint
        .setting(settings_id::INITIAL_WINDOW_SIZE)
        .unwrap_or(DEFAULT_WINDOW_SIZE);

    let mut preface = BytesMut::with_capacity(256);
    preface.extend_from_slice(CONNECTION_PREFACE);
    SettingsFrame::new(fingerprint.settings.clone()).serialize(&mut preface);
    if fingerprint.connection_window_increment > 0 {
        WindowUpdateFrame::new(0, fingerprint.connection_window_increment).serialize(&mut preface);
    }
    for p in &fingerprint.priorities {
        PriorityFrame {
            stream_id: p.stream_id,
            priority: p.priority,
        }
        .serialize(&mut preface);
    }

    let mut reader = FrameReader::new(read_half, local_max_frame);
    let server_settings = deadline("handshake", handshake_timeout, async {
        write_half
            .write_all(&preface)
            .await
            .map_err(|e| Error::connection(format!("failed to send HTTP/2 preface: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::connection(format!("failed to send HTTP/2 preface: {}", e)))?;

        let (header, payload) = reader
            .next_frame()
            .await?
            .ok_or(Error::SessionInvalidated(Invalidation::ConnClosed))?;
        if header.frame_type != FrameType::Settings || header.has_flag(flags::ACK) {
            return Err(Error::http_protocol(format!(
                "expected server SETTINGS, got {:?}",
                header.frame_type
            )));
        }
        SettingsFrame::parse(&header, payload)
    })
    .await?;

    let mut peer = PeerSettings::default();
    peer.apply(&server_settings.settings)?;
    tracing::debug!(
        settings = ?server_settings.settings,
        "HTTP/2: server SETTINGS received"
    );

    let state = Arc::new(SessionState {
        accepting: AtomicBool::new(true),
    });
    let (frame_tx, frame_rx) = mpsc::channel(INBOUND_QUEUE);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(read_frames(reader, frame_tx));

    let driver = Driver::new(
        write_half,
        command_rx,
        frame_rx,
        state.clone(),
        peer,
        DEFAULT_WINDOW_SIZE.saturating_add(fingerprint.connection_window_increment),
        local_stream_window,
        fingerprint.header_priority,
        first_stream_id,
    );
    tokio::spawn(driver.run());

    Ok(H2Handle::new(
        command_tx,
        state,
        fingerprint.pseudo_header_order,
    ))
}

/// Reader task: forwards frames until EOF or error, then reports it once.
async fn read_frames(mut reader: FrameReader, tx: mpsc::Sender<Result<(FrameHeader, Bytes)>>) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx
                    .send(Err(Error::SessionInvalidated(Invalidation::ConnClosed)))
                    .await;
                return;
            }
            Err(e) => {
                tracing::trace!(error = %e, "HTTP/2: reader stopped");
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Browser;
    use tokio::io::duplex;

    #[test]
    fn initial_window_change_yields_delta() {
        let mut peer = PeerSettings::default();
        let delta = peer.apply(&[(4, 1_048_576), (3, 100)]).unwrap();
        assert_eq!(delta, 1_048_576 - 65_535);
        assert_eq!(peer.max_concurrent_streams, 100);
        assert!(peer.apply(&[(5, 1)]).is_err());
    }

    #[test]
    fn request_streams_start_above_priority_streams() {
        let plain = Http2Fingerprint::parse("0|0|0|m,a,s,p", Browser::Chrome).unwrap();
        assert_eq!(first_stream_id(&plain).unwrap(), 1);

        let firefox = crate::fingerprint::profiles::http2_fingerprint(Browser::Firefox);
        let highest = firefox.priorities.iter().map(|p| p.stream_id).max().unwrap_or(0);
        let first = first_stream_id(&firefox).unwrap();
        assert!(first > highest && first % 2 == 1);

        let exhausted =
            Http2Fingerprint::parse("0|0|2147483647:0:0:1|m,a,s,p", Browser::Chrome).unwrap();
        assert!(matches!(first_stream_id(&exhausted), Err(Error::HttpProtocol(_))));
    }

    #[tokio::test]
    async fn reader_merges_continuation_frames() {
        let (client, mut server) = duplex(4096);
        let boxed: BoxedStream = Box::new(client);
        let (read_half, _write_half) = tokio::io::split(boxed);
        let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_SIZE);

        let mut wire = BytesMut::new();
        FrameHeader {
            length: 2,
            frame_type: FrameType::Headers,
            flags: flags::END_STREAM,
            stream_id: 1,
        }
        .serialize(&mut wire);
        wire.extend_from_slice(b"ab");
        FrameHeader {
            length: 2,
            frame_type: FrameType::Continuation,
            flags: flags::END_HEADERS,
            stream_id: 1,
        }
        .serialize(&mut wire);
        wire.extend_from_slice(b"cd");
        server.write_all(&wire).await.unwrap();
        drop(server);

        let (header, block) = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(header.frame_type, FrameType::Headers);
        assert!(header.has_flag(flags::END_STREAM));
        assert_eq!(block.as_ref(), b"abcd");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_conn_closed() {
        let (client, mut server) = duplex(4096);
        let boxed: BoxedStream = Box::new(client);
        let (read_half, _write_half) = tokio::io::split(boxed);
        let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_SIZE);
        server.write_all(&[0, 0, 8, 6, 0, 0, 0, 0, 0, 1, 2]).await.unwrap();
        drop(server);
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, Error::SessionInvalidated(Invalidation::ConnClosed)));
    }
}
