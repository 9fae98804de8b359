//! HTTP/2 connection driver - background task that owns the write half,
//! multiplexes streams and enforces flow control.
//!
//! The driver selects over commands from [`H2Handle`](super::H2Handle)s and
//! tunnels, and over frames from the reader task. Every event is handled
//! synchronously into an output buffer which is flushed once per event.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::error::{Error, Invalidation, ProxyError, Result};
use crate::fingerprint::http2::PriorityData;
use crate::response::TransportResponse;
use crate::transport::BoxedStream;
use crate::version::HttpVersion;

use super::connection::{PeerSettings, SessionState};
use super::frame::*;

/// Header list after pseudo-header ordering, ready for HPACK.
pub(crate) type HeaderList = Vec<(Vec<u8>, Vec<u8>)>;

/// Command sent from handles and tunnels to the driver.
pub(crate) enum Command {
    Request {
        headers: HeaderList,
        body: Option<Bytes>,
        respond: oneshot::Sender<Result<TransportResponse>>,
    },
    /// Open a CONNECT stream; answered with the stream id once the proxy
    /// replied 200.
    Connect {
        headers: HeaderList,
        inbound: mpsc::UnboundedSender<io::Result<Bytes>>,
        /// Send credit the driver refills as tunnel DATA goes out.
        credit: Arc<Semaphore>,
        respond: oneshot::Sender<Result<u32>>,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// The tunnel reader took `len` bytes; reopens the stream window.
    Consumed {
        stream_id: u32,
        len: u32,
    },
    Reset {
        stream_id: u32,
    },
    Shutdown,
}

impl Command {
    fn fail(self, err: Error) {
        match self {
            Command::Request { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Command::Connect { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            _ => {}
        }
    }
}

enum StreamKind {
    Request {
        respond: Option<oneshot::Sender<Result<TransportResponse>>>,
        status: Option<u16>,
        headers: Vec<(String, String)>,
        body: BytesMut,
    },
    Tunnel {
        opened: Option<oneshot::Sender<Result<u32>>>,
        inbound: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
        credit: Arc<Semaphore>,
    },
}

struct Stream {
    kind: StreamKind,
    send_window: i64,
    recv_unacked: u32,
    outbound: VecDeque<Bytes>,
    end_pending: bool,
    local_closed: bool,
}

impl Stream {
    fn new(kind: StreamKind, send_window: u32, local_closed: bool) -> Self {
        Self {
            kind,
            send_window: send_window as i64,
            recv_unacked: 0,
            outbound: VecDeque::new(),
            end_pending: false,
            local_closed,
        }
    }

    fn fail(self, err: Error) {
        // wakes a writer waiting for credit
        if let StreamKind::Tunnel { credit, .. } = &self.kind {
            credit.close();
        }
        match self.kind {
            StreamKind::Request {
                respond: Some(tx), ..
            } => {
                let _ = tx.send(Err(err));
            }
            StreamKind::Tunnel {
                opened: Some(tx), ..
            } => {
                let _ = tx.send(Err(err));
            }
            StreamKind::Tunnel {
                inbound: Some(tx), ..
            } => {
                let _ = tx.send(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    err.to_string(),
                )));
            }
            _ => {}
        }
    }
}

/// Copy of `err` for fan-out to every stream of a failed session.
fn replicate(err: &Error) -> Error {
    match err {
        Error::SessionInvalidated(reason) => Error::SessionInvalidated(*reason),
        Error::HttpProtocol(msg) => Error::HttpProtocol(msg.clone()),
        Error::Timeout { stage, after } => Error::timeout(*stage, *after),
        other => Error::connection(other.to_string()),
    }
}

pub(crate) struct Driver {
    io: WriteHalf<BoxedStream>,
    commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::Receiver<Result<(FrameHeader, Bytes)>>,
    state: Arc<SessionState>,
    peer: PeerSettings,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    streams: HashMap<u32, Stream>,
    /// Requests waiting for a MAX_CONCURRENT_STREAMS slot.
    pending: VecDeque<Command>,
    next_stream_id: u32,
    conn_send_window: i64,
    conn_recv_unacked: u32,
    local_conn_window: u32,
    local_stream_window: u32,
    header_priority: Option<PriorityData>,
    goaway: Option<Invalidation>,
    commands_closed: bool,
    out: BytesMut,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: WriteHalf<BoxedStream>,
        commands: mpsc::UnboundedReceiver<Command>,
        frames: mpsc::Receiver<Result<(FrameHeader, Bytes)>>,
        state: Arc<SessionState>,
        peer: PeerSettings,
        local_conn_window: u32,
        local_stream_window: u32,
        header_priority: Option<PriorityData>,
        first_stream_id: u32,
    ) -> Self {
        Self {
            io,
            commands,
            frames,
            state,
            peer,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            streams: HashMap::new(),
            pending: VecDeque::new(),
            next_stream_id: first_stream_id,
            conn_send_window: DEFAULT_WINDOW_SIZE as i64,
            conn_recv_unacked: 0,
            local_conn_window,
            local_stream_window,
            header_priority,
            goaway: None,
            commands_closed: false,
            out: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Run until the peer closes, a fatal error occurs or every handle is
    /// gone, then fail whatever is still in flight.
    pub async fn run(mut self) {
        SettingsFrame::ack().serialize(&mut self.out);
        let reason = match self.flush().await {
            Ok(()) => self.event_loop().await,
            Err(e) => e,
        };
        self.shutdown(reason).await;
    }

    async fn event_loop(&mut self) -> Error {
        loop {
            if self.streams.is_empty() && self.pending.is_empty() {
                if let Some(goaway) = self.goaway {
                    return Error::SessionInvalidated(goaway);
                }
                if self.commands_closed {
                    return Error::SessionInvalidated(Invalidation::ConnUnusable);
                }
            }

            let step = tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(Command::Shutdown) => {
                        return Error::SessionInvalidated(Invalidation::ConnUnusable);
                    }
                    Some(command) => {
                        self.handle_command(command);
                        Ok(())
                    }
                    None => {
                        self.commands_closed = true;
                        Ok(())
                    }
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok((header, payload))) => self.handle_frame(header, payload),
                    Some(Err(e)) => Err(e),
                    None => Err(Error::SessionInvalidated(Invalidation::ConnClosed)),
                },
            };

            let result = match step {
                Ok(()) => self.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                return e;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request { .. } | Command::Connect { .. } => {
                if self.goaway.is_some() || !self.state.accepting.load(Ordering::Acquire) {
                    command.fail(Error::SessionInvalidated(Invalidation::ConnUnusable));
                } else if self.streams.len() >= self.peer.max_concurrent_streams as usize {
                    self.pending.push_back(command);
                } else {
                    self.open_stream(command);
                }
            }
            Command::Data {
                stream_id,
                data,
                end_stream,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.local_closed || stream.end_pending {
                        return;
                    }
                    if !data.is_empty() {
                        stream.outbound.push_back(data);
                    }
                    stream.end_pending = end_stream;
                    self.flush_stream(stream_id);
                    self.reap(stream_id);
                }
            }
            Command::Consumed { stream_id, len } => {
                let half_window = self.local_stream_window / 2;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if matches!(stream.kind, StreamKind::Tunnel { inbound: Some(_), .. }) {
                        stream.recv_unacked = stream.recv_unacked.saturating_add(len);
                        if stream.recv_unacked >= half_window {
                            WindowUpdateFrame::new(stream_id, stream.recv_unacked)
                                .serialize(&mut self.out);
                            stream.recv_unacked = 0;
                        }
                    }
                }
            }
            Command::Reset { stream_id } => {
                if self.streams.remove(&stream_id).is_some() {
                    RstStreamFrame::new(stream_id, ErrorCode::Cancel).serialize(&mut self.out);
                    self.open_pending();
                }
            }
            Command::Shutdown => {}
        }
    }

    fn open_stream(&mut self, command: Command) {
        if self.next_stream_id > MAX_STREAM_ID {
            self.state.accepting.store(false, Ordering::Release);
            command.fail(Error::SessionInvalidated(Invalidation::ConnUnusable));
            return;
        }
        let stream_id = self.next_stream_id;

        let (headers, body, kind) = match command {
            Command::Request {
                headers,
                body,
                respond,
            } => (
                headers,
                body.filter(|b| !b.is_empty()),
                StreamKind::Request {
                    respond: Some(respond),
                    status: None,
                    headers: Vec::new(),
                    body: BytesMut::new(),
                },
            ),
            Command::Connect {
                headers,
                inbound,
                credit,
                respond,
            } => (
                headers,
                None,
                StreamKind::Tunnel {
                    opened: Some(respond),
                    inbound: Some(inbound),
                    credit,
                },
            ),
            _ => return,
        };
        self.next_stream_id += 2;

        let is_tunnel = matches!(kind, StreamKind::Tunnel { .. });
        let end_stream = body.is_none() && !is_tunnel;
        let block = self
            .encoder
            .encode(headers.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        HeadersFrame::new(stream_id, Bytes::from(block))
            .end_stream(end_stream)
            .with_priority(self.header_priority)
            .serialize(&mut self.out, self.peer.max_frame_size);
        tracing::trace!(stream_id, end_stream, "HTTP/2: HEADERS sent");

        let mut stream = Stream::new(kind, self.peer.initial_window_size, end_stream);
        if let Some(body) = body {
            stream.outbound.push_back(body);
            stream.end_pending = true;
        }
        self.streams.insert(stream_id, stream);
        self.flush_stream(stream_id);
    }

    fn open_pending(&mut self) {
        while self.streams.len() < self.peer.max_concurrent_streams as usize {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            self.open_stream(command);
        }
    }

    /// Send as much queued DATA as both windows allow.
    fn flush_stream(&mut self, stream_id: u32) {
        let max_frame = self.peer.max_frame_size as usize;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        while let Some(front) = stream.outbound.front_mut() {
            let window = self.conn_send_window.min(stream.send_window);
            if window <= 0 {
                break;
            }
            let n = front.len().min(window as usize).min(max_frame);
            let chunk = front.split_to(n);
            if front.is_empty() {
                stream.outbound.pop_front();
            }
            let end = stream.outbound.is_empty() && stream.end_pending;
            DataFrame::new(stream_id, chunk, end).serialize(&mut self.out);
            self.conn_send_window -= n as i64;
            stream.send_window -= n as i64;
            if let StreamKind::Tunnel { credit, .. } = &stream.kind {
                credit.add_permits(n);
            }
            if end {
                stream.local_closed = true;
                stream.end_pending = false;
            }
        }
        if stream.outbound.is_empty() && stream.end_pending && !stream.local_closed {
            DataFrame::new(stream_id, Bytes::new(), true).serialize(&mut self.out);
            stream.local_closed = true;
            stream.end_pending = false;
        }
    }

    fn flush_all(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.flush_stream(id);
        }
    }

    /// Drop a tunnel stream once both directions are closed.
    fn reap(&mut self, stream_id: u32) {
        let done = self.streams.get(&stream_id).is_some_and(|s| {
            s.local_closed
                && matches!(
                    s.kind,
                    StreamKind::Tunnel {
                        opened: None,
                        inbound: None,
                        ..
                    }
                )
        });
        if done {
            self.streams.remove(&stream_id);
            self.open_pending();
        }
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        match header.frame_type {
            FrameType::Data => self.on_data(header, payload),
            FrameType::Headers => self.on_headers(header, payload),
            FrameType::Settings => {
                let frame = SettingsFrame::parse(&header, payload)?;
                if frame.ack {
                    return Ok(());
                }
                let delta = self.peer.apply(&frame.settings)?;
                for stream in self.streams.values_mut() {
                    stream.send_window += delta;
                }
                SettingsFrame::ack().serialize(&mut self.out);
                self.flush_all();
                self.open_pending();
                Ok(())
            }
            FrameType::WindowUpdate => {
                let frame = WindowUpdateFrame::parse(&header, payload)?;
                if frame.stream_id == 0 {
                    self.conn_send_window += frame.increment as i64;
                    if self.conn_send_window > MAX_WINDOW_SIZE as i64 {
                        return Err(Error::http_protocol("connection send window overflow"));
                    }
                } else if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
                    stream.send_window += frame.increment as i64;
                }
                self.flush_all();
                Ok(())
            }
            FrameType::Ping => {
                let frame = PingFrame::parse(&header, payload)?;
                if !frame.ack {
                    PingFrame {
                        ack: true,
                        data: frame.data,
                    }
                    .serialize(&mut self.out);
                }
                Ok(())
            }
            FrameType::GoAway => {
                let frame = GoAwayFrame::parse(payload)?;
                self.on_goaway(frame.last_stream_id, frame.error_code);
                Ok(())
            }
            FrameType::RstStream => {
                let frame = RstStreamFrame::parse(&header, payload)?;
                if let Some(stream) = self.streams.remove(&frame.stream_id) {
                    tracing::debug!(
                        stream_id = frame.stream_id,
                        code = frame.error_code,
                        "HTTP/2: stream reset by peer"
                    );
                    stream.fail(Error::http_protocol(format!(
                        "stream {} reset by peer (code {:#x})",
                        frame.stream_id, frame.error_code
                    )));
                    self.open_pending();
                }
                Ok(())
            }
            FrameType::PushPromise => {
                if payload.len() < 4 {
                    return Err(Error::http_protocol("PUSH_PROMISE truncated"));
                }
                let promised = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff;
                // decoded only to keep the HPACK table in sync
                self.decoder
                    .decode(&payload[4..])
                    .map_err(|e| Error::http_protocol(format!("HPACK decode failed: {:?}", e)))?;
                RstStreamFrame::new(promised, ErrorCode::RefusedStream).serialize(&mut self.out);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_data(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let flow_len = payload.len() as u32;
        let frame = DataFrame::parse(&header, payload)?;

        self.conn_recv_unacked += flow_len;
        if self.conn_recv_unacked >= self.local_conn_window / 2 {
            WindowUpdateFrame::new(0, self.conn_recv_unacked).serialize(&mut self.out);
            self.conn_recv_unacked = 0;
        }

        let Some(stream) = self.streams.get_mut(&frame.stream_id) else {
            return Ok(());
        };
        // tunnel payload reopens the window once read, padding right away
        let unacked = match stream.kind {
            StreamKind::Tunnel { .. } => flow_len - frame.data.len() as u32,
            StreamKind::Request { .. } => flow_len,
        };
        if !frame.end_stream && unacked > 0 {
            stream.recv_unacked += unacked;
            if stream.recv_unacked >= self.local_stream_window / 2 {
                WindowUpdateFrame::new(frame.stream_id, stream.recv_unacked).serialize(&mut self.out);
                stream.recv_unacked = 0;
            }
        }
        match &mut stream.kind {
            StreamKind::Request { body, .. } => body.extend_from_slice(&frame.data),
            StreamKind::Tunnel {
                inbound: Some(tx), ..
            } => {
                if !frame.data.is_empty() {
                    let _ = tx.send(Ok(frame.data));
                }
            }
            StreamKind::Tunnel { .. } => {}
        }
        if frame.end_stream {
            self.remote_end(frame.stream_id);
        }
        Ok(())
    }

    fn on_headers(&mut self, header: FrameHeader, block: Bytes) -> Result<()> {
        let fields = self
            .decoder
            .decode(&block)
            .map_err(|e| Error::http_protocol(format!("HPACK decode failed: {:?}", e)))?;
        let stream_id = header.stream_id;
        let end_stream = header.has_flag(flags::END_STREAM);

        let mut status = None;
        let mut regular = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            if name.as_slice() == b":status" {
                status = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok());
            } else if !name.starts_with(b":") {
                regular.push((
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            }
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let informational = status.is_some_and(|s| (100..200).contains(&s)) && !end_stream;

        match &mut stream.kind {
            StreamKind::Request {
                status: current,
                headers,
                ..
            } => {
                if informational {
                    return Ok(());
                }
                if current.is_none() {
                    *current = status;
                }
                headers.extend(regular);
            }
            StreamKind::Tunnel { opened, .. } => {
                if informational || opened.is_none() {
                    return Ok(());
                }
                if status == Some(200) && !end_stream {
                    if let Some(tx) = opened.take() {
                        let _ = tx.send(Ok(stream_id));
                    }
                    tracing::debug!(stream_id, "HTTP/2: CONNECT tunnel established");
                } else {
                    let status_line = match status {
                        Some(code) => format!("HTTP/2 {}", code),
                        None => "HTTP/2 response without :status".to_string(),
                    };
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        stream.fail(ProxyError::ProxyTunnelFailed { status_line }.into());
                    }
                    if !end_stream {
                        RstStreamFrame::new(stream_id, ErrorCode::Cancel).serialize(&mut self.out);
                    }
                    self.open_pending();
                    return Ok(());
                }
            }
        }
        if end_stream {
            self.remote_end(stream_id);
        }
        Ok(())
    }

    fn remote_end(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match &mut stream.kind {
            StreamKind::Request {
                respond,
                status,
                headers,
                body,
            } => {
                let result = match status {
                    Some(status) => Ok(TransportResponse::new(
                        *status,
                        std::mem::take(headers),
                        HttpVersion::Http2,
                        std::mem::take(body).freeze(),
                    )),
                    None => Err(Error::http_protocol("response without :status")),
                };
                if let Some(tx) = respond.take() {
                    let _ = tx.send(result);
                }
                if !stream.local_closed {
                    RstStreamFrame::new(stream_id, ErrorCode::NoError).serialize(&mut self.out);
                }
                self.streams.remove(&stream_id);
                self.open_pending();
            }
            StreamKind::Tunnel { inbound, .. } => {
                inbound.take();
                self.reap(stream_id);
            }
        }
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: u32) {
        let reason = Invalidation::GoAway {
            last_stream_id,
            code,
        };
        tracing::debug!(last_stream_id, code, "HTTP/2: GOAWAY received");
        self.goaway = Some(reason);
        self.state.accepting.store(false, Ordering::Release);

        let refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for id in refused {
            if let Some(stream) = self.streams.remove(&id) {
                stream.fail(Error::SessionInvalidated(reason));
            }
        }
        for command in self.pending.drain(..) {
            command.fail(Error::SessionInvalidated(reason));
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let result = match self.io.write_all(&self.out).await {
            Ok(()) => self.io.flush().await,
            Err(e) => Err(e),
        };
        self.out.clear();
        result.map_err(|_| Error::SessionInvalidated(Invalidation::ConnClosed))
    }

    async fn shutdown(mut self, reason: Error) {
        self.state.accepting.store(false, Ordering::Release);
        match &reason {
            Error::SessionInvalidated(_) => {
                tracing::debug!(reason = %reason, streams = self.streams.len(), "HTTP/2: session ended")
            }
            other => tracing::warn!(error = %other, "HTTP/2: session failed"),
        }

        for (_, stream) in self.streams.drain() {
            stream.fail(replicate(&reason));
        }
        for command in self.pending.drain(..) {
            command.fail(replicate(&reason));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.fail(replicate(&reason));
        }

        if !matches!(reason, Error::SessionInvalidated(Invalidation::ConnClosed)) {
            GoAwayFrame::new(0, ErrorCode::NoError).serialize(&mut self.out);
            let _ = self.flush().await;
        }
        let _ = self.io.shutdown().await;
    }
}
