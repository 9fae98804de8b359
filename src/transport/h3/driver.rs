//! HTTP/3 connection driver - background task that owns the QUIC connection
//! and routes packets to streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quiche::h3::NameValue;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Invalidation, Result};
use crate::response::TransportResponse;
use crate::version::HttpVersion;

use super::path::DatagramPath;
use super::MAX_DATAGRAM_SIZE;

pub(crate) struct SessionState {
    pub accepting: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
        }
    }
}

pub(crate) enum Command {
    Request {
        headers: Vec<quiche::h3::Header>,
        body: Option<Bytes>,
        respond: oneshot::Sender<Result<TransportResponse>>,
    },
    Shutdown,
}

struct StreamState {
    respond: oneshot::Sender<Result<TransportResponse>>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: BytesMut,
    /// Request body bytes quiche has not accepted yet.
    outbound: Bytes,
}

pub(crate) struct Driver {
    commands: mpsc::UnboundedReceiver<Command>,
    conn: quiche::Connection,
    h3: quiche::h3::Connection,
    path: DatagramPath,
    state: Arc<SessionState>,
    host: String,
    streams: HashMap<u64, StreamState>,
}

impl Driver {
    pub fn new(
        commands: mpsc::UnboundedReceiver<Command>,
        conn: quiche::Connection,
        h3: quiche::h3::Connection,
        path: DatagramPath,
        state: Arc<SessionState>,
        host: String,
    ) -> Self {
        Self {
            commands,
            conn,
            h3,
            path,
            state,
            host,
            streams: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let reason = self.event_loop().await;
        self.shutdown(reason).await;
    }

    /// Returns why the session ended.
    async fn event_loop(&mut self) -> Error {
        let mut buf = vec![0u8; 65535];
        let local = match self.path.local_addr() {
            Ok(addr) => addr,
            Err(e) => return e,
        };

        loop {
            self.flush_bodies();
            if let Err(e) = self.flush_egress().await {
                return e;
            }
            if self.conn.is_closed() {
                tracing::debug!(host = %self.host, error = ?self.conn.peer_error(), "H3: connection closed");
                return Error::SessionInvalidated(Invalidation::ConnClosed);
            }
            if !self.state.accepting.load(Ordering::Acquire) && self.streams.is_empty() {
                return Error::SessionInvalidated(Invalidation::ConnUnusable);
            }

            let wait = self.conn.timeout().unwrap_or(Duration::from_secs(60));
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request { headers, body, respond }) => {
                        self.start_request(headers, body, respond);
                    }
                    Some(Command::Shutdown) | None => {
                        self.state.accepting.store(false, Ordering::Release);
                        return Error::SessionInvalidated(Invalidation::ConnUnusable);
                    }
                },
                received = self.path.recv(&mut buf) => match received {
                    Ok((len, from)) => {
                        let info = quiche::RecvInfo { from, to: local };
                        match self.conn.recv(&mut buf[..len], info) {
                            Ok(_) | Err(quiche::Error::Done) => {}
                            Err(e) => tracing::trace!(host = %self.host, error = %e, "H3: dropped packet"),
                        }
                        if let Err(e) = self.process_events() {
                            return e;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(host = %self.host, error = %e, "H3: datagram path failed");
                        return Error::SessionInvalidated(Invalidation::ConnClosed);
                    }
                },
                _ = tokio::time::sleep(wait) => self.conn.on_timeout(),
            }
        }
    }

    fn start_request(
        &mut self,
        headers: Vec<quiche::h3::Header>,
        body: Option<Bytes>,
        respond: oneshot::Sender<Result<TransportResponse>>,
    ) {
        if !self.state.accepting.load(Ordering::Acquire) {
            let _ = respond.send(Err(Error::SessionInvalidated(Invalidation::ConnUnusable)));
            return;
        }
        let body = body.filter(|b| !b.is_empty());
        match self.h3.send_request(&mut self.conn, &headers, body.is_none()) {
            Ok(stream_id) => {
                tracing::trace!(host = %self.host, stream_id, "H3: request sent");
                self.streams.insert(
                    stream_id,
                    StreamState {
                        respond,
                        status: None,
                        headers: Vec::new(),
                        body: BytesMut::new(),
                        outbound: body.unwrap_or_default(),
                    },
                );
            }
            Err(quiche::h3::Error::StreamBlocked)
            | Err(quiche::h3::Error::TransportError(quiche::Error::StreamLimit)) => {
                let _ = respond.send(Err(Error::SessionInvalidated(Invalidation::ConnUnusable)));
            }
            Err(e) => {
                let _ = respond.send(Err(Error::quic(format!("failed to send request: {}", e))));
            }
        }
    }

    /// Push pending request bodies as far as flow control allows.
    fn flush_bodies(&mut self) {
        let mut failed = Vec::new();
        for (&stream_id, stream) in self.streams.iter_mut() {
            if stream.outbound.is_empty() {
                continue;
            }
            match self
                .h3
                .send_body(&mut self.conn, stream_id, &stream.outbound, true)
            {
                Ok(written) => {
                    let _ = stream.outbound.split_to(written);
                }
                Err(quiche::h3::Error::Done) => {}
                Err(e) => failed.push((stream_id, e)),
            }
        }
        for (stream_id, e) in failed {
            if let Some(stream) = self.streams.remove(&stream_id) {
                let _ = stream
                    .respond
                    .send(Err(Error::quic(format!("failed to send body: {}", e))));
            }
        }
    }

    async fn flush_egress(&mut self) -> Result<()> {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.conn.send(&mut out) {
                Ok((len, _)) => {
                    if let Err(e) = self.path.send(&out[..len]).await {
                        tracing::debug!(host = %self.host, error = %e, "H3: send failed");
                        return Err(Error::SessionInvalidated(Invalidation::ConnClosed));
                    }
                }
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => return Err(Error::quic(format!("QUIC send failed: {}", e))),
            }
        }
    }

    fn process_events(&mut self) -> Result<()> {
        loop {
            match self.h3.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        for header in list {
                            let name = String::from_utf8_lossy(header.name()).into_owned();
                            let value = String::from_utf8_lossy(header.value()).into_owned();
                            if name == ":status" {
                                // Informational responses are followed by the real one
                                let status = value.parse().ok();
                                if stream.status.map_or(true, |s| (100..200).contains(&s)) {
                                    stream.status = status;
                                    stream.headers.clear();
                                }
                            } else if !name.starts_with(':') {
                                stream.headers.push((name, value));
                            }
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Data)) => {
                    let mut chunk = vec![0u8; 65535];
                    loop {
                        match self.h3.recv_body(&mut self.conn, stream_id, &mut chunk) {
                            Ok(len) => {
                                if let Some(stream) = self.streams.get_mut(&stream_id) {
                                    stream.body.extend_from_slice(&chunk[..len]);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        let result = match stream.status {
                            Some(status) => Ok(TransportResponse::new(
                                status,
                                stream.headers,
                                HttpVersion::Http3,
                                stream.body.freeze(),
                            )),
                            None => Err(Error::http_protocol("HTTP/3 response without :status")),
                        };
                        let _ = stream.respond.send(result);
                    }
                }
                Ok((stream_id, quiche::h3::Event::Reset(code))) => {
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        let _ = stream.respond.send(Err(Error::http_protocol(format!(
                            "stream {} reset by peer (code {:#x})",
                            stream_id, code
                        ))));
                    }
                }
                Ok((last_id, quiche::h3::Event::GoAway)) => {
                    tracing::debug!(host = %self.host, last_id, "H3: GOAWAY received");
                    self.state.accepting.store(false, Ordering::Release);
                    let refused: Vec<u64> = self
                        .streams
                        .keys()
                        .copied()
                        .filter(|id| *id >= last_id)
                        .collect();
                    for id in refused {
                        if let Some(stream) = self.streams.remove(&id) {
                            let _ = stream.respond.send(Err(Error::SessionInvalidated(
                                Invalidation::GoAway {
                                    last_stream_id: u32::try_from(last_id).unwrap_or(u32::MAX),
                                    code: 0,
                                },
                            )));
                        }
                    }
                }
                Ok((_, quiche::h3::Event::PriorityUpdate)) => {}
                Err(quiche::h3::Error::Done) => return Ok(()),
                Err(e) => {
                    tracing::warn!(host = %self.host, error = %e, "H3: connection error");
                    return Err(Error::quic(format!("HTTP/3 error: {}", e)));
                }
            }
        }
    }

    async fn shutdown(mut self, reason: Error) {
        self.state.accepting.store(false, Ordering::Release);
        let invalidation = match &reason {
            Error::SessionInvalidated(kind) => *kind,
            _ => Invalidation::ConnClosed,
        };
        for (_, stream) in self.streams.drain() {
            let _ = stream
                .respond
                .send(Err(Error::SessionInvalidated(invalidation)));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Request { respond, .. } = command {
                let _ = respond.send(Err(Error::SessionInvalidated(Invalidation::ConnUnusable)));
            }
        }

        if !self.conn.is_closed() {
            let _ = self.conn.close(true, 0x100, b"");
            let _ = self.flush_egress().await;
        }
        self.path.close();
        tracing::debug!(host = %self.host, reason = %reason, "H3: driver stopped");
    }
}
