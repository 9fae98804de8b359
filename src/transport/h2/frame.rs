//! HTTP/2 frame types and binary serialization.
//!
//! Implements the RFC 9113 frame format. Every frame serializes into a caller
//! supplied buffer so the connection preface, SETTINGS, WINDOW_UPDATE and
//! PRIORITY frames can leave in a single write.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::fingerprint::http2::PriorityData;

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Initial flow-control window for connections and streams.
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;

/// Largest legal window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Stream ids are 31 bits.
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1; // SETTINGS / PING
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS identifiers the connection acts on.
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header. The reserved stream-id bit is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn put_header(buf: &mut BytesMut, length: usize, frame_type: FrameType, flags: u8, stream_id: u32) {
    FrameHeader {
        length: length as u32,
        frame_type,
        flags,
        stream_id,
    }
    .serialize(buf);
}

fn put_priority(buf: &mut BytesMut, priority: &PriorityData) {
    let dependency = if priority.exclusive {
        priority.stream_dependency | 0x8000_0000
    } else {
        priority.stream_dependency
    };
    buf.put_u32(dependency);
    buf.put_u8(priority.weight);
}

/// SETTINGS frame. Order of `settings` is wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    pub settings: Vec<(u16, u32)>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new(settings: Vec<(u16, u32)>) -> Self {
        Self {
            settings,
            ack: false,
        }
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            ack: true,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        if self.ack {
            put_header(buf, 0, FrameType::Settings, flags::ACK, 0);
            return;
        }
        put_header(buf, self.settings.len() * 6, FrameType::Settings, 0, 0);
        for (id, value) in &self.settings {
            buf.put_u16(*id);
            buf.put_u32(*value);
        }
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        if header.stream_id != 0 {
            return Err(Error::http_protocol("SETTINGS on a non-zero stream"));
        }
        let ack = header.has_flag(flags::ACK);
        if ack && !payload.is_empty() {
            return Err(Error::http_protocol("SETTINGS ACK with a payload"));
        }
        if payload.len() % 6 != 0 {
            return Err(Error::http_protocol("SETTINGS length is not a multiple of 6"));
        }
        let mut settings = Vec::with_capacity(payload.len() / 6);
        while payload.remaining() >= 6 {
            settings.push((payload.get_u16(), payload.get_u32()));
        }
        Ok(Self { settings, ack })
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        put_header(buf, 4, FrameType::WindowUpdate, 0, self.stream_id);
        buf.put_u32(self.increment & MAX_WINDOW_SIZE);
    }

    /// A zero increment is a FLOW_CONTROL_ERROR (RFC 9113 Section 6.9).
    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(Error::http_protocol("WINDOW_UPDATE length must be 4"));
        }
        let increment = payload.get_u32() & MAX_WINDOW_SIZE;
        if increment == 0 {
            return Err(Error::http_protocol("WINDOW_UPDATE with zero increment"));
        }
        Ok(Self::new(header.stream_id, increment))
    }
}

/// PRIORITY frame, sent during the preface by browsers that build a
/// dependency tree up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PriorityData,
}

impl PriorityFrame {
    pub fn serialize(&self, buf: &mut BytesMut) {
        put_header(buf, 5, FrameType::Priority, 0, self.stream_id);
        put_priority(buf, &self.priority);
    }
}

/// HEADERS frame. Serialization splits the block into CONTINUATION frames
/// when it exceeds the peer's maximum frame size.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub priority: Option<PriorityData>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            priority: None,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn with_priority(mut self, priority: Option<PriorityData>) -> Self {
        self.priority = priority;
        self
    }

    pub fn serialize(&self, buf: &mut BytesMut, max_frame_size: u32) {
        let max = max_frame_size.max(DEFAULT_MAX_FRAME_SIZE) as usize;
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let first_len = self.header_block.len().min(max - priority_len);
        let (first, mut rest) = self.header_block.split_at(first_len);

        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if rest.is_empty() {
            frame_flags |= flags::END_HEADERS;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }
        put_header(
            buf,
            priority_len + first.len(),
            FrameType::Headers,
            frame_flags,
            self.stream_id,
        );
        if let Some(priority) = &self.priority {
            put_priority(buf, priority);
        }
        buf.extend_from_slice(first);

        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(max));
            let end = if tail.is_empty() { flags::END_HEADERS } else { 0 };
            put_header(buf, chunk.len(), FrameType::Continuation, end, self.stream_id);
            buf.extend_from_slice(chunk);
            rest = tail;
        }
    }

    /// Header block fragment of an inbound HEADERS frame, padding and
    /// priority fields removed.
    pub fn fragment(header: &FrameHeader, mut payload: Bytes) -> Result<Bytes> {
        if header.stream_id == 0 {
            return Err(Error::http_protocol("HEADERS on stream 0"));
        }
        let pad_len = take_pad_length(header, &mut payload)?;
        if header.has_flag(flags::PRIORITY) {
            if payload.len() < 5 + pad_len {
                return Err(Error::http_protocol("HEADERS priority fields truncated"));
            }
            payload.advance(5);
        }
        payload.truncate(payload.len() - pad_len);
        Ok(payload)
    }
}

/// Padding length of a PADDED frame, with the length byte consumed.
fn take_pad_length(header: &FrameHeader, payload: &mut Bytes) -> Result<usize> {
    if !header.has_flag(flags::PADDED) {
        return Ok(0);
    }
    if payload.is_empty() {
        return Err(Error::http_protocol("PADDED frame missing padding length"));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::http_protocol("padding exceeds payload size"));
    }
    Ok(pad_len)
}

/// DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            data,
            end_stream,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        let frame_flags = if self.end_stream { flags::END_STREAM } else { 0 };
        put_header(buf, self.data.len(), FrameType::Data, frame_flags, self.stream_id);
        buf.extend_from_slice(&self.data);
    }

    /// Strips padding. Flow control is charged the full frame length by the
    /// caller, padding included.
    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        if header.stream_id == 0 {
            return Err(Error::http_protocol("DATA on stream 0"));
        }
        let pad_len = take_pad_length(header, &mut payload)?;
        payload.truncate(payload.len() - pad_len);
        Ok(Self::new(
            header.stream_id,
            payload,
            header.has_flag(flags::END_STREAM),
        ))
    }
}

/// PING frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn serialize(&self, buf: &mut BytesMut) {
        let frame_flags = if self.ack { flags::ACK } else { 0 };
        put_header(buf, 8, FrameType::Ping, frame_flags, 0);
        buf.extend_from_slice(&self.data);
    }

    pub fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        let data: [u8; 8] = payload
            .as_ref()
            .try_into()
            .map_err(|_| Error::http_protocol("PING length must be 8"))?;
        Ok(Self {
            ack: header.has_flag(flags::ACK),
            data,
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: u32,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code: error_code as u32,
            debug_data: Bytes::new(),
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        put_header(buf, 8 + self.debug_data.len(), FrameType::GoAway, 0, 0);
        buf.put_u32(self.last_stream_id & 0x7fff_ffff);
        buf.put_u32(self.error_code);
        buf.extend_from_slice(&self.debug_data);
    }

    pub fn parse(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::http_protocol("GOAWAY shorter than 8 bytes"));
        }
        let last_stream_id = payload.get_u32() & 0x7fff_ffff;
        let error_code = payload.get_u32();
        Ok(Self {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: u32,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code: error_code as u32,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        put_header(buf, 4, FrameType::RstStream, 0, self.stream_id);
        buf.put_u32(self.error_code);
    }

    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(Error::http_protocol("RST_STREAM length must be 4"));
        }
        Ok(Self {
            stream_id: header.stream_id,
            error_code: payload.get_u32(),
        })
    }
}
