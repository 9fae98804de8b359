//! HTTP/3 transport via quiche.
//!
//! quiche is sans-IO: [`H3Connection::connect`] drives the QUIC handshake over
//! a [`DatagramPath`] (a plain UDP socket or a SOCKS5 UDP relay), then hands
//! the connection to a driver task. [`H3Handle`] clones share that driver, so
//! requests multiplex over one QUIC connection.
//!
//! The QUIC ClientHello comes from the browser's TLS 1.3 preset and the
//! SETTINGS frame from its [`Http3Fingerprint`].

mod connection;
mod driver;
mod handle;
mod path;

pub use connection::H3Connection;
pub use handle::H3Handle;
pub use path::DatagramPath;

use crate::error::{Error, Result};
use crate::fingerprint::http3::{
    SETTINGS_ENABLE_CONNECT_PROTOCOL, SETTINGS_MAX_FIELD_SECTION_SIZE,
    SETTINGS_QPACK_BLOCKED_STREAMS, SETTINGS_QPACK_MAX_TABLE_CAPACITY,
};
use crate::fingerprint::{ClientHelloSpec, Http3Fingerprint, PseudoHeaderOrder};
use crate::transport::connector::TlsConnector;

/// Maximum datagram size for QUIC.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds.
const QUIC_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Chrome's connection-level flow control window.
const INITIAL_MAX_DATA: u64 = 15_663_105;

const INITIAL_MAX_STREAM_DATA: u64 = 6_291_456;

/// Everything one QUIC connection is configured with.
pub struct QuicConfig {
    pub quic: quiche::Config,
    pub h3: quiche::h3::Config,
    pub pseudo_order: PseudoHeaderOrder,
}

impl QuicConfig {
    /// Transport and HTTP/3 config from a QUIC ClientHello and an HTTP/3
    /// fingerprint. quiche configs are single-use, so build one per dial.
    pub fn new(
        tls: &TlsConnector,
        hello: &ClientHelloSpec,
        fingerprint: &Http3Fingerprint,
    ) -> Result<Self> {
        let ssl = tls.quic_context(hello)?;
        let mut quic =
            quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ssl)
                .map_err(|e| Error::quic(format!("failed to create QUIC config: {}", e)))?;

        quic.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
            .map_err(|e| Error::quic(format!("failed to set ALPN: {}", e)))?;
        quic.verify_peer(tls.verifies_peers());
        quic.grease(fingerprint.has_grease() || hello.uses_grease());
        quic.set_max_idle_timeout(QUIC_IDLE_TIMEOUT_MS);
        quic.set_max_recv_udp_payload_size(65535);
        quic.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        quic.set_initial_max_data(INITIAL_MAX_DATA);
        quic.set_initial_max_stream_data_bidi_local(INITIAL_MAX_STREAM_DATA);
        quic.set_initial_max_stream_data_bidi_remote(INITIAL_MAX_STREAM_DATA);
        quic.set_initial_max_stream_data_uni(INITIAL_MAX_STREAM_DATA);
        quic.set_initial_max_streams_bidi(100);
        quic.set_initial_max_streams_uni(103);
        quic.set_disable_active_migration(true);

        Ok(Self {
            quic,
            h3: h3_config(fingerprint)?,
            pseudo_order: fingerprint.pseudo_header_order,
        })
    }
}

/// HTTP/3 SETTINGS from a fingerprint.
pub fn h3_config(fingerprint: &Http3Fingerprint) -> Result<quiche::h3::Config> {
    let mut config = quiche::h3::Config::new()
        .map_err(|e| Error::quic(format!("failed to create HTTP/3 config: {}", e)))?;
    if let Some(capacity) = fingerprint.setting(SETTINGS_QPACK_MAX_TABLE_CAPACITY) {
        config.set_qpack_max_table_capacity(capacity);
    }
    if let Some(blocked) = fingerprint.setting(SETTINGS_QPACK_BLOCKED_STREAMS) {
        config.set_qpack_blocked_streams(blocked);
    }
    if let Some(size) = fingerprint.setting(SETTINGS_MAX_FIELD_SECTION_SIZE) {
        config.set_max_field_section_size(size);
    }
    if fingerprint.setting(SETTINGS_ENABLE_CONNECT_PROTOCOL) == Some(1) {
        config.enable_extended_connect(true);
    }
    let extra = fingerprint.additional_settings();
    if !extra.is_empty() {
        config
            .set_additional_settings(extra)
            .map_err(|e| Error::quic(format!("invalid HTTP/3 settings: {}", e)))?;
    }
    Ok(config)
}
