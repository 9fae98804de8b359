//! QUIC handshake and HTTP/3 session setup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use boring::x509::X509;
use getrandom::fill as getrandom_fill;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pin::PinStore;
use crate::proxy::authority;
use crate::timeouts::deadline;

use super::driver::{Driver, SessionState};
use super::handle::H3Handle;
use super::path::DatagramPath;
use super::{QuicConfig, MAX_DATAGRAM_SIZE};

pub struct H3Connection;

impl H3Connection {
    /// Run the QUIC handshake with `host:port` over `path`, verify pins, and
    /// spawn the driver.
    pub async fn connect(
        host: &str,
        port: u16,
        mut config: QuicConfig,
        path: DatagramPath,
        pins: &PinStore,
        handshake_timeout: Duration,
    ) -> Result<H3Handle> {
        let peer = path.peer();
        let local = path.local_addr()?;

        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        getrandom_fill(&mut scid).map_err(|e| Error::quic(format!("RNG error: {}", e)))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let mut conn = quiche::connect(Some(host), &scid, local, peer, &mut config.quic)
            .map_err(|e| Error::quic(format!("failed to create QUIC connection: {}", e)))?;

        let started = Instant::now();
        let handshake = deadline("handshake", handshake_timeout, async {
            drive_handshake(&mut conn, &path).await
        })
        .await;
        if let Err(e) = handshake {
            path.close();
            return Err(e);
        }

        let host_port = authority(host, port);
        if let Err(e) = check_pins(&conn, pins, &host_port) {
            let _ = conn.close(true, 0x0, b"pin mismatch");
            let mut out = [0u8; MAX_DATAGRAM_SIZE];
            if let Ok((len, _)) = conn.send(&mut out) {
                let _ = path.send(&out[..len]).await;
            }
            path.close();
            return Err(e);
        }

        let h3 = quiche::h3::Connection::with_transport(&mut conn, &config.h3)
            .map_err(|e| Error::quic(format!("failed to start HTTP/3: {}", e)))?;
        tracing::debug!(
            host = %host_port,
            peer = %peer,
            elapsed = ?started.elapsed(),
            "H3: QUIC handshake complete"
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState::new());
        let driver = Driver::new(command_rx, conn, h3, path, state.clone(), host_port);
        tokio::spawn(driver.run());

        Ok(H3Handle::new(commands, state, config.pseudo_order))
    }
}

async fn drive_handshake(conn: &mut quiche::Connection, path: &DatagramPath) -> Result<()> {
    let mut buf = vec![0u8; 65535];
    let mut out = vec![0u8; MAX_DATAGRAM_SIZE];
    let local = path.local_addr()?;

    loop {
        loop {
            match conn.send(&mut out) {
                Ok((len, _)) => path.send(&out[..len]).await?,
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(Error::handshake(format!("QUIC send failed: {}", e))),
            }
        }

        if conn.is_established() {
            return Ok(());
        }
        if conn.is_closed() {
            return Err(Error::handshake(format!(
                "QUIC connection closed during handshake: {:?}",
                conn.peer_error().or(conn.local_error())
            )));
        }

        let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
        match tokio::time::timeout(wait, path.recv(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let info = quiche::RecvInfo { from, to: local };
                match conn.recv(&mut buf[..len], info) {
                    Ok(_) | Err(quiche::Error::Done) => {}
                    Err(e) => tracing::trace!(error = %e, "H3: dropped handshake packet"),
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => conn.on_timeout(),
        }
    }
}

fn check_pins(conn: &quiche::Connection, pins: &PinStore, host_port: &str) -> Result<()> {
    if pins.pins(host_port).map_or(true, |set| set.is_empty()) {
        return Ok(());
    }
    let chain: Vec<X509> = conn
        .peer_cert_chain()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|der| X509::from_der(der).ok())
        .collect();
    pins.check(chain.iter().map(|cert| &**cert), host_port)
}
