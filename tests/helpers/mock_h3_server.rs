use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quiche::h3::NameValue;
use tokio::net::UdpSocket;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Connection and request counters of a [`MockH3Server`].
#[derive(Debug, Default)]
pub struct H3Stats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
    pub goaways: AtomicUsize,
}

impl H3Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn goaways(&self) -> usize {
        self.goaways.load(Ordering::SeqCst)
    }
}

/// A mock HTTP/3 server for testing.
///
/// Every request is answered with `200` and a body of `"METHOD PATH"`.
/// With [`MockH3Server::goaway_first_connection`] the first QUIC connection
/// answers its first request with a GOAWAY that refuses it instead.
pub struct MockH3Server {
    socket: UdpSocket,
    port: u16,
    cert_path: PathBuf,
    key_path: PathBuf,
    goaway_first: bool,
    stats: Arc<H3Stats>,
}

struct Client {
    conn: quiche::Connection,
    h3: Option<quiche::h3::Connection>,
    /// Order in which the connection was accepted, from 0.
    ordinal: usize,
    requests: HashMap<u64, (String, String)>,
}

impl MockH3Server {
    pub async fn new() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let port = socket.local_addr()?.port();

        let cert = rcgen::generate_simple_self_signed(vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
        ])
        .expect("Failed to generate cert");
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("veil_h3_{}_{}.crt", std::process::id(), port));
        let key_path = dir.join(format!("veil_h3_{}_{}.key", std::process::id(), port));
        std::fs::write(&cert_path, cert.cert.pem())?;
        std::fs::write(&key_path, cert.signing_key.serialize_pem())?;

        Ok(Self {
            socket,
            port,
            cert_path,
            key_path,
            goaway_first: false,
            stats: Arc::new(H3Stats::default()),
        })
    }

    pub fn goaway_first_connection(mut self) -> Self {
        self.goaway_first = true;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn stats(&self) -> Arc<H3Stats> {
        self.stats.clone()
    }

    fn config(&self) -> quiche::Config {
        let mut config =
            quiche::Config::new(quiche::PROTOCOL_VERSION).expect("Failed to create QUIC config");
        config
            .load_cert_chain_from_pem_file(self.cert_path.to_str().expect("cert path"))
            .expect("Failed to load cert");
        config
            .load_priv_key_from_pem_file(self.key_path.to_str().expect("key path"))
            .expect("Failed to load key");
        config
            .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
            .expect("Failed to set ALPN");
        config.set_max_idle_timeout(5_000);
        config.set_max_recv_udp_payload_size(65535);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_stream_data_uni(1_000_000);
        config.set_initial_max_streams_bidi(100);
        config.set_initial_max_streams_uni(100);
        config.set_disable_active_migration(true);
        config
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut config = self.config();
        let h3_config = quiche::h3::Config::new().expect("Failed to create HTTP/3 config");
        let local = self.socket.local_addr().expect("local addr");

        let mut clients: Vec<Client> = Vec::new();
        // client-chosen initial DCID and our SCID both route to the client
        let mut ids: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut buf = vec![0u8; 65535];
        let mut out = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let wait = clients
                .iter()
                .filter_map(|c| c.conn.timeout())
                .min()
                .unwrap_or(Duration::from_millis(100));

            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => Some(received),
                _ = tokio::time::sleep(wait) => None,
            };

            match received {
                Some(Ok((len, peer))) => {
                    let header =
                        match quiche::Header::from_slice(&mut buf[..len], quiche::MAX_CONN_ID_LEN) {
                            Ok(header) => header,
                            Err(_) => continue,
                        };
                    let index = match ids.get(&header.dcid[..]) {
                        Some(&index) => index,
                        None => {
                            if header.ty != quiche::Type::Initial
                                || !quiche::version_is_supported(header.version)
                            {
                                continue;
                            }
                            let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
                            rand::Rng::fill(&mut rand::thread_rng(), &mut scid[..]);
                            let scid = quiche::ConnectionId::from_vec(scid.to_vec());
                            let conn = match quiche::accept(&scid, None, local, peer, &mut config) {
                                Ok(conn) => conn,
                                Err(e) => {
                                    tracing::debug!("MockH3Server: accept failed: {}", e);
                                    continue;
                                }
                            };
                            let ordinal = self.stats.connections.fetch_add(1, Ordering::SeqCst);
                            clients.push(Client {
                                conn,
                                h3: None,
                                ordinal,
                                requests: HashMap::new(),
                            });
                            let index = clients.len() - 1;
                            ids.insert(header.dcid.to_vec(), index);
                            ids.insert(scid.to_vec(), index);
                            index
                        }
                    };

                    let client = &mut clients[index];
                    let info = quiche::RecvInfo { from: peer, to: local };
                    if client.conn.recv(&mut buf[..len], info).is_err() {
                        continue;
                    }
                    if client.conn.is_established() && client.h3.is_none() {
                        match quiche::h3::Connection::with_transport(&mut client.conn, &h3_config) {
                            Ok(h3) => client.h3 = Some(h3),
                            Err(e) => tracing::debug!("MockH3Server: h3 setup failed: {}", e),
                        }
                    }
                    self.serve(client);
                }
                Some(Err(e)) => {
                    tracing::error!("MockH3Server: UDP recv error: {}", e);
                    return;
                }
                None => {
                    for client in clients.iter_mut() {
                        client.conn.on_timeout();
                    }
                }
            }

            for client in clients.iter_mut() {
                while let Ok((len, send_info)) = client.conn.send(&mut out) {
                    let _ = self.socket.send_to(&out[..len], send_info.to).await;
                }
            }
        }
    }

    fn serve(&self, client: &mut Client) {
        let Some(h3) = client.h3.as_mut() else { return };
        loop {
            match h3.poll(&mut client.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    let find = |name: &[u8]| {
                        list.iter()
                            .find(|h| h.name() == name)
                            .map(|h| String::from_utf8_lossy(h.value()).into_owned())
                            .unwrap_or_default()
                    };
                    client
                        .requests
                        .insert(stream_id, (find(b":method"), find(b":path")));

                    if self.goaway_first && client.ordinal == 0 {
                        // refuses this stream and every later one
                        if h3.send_goaway(&mut client.conn, stream_id).is_ok() {
                            self.stats.goaways.fetch_add(1, Ordering::SeqCst);
                        }
                        continue;
                    }

                    let (method, path) = client.requests[&stream_id].clone();
                    let body = format!("{} {}", method, path);
                    let headers = [
                        quiche::h3::Header::new(b":status", b"200"),
                        quiche::h3::Header::new(b"server", b"mock-h3"),
                        quiche::h3::Header::new(b"content-length", body.len().to_string().as_bytes()),
                    ];
                    if h3
                        .send_response(&mut client.conn, stream_id, &headers, false)
                        .is_ok()
                    {
                        let _ = h3.send_body(&mut client.conn, stream_id, body.as_bytes(), true);
                        self.stats.requests.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok((stream_id, quiche::h3::Event::Data)) => {
                    let mut sink = [0u8; 4096];
                    while h3.recv_body(&mut client.conn, stream_id, &mut sink).is_ok() {}
                }
                Ok(_) => {}
                Err(quiche::h3::Error::Done) => return,
                Err(e) => {
                    tracing::debug!("MockH3Server: h3 error: {}", e);
                    return;
                }
            }
        }
    }
}

impl Drop for MockH3Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}

