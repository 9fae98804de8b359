mod helpers;

use helpers::mock_server::MockHttpServer;
use helpers::tls;
use veil::{Engine, Error, ErrorKind, TransportRequest};

async fn tls_server() -> (String, u16, String) {
    let (acceptor, cert_pem) = tls::acceptor(&["http/1.1"]);
    let server = MockHttpServer::with_tls(acceptor).await.unwrap();
    let (url, port) = (server.url(), server.port());
    server.start();
    (url, port, tls::spki_pin(&cert_pem))
}

#[tokio::test]
async fn matching_pin_is_accepted() {
    let (url, port, pin) = tls_server().await;
    let engine = Engine::builder()
        .danger_accept_invalid_certs(true)
        .pin(format!("127.0.0.1:{}", port), [pin])
        .build()
        .unwrap();

    let response = engine.execute(TransportRequest::get(url)).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn unrelated_pin_fails_and_is_not_pooled() {
    let (url, port, _) = tls_server().await;
    let engine = Engine::builder()
        .danger_accept_invalid_certs(true)
        .pin(
            format!("127.0.0.1:{}", port),
            ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="],
        )
        .build()
        .unwrap();

    let err = engine.execute(TransportRequest::get(url)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
    assert!(matches!(err, Error::PinMismatch { ref host } if host == &format!("127.0.0.1:{}", port)));
    assert_eq!(engine.pool_stats().await.live, 0);
}

#[tokio::test]
async fn pins_for_other_hosts_do_not_apply() {
    let (url, _, _) = tls_server().await;
    let engine = Engine::builder()
        .danger_accept_invalid_certs(true)
        .pin("example.com:443", ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="])
        .build()
        .unwrap();
    assert!(engine.execute(TransportRequest::get(url)).await.is_ok());
}

#[tokio::test]
async fn learned_pins_match_the_server() {
    let (url, port, pin) = tls_server().await;
    let engine = Engine::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();

    let learned = engine.learn_pins(&url).await.unwrap();
    assert_eq!(learned, vec![pin.clone()]);

    let stored = engine.pins().pins(&format!("127.0.0.1:{}", port)).unwrap();
    assert!(stored.contains(&pin));
    assert!(engine.execute(TransportRequest::get(url)).await.is_ok());
}
