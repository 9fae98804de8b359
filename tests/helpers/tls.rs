use boring::pkey::PKey;
use boring::ssl::{select_next_proto, AlpnError, SslAcceptor, SslAcceptorBuilder, SslMethod};
use boring::x509::X509;

/// Generate a self-signed certificate for 127.0.0.1 and return SslAcceptorBuilder + CA cert bytes.
pub fn generate_cert_bundle() -> (SslAcceptorBuilder, Vec<u8>) {
    let subject_alt_names = vec!["127.0.0.1".to_string(), "localhost".to_string()];

    let cert =
        rcgen::generate_simple_self_signed(subject_alt_names).expect("Failed to generate cert");
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    let pkey = PKey::private_key_from_pem(key_pem.as_bytes()).expect("Failed to parse private key");
    let x509 = X509::from_pem(cert_pem.as_bytes()).expect("Failed to parse certificate");

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .expect("Failed to create SslAcceptor builder");
    builder
        .set_private_key(&pkey)
        .expect("Failed to set private key");
    builder
        .set_certificate(&x509)
        .expect("Failed to set certificate");

    (builder, cert_pem.into_bytes())
}

/// Acceptor that selects the first of `alpn` the client offers; an empty
/// list leaves ALPN unnegotiated.
pub fn acceptor(alpn: &[&str]) -> (SslAcceptor, Vec<u8>) {
    let (mut builder, cert_pem) = generate_cert_bundle();
    if !alpn.is_empty() {
        let protocols: Vec<String> = alpn.iter().map(|p| p.to_string()).collect();
        let wire = veil::fingerprint::tls::alpn_wire(&protocols);
        builder.set_alpn_select_callback(move |_, client| {
            select_next_proto(&wire, client).ok_or(AlpnError::NOACK)
        });
    }
    (builder.build(), cert_pem)
}

/// SPKI pin of a PEM certificate.
pub fn spki_pin(cert_pem: &[u8]) -> String {
    let cert = X509::from_pem(cert_pem).expect("Failed to parse certificate");
    veil::pin::spki_digest(&cert).expect("Failed to digest SPKI")
}
