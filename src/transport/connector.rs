//! BoringSSL TLS connector shaped by a [`ClientHelloSpec`].

use std::io;
use std::io::Read;
use std::os::raw::c_int;
use std::time::{Duration, Instant};

use boring::asn1::Asn1Time;
use boring::ssl::{
    SslConnector, SslContextBuilder, SslMethod, SslRef, SslSessionCacheMode, SslVerifyMode,
    SslVersion,
};
use boring::x509::X509;
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::tls::{
    alpn_wire, cipher_name, group_name, is_grease, is_tls13_cipher, sigalg_name, CertCompression,
    ClientHelloSpec, VERSION_TLS10, VERSION_TLS11, VERSION_TLS12,
};
use crate::transport::BoxedStream;

// FFI bindings for BoringSSL extension control
use boring_sys::{CRYPTO_BUFFER, SSL, SSL_CTX};

extern "C" {
    /// Enable GREASE (Generate Random Extensions And Sustain Extensibility)
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int);
    /// Enable extension order permutation (Chrome 110+ behavior)
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int);
    /// Send status_request (OCSP stapling).
    fn SSL_CTX_enable_ocsp_stapling(ctx: *mut SSL_CTX);
    /// Send signed_certificate_timestamp.
    fn SSL_CTX_enable_signed_cert_timestamps(ctx: *mut SSL_CTX);
}

unsafe fn finish_decompression(
    out: *mut *mut CRYPTO_BUFFER,
    result: io::Result<Vec<u8>>,
    uncompressed_len: usize,
) -> c_int {
    match result {
        Ok(decompressed) if decompressed.len() == uncompressed_len => {
            // CRYPTO_BUFFER_new copies the data
            let buffer = boring_sys::CRYPTO_BUFFER_new(
                decompressed.as_ptr(),
                decompressed.len(),
                std::ptr::null_mut(),
            );
            if buffer.is_null() {
                return 0;
            }
            *out = buffer;
            1
        }
        _ => 0,
    }
}

/// Brotli certificate decompression callback for BoringSSL.
unsafe extern "C" fn decompress_brotli_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    let result = brotli::Decompressor::new(compressed, 4096)
        .read_to_end(&mut decompressed)
        .map(|_| decompressed);
    finish_decompression(out, result, uncompressed_len)
}

/// Zlib certificate decompression callback for BoringSSL.
unsafe extern "C" fn decompress_zlib_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    let result = flate2::read::ZlibDecoder::new(compressed)
        .read_to_end(&mut decompressed)
        .map(|_| decompressed);
    finish_decompression(out, result, uncompressed_len)
}

/// Zstandard certificate decompression callback for BoringSSL.
unsafe extern "C" fn decompress_zstd_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let result = zstd::bulk::decompress(compressed, uncompressed_len);
    finish_decompression(out, result, uncompressed_len)
}

fn ssl_version(version: u16) -> SslVersion {
    match version {
        VERSION_TLS10 => SslVersion::TLS1,
        VERSION_TLS11 => SslVersion::TLS1_1,
        VERSION_TLS12 => SslVersion::TLS1_2,
        _ => SslVersion::TLS1_3,
    }
}

fn tls_err(context: &str) -> impl Fn(boring::error::ErrorStack) -> Error + '_ {
    move |e| Error::handshake(format!("{}: {}", context, e))
}

/// Apply the cipher, group, sigalg, version and extension knobs of `spec` to
/// an SSL context. Extension order itself is chosen by BoringSSL; the
/// `permute_extensions` flag only toggles per-connection permutation.
pub fn apply_client_hello(
    builder: &mut SslContextBuilder,
    spec: &ClientHelloSpec,
    alpn: Option<&[String]>,
) -> Result<()> {
    let ciphers: Vec<&str> = spec
        .cipher_suites
        .iter()
        .filter(|c| !is_grease(**c) && !is_tls13_cipher(**c))
        .filter_map(|c| cipher_name(*c))
        .collect();
    if !ciphers.is_empty() {
        builder
            .set_cipher_list(&ciphers.join(":"))
            .map_err(tls_err("failed to set cipher list"))?;
    }

    let curves: Vec<&str> = spec.curves().into_iter().filter_map(group_name).collect();
    if !curves.is_empty() {
        // Older BoringSSL builds lack the post-quantum hybrids
        let classical: Vec<&str> = curves
            .iter()
            .copied()
            .filter(|c| !c.contains("MLKEM") && !c.contains("Kyber"))
            .collect();
        if builder.set_curves_list(&curves.join(":")).is_err() {
            tracing::debug!("TLS: post-quantum groups unavailable, using classical groups");
            builder
                .set_curves_list(&classical.join(":"))
                .map_err(tls_err("failed to set curves"))?;
        }
    }

    let sigalgs: Vec<&str> = spec
        .signature_algorithms()
        .into_iter()
        .filter_map(sigalg_name)
        .collect();
    if !sigalgs.is_empty() {
        builder
            .set_sigalgs_list(&sigalgs.join(":"))
            .map_err(tls_err("failed to set signature algorithms"))?;
    }

    builder
        .set_min_proto_version(Some(ssl_version(spec.min_version)))
        .map_err(tls_err("failed to set min TLS version"))?;
    builder
        .set_max_proto_version(Some(ssl_version(spec.max_version)))
        .map_err(tls_err("failed to set max TLS version"))?;

    unsafe {
        let ctx = builder.as_ptr() as *mut SSL_CTX;
        SSL_CTX_set_grease_enabled(ctx, c_int::from(spec.uses_grease()));
        SSL_CTX_set_permute_extensions(ctx, c_int::from(spec.permute_extensions));
        if spec.has_extension(5) {
            SSL_CTX_enable_ocsp_stapling(ctx);
        }
        if spec.has_extension(18) {
            SSL_CTX_enable_signed_cert_timestamps(ctx);
        }

        // Decompression only; the client never compresses its own certificate
        for alg in spec.cert_compression() {
            let callback = match alg {
                CertCompression::Brotli => decompress_brotli_cert,
                CertCompression::Zlib => decompress_zlib_cert,
                CertCompression::Zstd => decompress_zstd_cert,
            };
            boring_sys::SSL_CTX_add_cert_compression_alg(ctx, alg.id(), None, Some(callback));
        }
    }

    builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);

    let protocols = alpn.or(spec.alpn());
    if let Some(protocols) = protocols {
        let wire = alpn_wire(protocols);
        if !wire.is_empty() {
            builder
                .set_alpn_protos(&wire)
                .map_err(tls_err("failed to set ALPN"))?;
        }
    }

    Ok(())
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    H2,
    Http1,
    /// No ALPN negotiated or unknown protocol
    Unknown,
}

impl AlpnProtocol {
    pub fn of(ssl: &SslRef) -> Self {
        match ssl.selected_alpn_protocol() {
            Some(b"h2") => Self::H2,
            Some(b"http/1.1") => Self::Http1,
            _ => Self::Unknown,
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }
}

/// Earliest `notAfter` across the presented chain, as an `Instant`.
///
/// A certificate that has already expired yields `Instant::now()`.
pub fn earliest_expiry(ssl: &SslRef) -> Option<Instant> {
    let now = Asn1Time::days_from_now(0).ok()?;
    let mut earliest: Option<i64> = None;
    let mut consider = |not_after: &boring::asn1::Asn1TimeRef| {
        if let Ok(diff) = now.diff(not_after) {
            let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
            earliest = Some(earliest.map_or(secs, |e| e.min(secs)));
        }
    };
    match ssl.peer_cert_chain() {
        Some(chain) => chain.iter().for_each(|cert| consider(cert.not_after())),
        None => {
            if let Some(cert) = ssl.peer_certificate() {
                consider(cert.not_after());
            }
        }
    }
    earliest.map(|secs| Instant::now() + Duration::from_secs(secs.max(0) as u64))
}

/// Builds TLS sessions for origins and HTTPS proxy hops.
#[derive(Clone)]
pub struct TlsConnector {
    roots: Vec<X509>,
    verify: bool,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("extra_roots", &self.roots.len())
            .field("verify", &self.verify)
            .finish()
    }
}

impl TlsConnector {
    /// `root_certs` are PEM or DER encoded; `verify = false` accepts any chain.
    pub fn new(root_certs: &[Vec<u8>], verify: bool) -> Result<Self> {
        let roots = root_certs
            .iter()
            .map(|bytes| {
                X509::from_der(bytes)
                    .or_else(|_| X509::from_pem(bytes))
                    .map_err(|e| Error::handshake(format!("invalid root certificate: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { roots, verify })
    }

    pub fn verifies_peers(&self) -> bool {
        self.verify
    }

    fn build(&self, spec: &ClientHelloSpec, alpn: Option<&[String]>) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(tls_err("failed to create SSL connector"))?;

        for cert in &self.roots {
            builder
                .cert_store_mut()
                .add_cert(cert.clone())
                .map_err(tls_err("failed to add root certificate"))?;
        }
        if !self.verify {
            builder.set_verify(SslVerifyMode::NONE);
        }

        apply_client_hello(&mut builder, spec, alpn)?;
        Ok(builder.build())
    }

    /// SSL context for a QUIC connection; quiche drives the handshake itself.
    pub fn quic_context(&self, spec: &ClientHelloSpec) -> Result<SslContextBuilder> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())
            .map_err(tls_err("failed to create QUIC SSL context"))?;
        builder
            .set_default_verify_paths()
            .map_err(tls_err("failed to load system roots"))?;
        for cert in &self.roots {
            builder
                .cert_store_mut()
                .add_cert(cert.clone())
                .map_err(tls_err("failed to add root certificate"))?;
        }
        builder.set_verify(if self.verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        let h3 = ["h3".to_string()];
        apply_client_hello(&mut builder, spec, Some(&h3))?;
        Ok(builder)
    }

    /// Run a TLS handshake over `stream` with SNI `host`.
    ///
    /// `alpn` overrides the ClientHello's ALPN list (proxy hops offer their own).
    pub async fn connect(
        &self,
        spec: &ClientHelloSpec,
        host: &str,
        stream: BoxedStream,
        alpn: Option<&[String]>,
    ) -> Result<SslStream<BoxedStream>> {
        let connector = self.build(spec, alpn)?;
        let mut config = connector
            .configure()
            .map_err(tls_err("failed to configure SSL"))?;
        if !self.verify {
            config.set_verify_hostname(false);
        }

        // ALPS and ECH GREASE are per-SSL settings the safe API does not
        // expose; they stay descriptive in the ClientHelloSpec.
        if spec.has_extension(17613) || spec.has_extension(17513) {
            tracing::trace!(host, "TLS: ALPS entry not configurable, skipping");
        }

        let started = Instant::now();
        let stream = tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| Error::handshake(format!("TLS handshake with {} failed: {}", host, e)))?;
        tracing::debug!(
            host,
            alpn = ?AlpnProtocol::of(stream.ssl()),
            elapsed = ?started.elapsed(),
            "TLS: handshake complete"
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::profiles::{client_hello, Browser};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn presets_apply_to_a_context() {
        for browser in [Browser::Chrome, Browser::Firefox, Browser::Safari] {
            let spec = client_hello(browser, &mut StdRng::seed_from_u64(1));
            let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
            apply_client_hello(&mut builder, &spec, None).unwrap();
        }
    }

    #[test]
    fn rejects_garbage_root() {
        assert!(TlsConnector::new(&[b"not a cert".to_vec()], true).is_err());
    }
}
