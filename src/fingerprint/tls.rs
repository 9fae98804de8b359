//! Declarative TLS ClientHello description.
//!
//! A [`ClientHelloSpec`] is what the JA3 parser and the browser presets
//! produce and what the connector applies to a BoringSSL context. It keeps the
//! exact cipher and extension order so it can be serialized back to JA3.

use md5::{Digest, Md5};

/// Placeholder written wherever a GREASE value belongs. BoringSSL substitutes
/// a fresh random GREASE codepoint per connection.
pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

pub const VERSION_TLS10: u16 = 0x0301;
pub const VERSION_TLS11: u16 = 0x0302;
pub const VERSION_TLS12: u16 = 0x0303;
pub const VERSION_TLS13: u16 = 0x0304;

/// Named groups.
pub mod groups {
    pub const SECP256R1: u16 = 23;
    pub const SECP384R1: u16 = 24;
    pub const SECP521R1: u16 = 25;
    pub const X25519: u16 = 29;
    pub const FFDHE2048: u16 = 256;
    pub const FFDHE3072: u16 = 257;
    pub const X25519_MLKEM768: u16 = 4588;
    pub const X25519_KYBER768_DRAFT00: u16 = 25497;
}

/// Signature schemes.
pub mod sigalgs {
    pub const RSA_PKCS1_SHA1: u16 = 0x0201;
    pub const ECDSA_SHA1: u16 = 0x0203;
    pub const RSA_PKCS1_SHA256: u16 = 0x0401;
    pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;
    pub const RSA_PKCS1_SHA384: u16 = 0x0501;
    pub const ECDSA_SECP384R1_SHA384: u16 = 0x0503;
    pub const RSA_PKCS1_SHA512: u16 = 0x0601;
    pub const ECDSA_SECP521R1_SHA512: u16 = 0x0603;
    pub const RSA_PSS_RSAE_SHA256: u16 = 0x0804;
    pub const RSA_PSS_RSAE_SHA384: u16 = 0x0805;
    pub const RSA_PSS_RSAE_SHA512: u16 = 0x0806;
}

/// True for the sixteen reserved GREASE values (RFC 8701).
pub fn is_grease(value: u16) -> bool {
    (value & 0x0f0f) == 0x0a0a && (value >> 8) == (value & 0xff)
}

/// Certificate compression algorithms (RFC 8879).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertCompression {
    Zlib,
    Brotli,
    Zstd,
}

impl CertCompression {
    pub fn id(&self) -> u16 {
        match self {
            Self::Zlib => 1,
            Self::Brotli => 2,
            Self::Zstd => 3,
        }
    }
}

/// One ClientHello extension. The variant fixes the extension ID; the payload
/// carries the contents a JA3 string cannot express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsExtension {
    Grease,
    ServerName,
    StatusRequest,
    SupportedGroups(Vec<u16>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<u16>),
    Alpn(Vec<String>),
    StatusRequestV2,
    SignedCertificateTimestamp,
    Padding,
    EncryptThenMac,
    ExtendedMasterSecret,
    CompressCertificate(Vec<CertCompression>),
    RecordSizeLimit(u16),
    DelegatedCredentials(Vec<u16>),
    SessionTicket,
    PreSharedKey,
    SupportedVersions(Vec<u16>),
    Cookie,
    PskKeyExchangeModes(Vec<u8>),
    PostHandshakeAuth,
    SignatureAlgorithmsCert(Vec<u16>),
    KeyShare(Vec<u16>),
    NextProtocolNegotiation,
    /// ALPS; `codepoint` is 17513 (old) or 17613 (new).
    ApplicationSettings { codepoint: u16, protocols: Vec<String> },
    EchGrease,
    RenegotiationInfo,
}

impl TlsExtension {
    /// Wire extension ID. GREASE reports the placeholder.
    pub fn id(&self) -> u16 {
        match self {
            Self::Grease => GREASE_PLACEHOLDER,
            Self::ServerName => 0,
            Self::StatusRequest => 5,
            Self::SupportedGroups(_) => 10,
            Self::EcPointFormats(_) => 11,
            Self::SignatureAlgorithms(_) => 13,
            Self::Alpn(_) => 16,
            Self::StatusRequestV2 => 17,
            Self::SignedCertificateTimestamp => 18,
            Self::Padding => 21,
            Self::EncryptThenMac => 22,
            Self::ExtendedMasterSecret => 23,
            Self::CompressCertificate(_) => 27,
            Self::RecordSizeLimit(_) => 28,
            Self::DelegatedCredentials(_) => 34,
            Self::SessionTicket => 35,
            Self::PreSharedKey => 41,
            Self::SupportedVersions(_) => 43,
            Self::Cookie => 44,
            Self::PskKeyExchangeModes(_) => 45,
            Self::PostHandshakeAuth => 49,
            Self::SignatureAlgorithmsCert(_) => 50,
            Self::KeyShare(_) => 51,
            Self::NextProtocolNegotiation => 13172,
            Self::ApplicationSettings { codepoint, .. } => *codepoint,
            Self::EchGrease => 65037,
            Self::RenegotiationInfo => 65281,
        }
    }

    pub fn is_grease(&self) -> bool {
        matches!(self, Self::Grease)
    }
}

/// Complete declarative ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    /// `legacy_version` field of the ClientHello (first JA3 field).
    pub legacy_version: u16,
    /// Cipher suites in wire order, GREASE included.
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Extensions in wire order, GREASE included.
    pub extensions: Vec<TlsExtension>,
    pub min_version: u16,
    pub max_version: u16,
    /// Ask BoringSSL to permute extensions per connection (Chrome 110+).
    pub permute_extensions: bool,
}

impl ClientHelloSpec {
    /// Extension IDs in order, GREASE excluded.
    pub fn extension_ids(&self) -> Vec<u16> {
        self.extensions
            .iter()
            .filter(|e| !e.is_grease())
            .map(TlsExtension::id)
            .collect()
    }

    /// Supported groups without GREASE.
    pub fn curves(&self) -> Vec<u16> {
        self.extensions
            .iter()
            .find_map(|e| match e {
                TlsExtension::SupportedGroups(g) => Some(g.clone()),
                _ => None,
            })
            .unwrap_or_default()
            .into_iter()
            .filter(|g| !is_grease(*g))
            .collect()
    }

    pub fn point_formats(&self) -> Vec<u8> {
        self.extensions
            .iter()
            .find_map(|e| match e {
                TlsExtension::EcPointFormats(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn signature_algorithms(&self) -> Vec<u16> {
        self.extensions
            .iter()
            .find_map(|e| match e {
                TlsExtension::SignatureAlgorithms(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn alpn(&self) -> Option<&[String]> {
        self.extensions.iter().find_map(|e| match e {
            TlsExtension::Alpn(p) => Some(p.as_slice()),
            _ => None,
        })
    }

    pub fn cert_compression(&self) -> Vec<CertCompression> {
        self.extensions
            .iter()
            .find_map(|e| match e {
                TlsExtension::CompressCertificate(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn has_extension(&self, id: u16) -> bool {
        self.extensions.iter().any(|e| e.id() == id)
    }

    /// Any GREASE cipher, extension or group present.
    pub fn uses_grease(&self) -> bool {
        self.cipher_suites.iter().any(|c| is_grease(*c))
            || self.extensions.iter().any(TlsExtension::is_grease)
    }

    /// Canonical JA3 text, GREASE values removed.
    pub fn ja3_string(&self) -> String {
        let join = |values: Vec<String>| values.join("-");
        let ciphers = join(
            self.cipher_suites
                .iter()
                .filter(|c| !is_grease(**c))
                .map(u16::to_string)
                .collect(),
        );
        let extensions = join(self.extension_ids().iter().map(u16::to_string).collect());
        let curves = join(self.curves().iter().map(u16::to_string).collect());
        let points = join(self.point_formats().iter().map(u8::to_string).collect());
        format!(
            "{},{},{},{},{}",
            self.legacy_version, ciphers, extensions, curves, points
        )
    }

    /// Lowercase hex MD5 of [`ja3_string`](Self::ja3_string).
    pub fn ja3_hash(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.ja3_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// BoringSSL cipher name for an IANA cipher suite ID.
///
/// TLS 1.3 suites are not configurable in BoringSSL and map to `None`, as do
/// suites BoringSSL no longer implements.
pub fn cipher_name(id: u16) -> Option<&'static str> {
    Some(match id {
        0xc02b => "ECDHE-ECDSA-AES128-GCM-SHA256",
        0xc02f => "ECDHE-RSA-AES128-GCM-SHA256",
        0xc02c => "ECDHE-ECDSA-AES256-GCM-SHA384",
        0xc030 => "ECDHE-RSA-AES256-GCM-SHA384",
        0xcca9 => "ECDHE-ECDSA-CHACHA20-POLY1305",
        0xcca8 => "ECDHE-RSA-CHACHA20-POLY1305",
        0xc009 => "ECDHE-ECDSA-AES128-SHA",
        0xc00a => "ECDHE-ECDSA-AES256-SHA",
        0xc013 => "ECDHE-RSA-AES128-SHA",
        0xc014 => "ECDHE-RSA-AES256-SHA",
        0x009c => "AES128-GCM-SHA256",
        0x009d => "AES256-GCM-SHA384",
        0x002f => "AES128-SHA",
        0x0035 => "AES256-SHA",
        0x000a => "DES-CBC3-SHA",
        _ => return None,
    })
}

/// True for the three TLS 1.3 AEAD suites.
pub fn is_tls13_cipher(id: u16) -> bool {
    matches!(id, 0x1301 | 0x1302 | 0x1303)
}

/// BoringSSL group name for a named-group ID.
pub fn group_name(id: u16) -> Option<&'static str> {
    Some(match id {
        groups::X25519 => "X25519",
        groups::SECP256R1 => "P-256",
        groups::SECP384R1 => "P-384",
        groups::SECP521R1 => "P-521",
        groups::X25519_MLKEM768 => "X25519MLKEM768",
        groups::X25519_KYBER768_DRAFT00 => "X25519Kyber768Draft00",
        _ => return None,
    })
}

/// BoringSSL signature-algorithm name for a signature scheme ID.
pub fn sigalg_name(id: u16) -> Option<&'static str> {
    Some(match id {
        sigalgs::ECDSA_SECP256R1_SHA256 => "ecdsa_secp256r1_sha256",
        sigalgs::ECDSA_SECP384R1_SHA384 => "ecdsa_secp384r1_sha384",
        sigalgs::ECDSA_SECP521R1_SHA512 => "ecdsa_secp521r1_sha512",
        sigalgs::RSA_PSS_RSAE_SHA256 => "rsa_pss_rsae_sha256",
        sigalgs::RSA_PSS_RSAE_SHA384 => "rsa_pss_rsae_sha384",
        sigalgs::RSA_PSS_RSAE_SHA512 => "rsa_pss_rsae_sha512",
        sigalgs::RSA_PKCS1_SHA256 => "rsa_pkcs1_sha256",
        sigalgs::RSA_PKCS1_SHA384 => "rsa_pkcs1_sha384",
        sigalgs::RSA_PKCS1_SHA512 => "rsa_pkcs1_sha512",
        sigalgs::RSA_PKCS1_SHA1 => "rsa_pkcs1_sha1",
        sigalgs::ECDSA_SHA1 => "ecdsa_sha1",
        _ => return None,
    })
}

/// ALPN protocol list in wire format (length-prefixed).
pub fn alpn_wire(protocols: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            continue;
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}
