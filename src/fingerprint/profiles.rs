//! Browser presets.
//!
//! Every table here is immutable module data. The only per-call variation is
//! Chrome's extension order, which is re-drawn from the caller's RNG on every
//! [`client_hello`] call.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::FormatError;
use crate::fingerprint::http2::{Http2Fingerprint, PriorityData, PseudoHeader, PseudoHeaderOrder};
use crate::fingerprint::http3::{Http3Fingerprint, Http3Setting};
use crate::fingerprint::tls::{
    groups, sigalgs, CertCompression, ClientHelloSpec, TlsExtension, GREASE_PLACEHOLDER,
    VERSION_TLS10, VERSION_TLS11, VERSION_TLS12, VERSION_TLS13,
};

/// Browser family to impersonate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Browser {
    #[default]
    Chrome,
    Firefox,
    Ios,
    Safari,
    Edge,
    Opera,
}

impl Browser {
    /// Chromium-based browsers share one preset.
    pub fn is_chrome_family(&self) -> bool {
        matches!(self, Self::Chrome | Self::Edge | Self::Opera)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Ios => "ios",
            Self::Safari => "safari",
            Self::Edge => "edge",
            Self::Opera => "opera",
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Browser {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "ios" => Ok(Self::Ios),
            "safari" => Ok(Self::Safari),
            "edge" => Ok(Self::Edge),
            "opera" => Ok(Self::Opera),
            other => Err(FormatError::InvalidFormat(format!("unknown browser `{}`", other))),
        }
    }
}

/// Extension contents a JA3 string cannot express, per browser.
#[derive(Debug, Clone, Copy)]
pub struct TlsDefaults {
    pub alpn: &'static [&'static str],
    pub signature_algorithms: &'static [u16],
    pub supported_versions: &'static [u16],
    pub cert_compression: &'static [CertCompression],
    pub delegated_credentials: &'static [u16],
    pub psk_modes: &'static [u8],
    pub alps_protocols: &'static [&'static str],
    pub record_size_limit: u16,
    pub key_share: &'static [u16],
}

const ALPN_H2_H1: &[&str] = &["h2", "http/1.1"];

const CHROME_SIGALGS: &[u16] = &[
    sigalgs::ECDSA_SECP256R1_SHA256,
    sigalgs::RSA_PSS_RSAE_SHA256,
    sigalgs::RSA_PKCS1_SHA256,
    sigalgs::ECDSA_SECP384R1_SHA384,
    sigalgs::RSA_PSS_RSAE_SHA384,
    sigalgs::RSA_PKCS1_SHA384,
    sigalgs::RSA_PSS_RSAE_SHA512,
    sigalgs::RSA_PKCS1_SHA512,
];

const FIREFOX_SIGALGS: &[u16] = &[
    sigalgs::ECDSA_SECP256R1_SHA256,
    sigalgs::ECDSA_SECP384R1_SHA384,
    sigalgs::ECDSA_SECP521R1_SHA512,
    sigalgs::RSA_PSS_RSAE_SHA256,
    sigalgs::RSA_PSS_RSAE_SHA384,
    sigalgs::RSA_PSS_RSAE_SHA512,
    sigalgs::RSA_PKCS1_SHA256,
    sigalgs::RSA_PKCS1_SHA384,
    sigalgs::RSA_PKCS1_SHA512,
    sigalgs::ECDSA_SHA1,
    sigalgs::RSA_PKCS1_SHA1,
];

const SAFARI_SIGALGS: &[u16] = &[
    sigalgs::ECDSA_SECP256R1_SHA256,
    sigalgs::RSA_PSS_RSAE_SHA256,
    sigalgs::RSA_PKCS1_SHA256,
    sigalgs::ECDSA_SECP384R1_SHA384,
    sigalgs::ECDSA_SHA1,
    sigalgs::RSA_PSS_RSAE_SHA384,
    sigalgs::RSA_PKCS1_SHA384,
    sigalgs::RSA_PSS_RSAE_SHA512,
    sigalgs::RSA_PKCS1_SHA512,
    sigalgs::RSA_PKCS1_SHA1,
];

const CHROME_DEFAULTS: TlsDefaults = TlsDefaults {
    alpn: ALPN_H2_H1,
    signature_algorithms: CHROME_SIGALGS,
    supported_versions: &[GREASE_PLACEHOLDER, VERSION_TLS13, VERSION_TLS12],
    cert_compression: &[CertCompression::Brotli],
    delegated_credentials: &[],
    psk_modes: &[1],
    alps_protocols: &["h2"],
    record_size_limit: 0x4001,
    key_share: &[GREASE_PLACEHOLDER, groups::X25519],
};

const FIREFOX_DEFAULTS: TlsDefaults = TlsDefaults {
    alpn: ALPN_H2_H1,
    signature_algorithms: FIREFOX_SIGALGS,
    supported_versions: &[VERSION_TLS13, VERSION_TLS12],
    cert_compression: &[
        CertCompression::Zlib,
        CertCompression::Brotli,
        CertCompression::Zstd,
    ],
    delegated_credentials: &[
        sigalgs::ECDSA_SECP256R1_SHA256,
        sigalgs::ECDSA_SECP384R1_SHA384,
        sigalgs::ECDSA_SECP521R1_SHA512,
        sigalgs::ECDSA_SHA1,
    ],
    psk_modes: &[1],
    alps_protocols: &["h2"],
    record_size_limit: 0x4001,
    key_share: &[groups::X25519, groups::SECP256R1],
};

const SAFARI_DEFAULTS: TlsDefaults = TlsDefaults {
    alpn: ALPN_H2_H1,
    signature_algorithms: SAFARI_SIGALGS,
    supported_versions: &[
        GREASE_PLACEHOLDER,
        VERSION_TLS13,
        VERSION_TLS12,
        VERSION_TLS11,
        VERSION_TLS10,
    ],
    cert_compression: &[CertCompression::Zlib],
    delegated_credentials: &[],
    psk_modes: &[1],
    alps_protocols: &["h2"],
    record_size_limit: 0x4001,
    key_share: &[GREASE_PLACEHOLDER, groups::X25519],
};

/// Extension contents used when building a `ClientHelloSpec` from a JA3 string.
pub fn tls_defaults(browser: Browser) -> TlsDefaults {
    match browser {
        Browser::Firefox => FIREFOX_DEFAULTS,
        Browser::Ios | Browser::Safari => SAFARI_DEFAULTS,
        Browser::Chrome | Browser::Edge | Browser::Opera => CHROME_DEFAULTS,
    }
}

const CHROME_CIPHERS: &[u16] = &[
    GREASE_PLACEHOLDER,
    0x1301,
    0x1302,
    0x1303,
    0xc02b,
    0xc02f,
    0xc02c,
    0xc030,
    0xcca9,
    0xcca8,
    0xc013,
    0xc014,
    0x009c,
    0x009d,
    0x002f,
    0x0035,
];

const FIREFOX_CIPHERS: &[u16] = &[
    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009,
    0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
];

const SAFARI_CIPHERS: &[u16] = &[
    GREASE_PLACEHOLDER,
    0x1301,
    0x1302,
    0x1303,
    0xc02c,
    0xc02b,
    0xcca9,
    0xc030,
    0xc02f,
    0xcca8,
    0xc00a,
    0xc009,
    0xc014,
    0xc013,
    0x009d,
    0x009c,
    0x0035,
    0x002f,
    0xc008,
    0xc012,
    0x000a,
];

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn chrome_extensions() -> Vec<TlsExtension> {
    vec![
        TlsExtension::Grease,
        TlsExtension::KeyShare(vec![
            GREASE_PLACEHOLDER,
            groups::X25519_MLKEM768,
            groups::X25519,
        ]),
        TlsExtension::Alpn(strings(ALPN_H2_H1)),
        TlsExtension::ServerName,
        TlsExtension::SignatureAlgorithms(CHROME_SIGALGS.to_vec()),
        TlsExtension::ExtendedMasterSecret,
        TlsExtension::SessionTicket,
        TlsExtension::SignedCertificateTimestamp,
        TlsExtension::RenegotiationInfo,
        TlsExtension::PskKeyExchangeModes(vec![1]),
        TlsExtension::ApplicationSettings {
            codepoint: 17613,
            protocols: strings(&["h2"]),
        },
        TlsExtension::CompressCertificate(vec![CertCompression::Brotli]),
        TlsExtension::SupportedVersions(vec![GREASE_PLACEHOLDER, VERSION_TLS13, VERSION_TLS12]),
        TlsExtension::SupportedGroups(vec![
            GREASE_PLACEHOLDER,
            groups::X25519_MLKEM768,
            groups::X25519,
            groups::SECP256R1,
            groups::SECP384R1,
        ]),
        TlsExtension::StatusRequest,
        TlsExtension::EcPointFormats(vec![0]),
        TlsExtension::EchGrease,
        TlsExtension::Grease,
        TlsExtension::Padding,
    ]
}

fn firefox_extensions() -> Vec<TlsExtension> {
    vec![
        TlsExtension::ServerName,
        TlsExtension::ExtendedMasterSecret,
        TlsExtension::RenegotiationInfo,
        TlsExtension::SupportedGroups(vec![
            groups::X25519_MLKEM768,
            groups::X25519,
            groups::SECP256R1,
            groups::SECP384R1,
            groups::SECP521R1,
            groups::FFDHE2048,
            groups::FFDHE3072,
        ]),
        TlsExtension::EcPointFormats(vec![0]),
        TlsExtension::SessionTicket,
        TlsExtension::Alpn(strings(ALPN_H2_H1)),
        TlsExtension::StatusRequest,
        TlsExtension::DelegatedCredentials(FIREFOX_DEFAULTS.delegated_credentials.to_vec()),
        TlsExtension::SignedCertificateTimestamp,
        TlsExtension::KeyShare(vec![
            groups::X25519_MLKEM768,
            groups::X25519,
            groups::SECP256R1,
        ]),
        TlsExtension::SupportedVersions(vec![VERSION_TLS13, VERSION_TLS12]),
        TlsExtension::SignatureAlgorithms(FIREFOX_SIGALGS.to_vec()),
        TlsExtension::PskKeyExchangeModes(vec![1]),
        TlsExtension::RecordSizeLimit(0x4001),
        TlsExtension::CompressCertificate(FIREFOX_DEFAULTS.cert_compression.to_vec()),
        TlsExtension::EchGrease,
    ]
}

fn safari_extensions() -> Vec<TlsExtension> {
    vec![
        TlsExtension::Grease,
        TlsExtension::ServerName,
        TlsExtension::ExtendedMasterSecret,
        TlsExtension::RenegotiationInfo,
        TlsExtension::SupportedGroups(vec![
            GREASE_PLACEHOLDER,
            groups::X25519,
            groups::SECP256R1,
            groups::SECP384R1,
            groups::SECP521R1,
        ]),
        TlsExtension::EcPointFormats(vec![0]),
        TlsExtension::Alpn(strings(ALPN_H2_H1)),
        TlsExtension::StatusRequest,
        TlsExtension::SignatureAlgorithms(SAFARI_SIGALGS.to_vec()),
        TlsExtension::SignedCertificateTimestamp,
        TlsExtension::KeyShare(vec![GREASE_PLACEHOLDER, groups::X25519]),
        TlsExtension::PskKeyExchangeModes(vec![1]),
        TlsExtension::SupportedVersions(SAFARI_DEFAULTS.supported_versions.to_vec()),
        TlsExtension::CompressCertificate(vec![CertCompression::Zlib]),
        TlsExtension::Grease,
        TlsExtension::Padding,
    ]
}

/// Permute every extension except the first and the last two.
///
/// Chrome keeps the leading GREASE and the trailing GREASE + padding pair in
/// place and randomizes everything between them.
pub fn shuffle_stable_ends<R: Rng + ?Sized>(extensions: &mut [TlsExtension], rng: &mut R) {
    if extensions.len() <= 3 {
        return;
    }
    let end = extensions.len() - 2;
    extensions[1..end].shuffle(rng);
}

/// Full ClientHello preset for a browser.
pub fn client_hello<R: Rng + ?Sized>(browser: Browser, rng: &mut R) -> ClientHelloSpec {
    match browser {
        Browser::Chrome | Browser::Edge | Browser::Opera => {
            let mut extensions = chrome_extensions();
            shuffle_stable_ends(&mut extensions, rng);
            ClientHelloSpec {
                legacy_version: VERSION_TLS12,
                cipher_suites: CHROME_CIPHERS.to_vec(),
                compression_methods: vec![0],
                extensions,
                min_version: VERSION_TLS12,
                max_version: VERSION_TLS13,
                permute_extensions: true,
            }
        }
        Browser::Firefox => ClientHelloSpec {
            legacy_version: VERSION_TLS12,
            cipher_suites: FIREFOX_CIPHERS.to_vec(),
            compression_methods: vec![0],
            extensions: firefox_extensions(),
            min_version: VERSION_TLS12,
            max_version: VERSION_TLS13,
            permute_extensions: false,
        },
        Browser::Ios | Browser::Safari => ClientHelloSpec {
            legacy_version: VERSION_TLS12,
            cipher_suites: SAFARI_CIPHERS.to_vec(),
            compression_methods: vec![0],
            extensions: safari_extensions(),
            min_version: VERSION_TLS10,
            max_version: VERSION_TLS13,
            permute_extensions: false,
        },
    }
}

/// TLS 1.3-only preset carried inside QUIC Initial packets.
pub fn quic_client_hello<R: Rng + ?Sized>(browser: Browser, rng: &mut R) -> ClientHelloSpec {
    let (curves, key_share, sigs, compression): (&[u16], &[u16], &[u16], &[CertCompression]) =
        match browser {
            Browser::Firefox => (
                &[
                    groups::X25519_MLKEM768,
                    groups::X25519,
                    groups::SECP256R1,
                    groups::SECP384R1,
                    groups::SECP521R1,
                    groups::FFDHE2048,
                    groups::FFDHE3072,
                ],
                &[groups::X25519_MLKEM768, groups::X25519, groups::SECP256R1],
                FIREFOX_SIGALGS,
                &[],
            ),
            Browser::Ios | Browser::Safari => (
                &[
                    groups::X25519,
                    groups::SECP256R1,
                    groups::SECP384R1,
                    groups::SECP521R1,
                ],
                &[groups::X25519],
                SAFARI_SIGALGS,
                &[CertCompression::Zlib],
            ),
            Browser::Chrome | Browser::Edge | Browser::Opera => (
                &[
                    groups::X25519_MLKEM768,
                    groups::X25519,
                    groups::SECP256R1,
                    groups::SECP384R1,
                ],
                &[groups::X25519_MLKEM768, groups::X25519],
                CHROME_SIGALGS,
                &[CertCompression::Brotli],
            ),
        };

    let mut extensions = vec![
        TlsExtension::ServerName,
        TlsExtension::Alpn(strings(&["h3"])),
        TlsExtension::SupportedGroups(curves.to_vec()),
        TlsExtension::KeyShare(key_share.to_vec()),
        TlsExtension::SignatureAlgorithms(sigs.to_vec()),
        TlsExtension::SupportedVersions(vec![VERSION_TLS13]),
        TlsExtension::PskKeyExchangeModes(vec![1]),
    ];
    if !compression.is_empty() {
        extensions.push(TlsExtension::CompressCertificate(compression.to_vec()));
    }
    let chrome = browser.is_chrome_family();
    if chrome {
        extensions.push(TlsExtension::ApplicationSettings {
            codepoint: 17613,
            protocols: strings(&["h3"]),
        });
        extensions.shuffle(rng);
    }

    ClientHelloSpec {
        legacy_version: VERSION_TLS12,
        cipher_suites: vec![0x1301, 0x1302, 0x1303],
        compression_methods: vec![0],
        extensions,
        min_version: VERSION_TLS13,
        max_version: VERSION_TLS13,
        permute_extensions: chrome,
    }
}

const CHROME_H2_SETTINGS: &[(u16, u32)] = &[(1, 65536), (2, 0), (4, 6291456), (6, 262144)];
const FIREFOX_H2_SETTINGS: &[(u16, u32)] = &[(1, 65536), (2, 0), (4, 131072), (5, 16384)];
const IOS_H2_SETTINGS: &[(u16, u32)] = &[(2, 0), (3, 100), (4, 2097152), (9, 1)];
const SAFARI_H2_SETTINGS: &[(u16, u32)] = &[(2, 0), (3, 100), (4, 2097152), (8, 1), (9, 1)];

/// Default pseudo-header order when a fingerprint says `0`.
pub fn pseudo_header_order(browser: Browser) -> PseudoHeaderOrder {
    use PseudoHeader::*;
    match browser {
        Browser::Firefox => PseudoHeaderOrder([Method, Path, Authority, Scheme]),
        Browser::Ios | Browser::Safari => PseudoHeaderOrder([Method, Scheme, Path, Authority]),
        Browser::Chrome | Browser::Edge | Browser::Opera => {
            PseudoHeaderOrder([Method, Authority, Scheme, Path])
        }
    }
}

/// Priority block attached to request HEADERS frames.
pub fn header_priority(browser: Browser) -> Option<PriorityData> {
    Some(match browser {
        Browser::Firefox => PriorityData {
            exclusive: false,
            stream_dependency: 0,
            weight: 41,
        },
        Browser::Ios | Browser::Safari => PriorityData {
            exclusive: false,
            stream_dependency: 0,
            weight: 255,
        },
        Browser::Chrome | Browser::Edge | Browser::Opera => PriorityData {
            exclusive: true,
            stream_dependency: 0,
            weight: 255,
        },
    })
}

pub fn http2_fingerprint(browser: Browser) -> Http2Fingerprint {
    let (settings, window) = match browser {
        Browser::Firefox => (FIREFOX_H2_SETTINGS, 12517377),
        Browser::Ios => (IOS_H2_SETTINGS, 10420225),
        Browser::Safari => (SAFARI_H2_SETTINGS, 10420225),
        Browser::Chrome | Browser::Edge | Browser::Opera => (CHROME_H2_SETTINGS, 15663105),
    };
    Http2Fingerprint {
        settings: settings.to_vec(),
        connection_window_increment: window,
        priorities: Vec::new(),
        pseudo_header_order: pseudo_header_order(browser),
        header_priority: header_priority(browser),
    }
}

const CHROME_H3_SETTINGS: &[Http3Setting] = &[
    Http3Setting::Value { id: 0x1, value: 65536 },
    Http3Setting::Value { id: 0x6, value: 262144 },
    Http3Setting::Value { id: 0x7, value: 100 },
    Http3Setting::Value { id: 0x33, value: 1 },
    Http3Setting::Grease,
];

const FIREFOX_H3_SETTINGS: &[Http3Setting] = &[
    Http3Setting::Value { id: 0x1, value: 65536 },
    Http3Setting::Value { id: 0x7, value: 20 },
    Http3Setting::Value { id: 0x2b60_3742, value: 0 },
];

pub fn http3_fingerprint(browser: Browser) -> Http3Fingerprint {
    let settings = match browser {
        Browser::Firefox => FIREFOX_H3_SETTINGS,
        _ => CHROME_H3_SETTINGS,
    };
    Http3Fingerprint {
        settings: settings.to_vec(),
        pseudo_header_order: pseudo_header_order(browser),
    }
}

pub fn user_agent(browser: Browser) -> &'static str {
    match browser {
        Browser::Chrome => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36"
        }
        Browser::Edge => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 Edg/133.0.0.0"
        }
        Browser::Opera => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 OPR/118.0.0.0"
        }
        Browser::Firefox => {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:138.0) Gecko/20100101 Firefox/138.0"
        }
        Browser::Safari => {
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15"
        }
        Browser::Ios => {
            "Mozilla/5.0 (iPhone; CPU iPhone OS 18_3 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Mobile/15E148 Safari/604.1"
        }
    }
}
