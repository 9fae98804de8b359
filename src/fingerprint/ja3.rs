//! JA3 string to [`ClientHelloSpec`].
//!
//! `SSLVersion,Ciphers,Extensions,EllipticCurves,EllipticCurvePointFormats`,
//! each list dash-separated. Extension contents that JA3 does not carry come
//! from the browser's [`TlsDefaults`].

use crate::error::{FormatError, Ja3Field};
use crate::fingerprint::profiles::{self, Browser, TlsDefaults};
use crate::fingerprint::tls::{
    is_grease, ClientHelloSpec, TlsExtension, GREASE_PLACEHOLDER, VERSION_TLS10, VERSION_TLS13,
};

const PADDING: u16 = 21;

/// Build a ClientHello description from a JA3 string.
pub fn parse(ja3: &str, browser: Browser) -> Result<ClientHelloSpec, FormatError> {
    let fields: Vec<&str> = ja3.trim().split(',').collect();
    if fields.len() != 5 {
        return Err(FormatError::InvalidFormat(format!(
            "JA3 needs 5 fields, got {}",
            fields.len()
        )));
    }

    let legacy_version = fields[0]
        .trim()
        .parse::<u16>()
        .map_err(|_| FormatError::InvalidField {
            kind: Ja3Field::Version,
            index: 0,
        })?;

    let ciphers = parse_list::<u16>(fields[1], Ja3Field::Cipher)?;
    if ciphers.is_empty() {
        return Err(FormatError::InvalidFormat("empty cipher list".into()));
    }
    let extension_ids = parse_list::<u16>(fields[2], Ja3Field::Extension)?;
    let curves = parse_list::<u16>(fields[3], Ja3Field::Curve)?;
    let points = parse_list::<u8>(fields[4], Ja3Field::PointFormat)?;

    // only Chromium injects GREASE into a JA3-built hello
    let grease = browser.is_chrome_family();
    let defaults = profiles::tls_defaults(browser);

    let mut cipher_suites = Vec::with_capacity(ciphers.len() + 1);
    if grease {
        cipher_suites.push(GREASE_PLACEHOLDER);
    }
    cipher_suites.extend(ciphers.into_iter().filter(|c| !is_grease(*c)));

    let mut groups: Vec<u16> = curves.into_iter().filter(|c| !is_grease(*c)).collect();
    if grease && !groups.is_empty() {
        groups.insert(0, GREASE_PLACEHOLDER);
    }

    let mut extensions = Vec::new();
    if extension_ids.is_empty() {
        if !groups.is_empty() {
            extensions.push(TlsExtension::SupportedGroups(groups.clone()));
        }
        if !points.is_empty() {
            extensions.push(TlsExtension::EcPointFormats(points.clone()));
        }
    } else {
        for id in extension_ids.iter().copied().filter(|id| !is_grease(*id)) {
            match build_extension(id, &defaults, &groups, &points) {
                Some(ext) => extensions.push(ext),
                None => tracing::trace!(extension = id, "JA3: dropping extension"),
            }
        }
    }

    if grease {
        extensions.insert(0, TlsExtension::Grease);
        match extensions.last() {
            Some(last) if last.id() == PADDING => {
                let at = extensions.len() - 1;
                extensions.insert(at, TlsExtension::Grease);
            }
            _ => extensions.push(TlsExtension::Grease),
        }
    }

    let (min_version, max_version) = version_range(&extensions);

    Ok(ClientHelloSpec {
        legacy_version,
        cipher_suites,
        compression_methods: vec![0],
        extensions,
        min_version,
        max_version,
        permute_extensions: false,
    })
}

fn parse_list<T: std::str::FromStr>(field: &str, kind: Ja3Field) -> Result<Vec<T>, FormatError> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('-')
        .enumerate()
        .map(|(index, token)| {
            token
                .trim()
                .parse::<T>()
                .map_err(|_| FormatError::InvalidField { kind, index })
        })
        .collect()
}

fn build_extension(
    id: u16,
    defaults: &TlsDefaults,
    groups: &[u16],
    points: &[u8],
) -> Option<TlsExtension> {
    let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    Some(match id {
        0 => TlsExtension::ServerName,
        5 => TlsExtension::StatusRequest,
        10 if groups.is_empty() => return None,
        10 => TlsExtension::SupportedGroups(groups.to_vec()),
        11 if points.is_empty() => return None,
        11 => TlsExtension::EcPointFormats(points.to_vec()),
        13 => TlsExtension::SignatureAlgorithms(defaults.signature_algorithms.to_vec()),
        16 => TlsExtension::Alpn(strings(defaults.alpn)),
        17 => TlsExtension::StatusRequestV2,
        18 => TlsExtension::SignedCertificateTimestamp,
        21 => TlsExtension::Padding,
        22 => TlsExtension::EncryptThenMac,
        23 => TlsExtension::ExtendedMasterSecret,
        27 => TlsExtension::CompressCertificate(defaults.cert_compression.to_vec()),
        28 => TlsExtension::RecordSizeLimit(defaults.record_size_limit),
        34 => TlsExtension::DelegatedCredentials(defaults.delegated_credentials.to_vec()),
        35 => TlsExtension::SessionTicket,
        41 => TlsExtension::PreSharedKey,
        43 => TlsExtension::SupportedVersions(defaults.supported_versions.to_vec()),
        44 => TlsExtension::Cookie,
        45 => TlsExtension::PskKeyExchangeModes(defaults.psk_modes.to_vec()),
        49 => TlsExtension::PostHandshakeAuth,
        50 => TlsExtension::SignatureAlgorithmsCert(defaults.signature_algorithms.to_vec()),
        51 => TlsExtension::KeyShare(defaults.key_share.to_vec()),
        13172 => TlsExtension::NextProtocolNegotiation,
        17513 | 17613 => TlsExtension::ApplicationSettings {
            codepoint: id,
            protocols: strings(defaults.alps_protocols),
        },
        65037 => TlsExtension::EchGrease,
        65281 => TlsExtension::RenegotiationInfo,
        _ => return None,
    })
}

fn version_range(extensions: &[TlsExtension]) -> (u16, u16) {
    let versions: Vec<u16> = extensions
        .iter()
        .find_map(|e| match e {
            TlsExtension::SupportedVersions(v) => Some(v.clone()),
            _ => None,
        })
        .unwrap_or_default()
        .into_iter()
        .filter(|v| !is_grease(*v))
        .collect();
    match (versions.iter().min(), versions.iter().max()) {
        (Some(min), Some(max)) => (*min, *max),
        _ => (VERSION_TLS10, VERSION_TLS13),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::tls::VERSION_TLS12;

    const FIREFOX_JA3: &str = "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-34-18-51-43-13-45-28-27-65037,4588-29-23-24-25-256-257,0";
    const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17613-65037-21,4588-29-23-24,0";

    #[test]
    fn firefox_round_trips_exactly() {
        let spec = parse(FIREFOX_JA3, Browser::Firefox).unwrap();
        assert_eq!(spec.ja3_string(), FIREFOX_JA3);
        assert!(!spec.uses_grease());
        assert_eq!(spec.min_version, VERSION_TLS12);
        assert_eq!(spec.max_version, VERSION_TLS13);
    }

    #[test]
    fn chrome_gets_grease_around_padding() {
        let spec = parse(CHROME_JA3, Browser::Chrome).unwrap();
        assert_eq!(spec.cipher_suites[0], GREASE_PLACEHOLDER);
        assert_eq!(spec.extensions[0], TlsExtension::Grease);
        let n = spec.extensions.len();
        assert_eq!(spec.extensions[n - 2], TlsExtension::Grease);
        assert_eq!(spec.extensions[n - 1], TlsExtension::Padding);
        assert_eq!(
            spec.extensions.iter().find(|e| e.id() == 10),
            Some(&TlsExtension::SupportedGroups(vec![
                GREASE_PLACEHOLDER,
                4588,
                29,
                23,
                24
            ]))
        );
        assert_eq!(spec.ja3_string(), CHROME_JA3);
    }

    #[test]
    fn trailing_grease_goes_last_without_padding() {
        let spec = parse("771,4865,0-10,29,0", Browser::Edge).unwrap();
        assert_eq!(spec.extensions.last(), Some(&TlsExtension::Grease));
    }

    #[test]
    fn apple_and_firefox_builds_carry_no_grease() {
        for browser in [Browser::Safari, Browser::Ios, Browser::Firefox] {
            let spec = parse(CHROME_JA3, browser).unwrap();
            assert!(!spec.uses_grease(), "{}", browser);
            assert!(!spec.cipher_suites.iter().any(|c| is_grease(*c)), "{}", browser);
            assert!(!spec.extensions.contains(&TlsExtension::Grease), "{}", browser);
            let groups = spec.extensions.iter().find_map(|e| match e {
                TlsExtension::SupportedGroups(groups) => Some(groups.clone()),
                _ => None,
            });
            assert!(groups.is_some_and(|g| !g.iter().any(|c| is_grease(*c))), "{}", browser);
        }
    }

    #[test]
    fn grease_in_input_is_not_duplicated() {
        let spec = parse("771,2570-4865,2570-0-10,2570-29,0", Browser::Chrome).unwrap();
        assert_eq!(
            spec.cipher_suites
                .iter()
                .filter(|c| **c == GREASE_PLACEHOLDER)
                .count(),
            1
        );
        // no ec_point_formats extension in the list, so no point formats
        assert_eq!(spec.ja3_string(), "771,4865,0-10,29,");
    }

    #[test]
    fn empty_extension_field_still_emits_curves_and_points() {
        let spec = parse("771,4865,,29-23,0", Browser::Firefox).unwrap();
        assert_eq!(spec.extension_ids(), vec![10, 11]);
        assert_eq!(spec.min_version, VERSION_TLS10);
    }

    #[test]
    fn empty_curves_omit_the_extension() {
        let spec = parse("771,4865,0-10-11,,", Browser::Firefox).unwrap();
        assert_eq!(spec.extension_ids(), vec![0]);
    }

    #[test]
    fn unknown_extensions_are_dropped() {
        let spec = parse("771,4865,0-9999-23,29,0", Browser::Firefox).unwrap();
        assert_eq!(spec.extension_ids(), vec![0, 23]);
    }

    #[test]
    fn field_errors_name_kind_and_index() {
        assert!(matches!(
            parse("771,4865-4866,0-23,29", Browser::Chrome),
            Err(FormatError::InvalidFormat(_))
        ));
        assert_eq!(
            parse("771,4865-abc,0,29,0", Browser::Chrome),
            Err(FormatError::InvalidField {
                kind: Ja3Field::Cipher,
                index: 1
            })
        );
        assert_eq!(
            parse("771,4865,0,29,300", Browser::Chrome),
            Err(FormatError::InvalidField {
                kind: Ja3Field::PointFormat,
                index: 0
            })
        );
        assert_eq!(
            parse("tls,4865,0,29,0", Browser::Chrome),
            Err(FormatError::InvalidField {
                kind: Ja3Field::Version,
                index: 0
            })
        );
        assert!(matches!(
            parse("771,,0,29,0", Browser::Chrome),
            Err(FormatError::InvalidFormat(_))
        ));
    }
}
