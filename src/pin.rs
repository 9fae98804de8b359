//! SPKI certificate pinning.
//!
//! A pin is `base64(SHA-256(SubjectPublicKeyInfo DER))`. Hosts without pins
//! accept any chain; hosts with pins need at least one presented certificate
//! whose digest is in the set.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use boring::ssl::SslRef;
use boring::x509::{X509Ref, X509};

use crate::error::{Error, Result};

/// Digest of a certificate's public key, in pin format.
pub fn spki_digest(cert: &X509Ref) -> Result<String> {
    let der = cert
        .public_key()
        .and_then(|key| key.public_key_to_der())
        .map_err(|e| Error::handshake(format!("failed to encode SPKI: {}", e)))?;
    Ok(STANDARD.encode(boring::sha::sha256(&der)))
}

/// Certificates the peer presented in a finished TLS handshake, leaf first.
pub fn presented_certificates(ssl: &SslRef) -> Vec<X509> {
    let mut certs: Vec<X509> = ssl
        .peer_cert_chain()
        .map(|chain| chain.iter().map(|cert| cert.to_owned()).collect())
        .unwrap_or_default();
    if certs.is_empty() {
        certs.extend(ssl.peer_certificate());
    }
    certs
}

/// Set of accepted SPKI digests for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: HashSet<String>,
}

impl PinSet {
    pub fn new<I, S>(pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pins: pins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn contains(&self, pin: &str) -> bool {
        self.pins.contains(pin)
    }

    pub fn insert(&mut self, pin: impl Into<String>) {
        self.pins.insert(pin.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.pins.iter().map(String::as_str)
    }
}

/// Concurrent `host:port -> PinSet` map.
///
/// Reads dominate (one per handshake), so lookups take a shared lock.
#[derive(Debug, Default)]
pub struct PinStore {
    hosts: RwLock<HashMap<String, PinSet>>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pin set for `host_port`.
    pub fn add_host(&self, host_port: &str, pins: PinSet) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.insert(host_port.to_string(), pins);
    }

    /// Merge pins into the existing set for `host_port`.
    pub fn add_pins<I, S>(&self, host_port: &str, pins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        let set = hosts.entry(host_port.to_string()).or_default();
        for pin in pins {
            set.insert(pin);
        }
    }

    /// Empty the pin set for `host_port`; any chain is accepted afterwards.
    pub fn clear_host(&self, host_port: &str) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.remove(host_port);
    }

    pub fn pins(&self, host_port: &str) -> Option<PinSet> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(host_port).cloned()
    }

    /// True iff the host has no pins or one presented certificate matches.
    pub fn verify<'a, I>(&self, chain: I, host_port: &str) -> bool
    where
        I: IntoIterator<Item = &'a X509Ref>,
    {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        let set = match hosts.get(host_port) {
            Some(set) if !set.is_empty() => set,
            _ => return true,
        };
        chain.into_iter().any(|cert| match spki_digest(cert) {
            Ok(digest) => set.contains(&digest),
            Err(e) => {
                tracing::debug!(host = host_port, error = %e, "Pin: skipping certificate");
                false
            }
        })
    }

    /// [`verify`](Self::verify) as a `Result`, failing with `PinMismatch`.
    pub fn check<'a, I>(&self, chain: I, host_port: &str) -> Result<()>
    where
        I: IntoIterator<Item = &'a X509Ref>,
    {
        if self.verify(chain, host_port) {
            Ok(())
        } else {
            tracing::warn!(host = host_port, "Pin: no presented certificate matched");
            Err(Error::PinMismatch {
                host: host_port.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boring::asn1::Asn1Time;
    use boring::bn::BigNum;
    use boring::ec::{EcGroup, EcKey};
    use boring::hash::MessageDigest;
    use boring::nid::Nid;
    use boring::pkey::PKey;
    use boring::x509::{X509NameBuilder, X509};

    fn self_signed(cn: &str) -> X509 {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    #[test]
    fn unpinned_hosts_accept_anything() {
        let store = PinStore::new();
        let cert = self_signed("a.test");
        assert!(store.verify([&*cert], "a.test:443"));
    }

    #[test]
    fn matching_digest_verifies() {
        let store = PinStore::new();
        let cert = self_signed("a.test");
        let pin = spki_digest(&cert).unwrap();
        assert_eq!(pin.len(), 44);
        store.add_host("a.test:443", PinSet::new([pin]));
        assert!(store.verify([&*cert], "a.test:443"));
        assert!(store.check([&*cert], "a.test:443").is_ok());
    }

    #[test]
    fn unrelated_digest_fails_until_cleared() {
        let store = PinStore::new();
        let cert = self_signed("a.test");
        let other = self_signed("b.test");
        store.add_host("a.test:443", PinSet::new([spki_digest(&other).unwrap()]));

        assert!(!store.verify([&*cert], "a.test:443"));
        assert!(matches!(
            store.check([&*cert], "a.test:443"),
            Err(Error::PinMismatch { .. })
        ));

        store.clear_host("a.test:443");
        assert!(store.verify([&*cert], "a.test:443"));
    }

    #[test]
    fn add_pins_merges() {
        let store = PinStore::new();
        store.add_pins("h:443", ["one"]);
        store.add_pins("h:443", ["two"]);
        let pins = store.pins("h:443").unwrap();
        assert_eq!(pins.len(), 2);
        assert!(pins.contains("one") && pins.contains("two"));

        store.add_host("h:443", PinSet::new(["three"]));
        assert_eq!(store.pins("h:443").unwrap().len(), 1);
    }
}
