//! Forged-leaf certificate cache and on-demand forging.
//!
//! For every intercepted TLS connection the client must be shown a leaf that
//! mimics the real server's certificate but chains to our own CA. Forged
//! leaves are cached by the original certificate's fingerprint (`fkcrt`);
//! operator-provided target certificates are matched by SNI pattern
//! (`tgcrt`) and take priority. All forged leaves share one key pair, so a
//! cache hit costs a map lookup, not a key generation.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, CrlDistributionPoint, DistinguishedName, DnType, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("failed to parse peer certificate: {0}")]
    X509(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid private key: {0}")]
    Key(String),
}

/// A leaf certificate ready to be served to an intercepted client: the leaf
/// plus our CA as its chain, the signing key, and bookkeeping for logging
/// and the SNI mismatch path.
pub struct ForgedLeaf {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SHA-256 fingerprint of the leaf, hex encoded.
    pub fingerprint: String,
    /// Comma-separated CN plus SAN list, for the connect log and CN rules.
    pub names: String,
    /// Preloaded target and default leaves are never re-forged on SNI
    /// mismatch.
    pub immutable: bool,
}

impl std::fmt::Debug for ForgedLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgedLeaf")
            .field("fingerprint", &self.fingerprint)
            .field("names", &self.names)
            .field("immutable", &self.immutable)
            .finish()
    }
}

/// SHA-256 fingerprint of a DER certificate, hex encoded.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// The CA used to sign forged leaves.
pub struct CertAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertAuthority {
    /// Load the CA key and rebuild the CA certificate from it. Holding the
    /// key is what matters for signing; the certificate itself is
    /// reconstructed with the same subject so the chain verifies against the
    /// PEM the operator distributed.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|source| CertError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        // The cert file must exist even though the key drives signing.
        let _cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;
        let key = KeyPair::from_pem(&key_pem)?;
        let cert = Self::ca_params().self_signed(&key)?;
        Ok(CertAuthority { cert, key })
    }

    /// Generate a fresh CA and write `ca-cert.pem` / `ca-key.pem` into
    /// `output_dir`.
    pub fn generate(output_dir: &Path) -> Result<(PathBuf, PathBuf), CertError> {
        std::fs::create_dir_all(output_dir).map_err(|source| CertError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let key = KeyPair::generate()?;
        let cert = Self::ca_params().self_signed(&key)?;

        let cert_path = output_dir.join("ca-cert.pem");
        let key_path = output_dir.join("ca-key.pem");
        std::fs::write(&cert_path, cert.pem()).map_err(|source| CertError::Io {
            path: cert_path.clone(),
            source,
        })?;
        std::fs::write(&key_path, key.serialize_pem()).map_err(|source| CertError::Io {
            path: key_path.clone(),
            source,
        })?;
        Ok((cert_path, key_path))
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "tlstap CA");
        dn.push(DnType::OrganizationName, "tlstap");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);
        params
    }

    pub fn der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert.der().to_vec())
    }
}

/// Shared certificate state: the CA, the shared leaf key, and the caches.
pub struct CertStore {
    authority: CertAuthority,
    /// One key pair for every forged leaf.
    leaf_key: KeyPair,
    leaf_key_der: Vec<u8>,
    /// Original-leaf fingerprint → forged leaf.
    forged: DashMap<String, Arc<ForgedLeaf>>,
    /// SNI pattern → operator-preloaded leaf.
    targets: DashMap<String, Arc<ForgedLeaf>>,
    default_leaf: Option<Arc<ForgedLeaf>>,
    /// `CAChain`: intermediates served between the forged leaf and our CA.
    extra_chain: Vec<CertificateDer<'static>>,
    crl_url: Option<String>,
}

impl CertStore {
    pub fn new(authority: CertAuthority, crl_url: Option<String>) -> Result<Self, CertError> {
        let leaf_key = KeyPair::generate()?;
        let leaf_key_der = leaf_key.serialize_der();
        Ok(CertStore {
            authority,
            leaf_key,
            leaf_key_der,
            forged: DashMap::new(),
            targets: DashMap::new(),
            default_leaf: None,
            extra_chain: Vec::new(),
            crl_url,
        })
    }

    /// Set the `CAChain` intermediates appended to every forged leaf.
    pub fn set_extra_chain(&mut self, certs: Vec<CertificateDer<'static>>) {
        self.extra_chain = certs;
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.authority.der()
    }

    /// Register an operator-provided leaf for an exact or wildcard SNI
    /// pattern. Target leaves are immutable.
    pub fn insert_target(&self, pattern: &str, leaf: Arc<ForgedLeaf>) {
        self.targets.insert(pattern.to_string(), leaf);
    }

    pub fn set_default_leaf(&mut self, leaf: Arc<ForgedLeaf>) {
        self.default_leaf = Some(leaf);
    }

    /// Select or forge the leaf for one connection.
    ///
    /// Lookup order: target by exact SNI, target by wildcarded SNI, cache or
    /// forge from the original peer certificate, default leaf. `None` means
    /// the connection cannot be intercepted and the engine must fall back to
    /// passthrough or terminate.
    pub fn leaf_for(
        &self,
        sni: Option<&str>,
        orig_der: Option<&[u8]>,
    ) -> Result<Option<Arc<ForgedLeaf>>, CertError> {
        if let Some(sni) = sni {
            if let Some(leaf) = self.targets.get(sni) {
                debug!(sni, "target cert by SNI");
                return Ok(Some(leaf.clone()));
            }
            if let Some(wildcarded) = wildcardify(sni) {
                if let Some(leaf) = self.targets.get(&wildcarded) {
                    debug!(sni, pattern = %wildcarded, "target cert by wildcarded SNI");
                    return Ok(Some(leaf.clone()));
                }
            }
        }

        if let Some(der) = orig_der {
            let fp = fingerprint(der);
            if let Some(leaf) = self.forged.get(&fp) {
                debug!(fingerprint = %fp, "certificate cache: HIT");
                return Ok(Some(leaf.clone()));
            }
            debug!(fingerprint = %fp, "certificate cache: MISS");
            let leaf = self.forge(der, sni)?;
            // Concurrent forgeries for the same original race benignly; the
            // last writer wins and the surplus leaf is dropped.
            self.forged.insert(fp, leaf.clone());
            return Ok(Some(leaf));
        }

        Ok(self.default_leaf.clone())
    }

    /// Forge a replacement for an observed SNI that the currently bound leaf
    /// does not cover, updating the cache entry for the original.
    pub fn reforge_for_name(
        &self,
        orig_der: &[u8],
        name: &str,
    ) -> Result<Arc<ForgedLeaf>, CertError> {
        let leaf = self.forge(orig_der, Some(name))?;
        self.forged.insert(fingerprint(orig_der), leaf.clone());
        Ok(leaf)
    }

    /// Forge a leaf mimicking `orig_der`: same subject, same validity, the
    /// original's SANs plus the SNI hostname, signed by our CA with the
    /// shared leaf key.
    pub fn forge(&self, orig_der: &[u8], sni: Option<&str>) -> Result<Arc<ForgedLeaf>, CertError> {
        let (_, orig) = X509Certificate::from_der(orig_der)
            .map_err(|e| CertError::X509(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = copy_subject(&orig);
        params.subject_alt_names = copy_sans(&orig)?;
        if let Some(sni) = sni {
            let covered = params.subject_alt_names.iter().any(|san| match san {
                SanType::DnsName(n) => n.as_str().eq_ignore_ascii_case(sni),
                _ => false,
            });
            if !covered {
                params
                    .subject_alt_names
                    .push(SanType::DnsName(sni.try_into().map_err(
                        |e: rcgen::Error| CertError::X509(e.to_string()),
                    )?));
            }
        }

        let validity = orig.validity();
        if let (Ok(nb), Ok(na)) = (
            time::OffsetDateTime::from_unix_timestamp(validity.not_before.timestamp()),
            time::OffsetDateTime::from_unix_timestamp(validity.not_after.timestamp()),
        ) {
            params.not_before = nb;
            params.not_after = na;
        }

        if let Some(url) = &self.crl_url {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: vec![url.clone()],
            }];
        }

        let cert = params.signed_by(&self.leaf_key, &self.authority.cert, &self.authority.key)?;
        let leaf_der = CertificateDer::from(cert.der().to_vec());
        let names = names_of(&leaf_der).unwrap_or_default();
        let key = PrivateKeyDer::try_from(self.leaf_key_der.clone())
            .map_err(|e| CertError::Key(e.to_string()))?;

        let mut chain = Vec::with_capacity(2 + self.extra_chain.len());
        chain.push(leaf_der);
        chain.extend(self.extra_chain.iter().cloned());
        chain.push(self.authority.der());

        Ok(Arc::new(ForgedLeaf {
            fingerprint: fingerprint(&chain[0]),
            names,
            chain,
            key,
            immutable: false,
        }))
    }
}

fn copy_subject(orig: &X509Certificate<'_>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    let subject = orig.subject();
    let mut push_all = |dn_type: DnType, iter: &mut dyn Iterator<Item = &x509_parser::x509::AttributeTypeAndValue>| {
        for attr in iter {
            if let Ok(value) = attr.as_str() {
                dn.push(dn_type.clone(), value);
            }
        }
    };
    push_all(DnType::CountryName, &mut subject.iter_country());
    push_all(DnType::StateOrProvinceName, &mut subject.iter_state_or_province());
    push_all(DnType::LocalityName, &mut subject.iter_locality());
    push_all(DnType::OrganizationName, &mut subject.iter_organization());
    push_all(DnType::OrganizationalUnitName, &mut subject.iter_organizational_unit());
    push_all(DnType::CommonName, &mut subject.iter_common_name());
    dn
}

fn copy_sans(orig: &X509Certificate<'_>) -> Result<Vec<SanType>, CertError> {
    let mut sans = Vec::new();
    let ext = orig
        .subject_alternative_name()
        .map_err(|e| CertError::X509(e.to_string()))?;
    if let Some(san) = ext {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    sans.push(SanType::DnsName((*dns).try_into().map_err(
                        |e: rcgen::Error| CertError::X509(e.to_string()),
                    )?));
                }
                GeneralName::IPAddress(bytes) => {
                    let ip = match bytes.len() {
                        4 => {
                            let octets: [u8; 4] = (*bytes)
                                .try_into()
                                .map_err(|_| CertError::X509("bad IPv4 SAN".into()))?;
                            Some(IpAddr::from(octets))
                        }
                        16 => {
                            let octets: [u8; 16] = (*bytes)
                                .try_into()
                                .map_err(|_| CertError::X509("bad IPv6 SAN".into()))?;
                            Some(IpAddr::from(octets))
                        }
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        sans.push(SanType::IpAddress(ip));
                    }
                }
                // Other name forms are not carried over.
                _ => {}
            }
        }
    }
    Ok(sans)
}

/// Comma-separated CN plus SAN list of a DER certificate.
pub fn names_of(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
    let mut names: Vec<String> = Vec::new();
    for cn in cert.subject().iter_common_name() {
        if let Ok(value) = cn.as_str() {
            names.push(value.to_string());
        }
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                let dns = dns.to_string();
                if !names.contains(&dns) {
                    names.push(dns);
                }
            }
        }
    }
    Some(names.join(","))
}

/// Whether any name in a comma-separated CN/SAN list covers `host`,
/// honouring leading wildcards.
pub fn names_match(names: &str, host: &str) -> bool {
    names.split(',').any(|name| {
        let name = name.trim();
        if name.eq_ignore_ascii_case(host) {
            return true;
        }
        if let Some(suffix) = name.strip_prefix("*.") {
            if let Some((_, rest)) = host.split_once('.') {
                return rest.eq_ignore_ascii_case(suffix);
            }
        }
        false
    })
}

/// Turn `host.example.com` into `*.example.com`. Hostnames without at least
/// two labels after the first cannot be wildcarded.
pub fn wildcardify(sni: &str) -> Option<String> {
    let (_, rest) = sni.split_once('.')?;
    if !rest.contains('.') {
        return None;
    }
    Some(format!("*.{rest}"))
}

/// Load one PEM file holding a leaf certificate (optionally with chain) and
/// its private key into a [`ForgedLeaf`]. Used for operator-preloaded target
/// certificates and the default leaf.
pub fn load_leaf_pem(path: &Path) -> Result<Arc<ForgedLeaf>, CertError> {
    let data = std::fs::read(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader: &[u8] = &data;

    let mut chain: Vec<CertificateDer<'static>> = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| CertError::Key(e.to_string()))? {
            rustls_pemfile::Item::X509Certificate(cert) => chain.push(cert),
            rustls_pemfile::Item::Pkcs8Key(k) => key = Some(k.into()),
            rustls_pemfile::Item::Pkcs1Key(k) => key = Some(k.into()),
            rustls_pemfile::Item::Sec1Key(k) => key = Some(k.into()),
            _ => {}
        }
    }
    let Some(first) = chain.first() else {
        return Err(CertError::Key(format!(
            "{} holds no certificate",
            path.display()
        )));
    };
    let Some(key) = key else {
        return Err(CertError::Key(format!(
            "{} holds no private key",
            path.display()
        )));
    };

    let names = names_of(first).unwrap_or_default();
    Ok(Arc::new(ForgedLeaf {
        fingerprint: fingerprint(first.as_ref()),
        names,
        chain,
        key,
        immutable: true,
    }))
}

/// Load the certificates of a PEM bundle, for the `CAChain` option.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let data = std::fs::read(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Key(e.to_string()))
}

/// Load every `*.pem` in a directory into the target-certificate cache. The
/// file stem is the SNI pattern the leaf is served for (`_` standing in for
/// the wildcard `*`, which most filesystems dislike).
pub fn load_target_dir(store: &CertStore, dir: &Path) -> Result<usize, CertError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CertError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut loaded = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "pem") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let pattern = stem.replace('_', "*");
        let leaf = load_leaf_pem(&path)?;
        debug!(pattern = %pattern, file = %path.display(), "target certificate loaded");
        store.insert_target(&pattern, leaf);
        loaded += 1;
    }
    Ok(loaded)
}

/// Build a leaf directly for a hostname, used for preloaded targets in tests
/// and for the default leaf.
pub fn self_signed_leaf(host: &str) -> Result<(CertificateDer<'static>, KeyPair), CertError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(
        host.try_into().map_err(|e: rcgen::Error| CertError::X509(e.to_string()))?,
    )];
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(1);
    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((CertificateDer::from(cert.der().to_vec()), key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_authority() -> CertAuthority {
        let key = KeyPair::generate().unwrap();
        let cert = CertAuthority::ca_params().self_signed(&key).unwrap();
        CertAuthority { cert, key }
    }

    fn store() -> CertStore {
        CertStore::new(test_authority(), None).unwrap()
    }

    fn original_with_sans(cn: &str, sans: &[&str]) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::OrganizationName, "Original Org");
        params.distinguished_name = dn;
        params.subject_alt_names = sans
            .iter()
            .map(|s| SanType::DnsName((*s).try_into().unwrap()))
            .collect();
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn test_forge_copies_subject_and_sans_and_adds_sni() {
        let store = store();
        let orig = original_with_sans("www.example.com", &["www.example.com", "example.com"]);
        let leaf = store.forge(&orig, Some("alt.example.com")).unwrap();

        let (_, parsed) = X509Certificate::from_der(leaf.chain[0].as_ref()).unwrap();
        let cn: Vec<_> = parsed
            .subject()
            .iter_common_name()
            .filter_map(|a| a.as_str().ok())
            .collect();
        assert_eq!(cn, vec!["www.example.com"]);

        assert!(names_match(&leaf.names, "www.example.com"));
        assert!(names_match(&leaf.names, "example.com"));
        assert!(names_match(&leaf.names, "alt.example.com"));

        // Issuer must be our CA.
        let issuer_cn: Vec<_> = parsed
            .issuer()
            .iter_common_name()
            .filter_map(|a| a.as_str().ok())
            .collect();
        assert_eq!(issuer_cn, vec!["tlstap CA"]);
    }

    #[test]
    fn test_cache_hit_returns_same_leaf() {
        let store = store();
        let orig = original_with_sans("cached.example", &["cached.example"]);
        let first = store
            .leaf_for(Some("cached.example"), Some(&orig))
            .unwrap()
            .unwrap();
        let second = store
            .leaf_for(Some("cached.example"), Some(&orig))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_target_cert_takes_priority() {
        let store = store();
        let (der, key) = self_signed_leaf("pinned.example").unwrap();
        let target = Arc::new(ForgedLeaf {
            fingerprint: fingerprint(der.as_ref()),
            names: "pinned.example".into(),
            chain: vec![der],
            key: PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
            immutable: true,
        });
        store.insert_target("pinned.example", target.clone());

        let orig = original_with_sans("pinned.example", &["pinned.example"]);
        let leaf = store
            .leaf_for(Some("pinned.example"), Some(&orig))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&leaf, &target));
        assert!(leaf.immutable);
    }

    #[test]
    fn test_target_cert_by_wildcard_pattern() {
        let store = store();
        let (der, key) = self_signed_leaf("*.wild.example").unwrap();
        let target = Arc::new(ForgedLeaf {
            fingerprint: fingerprint(der.as_ref()),
            names: "*.wild.example".into(),
            chain: vec![der],
            key: PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
            immutable: true,
        });
        store.insert_target("*.wild.example", target.clone());

        let leaf = store
            .leaf_for(Some("deep.wild.example"), None)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&leaf, &target));
    }

    #[test]
    fn test_no_material_yields_none_without_default() {
        let store = store();
        assert!(store.leaf_for(Some("nothing.example"), None).unwrap().is_none());
    }

    #[test]
    fn test_default_leaf_fallback() {
        let mut store = store();
        let (der, key) = self_signed_leaf("default.example").unwrap();
        let default = Arc::new(ForgedLeaf {
            fingerprint: fingerprint(der.as_ref()),
            names: "default.example".into(),
            chain: vec![der],
            key: PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
            immutable: true,
        });
        store.set_default_leaf(default.clone());
        let leaf = store.leaf_for(None, None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&leaf, &default));
    }

    #[test]
    fn test_wildcardify() {
        assert_eq!(
            wildcardify("host.example.com").as_deref(),
            Some("*.example.com")
        );
        assert_eq!(wildcardify("example.com"), None);
        assert_eq!(wildcardify("localhost"), None);
    }

    #[test]
    fn test_names_match() {
        assert!(names_match("a.example,b.example", "b.example"));
        assert!(names_match("*.example.com", "www.example.com"));
        assert!(!names_match("*.example.com", "deep.www.example.com"));
        assert!(!names_match("a.example", "b.example"));
    }

    #[test]
    fn test_forge_serves_configured_extra_chain() {
        let mut store = store();
        let (intermediate, _) = self_signed_leaf("intermediate.example").unwrap();
        store.set_extra_chain(vec![intermediate.clone()]);

        let orig = original_with_sans("chained.example", &["chained.example"]);
        let leaf = store.forge(&orig, None).unwrap();
        // leaf, configured intermediate, then our CA.
        assert_eq!(leaf.chain.len(), 3);
        assert_eq!(leaf.chain[1], intermediate);
    }

    #[test]
    fn test_load_target_dir_from_pem() {
        let dir = tempfile::tempdir().unwrap();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "pinned.example");
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName("pinned.example".try_into().unwrap())];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        std::fs::write(
            dir.path().join("pinned.example.pem"),
            format!("{}{}", cert.pem(), key.serialize_pem()),
        )
        .unwrap();
        // Not a PEM, must be skipped.
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let store = store();
        let loaded = load_target_dir(&store, dir.path()).unwrap();
        assert_eq!(loaded, 1);

        let leaf = store.leaf_for(Some("pinned.example"), None).unwrap().unwrap();
        assert!(leaf.immutable);
        assert!(names_match(&leaf.names, "pinned.example"));
    }

    #[test]
    fn test_target_dir_underscore_becomes_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "*.wild.example");
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        std::fs::write(
            dir.path().join("_.wild.example.pem"),
            format!("{}{}", cert.pem(), key.serialize_pem()),
        )
        .unwrap();

        let store = store();
        load_target_dir(&store, dir.path()).unwrap();
        let leaf = store.leaf_for(Some("deep.wild.example"), None).unwrap().unwrap();
        assert!(leaf.immutable);
    }

    #[test]
    fn test_reforge_updates_cache() {
        let store = store();
        let orig = original_with_sans("www.example.com", &["www.example.com"]);
        let first = store.leaf_for(None, Some(&orig)).unwrap().unwrap();
        assert!(!names_match(&first.names, "other.example.com"));

        let reforged = store.reforge_for_name(&orig, "other.example.com").unwrap();
        assert!(names_match(&reforged.names, "other.example.com"));

        // The cache now serves the re-forged leaf.
        let cached = store.leaf_for(None, Some(&orig)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&cached, &reforged));
    }
}
