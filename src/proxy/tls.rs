//! TLS legs of an intercepted connection.
//!
//! The client-facing leg serves a forged leaf through a certificate
//! resolver that can re-forge in place when the ClientHello carries an SNI
//! the bound leaf does not cover. The upstream leg optionally verifies the
//! real server and always exposes its certificate for forging.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::detect::{self, HelloScan};
use crate::cert::{names_match, CertStore, ForgedLeaf};
use crate::config::{ConnOpts, SslProto};
use crate::logging::MasterKeyLog;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("certificate error: {0}")]
    Cert(#[from] crate::cert::CertError),
    #[error("unusable key for TLS: {0}")]
    Key(rustls::Error),
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
    #[error("no TLS protocol version left enabled")]
    NoVersions,
    #[error("invalid client certificate material: {0}")]
    ClientAuth(String),
    #[error("client did not send a TLS ClientHello")]
    NotTls,
    #[error("gave up waiting for a complete ClientHello")]
    HelloTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of peeking the first client bytes for a ClientHello.
pub async fn peek_sni(stream: &TcpStream) -> Result<Option<String>, TlsSetupError> {
    let mut buf = [0u8; detect::PEEK_SIZE];
    let mut retries = 0u32;
    loop {
        let n = stream.peek(&mut buf).await?;
        match detect::parse_client_hello(&buf[..n]) {
            HelloScan::Hello { sni } => return Ok(sni),
            HelloScan::NotTls => return Err(TlsSetupError::NotTls),
            HelloScan::Truncated => {
                retries += 1;
                if retries > detect::SNI_PEEK_RETRIES {
                    warn!("giving up on truncated ClientHello after {retries} peeks");
                    return Err(TlsSetupError::HelloTimeout);
                }
                tokio::time::sleep(detect::SNI_PEEK_DELAY).await;
            }
        }
    }
}

fn certified_key(leaf: &ForgedLeaf) -> Result<Arc<CertifiedKey>, TlsSetupError> {
    let signing_key = ring_provider::sign::any_supported_type(&leaf.key.clone_key())
        .map_err(TlsSetupError::Key)?;
    Ok(Arc::new(CertifiedKey::new(leaf.chain.clone(), signing_key)))
}

/// Serves the forged leaf and re-forges when the observed SNI is not
/// covered, the leaf is not immutable, and policy allows wrong hosts.
pub struct LeafResolver {
    store: Arc<CertStore>,
    orig_der: Option<Vec<u8>>,
    allow_wrong_host: bool,
    leaf: Mutex<(Arc<ForgedLeaf>, Arc<CertifiedKey>)>,
}

impl LeafResolver {
    pub fn new(
        store: Arc<CertStore>,
        leaf: Arc<ForgedLeaf>,
        orig_der: Option<Vec<u8>>,
        allow_wrong_host: bool,
    ) -> Result<Arc<Self>, TlsSetupError> {
        let key = certified_key(&leaf)?;
        Ok(Arc::new(LeafResolver {
            store,
            orig_der,
            allow_wrong_host,
            leaf: Mutex::new((leaf, key)),
        }))
    }

    /// Leaf currently bound, for post-handshake logging.
    pub fn current_leaf(&self) -> Arc<ForgedLeaf> {
        match self.leaf.lock() {
            Ok(guard) => guard.0.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }
}

impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("allow_wrong_host", &self.allow_wrong_host)
            .finish()
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let mut guard = match self.leaf.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(name) = client_hello.server_name() {
            let (leaf, _) = &*guard;
            if self.allow_wrong_host && !leaf.immutable && !names_match(&leaf.names, name) {
                if let Some(orig) = &self.orig_der {
                    debug!(sni = name, "certificate cache: UPDATE (SNI mismatch)");
                    match self.store.reforge_for_name(orig, name) {
                        Ok(new_leaf) => match certified_key(&new_leaf) {
                            Ok(key) => *guard = (new_leaf, key),
                            Err(e) => warn!("re-forged leaf unusable: {e}"),
                        },
                        Err(e) => warn!("re-forge for {name} failed: {e}"),
                    }
                }
            }
        }
        Some(guard.1.clone())
    }
}

fn enabled_versions(
    opts: &ConnOpts,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsSetupError> {
    let keep = |proto: SslProto| -> bool {
        if let Some(forced) = opts.force_ssl_proto {
            return proto == forced;
        }
        if opts.disabled_ssl_protos.contains(&proto) {
            return false;
        }
        if !opts.enabled_ssl_protos.is_empty() && !opts.enabled_ssl_protos.contains(&proto) {
            return false;
        }
        if let Some(min) = opts.min_ssl_proto {
            if proto < min {
                return false;
            }
        }
        if let Some(max) = opts.max_ssl_proto {
            if proto > max {
                return false;
            }
        }
        true
    };

    let mut versions = Vec::new();
    if keep(SslProto::Tls12) {
        versions.push(&rustls::version::TLS12);
    }
    if keep(SslProto::Tls13) {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        return Err(TlsSetupError::NoVersions);
    }
    Ok(versions)
}

/// Build the client-facing TLS server config around a leaf resolver.
pub fn server_config(
    resolver: Arc<LeafResolver>,
    opts: &ConnOpts,
    key_log: Option<Arc<MasterKeyLog>>,
) -> Result<ServerConfig, TlsSetupError> {
    let versions = enabled_versions(opts)?;
    let mut config = ServerConfig::builder_with_protocol_versions(&versions)
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    if let Some(log) = key_log {
        config.key_log = log;
    }
    Ok(config)
}

/// Accepts any server certificate; interception must observe servers whose
/// certificates would never verify, and the operator opted out of
/// verification.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_provider::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Load the `ClientCert` / `ClientKey` pair for upstream client
/// authentication, when both are configured.
fn load_client_auth(
    opts: &ConnOpts,
) -> Result<
    Option<(
        Vec<rustls::pki_types::CertificateDer<'static>>,
        rustls::pki_types::PrivateKeyDer<'static>,
    )>,
    TlsSetupError,
> {
    let (Some(cert_path), Some(key_path)) = (&opts.client_cert, &opts.client_key) else {
        return Ok(None);
    };
    let cert_data = std::fs::read(cert_path)?;
    let chain = rustls_pemfile::certs(&mut cert_data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsSetupError::ClientAuth(e.to_string()))?;
    if chain.is_empty() {
        return Err(TlsSetupError::ClientAuth(format!(
            "{} holds no certificate",
            cert_path.display()
        )));
    }
    let key_data = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_data.as_slice())
        .map_err(|e| TlsSetupError::ClientAuth(e.to_string()))?
        .ok_or_else(|| {
            TlsSetupError::ClientAuth(format!("{} holds no private key", key_path.display()))
        })?;
    Ok(Some((chain, key)))
}

/// Build the upstream TLS client config. With `VerifyPeer` off the upstream
/// certificate is accepted unconditionally; either way it is captured after
/// the handshake for forging. A configured `ClientCert`/`ClientKey` pair is
/// presented to servers that request client authentication.
pub fn client_config(
    opts: &ConnOpts,
    key_log: Option<Arc<MasterKeyLog>>,
) -> Result<ClientConfig, TlsSetupError> {
    let versions = enabled_versions(opts)?;
    let client_auth = load_client_auth(opts)?;
    let builder = ClientConfig::builder_with_protocol_versions(&versions);
    let mut config = if opts.verify_peer {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let builder = builder.with_root_certificates(roots);
        match client_auth {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
        match client_auth {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        }
    };
    if let Some(log) = key_log {
        config.key_log = log;
    }
    Ok(config)
}

/// `version:cipher` of an established rustls connection, for the connect
/// log.
pub fn negotiated_info(conn: &rustls::CommonState) -> Option<String> {
    let version = conn.protocol_version()?;
    let suite = conn.negotiated_cipher_suite()?;
    Some(format!("{version:?}:{:?}", suite.suite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_versions_default_both() {
        let opts = ConnOpts::default();
        assert_eq!(enabled_versions(&opts).unwrap().len(), 2);
    }

    #[test]
    fn test_force_proto_narrows_to_one() {
        let mut opts = ConnOpts::default();
        opts.force_ssl_proto = Some(SslProto::Tls13);
        let versions = enabled_versions(&opts).unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn test_client_auth_material_is_loaded() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let (cert_der, key) = crate::cert::self_signed_leaf("client.example").unwrap();
        let cert_path = dir.path().join("client-cert.pem");
        let key_path = dir.path().join("client-key.pem");
        let pem = pem_encode_cert(cert_der.as_ref());
        std::fs::write(&cert_path, pem).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        let mut opts = ConnOpts::default();
        opts.client_cert = Some(cert_path.clone());
        opts.client_key = Some(key_path);
        let loaded = load_client_auth(&opts).unwrap();
        assert!(loaded.is_some());
        assert!(client_config(&opts, None).is_ok());

        // A cert without its key is not client auth.
        let mut opts = ConnOpts::default();
        opts.client_cert = Some(cert_path.clone());
        assert!(load_client_auth(&opts).unwrap().is_none());

        // Garbage material is rejected.
        let bogus = dir.path().join("bogus.pem");
        std::fs::write(&bogus, "not a key").unwrap();
        let mut opts = ConnOpts::default();
        opts.client_cert = Some(cert_path);
        opts.client_key = Some(bogus);
        assert!(matches!(
            load_client_auth(&opts),
            Err(TlsSetupError::ClientAuth(_))
        ));
    }

    fn pem_encode_cert(der: &[u8]) -> String {
        use base64::Engine;
        let body = base64::engine::general_purpose::STANDARD.encode(der);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for chunk in body.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).unwrap());
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    #[test]
    fn test_min_max_and_disable() {
        let mut opts = ConnOpts::default();
        opts.min_ssl_proto = Some(SslProto::Tls13);
        assert_eq!(enabled_versions(&opts).unwrap().len(), 1);

        let mut opts = ConnOpts::default();
        opts.disabled_ssl_protos = vec![SslProto::Tls12, SslProto::Tls13];
        assert!(matches!(
            enabled_versions(&opts),
            Err(TlsSetupError::NoVersions)
        ));

        // A floor of TLS 1.0 with a ceiling below 1.2 leaves nothing rustls
        // can negotiate.
        let mut opts = ConnOpts::default();
        opts.max_ssl_proto = Some(SslProto::Tls11);
        assert!(matches!(
            enabled_versions(&opts),
            Err(TlsSetupError::NoVersions)
        ));
    }
}
