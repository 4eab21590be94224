//! Self-signed certificate generation and TLS server material.
//!
//! When the config names no certificate, a self-signed one is generated
//! under `sbrwxmpp-certs/` with the configured domain as its common name.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// Certificate generation and loading errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation: {0}")]
    Generate(#[from] rcgen::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Generate a self-signed server certificate for `cn`, writing
/// `<dir>/<cn>.crt` and `<dir>/<cn>.key` in PEM form. The certificate is
/// valid for 3650 days with a server-auth EKU.
pub fn generate_certificate(dir: &Path, cn: &str) -> Result<(), CertError> {
    let mut params = CertificateParams::new(vec![cn.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = IsCa::ExplicitNoCa;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(3650);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    fs::write(dir.join(format!("{cn}.crt")), cert.pem())?;
    fs::write(dir.join(format!("{cn}.key")), key_pair.serialize_pem())?;
    Ok(())
}

/// Install the process-wide rustls crypto provider. Idempotent; required
/// before any TLS configuration is built.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build a TLS acceptor from PEM certificate and key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, CertError> {
    init_crypto_provider();
    let certs = rustls_pemfile::certs(&mut BufReader::new(fs::File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(fs::File::open(key_path)?))?
        .ok_or_else(|| CertError::NoKey(key_path.display().to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
