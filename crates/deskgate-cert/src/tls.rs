//! TLS configuration for the mTLS listener and the desktop relay

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::issuer::IssuedCredential;
use crate::Certificate;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Failed to parse certificate: {0}")]
    Certificate(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKey(String),

    #[error("No certificates found in {0}")]
    EmptyRoots(String),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Client verifier error: {0}")]
    Verifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a certificate chain and private key from PEM files
pub async fn load_certificate_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<Certificate, TlsConfigError> {
    let cert_pem = fs::read(cert_path).await?;
    let key_pem = fs::read(key_path).await?;

    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Certificate(e.to_string()))?;
    if cert_chain.is_empty() {
        return Err(TlsConfigError::Certificate(format!(
            "no certificate found in {}",
            cert_path
        )));
    }

    let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| TlsConfigError::PrivateKey(e.to_string()))?
        .ok_or_else(|| TlsConfigError::PrivateKey("No private key found in file".to_string()))?;

    info!("Certificate loaded from {} and {}", cert_path, key_path);

    Ok(Certificate {
        cert_chain,
        private_key,
    })
}

/// Build a root store from PEM encoded CA certificates
pub fn root_store_from_pem(pem: &[u8], source: &str) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| TlsConfigError::Certificate(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| TlsConfigError::Certificate(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(TlsConfigError::EmptyRoots(source.to_string()));
    }
    Ok(roots)
}

/// Load a root store from a PEM file
pub async fn load_root_store(path: &str) -> Result<RootCertStore, TlsConfigError> {
    let pem = fs::read(path).await?;
    root_store_from_pem(&pem, path)
}

/// Server config that requires a client certificate signed by `client_roots`
pub fn mtls_server_config(
    cert: Certificate,
    client_roots: RootCertStore,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let provider = provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider.clone())
        .build()
        .map_err(|e| TlsConfigError::Verifier(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert.cert_chain, cert.private_key)?;

    Ok(Arc::new(config))
}

/// Client config presenting an issued desktop credential
///
/// When `roots` is `None` the desktop's certificate is not verified. Windows
/// hosts typically serve RDP with a self-signed certificate.
pub fn credential_client_config(
    credential: &IssuedCredential,
    roots: Option<RootCertStore>,
) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match roots {
        Some(roots) => builder.with_root_certificates(roots),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider })),
    };

    let chain = vec![CertificateDer::from(credential.cert_der.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(credential.key_der.clone()));
    let config = builder.with_client_auth_cert(chain, key)?;

    Ok(Arc::new(config))
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        warn!(server = ?server_name, "Skipping desktop certificate verification");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
