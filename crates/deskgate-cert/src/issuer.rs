//! Short-lived desktop login credentials
//!
//! Windows smartcard logon accepts an X.509 certificate when it carries the
//! Smartcard Logon extended key usage and the user's UPN as a Subject
//! Alternative Name. The issuer generates a fresh key for every login, asks
//! the authority to sign a request carrying both extensions and hands the
//! certificate and key back in DER form.

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::authority::{AuthorityError, CertAuthority, DesktopCertRequest};
use crate::cdp::CrlLocation;
use crate::der::{self, DerError, OID_EXTENDED_KEY_USAGE, OID_SUBJECT_ALT_NAME};

/// Validity of a desktop login certificate
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("Invalid principal {0:?}")]
    InvalidPrincipal(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Failed to encode extension: {0}")]
    Encoding(#[from] DerError),

    #[error("Failed to build certificate request: {0}")]
    Request(String),

    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("Authority returned an unusable certificate: {0}")]
    InvalidCertificate(String),
}

/// A signed certificate and its private key
#[derive(Clone)]
pub struct IssuedCredential {
    /// DER encoded certificate
    pub cert_der: Vec<u8>,
    /// PKCS#8 DER encoded private key
    pub key_der: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("cert_der", &format_args!("{} bytes", self.cert_der.len()))
            .field("key_der", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues desktop login credentials through a [`CertAuthority`]
#[derive(Clone)]
pub struct CredentialIssuer {
    authority: Arc<dyn CertAuthority>,
    cluster_name: String,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(authority: Arc<dyn CertAuthority>, cluster_name: impl Into<String>) -> Self {
        Self {
            authority,
            cluster_name: cluster_name.into(),
            ttl: CREDENTIAL_TTL,
        }
    }

    /// Issue a credential for `principal` logging into `domain`
    pub async fn issue(
        &self,
        principal: &str,
        domain: &str,
    ) -> Result<IssuedCredential, IssuanceError> {
        validate_principal(principal)?;

        let key_pair =
            KeyPair::generate().map_err(|e| IssuanceError::KeyGeneration(e.to_string()))?;
        let csr_pem = build_request(principal, domain, &key_pair)?;
        let crl_endpoint = CrlLocation::new(&self.cluster_name, domain).distribution_point_uri();

        let issued_at = Utc::now();
        let response = self
            .authority
            .sign_desktop_cert(DesktopCertRequest {
                csr_pem: csr_pem.into_bytes(),
                crl_endpoint,
                ttl: self.ttl,
            })
            .await?;
        let cert_der = decode_certificate(&response.cert_pem)?;

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| IssuanceError::Request(e.to_string()))?;
        debug!(principal = %principal, domain = %domain, "Issued desktop credential");

        Ok(IssuedCredential {
            cert_der,
            key_der: key_pair.serialize_der(),
            expires_at: issued_at + ttl,
        })
    }
}

/// The UPN is `principal@domain`, so a principal must not smuggle in its own
/// domain part
fn validate_principal(principal: &str) -> Result<(), IssuanceError> {
    if principal.is_empty()
        || principal.contains('@')
        || principal.chars().any(|c| c.is_control())
    {
        return Err(IssuanceError::InvalidPrincipal(principal.to_string()));
    }
    Ok(())
}

/// Build a PEM encoded certificate request with the smartcard logon
/// extensions
pub fn build_request(
    principal: &str,
    domain: &str,
    key_pair: &KeyPair,
) -> Result<String, IssuanceError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, principal);
    params.distinguished_name = dn;

    let upn = format!("{}@{}", principal, domain);
    params.custom_extensions = vec![
        CustomExtension::from_oid_content(OID_EXTENDED_KEY_USAGE, der::extended_key_usage_value()?),
        CustomExtension::from_oid_content(
            OID_SUBJECT_ALT_NAME,
            der::upn_subject_alt_name_value(&upn)?,
        ),
    ];

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| IssuanceError::Request(e.to_string()))?;
    csr.pem().map_err(|e| IssuanceError::Request(e.to_string()))
}

/// Decode the authority's certificate, accepting PEM or raw DER
fn decode_certificate(encoded: &[u8]) -> Result<Vec<u8>, IssuanceError> {
    if encoded.first() == Some(&der::TAG_SEQUENCE) {
        return Ok(encoded.to_vec());
    }
    let cert = rustls_pemfile::certs(&mut &encoded[..])
        .next()
        .ok_or_else(|| IssuanceError::InvalidCertificate("no certificate found".to_string()))?
        .map_err(|e| IssuanceError::InvalidCertificate(e.to_string()))?;
    Ok(cert.as_ref().to_vec())
}
