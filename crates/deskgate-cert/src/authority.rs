//! Certificate authority client
//!
//! The gateway never signs certificates itself. It hands a CSR, a CRL
//! distribution point and a TTL to an authority and gets a signed certificate
//! back, and it asks the same authority for the current CRL when publishing.
//!
//! [`LocalAuthority`] is a file-backed implementation for single-node
//! deployments and tests. It only accepts the extensions the gateway requests
//! (Extended Key Usage and Subject Alternative Name) and copies them verbatim.

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    CustomExtension, DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
    PublicKeyData, SerialNumber, SignatureAlgorithm,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::cri_attributes::ParsedCriAttribute;
use x509_parser::prelude::FromDer;

use crate::der::{self, OID_EXTENDED_KEY_USAGE, OID_SUBJECT_ALT_NAME};

/// The CRL is published once at startup, so make it last a year
const CRL_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_EC_P256: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
const OID_EC_P384: &[u64] = &[1, 3, 132, 0, 34];
const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_ED25519: &[u64] = &[1, 3, 101, 112];

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported key algorithm: {0}")]
    UnsupportedKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid CA material: {0}")]
    InvalidCa(String),

    #[error("Authority rejected the request: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for AuthorityError {
    fn from(e: rcgen::Error) -> Self {
        AuthorityError::Signing(e.to_string())
    }
}

/// Which CA a CRL is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertAuthType {
    /// CA that signs user certificates, including desktop credentials
    User,
    /// CA that signs host certificates
    Host,
}

impl std::fmt::Display for CertAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertAuthType::User => write!(f, "user"),
            CertAuthType::Host => write!(f, "host"),
        }
    }
}

/// Request for a short-lived desktop login certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopCertRequest {
    /// PEM encoded PKCS#10 request
    pub csr_pem: Vec<u8>,
    /// URI placed in the CRL distribution points extension
    pub crl_endpoint: String,
    /// Certificate lifetime
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopCertResponse {
    /// PEM encoded certificate
    pub cert_pem: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertAuthority: Send + Sync {
    /// Sign a desktop login certificate request
    async fn sign_desktop_cert(
        &self,
        req: DesktopCertRequest,
    ) -> Result<DesktopCertResponse, AuthorityError>;

    /// Return the current DER encoded CRL of a CA
    async fn generate_crl(&self, ca_type: CertAuthType) -> Result<Vec<u8>, AuthorityError>;
}

/// Subject public key taken from a CSR
struct RequestedKey {
    raw: Vec<u8>,
    alg: &'static SignatureAlgorithm,
}

impl PublicKeyData for RequestedKey {
    fn der_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn algorithm(&self) -> &SignatureAlgorithm {
        self.alg
    }
}

fn oid_arcs(oid: &x509_parser::der_parser::oid::Oid<'_>) -> Option<Vec<u64>> {
    oid.iter().map(|arcs| arcs.collect())
}

/// File-backed certificate authority
pub struct LocalAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    crl_number: AtomicU64,
}

impl LocalAuthority {
    /// Build an authority from a PEM encoded CA certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, AuthorityError> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| AuthorityError::InvalidCa(format!("CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| AuthorityError::InvalidCa(format!("CA certificate: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| AuthorityError::InvalidCa(e.to_string()))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
            crl_number: AtomicU64::new(1),
        })
    }

    /// Load the CA certificate and key from PEM files
    pub async fn load(cert_path: &str, key_path: &str) -> Result<Self, AuthorityError> {
        let cert_pem = tokio::fs::read_to_string(cert_path).await?;
        let key_pem = tokio::fs::read_to_string(key_path).await?;
        let authority = Self::from_pem(&cert_pem, &key_pem)?;
        info!("Certificate authority loaded from {} and {}", cert_path, key_path);
        Ok(authority)
    }

    /// Generate a fresh self-signed CA named after the cluster
    pub fn generate(cluster_name: &str) -> Result<Self, AuthorityError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cluster_name);
        dn.push(DnType::OrganizationName, "deskgate");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CA_VALIDITY;

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            crl_number: AtomicU64::new(1),
        })
    }

    /// PEM encoded CA certificate, for trust stores
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM encoded CA private key
    pub fn ca_key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }

    fn sign(&self, req: &DesktopCertRequest) -> Result<DesktopCertResponse, AuthorityError> {
        let (label_ok, csr_der) = match x509_parser::pem::parse_x509_pem(&req.csr_pem) {
            Ok((_, pem)) => (pem.label == "CERTIFICATE REQUEST", pem.contents),
            Err(_) => (true, req.csr_pem.clone()),
        };
        if !label_ok {
            return Err(AuthorityError::InvalidRequest(
                "expected a CERTIFICATE REQUEST PEM block".to_string(),
            ));
        }

        let (_, csr) = X509CertificationRequest::from_der(&csr_der)
            .map_err(|e| AuthorityError::InvalidRequest(e.to_string()))?;
        csr.verify_signature()
            .map_err(|e| AuthorityError::InvalidRequest(format!("bad signature: {}", e)))?;

        let info = &csr.certification_request_info;
        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| AuthorityError::InvalidRequest("missing common name".to_string()))?;

        let mut extensions = Vec::new();
        for attribute in info.attributes() {
            let ParsedCriAttribute::ExtensionRequest(request) = attribute.parsed_attribute()
            else {
                continue;
            };
            for ext in &request.extensions {
                let oid = oid_arcs(&ext.oid).ok_or_else(|| {
                    AuthorityError::InvalidRequest("extension OID out of range".to_string())
                })?;
                if oid != OID_EXTENDED_KEY_USAGE && oid != OID_SUBJECT_ALT_NAME {
                    return Err(AuthorityError::InvalidRequest(format!(
                        "extension {} not allowed",
                        der::format_oid(&oid)
                    )));
                }
                let mut custom = CustomExtension::from_oid_content(&oid, ext.value.to_vec());
                custom.set_criticality(ext.critical);
                extensions.push(custom);
            }
        }

        let spki = &info.subject_pki;
        let key_alg = oid_arcs(&spki.algorithm.algorithm).unwrap_or_default();
        let alg: &'static SignatureAlgorithm = match key_alg.as_slice() {
            OID_EC_PUBLIC_KEY => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| der::decode_oid(&params.data).ok())
                    .unwrap_or_default();
                match curve.as_slice() {
                    OID_EC_P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
                    OID_EC_P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
                    other => {
                        return Err(AuthorityError::UnsupportedKey(format!(
                            "EC curve {}",
                            der::format_oid(other)
                        )))
                    }
                }
            }
            OID_RSA_ENCRYPTION => &rcgen::PKCS_RSA_SHA256,
            OID_ED25519 => &rcgen::PKCS_ED25519,
            other => return Err(AuthorityError::UnsupportedKey(der::format_oid(other))),
        };
        let requested_key = RequestedKey {
            raw: spki.subject_public_key.data.to_vec(),
            alg,
        };

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + req.ttl;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.use_authority_key_identifier_extension = true;
        params.crl_distribution_points = vec![CrlDistributionPoint {
            uris: vec![req.crl_endpoint.clone()],
        }];
        params.custom_extensions = extensions;

        let cert = params.signed_by(&requested_key, &self.ca_cert, &self.ca_key)?;
        debug!(
            common_name = %common_name,
            ttl_secs = req.ttl.as_secs(),
            "Signed desktop certificate"
        );

        Ok(DesktopCertResponse {
            cert_pem: cert.pem().into_bytes(),
        })
    }
}

#[async_trait]
impl CertAuthority for LocalAuthority {
    async fn sign_desktop_cert(
        &self,
        req: DesktopCertRequest,
    ) -> Result<DesktopCertResponse, AuthorityError> {
        self.sign(&req)
    }

    async fn generate_crl(&self, ca_type: CertAuthType) -> Result<Vec<u8>, AuthorityError> {
        // A single CA backs both user and host certificates here
        let now = time::OffsetDateTime::now_utc();
        let crl_number = self.crl_number.fetch_add(1, Ordering::Relaxed);
        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + CRL_VALIDITY,
            crl_number: SerialNumber::from(crl_number),
            issuing_distribution_point: None,
            revoked_certs: vec![],
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&self.ca_cert, &self.ca_key)?;
        debug!(ca_type = %ca_type, crl_number, "Generated CRL");
        Ok(crl.der().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::{CertificateRevocationList, X509Certificate};

    fn request_for(key: &KeyPair, extensions: Vec<CustomExtension>) -> DesktopCertRequest {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "alice");
        params.distinguished_name = dn;
        params.custom_extensions = extensions;
        let csr = params.serialize_request(key).unwrap();
        DesktopCertRequest {
            csr_pem: csr.pem().unwrap().into_bytes(),
            crl_endpoint: "ldap:///CN=test?certificateRevocationList?base".to_string(),
            ttl: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn test_sign_copies_subject_and_extensions() {
        let authority = LocalAuthority::generate("test-cluster").unwrap();
        let key = KeyPair::generate().unwrap();
        let eku = der::extended_key_usage_value().unwrap();
        let req = request_for(
            &key,
            vec![CustomExtension::from_oid_content(
                OID_EXTENDED_KEY_USAGE,
                eku.clone(),
            )],
        );

        let resp = authority.sign_desktop_cert(req).await.unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&resp.cert_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "alice");
        assert!(cert
            .extensions()
            .iter()
            .any(|ext| ext.value == eku.as_slice()));

        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert_eq!(lifetime, 300);
    }

    #[tokio::test]
    async fn test_sign_rejects_unexpected_extensions() {
        let authority = LocalAuthority::generate("test-cluster").unwrap();
        let key = KeyPair::generate().unwrap();
        // basicConstraints must never be copied from a request
        let req = request_for(
            &key,
            vec![CustomExtension::from_oid_content(
                &[2, 5, 29, 19],
                vec![0x30, 0x03, 0x01, 0x01, 0xff],
            )],
        );

        let err = authority.sign_desktop_cert(req).await.unwrap_err();
        assert!(matches!(err, AuthorityError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_sign_rejects_garbage() {
        let authority = LocalAuthority::generate("test-cluster").unwrap();
        let req = DesktopCertRequest {
            csr_pem: b"not a csr".to_vec(),
            crl_endpoint: String::new(),
            ttl: Duration::from_secs(300),
        };
        assert!(matches!(
            authority.sign_desktop_cert(req).await,
            Err(AuthorityError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_crl_is_empty_and_long_lived() {
        let authority = LocalAuthority::generate("test-cluster").unwrap();
        let der = authority.generate_crl(CertAuthType::User).await.unwrap();
        let (_, crl) = CertificateRevocationList::from_der(&der).unwrap();

        assert_eq!(crl.iter_revoked_certificates().count(), 0);
        let next = crl.next_update().unwrap().timestamp();
        let this = crl.last_update().timestamp();
        assert_eq!(next - this, CRL_VALIDITY.as_secs() as i64);
    }

    #[tokio::test]
    async fn test_from_pem_round_trip() {
        let generated = LocalAuthority::generate("test-cluster").unwrap();
        let loaded =
            LocalAuthority::from_pem(generated.ca_cert_pem(), &generated.ca_key_pem()).unwrap();
        assert!(loaded.generate_crl(CertAuthType::User).await.is_ok());

        assert!(matches!(
            LocalAuthority::from_pem("garbage", &generated.ca_key_pem()),
            Err(AuthorityError::InvalidCa(_))
        ));
    }
}
