//! Certificates for Windows desktop access
//!
//! Builds the smartcard logon credentials presented to Windows hosts, talks
//! to the certificate authority that signs them and sets up the TLS configs
//! used by the gateway listener.

pub mod authority;
pub mod cdp;
pub mod der;
pub mod identity;
pub mod issuer;
pub mod tls;

pub use authority::{
    AuthorityError, CertAuthType, CertAuthority, DesktopCertRequest, DesktopCertResponse,
    LocalAuthority,
};
pub use cdp::CrlLocation;
pub use identity::{AuthError, Identity, USAGE_WINDOWS_DESKTOP};
pub use issuer::{CredentialIssuer, IssuanceError, IssuedCredential, CREDENTIAL_TTL};
pub use tls::TlsConfigError;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}
