//! Caller identity from a verified client certificate

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Client did not present a certificate")]
    NoClientCertificate,

    #[error("Invalid client certificate: {0}")]
    InvalidCertificate(String),

    #[error("Client certificate has no username")]
    MissingUsername,

    #[error("Client certificate usage {0:?} is not accepted")]
    UsageNotAllowed(Vec<String>),
}

/// Usage carried by certificates restricted to Windows desktop access
pub const USAGE_WINDOWS_DESKTOP: &str = "usage:windows_desktop";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject common name
    pub username: String,
    /// Usage restrictions from the subject organizational units
    pub usage: Vec<String>,
}

impl Identity {
    /// Derive the identity from the peer chain of a completed handshake
    ///
    /// The chain has already been verified against the client CA, so only
    /// the leaf is inspected. With a non-empty `accepted_usage` the leaf must
    /// be restricted to usages from that list; an unrestricted certificate is
    /// rejected.
    pub fn from_peer_certificates(
        certs: Option<&[CertificateDer<'_>]>,
        accepted_usage: &[String],
    ) -> Result<Self, AuthError> {
        let leaf = certs
            .and_then(|chain| chain.first())
            .ok_or(AuthError::NoClientCertificate)?;
        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| AuthError::InvalidCertificate(e.to_string()))?;

        let subject = cert.subject();
        let username = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .ok_or(AuthError::MissingUsername)?
            .to_string();
        let usage: Vec<String> = subject
            .iter_organizational_unit()
            .filter_map(|ou| ou.as_str().ok())
            .map(str::to_string)
            .collect();

        if !accepted_usage.is_empty()
            && (usage.is_empty() || !usage.iter().all(|u| accepted_usage.contains(u)))
        {
            return Err(AuthError::UsageNotAllowed(usage));
        }

        Ok(Self { username, usage })
    }
}
