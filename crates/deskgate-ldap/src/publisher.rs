//! Publishes the cluster CRL into Active Directory
//!
//! Windows validates smartcard certificates against the CRL named in their
//! distribution point extension, so the entry must exist before the first
//! login or every login is rejected as unverifiable.

use deskgate_cert::cdp::{CONTAINER_OBJECT_CLASS, CRL_ATTRIBUTE, CRL_OBJECT_CLASS};
use deskgate_cert::{AuthorityError, CertAuthType, CertAuthority, CrlLocation};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{LdapClient, LdapConnector, LdapError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to fetch CRL: {0}")]
    Crl(#[from] AuthorityError),

    #[error(transparent)]
    Ldap(#[from] LdapError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The CRL entry did not exist and was created
    Created,
    /// The CRL entry existed and its payload was replaced
    Updated,
}

/// Upserts the cluster CRL entry for a domain
pub struct RevocationPublisher {
    authority: Arc<dyn CertAuthority>,
    connector: Arc<dyn LdapConnector>,
    cluster_name: String,
}

impl RevocationPublisher {
    pub fn new(
        authority: Arc<dyn CertAuthority>,
        connector: Arc<dyn LdapConnector>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            connector,
            cluster_name: cluster_name.into(),
        }
    }

    /// Fetch the current user CA CRL and write it to `domain`
    ///
    /// Safe to call repeatedly. Opens a fresh directory session per call.
    pub async fn publish(&self, domain: &str) -> Result<PublishOutcome, PublishError> {
        let crl = self.authority.generate_crl(CertAuthType::User).await?;
        let location = CrlLocation::new(&self.cluster_name, domain);

        let mut client = self.connector.connect().await?;
        let outcome = upsert(client.as_mut(), &location, crl).await;
        if let Err(e) = client.close().await {
            debug!("Failed to close LDAP session: {}", e);
        }
        let outcome = outcome?;

        info!(dn = %location.dn, outcome = ?outcome, "Published CRL to LDAP");
        Ok(outcome)
    }
}

async fn upsert(
    client: &mut dyn LdapClient,
    location: &CrlLocation,
    crl: Vec<u8>,
) -> Result<PublishOutcome, LdapError> {
    match client
        .add(
            &location.parent_dn,
            vec![(
                "objectClass".to_string(),
                vec![CONTAINER_OBJECT_CLASS.as_bytes().to_vec()],
            )],
        )
        .await
    {
        Ok(()) => debug!(dn = %location.parent_dn, "Created CRL container"),
        Err(e) if e.is_already_exists() => {
            debug!(dn = %location.parent_dn, "CRL container already exists")
        }
        Err(e) => return Err(e),
    }

    let attributes = vec![
        (
            "objectClass".to_string(),
            vec![CRL_OBJECT_CLASS.as_bytes().to_vec()],
        ),
        (CRL_ATTRIBUTE.to_string(), vec![crl.clone()]),
    ];
    match client.add(&location.dn, attributes).await {
        Ok(()) => Ok(PublishOutcome::Created),
        Err(e) if e.is_already_exists() => {
            client.replace(&location.dn, CRL_ATTRIBUTE, vec![crl]).await?;
            Ok(PublishOutcome::Updated)
        }
        Err(e) => Err(e),
    }
}
