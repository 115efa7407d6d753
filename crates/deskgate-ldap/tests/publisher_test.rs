//! CRL publishing against an in-memory directory

use async_trait::async_trait;
use deskgate_cert::{AuthorityError, CertAuthType, CertAuthority, DesktopCertRequest, DesktopCertResponse};
use deskgate_ldap::{
    Attribute, InMemoryLdap, LdapClient, LdapConnector, LdapError, PublishError, PublishOutcome,
    RevocationPublisher,
};
use std::sync::{Arc, Mutex};

const ENTRY_DN: &str = "CN=mycluster,CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration,DC=example,DC=com";
const PARENT_DN: &str = "CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration,DC=example,DC=com";

/// Authority returning whatever CRL bytes the test sets
struct FakeAuthority {
    crl: Mutex<Vec<u8>>,
}

impl FakeAuthority {
    fn new(crl: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            crl: Mutex::new(crl.to_vec()),
        })
    }

    fn set_crl(&self, crl: &[u8]) {
        *self.crl.lock().unwrap() = crl.to_vec();
    }
}

#[async_trait]
impl CertAuthority for FakeAuthority {
    async fn sign_desktop_cert(
        &self,
        _req: DesktopCertRequest,
    ) -> Result<DesktopCertResponse, AuthorityError> {
        Err(AuthorityError::Rejected("not used".to_string()))
    }

    async fn generate_crl(&self, ca_type: CertAuthType) -> Result<Vec<u8>, AuthorityError> {
        assert_eq!(ca_type, CertAuthType::User);
        Ok(self.crl.lock().unwrap().clone())
    }
}

/// Directory that fails every add with a non-recoverable error
struct BrokenLdap;

#[async_trait]
impl LdapConnector for BrokenLdap {
    async fn connect(&self) -> Result<Box<dyn LdapClient>, LdapError> {
        Ok(Box::new(BrokenLdap))
    }
}

#[async_trait]
impl LdapClient for BrokenLdap {
    async fn add(&mut self, dn: &str, _attributes: Vec<Attribute>) -> Result<(), LdapError> {
        Err(LdapError::Operation {
            op: "add",
            dn: dn.to_string(),
            message: "insufficient access rights".to_string(),
        })
    }

    async fn replace(&mut self, dn: &str, _: &str, _: Vec<Vec<u8>>) -> Result<(), LdapError> {
        Err(LdapError::Operation {
            op: "modify",
            dn: dn.to_string(),
            message: "insufficient access rights".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), LdapError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_creates_container_and_entry() {
    let directory = InMemoryLdap::new();
    let publisher = RevocationPublisher::new(
        FakeAuthority::new(b"crl-v1"),
        Arc::new(directory.clone()),
        "mycluster",
    );

    let outcome = publisher.publish("example.com").await.unwrap();
    assert_eq!(outcome, PublishOutcome::Created);
    assert!(directory.contains(PARENT_DN));
    assert_eq!(
        directory.attribute(ENTRY_DN, "certificateRevocationList"),
        Some(vec![b"crl-v1".to_vec()])
    );
    assert_eq!(
        directory.attribute(ENTRY_DN, "objectClass"),
        Some(vec![b"cRLDistributionPoint".to_vec()])
    );
}

#[tokio::test]
async fn test_publish_is_idempotent() {
    let directory = InMemoryLdap::new();
    let publisher = RevocationPublisher::new(
        FakeAuthority::new(b"crl-v1"),
        Arc::new(directory.clone()),
        "mycluster",
    );

    publisher.publish("example.com").await.unwrap();
    let outcome = publisher.publish("example.com").await.unwrap();

    assert_eq!(outcome, PublishOutcome::Updated);
    assert_eq!(directory.len(), 2);
    assert_eq!(
        directory.attribute(ENTRY_DN, "certificateRevocationList"),
        Some(vec![b"crl-v1".to_vec()])
    );
}

#[tokio::test]
async fn test_publish_replaces_changed_payload() {
    let directory = InMemoryLdap::new();
    let authority = FakeAuthority::new(b"crl-v1");
    let publisher =
        RevocationPublisher::new(authority.clone(), Arc::new(directory.clone()), "mycluster");

    publisher.publish("example.com").await.unwrap();
    authority.set_crl(b"crl-v2");
    publisher.publish("example.com").await.unwrap();

    assert_eq!(
        directory.attribute(ENTRY_DN, "certificateRevocationList"),
        Some(vec![b"crl-v2".to_vec()])
    );
}

#[tokio::test]
async fn test_publish_propagates_directory_errors() {
    let publisher =
        RevocationPublisher::new(FakeAuthority::new(b"crl"), Arc::new(BrokenLdap), "mycluster");

    let err = publisher.publish("example.com").await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::Ldap(LdapError::Operation { op: "add", .. })
    ));
}

#[tokio::test]
async fn test_publish_per_domain_entries() {
    let directory = InMemoryLdap::new();
    let publisher = RevocationPublisher::new(
        FakeAuthority::new(b"crl"),
        Arc::new(directory.clone()),
        "mycluster",
    );

    publisher.publish("example.com").await.unwrap();
    publisher.publish("corp.local").await.unwrap();

    assert!(directory.contains(ENTRY_DN));
    assert!(directory.contains(
        "CN=mycluster,CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration,DC=corp,DC=local"
    ));
}
