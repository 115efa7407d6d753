//! CRL distribution point locations in Active Directory
//!
//! The CRL for a cluster lives at a fixed place under the domain's
//! configuration partition, next to where a Windows CA stores its own CRLs:
//!
//! ```text
//! CN=mycluster,CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration,DC=example,DC=com
//! ```
//!
//! Read it backwards: `DC=example,DC=com` is the `example.com` domain, and the
//! `CN` chain is `Configuration/Services/Public Key Services/CDP/Teleport/mycluster`.

/// Container under the CDP tree that holds one CRL entry per cluster
const CDP_CONTAINER: &str =
    "CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration";

/// LDAP object class of a CRL entry
pub const CRL_OBJECT_CLASS: &str = "cRLDistributionPoint";

/// LDAP attribute holding the DER encoded CRL
pub const CRL_ATTRIBUTE: &str = "certificateRevocationList";

/// LDAP object class of the parent container
pub const CONTAINER_OBJECT_CLASS: &str = "container";

/// Where a cluster's CRL lives in one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlLocation {
    /// DN of the CRL entry itself
    pub dn: String,
    /// DN of the container that holds it
    pub parent_dn: String,
}

impl CrlLocation {
    /// Compute the CRL location for `cluster_name` in `domain`
    pub fn new(cluster_name: &str, domain: &str) -> Self {
        let mut parent_dn = CDP_CONTAINER.to_string();
        for component in domain.split('.') {
            parent_dn.push_str(",DC=");
            parent_dn.push_str(component);
        }
        let dn = format!("CN={},{}", cluster_name, parent_dn);
        Self { dn, parent_dn }
    }

    /// LDAP URI embedded in issued certificates as the CRL distribution point
    ///
    /// The host part is empty so Windows fetches the CRL from any of its
    /// current domain controllers.
    pub fn distribution_point_uri(&self) -> String {
        format!(
            "ldap:///{}?{}?base?objectClass={}",
            self.dn, CRL_ATTRIBUTE, CRL_OBJECT_CLASS
        )
    }
}
