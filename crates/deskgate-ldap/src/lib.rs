//! Active Directory integration over LDAP
//!
//! Only the handful of operations the gateway needs: bind over StartTLS, add
//! an entry and replace one attribute of an existing entry.

pub mod client;
pub mod config;
pub mod memory;
pub mod publisher;

pub use client::{Attribute, Ldap3Connector, LdapClient, LdapConnector, LdapError};
pub use config::LdapConfig;
pub use memory::InMemoryLdap;
pub use publisher::{PublishError, PublishOutcome, RevocationPublisher};
