//! Directory client abstraction and the ldap3 backed implementation

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, LdapResult, Mod};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

use crate::LdapConfig;

/// LDAP result code for entryAlreadyExists
pub const LDAP_ALREADY_EXISTS: u32 = 68;

#[derive(Debug, Error)]
pub enum LdapError {
    #[error("Invalid LDAP configuration: {0}")]
    Config(String),

    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Failed to bind as {username}: {message}")]
    Bind { username: String, message: String },

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("LDAP {op} of {dn} failed: {message}")]
    Operation {
        op: &'static str,
        dn: String,
        message: String,
    },
}

impl LdapError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, LdapError::AlreadyExists(_))
    }
}

/// One attribute and its values
pub type Attribute = (String, Vec<Vec<u8>>);

/// A bound directory session
#[async_trait]
pub trait LdapClient: Send {
    /// Add an entry. Fails with [`LdapError::AlreadyExists`] if `dn` exists.
    async fn add(&mut self, dn: &str, attributes: Vec<Attribute>) -> Result<(), LdapError>;

    /// Replace all values of one attribute of an existing entry
    async fn replace(
        &mut self,
        dn: &str,
        attribute: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), LdapError>;

    /// Unbind and close the session
    async fn close(&mut self) -> Result<(), LdapError>;
}

/// Opens bound directory sessions
#[async_trait]
pub trait LdapConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LdapClient>, LdapError>;
}

/// Connects with StartTLS and a simple bind
#[derive(Debug, Clone)]
pub struct Ldap3Connector {
    config: LdapConfig,
}

impl Ldap3Connector {
    pub fn new(config: LdapConfig) -> Result<Self, LdapError> {
        config.check()?;
        if config.insecure_skip_verify {
            warn!(
                addr = %config.addr,
                "LDAP server certificate verification is disabled"
            );
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(&self) -> Result<Box<dyn LdapClient>, LdapError> {
        let settings = LdapConnSettings::new()
            .set_starttls(true)
            .set_no_tls_verify(self.config.insecure_skip_verify);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url())
            .await
            .map_err(|e| LdapError::Connect {
                addr: self.config.addr.clone(),
                message: e.to_string(),
            })?;

        let addr = self.config.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(addr = %addr, "LDAP connection error: {}", e);
            }
        });

        ldap.simple_bind(&self.config.username, &self.config.password)
            .await
            .and_then(LdapResult::success)
            .map_err(|e| LdapError::Bind {
                username: self.config.username.clone(),
                message: e.to_string(),
            })?;
        debug!(addr = %self.config.addr, "Bound to LDAP server");

        Ok(Box::new(Ldap3Client { ldap }))
    }
}

struct Ldap3Client {
    ldap: ldap3::Ldap,
}

fn check_result(
    op: &'static str,
    dn: &str,
    result: ldap3::result::Result<LdapResult>,
) -> Result<(), LdapError> {
    match result.and_then(LdapResult::success) {
        Ok(_) => Ok(()),
        Err(ldap3::LdapError::LdapResult { result }) if result.rc == LDAP_ALREADY_EXISTS => {
            Err(LdapError::AlreadyExists(dn.to_string()))
        }
        Err(e) => Err(LdapError::Operation {
            op,
            dn: dn.to_string(),
            message: e.to_string(),
        }),
    }
}

#[async_trait]
impl LdapClient for Ldap3Client {
    async fn add(&mut self, dn: &str, attributes: Vec<Attribute>) -> Result<(), LdapError> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .into_iter()
            .map(|(name, values)| (name.into_bytes(), values.into_iter().collect()))
            .collect();
        let result = self.ldap.add(dn, attrs).await;
        check_result("add", dn, result)
    }

    async fn replace(
        &mut self,
        dn: &str,
        attribute: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), LdapError> {
        let mods = vec![Mod::Replace(
            attribute.as_bytes().to_vec(),
            values.into_iter().collect::<HashSet<_>>(),
        )];
        let result = self.ldap.modify(dn, mods).await;
        check_result("modify", dn, result)
    }

    async fn close(&mut self) -> Result<(), LdapError> {
        self.ldap.unbind().await.map_err(|e| LdapError::Operation {
            op: "unbind",
            dn: String::new(),
            message: e.to_string(),
        })
    }
}
