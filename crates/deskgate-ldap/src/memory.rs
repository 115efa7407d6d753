//! In-memory directory
//!
//! Behaves like a directory server for add and replace, including the
//! already-exists signal. All data is lost when the process exits.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::client::{Attribute, LdapClient, LdapConnector, LdapError};

type Entries = BTreeMap<String, HashMap<String, Vec<Vec<u8>>>>;

#[derive(Clone, Default)]
pub struct InMemoryLdap {
    entries: Arc<Mutex<Entries>>,
}

impl InMemoryLdap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of `attribute` on `dn`, if both exist
    pub fn attribute(&self, dn: &str, attribute: &str) -> Option<Vec<Vec<u8>>> {
        let entries = self.entries.lock().ok()?;
        entries.get(dn)?.get(attribute).cloned()
    }

    pub fn contains(&self, dn: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(dn))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(op: &'static str, dn: &str) -> LdapError {
    LdapError::Operation {
        op,
        dn: dn.to_string(),
        message: "directory lock poisoned".to_string(),
    }
}

#[async_trait]
impl LdapConnector for InMemoryLdap {
    async fn connect(&self) -> Result<Box<dyn LdapClient>, LdapError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl LdapClient for InMemoryLdap {
    async fn add(&mut self, dn: &str, attributes: Vec<Attribute>) -> Result<(), LdapError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("add", dn))?;
        if entries.contains_key(dn) {
            return Err(LdapError::AlreadyExists(dn.to_string()));
        }
        entries.insert(dn.to_string(), attributes.into_iter().collect());
        Ok(())
    }

    async fn replace(
        &mut self,
        dn: &str,
        attribute: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), LdapError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("modify", dn))?;
        let entry = entries.get_mut(dn).ok_or_else(|| LdapError::Operation {
            op: "modify",
            dn: dn.to_string(),
            message: "no such object".to_string(),
        })?;
        entry.insert(attribute.to_string(), values);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LdapError> {
        Ok(())
    }
}
