//! LDAP connection settings

use serde::{Deserialize, Serialize};

use crate::LdapError;

/// How to reach and authenticate to the domain controller
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LdapConfig {
    /// `host:port` of the LDAP server
    pub addr: String,
    /// Active Directory domain, e.g. `corp.local`
    pub domain: String,
    /// Bind user
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Skip verification of the server certificate during StartTLS
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("addr", &self.addr)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl LdapConfig {
    /// Validate that every field needed to bind is present
    pub fn check(&self) -> Result<(), LdapError> {
        if self.addr.is_empty() {
            return Err(LdapError::Config("missing LDAP address".to_string()));
        }
        if self.domain.is_empty() {
            return Err(LdapError::Config("missing Active Directory domain name".to_string()));
        }
        if self.username.is_empty() {
            return Err(LdapError::Config("missing LDAP username".to_string()));
        }
        if self.password.is_empty() {
            return Err(LdapError::Config("missing LDAP password".to_string()));
        }
        Ok(())
    }

    /// Server URL; StartTLS is negotiated on top of it
    pub fn url(&self) -> String {
        format!("ldap://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LdapConfig {
        LdapConfig {
            addr: "dc.corp.local:389".to_string(),
            domain: "corp.local".to_string(),
            username: "svc-deskgate".to_string(),
            password: "hunter2".to_string(),
            insecure_skip_verify: false,
        }
    }

    #[test]
    fn test_check_names_missing_field() {
        assert!(config().check().is_ok());

        for (mutate, expected) in [
            (
                Box::new(|c: &mut LdapConfig| c.addr.clear()) as Box<dyn Fn(&mut LdapConfig)>,
                "address",
            ),
            (Box::new(|c: &mut LdapConfig| c.domain.clear()), "domain"),
            (Box::new(|c: &mut LdapConfig| c.username.clear()), "username"),
            (Box::new(|c: &mut LdapConfig| c.password.clear()), "password"),
        ] {
            let mut cfg = config();
            mutate(&mut cfg);
            let err = cfg.check().unwrap_err().to_string();
            assert!(err.contains(expected), "{} should mention {}", err, expected);
        }
    }

    #[test]
    fn test_url() {
        assert_eq!(config().url(), "ldap://dc.corp.local:389");
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_password_not_serialized() {
        let yaml = serde_yaml::to_string(&config()).unwrap();
        assert!(!yaml.contains("hunter2"));

        let parsed: LdapConfig = serde_yaml::from_str(
            "addr: dc:389\ndomain: corp.local\nusername: u\npassword: p\n",
        )
        .unwrap();
        assert_eq!(parsed.password, "p");
        assert!(!parsed.insecure_skip_verify);
    }
}
