//! Gateway configuration file

use anyhow::{Context, Result};
use deskgate_ldap::LdapConfig;
use deskgate_proto::{NetAddr, RDP_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Written next to the config file when `heartbeat.host_uuid` is not set
const HOST_UUID_FILE: &str = "host_uuid";

fn default_listen_addr() -> String {
    "0.0.0.0:3028".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the mutual TLS listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    pub cluster_name: String,

    /// Stripped from the TLS server name to get the desktop name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_suffix: Option<String>,

    /// Concurrent connections allowed per client IP, 0 for no limit
    #[serde(default)]
    pub max_connections_per_ip: u32,

    /// Seconds a client may take to finish the TLS handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_seconds: Option<u64>,

    /// Seconds allowed for the TCP connect to a desktop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_connect_timeout_seconds: Option<u64>,

    pub tls: TlsFiles,
    pub ldap: LdapSection,
    pub heartbeat: HeartbeatSection,
    pub authority: AuthorityFiles,

    /// CA bundle used to verify desktops; omitted means they are not verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_tls: Option<DesktopTls>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
    /// CA that signs proxy client certificates
    pub client_ca: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityFiles {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopTls {
    pub ca: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LdapSection {
    pub addr: String,
    pub domain: String,
    pub username: String,

    /// Prefer `password_env`
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the bind password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl std::fmt::Debug for LdapSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSection")
            .field("addr", &self.addr)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password_env", &self.password_env)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl LdapSection {
    /// Resolve the bind password and build the client config
    pub fn to_ldap_config(&self) -> Result<LdapConfig> {
        let password = if let Some(env_var) = &self.password_env {
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?
        } else if let Some(password) = &self.password {
            password.clone()
        } else {
            anyhow::bail!("No LDAP password specified in config file");
        };

        Ok(LdapConfig {
            addr: self.addr.clone(),
            domain: self.domain.clone(),
            username: self.username.clone(),
            password,
            insecure_skip_verify: self.insecure_skip_verify,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatSection {
    /// Generated at startup when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_uuid: Option<String>,

    pub public_addr: String,

    /// `host[:port]` of desktops announced by this gateway
    #[serde(default)]
    pub static_hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce_ttl_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_period_seconds: Option<u64>,
}

impl HeartbeatSection {
    pub fn static_host_addrs(&self) -> Result<Vec<NetAddr>> {
        self.static_hosts
            .iter()
            .map(|host| {
                NetAddr::parse_with_default_port(host, RDP_PORT)
                    .with_context(|| format!("Invalid static host: {}", host))
            })
            .collect()
    }

    pub fn announce_ttl(&self) -> Option<Duration> {
        self.announce_ttl_seconds.map(Duration::from_secs)
    }

    pub fn check_period(&self) -> Option<Duration> {
        self.check_period_seconds.map(Duration::from_secs)
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_seconds.map(Duration::from_secs)
    }

    pub fn desktop_connect_timeout(&self) -> Option<Duration> {
        self.desktop_connect_timeout_seconds.map(Duration::from_secs)
    }

    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            anyhow::bail!("cluster_name must not be empty");
        }
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen_addr: {}", self.listen_addr))?;

        if self.handshake_timeout_seconds == Some(0) {
            anyhow::bail!("handshake_timeout_seconds must be greater than zero");
        }
        if self.desktop_connect_timeout_seconds == Some(0) {
            anyhow::bail!("desktop_connect_timeout_seconds must be greater than zero");
        }

        if self.heartbeat.public_addr.is_empty() {
            anyhow::bail!("heartbeat.public_addr must not be empty");
        }
        if self.heartbeat.announce_ttl_seconds == Some(0) {
            anyhow::bail!("heartbeat.announce_ttl_seconds must be greater than zero");
        }
        if self.heartbeat.check_period_seconds == Some(0) {
            anyhow::bail!("heartbeat.check_period_seconds must be greater than zero");
        }
        self.heartbeat.static_host_addrs()?;

        if self.ldap.password.is_some() && self.ldap.password_env.is_some() {
            anyhow::bail!("ldap.password and ldap.password_env are mutually exclusive");
        }

        Ok(())
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# Deskgate Windows desktop gateway configuration

listen_addr: "0.0.0.0:3028"
cluster_name: "example-cluster"
# sni_suffix: ".desktop.deskgate.cluster.local"

# Concurrent connections per client IP (0 = unlimited)
max_connections_per_ip: 32
# handshake_timeout_seconds: 10
# desktop_connect_timeout_seconds: 10

# Listener certificate and the CA that signs proxy client certificates
tls:
  cert: "/etc/deskgate/tls.crt"
  key: "/etc/deskgate/tls.key"
  client_ca: "/etc/deskgate/proxy-ca.crt"

# CA that signs desktop logon certificates and the CRL
authority:
  cert: "/etc/deskgate/user-ca.crt"
  key: "/etc/deskgate/user-ca.key"

ldap:
  addr: "dc.example.com:389"
  domain: "example.com"
  username: "svc-deskgate"
  password_env: "DESKGATE_LDAP_PASSWORD"
  # insecure_skip_verify: false

heartbeat:
  # host_uuid: "generated and saved to host_uuid next to this file when omitted"
  public_addr: "gateway.example.com:3028"
  # announce_ttl_seconds: 600
  # check_period_seconds: 5
  # Desktops announced by this gateway, port defaults to 3389
  static_hosts: []
  # static_hosts:
  #   - "10.0.0.5"
  #   - "desktop.example.com:3390"

# Verify desktop certificates against this bundle
# desktop_tls:
#   ca: "/etc/deskgate/desktop-ca.crt"
"#
        .to_string()
    }
}

/// Where a generated host UUID is kept for the config at `config_path`
pub fn host_uuid_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(HOST_UUID_FILE)
}

/// Read the host UUID stored at `path`, generating and saving one on first use
pub fn load_or_create_host_uuid(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let id = content.trim();
            uuid::Uuid::parse_str(id)
                .with_context(|| format!("Invalid host UUID in {}", path.display()))?;
            Ok(id.to_string())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = uuid::Uuid::new_v4().to_string();
            std::fs::write(path, format!("{}\n", id))
                .with_context(|| format!("Failed to write host UUID to {}", path.display()))?;
            Ok(id)
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read host UUID from {}", path.display()))
        }
    }
}
