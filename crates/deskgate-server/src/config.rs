//! Gateway service configuration

use deskgate_cert::{CertAuthority, USAGE_WINDOWS_DESKTOP};
use deskgate_directory::{Announcer, DesktopDirectory, OnHeartbeat};
use deskgate_ldap::{Ldap3Connector, LdapConfig, LdapConnector};
use deskgate_proto::{
    Clock, NetAddr, ServiceIdentity, SystemClock, HEARTBEAT_CHECK_PERIOD, SERVER_ANNOUNCE_TTL,
    SNI_SUFFIX,
};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::RdpClient;
use crate::limiter::ConnectionLimiter;
use crate::ServiceError;

/// How long a client may take to complete the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat settings for the service and its static hosts
#[derive(Clone, Default)]
pub struct HeartbeatConfig {
    /// UUID of this host, announced as the service name
    pub host_uuid: String,
    /// Address the proxy uses to reach this service
    pub public_addr: String,
    /// Desktops announced by this service rather than discovered
    pub static_hosts: Vec<NetAddr>,
    pub announce_ttl: Option<Duration>,
    pub check_period: Option<Duration>,
    /// Called after every announce attempt
    pub on_heartbeat: Option<OnHeartbeat>,
}

impl HeartbeatConfig {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            host_uuid: self.host_uuid.clone(),
            public_addr: self.public_addr.clone(),
        }
    }

    pub fn check_and_set_defaults(&mut self) -> Result<(), ServiceError> {
        if self.host_uuid.is_empty() {
            return Err(ServiceError::Config("heartbeat: missing host UUID".to_string()));
        }
        if self.public_addr.is_empty() {
            return Err(ServiceError::Config("heartbeat: missing public address".to_string()));
        }
        if self.on_heartbeat.is_none() {
            return Err(ServiceError::Config("heartbeat: missing heartbeat callback".to_string()));
        }
        if self.announce_ttl.map_or(true, |ttl| ttl.is_zero()) {
            self.announce_ttl = Some(SERVER_ANNOUNCE_TTL);
        }
        if self.check_period.map_or(true, |period| period.is_zero()) {
            self.check_period = Some(HEARTBEAT_CHECK_PERIOD);
        }
        Ok(())
    }
}

/// Everything the gateway needs to run
#[derive(Clone)]
pub struct WindowsServiceConfig {
    /// Mutual TLS config of the listener
    pub tls: Option<Arc<ServerConfig>>,
    /// Where desktops are looked up
    pub access_point: Option<Arc<dyn DesktopDirectory>>,
    /// Where heartbeats are announced
    pub announcer: Option<Arc<dyn Announcer>>,
    /// Signs desktop certificates and produces the CRL
    pub authority: Option<Arc<dyn CertAuthority>>,
    pub conn_limiter: Option<Arc<ConnectionLimiter>>,
    pub rdp: Option<Arc<dyn RdpClient>>,
    pub ldap: LdapConfig,
    /// Overrides the ldap3 connector built from `ldap`
    pub ldap_connector: Option<Arc<dyn LdapConnector>>,
    pub heartbeat: HeartbeatConfig,
    pub cluster_name: String,
    /// Stripped from the TLS server name to get the desktop name
    pub sni_suffix: String,
    pub clock: Option<Arc<dyn Clock>>,
    /// Zero means [`DEFAULT_HANDSHAKE_TIMEOUT`]
    pub handshake_timeout: Duration,
    /// Client certificates must be restricted to these usages; empty accepts
    /// any certificate signed by the client CA
    pub accepted_usage: Vec<String>,
}

impl WindowsServiceConfig {
    pub fn new(ldap: LdapConfig, heartbeat: HeartbeatConfig) -> Self {
        Self {
            tls: None,
            access_point: None,
            announcer: None,
            authority: None,
            conn_limiter: None,
            rdp: None,
            ldap,
            ldap_connector: None,
            heartbeat,
            cluster_name: String::new(),
            sni_suffix: SNI_SUFFIX.to_string(),
            clock: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            accepted_usage: vec![USAGE_WINDOWS_DESKTOP.to_string()],
        }
    }

    pub fn check_and_set_defaults(&mut self) -> Result<(), ServiceError> {
        if self.tls.is_none() {
            return Err(ServiceError::Config("WindowsServiceConfig is missing TLS".to_string()));
        }
        if self.access_point.is_none() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing access point".to_string(),
            ));
        }
        if self.announcer.is_none() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing announcer".to_string(),
            ));
        }
        if self.authority.is_none() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing certificate authority".to_string(),
            ));
        }
        if self.conn_limiter.is_none() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing connection limiter".to_string(),
            ));
        }
        if self.rdp.is_none() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing RDP client".to_string(),
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(ServiceError::Config(
                "WindowsServiceConfig is missing cluster name".to_string(),
            ));
        }
        self.heartbeat.check_and_set_defaults()?;
        self.ldap
            .check()
            .map_err(|e| ServiceError::Config(e.to_string()))?;

        if self.ldap_connector.is_none() {
            let connector = Ldap3Connector::new(self.ldap.clone())
                .map_err(|e| ServiceError::Config(e.to_string()))?;
            self.ldap_connector = Some(Arc::new(connector));
        }
        if self.sni_suffix.is_empty() {
            self.sni_suffix = SNI_SUFFIX.to_string();
        }
        if self.clock.is_none() {
            self.clock = Some(Arc::new(SystemClock));
        }
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
        }
        Ok(())
    }
}
