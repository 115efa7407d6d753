//! Descriptor sources for heartbeats
//!
//! A source is asked for a fresh descriptor on every tick; nothing is cached
//! between calls.

use async_trait::async_trait;
use deskgate_proto::{NetAddr, Resource, ServiceIdentity, WindowsDesktop, WindowsDesktopService};
use std::sync::Arc;
use tracing::trace;

use crate::heartbeat::HeartbeatError;
use crate::registry::{DesktopDirectory, RegistryError};

#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn descriptor(&self) -> Result<Resource, HeartbeatError>;
}

/// Describes the gateway service itself
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    identity: ServiceIdentity,
}

impl ServiceDescriptor {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl DescriptorSource for ServiceDescriptor {
    async fn descriptor(&self) -> Result<Resource, HeartbeatError> {
        Ok(WindowsDesktopService::new(&self.identity)?.into())
    }
}

/// Describes one statically configured desktop
pub struct StaticDesktopDescriptor {
    directory: Arc<dyn DesktopDirectory>,
    addr: NetAddr,
    domain: String,
}

impl StaticDesktopDescriptor {
    pub fn new(directory: Arc<dyn DesktopDirectory>, addr: NetAddr, domain: impl Into<String>) -> Self {
        Self {
            directory,
            addr,
            domain: domain.into(),
        }
    }
}

#[async_trait]
impl DescriptorSource for StaticDesktopDescriptor {
    async fn descriptor(&self) -> Result<Resource, HeartbeatError> {
        let addr = self.addr.to_string();
        let name = name_for_static_host(self.directory.as_ref(), &addr).await?;
        Ok(WindowsDesktop::new(name, addr, self.domain.clone())?.into())
    }
}

/// Name for a static host: the name of a known desktop at `addr`, or a new
/// random UUID
///
/// Reusing the existing name keeps a host's identity stable across restarts.
pub async fn name_for_static_host(
    directory: &dyn DesktopDirectory,
    addr: &str,
) -> Result<String, RegistryError> {
    let desktops = directory.get_windows_desktops().await?;
    if let Some(desktop) = desktops.into_iter().find(|d| d.addr == addr) {
        trace!(addr = %addr, desktop_uuid = %desktop.name, "Reusing static host name");
        return Ok(desktop.name);
    }
    Ok(uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRegistry;
    use chrono::{Duration, Utc};

    fn registry_with(desktops: &[(&str, &str)]) -> ResourceRegistry {
        let registry = ResourceRegistry::default();
        for (name, addr) in desktops {
            let mut desktop = WindowsDesktop::new(*name, *addr, "corp.local").unwrap();
            desktop.expiry = Some(Utc::now() + Duration::minutes(10));
            registry.upsert(desktop.into());
        }
        registry
    }

    #[tokio::test]
    async fn test_name_reused_for_known_address() {
        let registry = registry_with(&[("known-1", "10.0.0.1:3389"), ("known-2", "10.0.0.2:3389")]);

        let first = name_for_static_host(&registry, "10.0.0.2:3389").await.unwrap();
        let second = name_for_static_host(&registry, "10.0.0.2:3389").await.unwrap();
        assert_eq!(first, "known-2");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_address_gets_fresh_uuid() {
        let registry = registry_with(&[("known-1", "10.0.0.1:3389")]);

        let a = name_for_static_host(&registry, "10.0.0.9:3389").await.unwrap();
        let b = name_for_static_host(&registry, "10.0.0.9:3389").await.unwrap();
        assert!(uuid::Uuid::parse_str(&a).is_ok());
        assert!(uuid::Uuid::parse_str(&b).is_ok());
        assert_ne!(a, b);
        assert_ne!(a, "known-1");
    }

    #[tokio::test]
    async fn test_static_descriptor_uses_normalized_addr() {
        let registry = Arc::new(registry_with(&[]));
        let addr = NetAddr::parse_with_default_port("10.0.0.5", deskgate_proto::RDP_PORT).unwrap();
        let source = StaticDesktopDescriptor::new(registry, addr, "corp.local");

        match source.descriptor().await.unwrap() {
            Resource::WindowsDesktop(desktop) => {
                assert_eq!(desktop.addr, "10.0.0.5:3389");
                assert_eq!(desktop.domain, "corp.local");
                assert!(desktop.expiry.is_none());
            }
            other => panic!("unexpected resource {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_service_descriptor() {
        let source = ServiceDescriptor::new(ServiceIdentity {
            host_uuid: "host-1".to_string(),
            public_addr: "gw.example.com:3028".to_string(),
        });
        let resource = source.descriptor().await.unwrap();
        assert_eq!(resource.name(), "host-1");

        let empty = ServiceDescriptor::new(ServiceIdentity {
            host_uuid: String::new(),
            public_addr: "gw:3028".to_string(),
        });
        assert!(empty.descriptor().await.is_err());
    }
}
