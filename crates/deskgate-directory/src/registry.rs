//! In-memory directory of announced resources
//!
//! Every announce replaces the stored descriptor wholesale. Nothing is ever
//! deleted explicitly: a descriptor that is not refreshed before its expiry
//! stops being returned and is dropped on the next prune.

use async_trait::async_trait;
use dashmap::DashMap;
use deskgate_proto::{Clock, Resource, ResourceKind, SystemClock, WindowsDesktop, WindowsDesktopService};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

/// Read access to known desktops
#[async_trait]
pub trait DesktopDirectory: Send + Sync {
    async fn get_windows_desktop(&self, name: &str) -> Result<WindowsDesktop, RegistryError>;

    async fn get_windows_desktops(&self) -> Result<Vec<WindowsDesktop>, RegistryError>;
}

/// Write access used by heartbeats
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn upsert_resource(&self, resource: Resource) -> Result<(), RegistryError>;
}

type ResourceKey = (ResourceKind, String);

/// Resource registry keyed by kind and name
pub struct ResourceRegistry {
    resources: Arc<DashMap<ResourceKey, Resource>>,
    clock: Arc<dyn Clock>,
}

impl ResourceRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            resources: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Store a resource, replacing any previous descriptor with the same name
    pub fn upsert(&self, resource: Resource) {
        trace!(
            kind = %resource.kind(),
            resource = %resource.name(),
            expiry = ?resource.expiry(),
            "Upserting resource"
        );
        let key = (resource.kind(), resource.name().to_string());
        self.resources.insert(key, resource);
    }

    /// Look up a live resource
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Resource> {
        let now = self.clock.now();
        self.resources
            .get(&(kind, name.to_string()))
            .map(|entry| entry.value().clone())
            .filter(|resource| !resource.is_expired(now))
    }

    /// All live resources of one kind, ordered by name
    pub fn list(&self, kind: ResourceKind) -> Vec<Resource> {
        let now = self.clock.now();
        let mut resources: Vec<Resource> = self
            .resources
            .iter()
            .filter(|entry| entry.key().0 == kind && !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        resources.sort_by(|a, b| a.name().cmp(b.name()));
        resources
    }

    pub fn windows_desktop_services(&self) -> Vec<WindowsDesktopService> {
        self.list(ResourceKind::WindowsDesktopService)
            .into_iter()
            .filter_map(|resource| match resource {
                Resource::WindowsDesktopService(service) => Some(service),
                Resource::WindowsDesktop(_) => None,
            })
            .collect()
    }

    /// Drop expired resources, returning how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.resources.len();
        self.resources.retain(|_, resource| !resource.is_expired(now));
        let removed = before.saturating_sub(self.resources.len());
        if removed > 0 {
            debug!(removed, "Pruned expired resources");
        }
        removed
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl DesktopDirectory for ResourceRegistry {
    async fn get_windows_desktop(&self, name: &str) -> Result<WindowsDesktop, RegistryError> {
        match self.get(ResourceKind::WindowsDesktop, name) {
            Some(Resource::WindowsDesktop(desktop)) => Ok(desktop),
            _ => Err(RegistryError::NotFound {
                kind: ResourceKind::WindowsDesktop,
                name: name.to_string(),
            }),
        }
    }

    async fn get_windows_desktops(&self) -> Result<Vec<WindowsDesktop>, RegistryError> {
        Ok(self
            .list(ResourceKind::WindowsDesktop)
            .into_iter()
            .filter_map(|resource| match resource {
                Resource::WindowsDesktop(desktop) => Some(desktop),
                Resource::WindowsDesktopService(_) => None,
            })
            .collect())
    }
}

#[async_trait]
impl Announcer for ResourceRegistry {
    async fn upsert_resource(&self, resource: Resource) -> Result<(), RegistryError> {
        self.upsert(resource);
        Ok(())
    }
}
