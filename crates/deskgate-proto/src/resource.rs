//! Resource descriptors announced into the shared directory
//!
//! Two shapes exist: a [`WindowsDesktop`] (one remote desktop target) and a
//! [`WindowsDesktopService`] (a running gateway instance). Both carry an
//! expiry; a descriptor that is not re-announced before it expires is treated
//! as gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("{kind} is missing {field}")]
    MissingField {
        kind: ResourceKind,
        field: &'static str,
    },
}

/// Identity of this gateway process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// UUID of the host the service runs on, used as the service resource name
    pub host_uuid: String,
    /// Address the proxy uses to reach this service
    pub public_addr: String,
}

/// A remote desktop target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsDesktop {
    /// Unique name (a UUID)
    pub name: String,
    /// RDP address in `host:port` form
    pub addr: String,
    /// Active Directory domain the desktop authenticates against
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl WindowsDesktop {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self, ResourceError> {
        let desktop = Self {
            name: name.into(),
            addr: addr.into(),
            domain: domain.into(),
            expiry: None,
        };
        if desktop.name.is_empty() {
            return Err(ResourceError::MissingField {
                kind: ResourceKind::WindowsDesktop,
                field: "name",
            });
        }
        if desktop.addr.is_empty() {
            return Err(ResourceError::MissingField {
                kind: ResourceKind::WindowsDesktop,
                field: "addr",
            });
        }
        Ok(desktop)
    }
}

/// A running desktop gateway instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsDesktopService {
    /// Host UUID of the service
    pub name: String,
    /// Public address of the service
    pub addr: String,
    /// Software version
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl WindowsDesktopService {
    pub fn new(identity: &ServiceIdentity) -> Result<Self, ResourceError> {
        if identity.host_uuid.is_empty() {
            return Err(ResourceError::MissingField {
                kind: ResourceKind::WindowsDesktopService,
                field: "host_uuid",
            });
        }
        if identity.public_addr.is_empty() {
            return Err(ResourceError::MissingField {
                kind: ResourceKind::WindowsDesktopService,
                field: "public_addr",
            });
        }
        Ok(Self {
            name: identity.host_uuid.clone(),
            addr: identity.public_addr.clone(),
            version: crate::VERSION.to_string(),
            expiry: None,
        })
    }
}

/// Kind of announced resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    WindowsDesktop,
    WindowsDesktopService,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::WindowsDesktop => write!(f, "windows_desktop"),
            ResourceKind::WindowsDesktopService => write!(f, "windows_desktop_service"),
        }
    }
}

/// Any resource a heartbeat can announce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    WindowsDesktop(WindowsDesktop),
    WindowsDesktopService(WindowsDesktopService),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::WindowsDesktop(_) => ResourceKind::WindowsDesktop,
            Resource::WindowsDesktopService(_) => ResourceKind::WindowsDesktopService,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::WindowsDesktop(d) => &d.name,
            Resource::WindowsDesktopService(s) => &s.name,
        }
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            Resource::WindowsDesktop(d) => d.expiry,
            Resource::WindowsDesktopService(s) => s.expiry,
        }
    }

    pub fn set_expiry(&mut self, expiry: DateTime<Utc>) {
        match self {
            Resource::WindowsDesktop(d) => d.expiry = Some(expiry),
            Resource::WindowsDesktopService(s) => s.expiry = Some(expiry),
        }
    }

    /// A resource without an expiry never expires
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry().is_some_and(|expiry| expiry <= now)
    }

    /// Compare two descriptors ignoring their expiry
    pub fn same_content(&self, other: &Resource) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        a.set_expiry(epoch);
        b.set_expiry(epoch);
        a == b
    }
}

impl From<WindowsDesktop> for Resource {
    fn from(desktop: WindowsDesktop) -> Self {
        Resource::WindowsDesktop(desktop)
    }
}

impl From<WindowsDesktopService> for Resource {
    fn from(service: WindowsDesktopService) -> Self {
        Resource::WindowsDesktopService(service)
    }
}
