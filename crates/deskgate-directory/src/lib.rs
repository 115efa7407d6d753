//! Resource directory and heartbeats
//!
//! The gateway announces itself and its statically configured desktops into a
//! [`ResourceRegistry`] and resolves incoming connections against it.

pub mod descriptor;
pub mod heartbeat;
pub mod registry;

pub use descriptor::{name_for_static_host, DescriptorSource, ServiceDescriptor, StaticDesktopDescriptor};
pub use heartbeat::{
    announce_period, Heartbeat, HeartbeatConfig, HeartbeatError, HeartbeatMode, OnHeartbeat,
};
pub use registry::{Announcer, DesktopDirectory, RegistryError, ResourceRegistry};
