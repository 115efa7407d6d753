//! Desktop gateway resource definitions
//!
//! This crate defines the resource descriptors announced into the shared
//! directory (desktop targets and the gateway service itself), address parsing
//! for statically configured targets, and the clock abstraction used to stamp
//! expiry times.

pub mod clock;
pub mod net_addr;
pub mod resource;

pub use clock::{Clock, ManualClock, SystemClock};
pub use net_addr::{NetAddr, NetAddrError};
pub use resource::{
    Resource, ResourceError, ResourceKind, ServiceIdentity, WindowsDesktop, WindowsDesktopService,
};

/// Default RDP port used when a static host is configured without one
pub const RDP_PORT: u16 = 3389;

/// How long an announced resource stays in the directory without a refresh
pub const SERVER_ANNOUNCE_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Period of the heartbeat consistency check between announces
pub const HEARTBEAT_CHECK_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);

/// Suffix appended by the proxy to the desktop name in the TLS server name
pub const SNI_SUFFIX: &str = ".desktop.deskgate.cluster.local";

/// Version string reported in service heartbeats
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
