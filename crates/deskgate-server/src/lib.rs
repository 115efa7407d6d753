//! Windows desktop gateway
//!
//! Terminates mutual TLS from the proxy, issues a short-lived smartcard
//! credential for the requested desktop and bridges the desktop protocol
//! stream to a remote desktop session.

pub mod bridge;
pub mod config;
pub mod desktop_conn;
pub mod limiter;
pub mod relay;
pub mod service;
pub mod transport;

pub use bridge::{BridgeError, CredentialSource, ProtocolBridge, RdpClient, SessionConfig};
pub use config::{HeartbeatConfig, WindowsServiceConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use desktop_conn::DesktopConn;
pub use limiter::{ConnectionGuard, ConnectionLimiter, LimitExceeded};
pub use relay::TlsRelayClient;
pub use service::{ConnectionError, ConnectionState, ServiceError, WindowsService};
pub use transport::{desktop_name_from_sni, VerifiedTransport};
