//! Windows desktop gateway service
//!
//! Accepts mutual TLS connections from the proxy, resolves the requested
//! desktop from the TLS server name and bridges the connection to a remote
//! desktop session. At startup it publishes the cluster CRL to Active
//! Directory and starts heartbeats for itself and its static hosts.

use deskgate_cert::{AuthError, CredentialIssuer};
use deskgate_directory::{
    DescriptorSource, DesktopDirectory, Heartbeat, HeartbeatError, HeartbeatMode, RegistryError,
    ServiceDescriptor, StaticDesktopDescriptor,
};
use deskgate_ldap::{PublishError, PublishOutcome, RevocationPublisher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::bridge::{BridgeError, ProtocolBridge};
use crate::config::WindowsServiceConfig;
use crate::desktop_conn::DesktopConn;
use crate::limiter::{ConnectionLimiter, LimitExceeded};
use crate::transport::{desktop_name_from_sni, VerifiedTransport};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to publish CRL: {0}")]
    Publish(#[from] PublishError),

    #[error("Failed to start heartbeat: {0}")]
    Heartbeat(#[from] HeartbeatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress of one proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Authenticated,
    TargetResolved,
    Bridging,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::TargetResolved => "target_resolved",
            ConnectionState::Bridging => "bridging",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to read client address: {0}")]
    ClientAddr(std::io::Error),

    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Client did not send a TLS server name")]
    MissingServerName,

    #[error("Desktop lookup failed: {0}")]
    Lookup(#[from] RegistryError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ConnectionError {
    /// State the connection was in when it failed
    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionError::ClientAddr(_) | ConnectionError::LimitExceeded(_) => {
                ConnectionState::Accepted
            }
            ConnectionError::Handshake(_) | ConnectionError::Auth(_) => {
                ConnectionState::Authenticating
            }
            ConnectionError::MissingServerName | ConnectionError::Lookup(_) => {
                ConnectionState::Authenticated
            }
            ConnectionError::Bridge(_) => ConnectionState::Bridging,
        }
    }
}

fn required<T: Clone>(value: &Option<T>, what: &str) -> Result<T, ServiceError> {
    value
        .clone()
        .ok_or_else(|| ServiceError::Config(format!("WindowsServiceConfig is missing {}", what)))
}

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Wait before the next accept, returning early on cancellation
async fn accept_backoff(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
    }
}

/// State shared by every connection task
struct ConnectionHandler {
    acceptor: TlsAcceptor,
    access_point: Arc<dyn DesktopDirectory>,
    limiter: Arc<ConnectionLimiter>,
    bridge: ProtocolBridge,
    sni_suffix: String,
    handshake_timeout: Duration,
    accepted_usage: Vec<String>,
}

impl ConnectionHandler {
    async fn handle(&self, socket: TcpStream) {
        let span = info_span!(
            "desktop_connection",
            client_ip = field::Empty,
            desktop_uuid = field::Empty,
            desktop_addr = field::Empty,
        );
        async {
            match self.serve_connection(socket).await {
                Ok(()) => info!(state = %ConnectionState::Closed, "Desktop session ended"),
                Err(e) => warn!(
                    state = %ConnectionState::Closed,
                    failed_in = %e.state(),
                    "Desktop connection failed: {}",
                    e
                ),
            }
        }
        .instrument(span)
        .await
    }

    async fn serve_connection(&self, socket: TcpStream) -> Result<(), ConnectionError> {
        let span = Span::current();

        let peer = socket.peer_addr().map_err(ConnectionError::ClientAddr)?;
        span.record("client_ip", field::display(peer.ip()));
        let _slot = self.limiter.acquire(peer.ip())?;

        debug!(state = %ConnectionState::Authenticating, "Starting TLS handshake");
        let transport = tokio::time::timeout(
            self.handshake_timeout,
            VerifiedTransport::accept(&self.acceptor, socket, &self.accepted_usage),
        )
        .await
        .map_err(|_| {
            ConnectionError::Handshake(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no handshake within {:?}", self.handshake_timeout),
            ))
        })??;
        debug!(
            state = %ConnectionState::Authenticated,
            username = %transport.identity().username,
            "Client authenticated"
        );

        let server_name = transport
            .server_name()
            .ok_or(ConnectionError::MissingServerName)?;
        let desktop_name = desktop_name_from_sni(server_name, &self.sni_suffix).to_string();
        span.record("desktop_uuid", field::display(&desktop_name));

        let desktop = self.access_point.get_windows_desktop(&desktop_name).await?;
        span.record("desktop_addr", field::display(&desktop.addr));
        debug!(state = %ConnectionState::TargetResolved, "Resolved desktop");

        debug!(state = %ConnectionState::Bridging, "Starting desktop session");
        self.bridge
            .bridge(DesktopConn::new(transport.into_stream()), &desktop)
            .await?;
        Ok(())
    }
}

/// The gateway service
pub struct WindowsService {
    handler: Arc<ConnectionHandler>,
    publisher: RevocationPublisher,
    domain: String,
    cancel: CancellationToken,
}

impl WindowsService {
    /// Validate the config, publish the CRL and start heartbeats
    ///
    /// Fails if the CRL cannot be published or any heartbeat cannot start.
    pub async fn new(mut config: WindowsServiceConfig) -> Result<Self, ServiceError> {
        config.check_and_set_defaults()?;

        let tls = required(&config.tls, "TLS")?;
        let access_point = required(&config.access_point, "access point")?;
        let announcer = required(&config.announcer, "announcer")?;
        let authority = required(&config.authority, "certificate authority")?;
        let limiter = required(&config.conn_limiter, "connection limiter")?;
        let rdp = required(&config.rdp, "RDP client")?;
        let ldap_connector = required(&config.ldap_connector, "LDAP connector")?;
        let clock = required(&config.clock, "clock")?;
        let on_heartbeat = required(&config.heartbeat.on_heartbeat, "heartbeat callback")?;

        let issuer = Arc::new(CredentialIssuer::new(authority.clone(), &config.cluster_name));
        let publisher = RevocationPublisher::new(authority, ldap_connector, &config.cluster_name);
        let domain = config.ldap.domain.clone();
        publisher.publish(&domain).await?;

        let announce_ttl = required(&config.heartbeat.announce_ttl, "announce TTL")?;
        let check_period = required(&config.heartbeat.check_period, "heartbeat check period")?;
        let loop_config = |mode: HeartbeatMode, source: Arc<dyn DescriptorSource>| {
            deskgate_directory::HeartbeatConfig {
                mode,
                source,
                announcer: announcer.clone(),
                clock: clock.clone(),
                announce_ttl,
                check_period,
                on_heartbeat: on_heartbeat.clone(),
            }
        };

        // Build every heartbeat before spawning any, so a bad one leaves
        // nothing running
        let mut heartbeats = vec![Heartbeat::new(loop_config(
            HeartbeatMode::WindowsDesktopService,
            Arc::new(ServiceDescriptor::new(config.heartbeat.identity())),
        ))?];
        for addr in &config.heartbeat.static_hosts {
            heartbeats.push(Heartbeat::new(loop_config(
                HeartbeatMode::WindowsDesktop,
                Arc::new(StaticDesktopDescriptor::new(
                    access_point.clone(),
                    addr.clone(),
                    domain.clone(),
                )),
            ))?);
        }

        let service = Self {
            handler: Arc::new(ConnectionHandler {
                acceptor: TlsAcceptor::from(tls),
                access_point,
                limiter,
                bridge: ProtocolBridge::new(rdp, issuer),
                sni_suffix: config.sni_suffix.clone(),
                handshake_timeout: config.handshake_timeout,
                accepted_usage: config.accepted_usage.clone(),
            }),
            publisher,
            domain,
            cancel: CancellationToken::new(),
        };
        for heartbeat in heartbeats {
            service.spawn_heartbeat(heartbeat);
        }

        info!(
            cluster = %config.cluster_name,
            static_hosts = config.heartbeat.static_hosts.len(),
            max_connections_per_ip = service.handler.limiter.max_per_ip(),
            "Windows desktop service initialized"
        );
        Ok(service)
    }

    fn spawn_heartbeat(&self, heartbeat: Heartbeat) {
        let mode = heartbeat.mode();
        let handle = tokio::spawn(heartbeat.run(self.cancel.child_token()));
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!(mode = %mode, "Heartbeat ended with error: {}", e);
            }
        });
    }

    /// Accept connections until [`close`](Self::close) is called
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServiceError> {
        info!("Windows desktop service listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Windows desktop service stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("New desktop connection from {}", peer_addr);
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            handler.handle(socket).await;
                        });
                    }
                    Err(e) => {
                        error!("Desktop listener accept error: {}", e);
                        accept_backoff(&self.cancel).await;
                    }
                },
            }
        }
    }

    /// Stop accepting connections and stop heartbeats
    ///
    /// Connections already being served run to completion.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Re-publish the CRL to the service's domain
    pub async fn update_crl(&self) -> Result<PublishOutcome, PublishError> {
        self.publisher.publish(&self.domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_states() {
        let err = ConnectionError::MissingServerName;
        assert_eq!(err.state(), ConnectionState::Authenticated);

        let err = ConnectionError::LimitExceeded(LimitExceeded {
            ip: "10.0.0.1".parse().unwrap(),
            max: 1,
        });
        assert_eq!(err.state(), ConnectionState::Accepted);

        let err = ConnectionError::Bridge(BridgeError::ClientClosed);
        assert_eq!(err.state(), ConnectionState::Bridging);
        assert_eq!(err.state().to_string(), "bridging");

        let err = ConnectionError::Auth(AuthError::UsageNotAllowed(vec![]));
        assert_eq!(err.state(), ConnectionState::Authenticating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_waits_until_cancelled() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        accept_backoff(&cancel).await;
        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY);

        cancel.cancel();
        let start = tokio::time::Instant::now();
        accept_backoff(&cancel).await;
        assert!(start.elapsed() < ACCEPT_RETRY_DELAY);
    }
}
