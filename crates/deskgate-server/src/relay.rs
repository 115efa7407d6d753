//! TLS relay to the desktop host
//!
//! The first message from the proxy names the Windows user. The relay issues
//! a credential for that user, opens a TLS connection to the desktop that
//! presents it as the client certificate, and then forwards raw bytes in
//! both directions: each proxy message is written to the desktop as is, and
//! every read from the desktop becomes one message back to the proxy.

use async_trait::async_trait;
use bytes::Bytes;
use deskgate_cert::tls::credential_client_config;
use deskgate_proto::{NetAddr, RDP_PORT};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::bridge::{BridgeError, RdpClient, SessionConfig};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TlsRelayClient {
    roots: Option<RootCertStore>,
    connect_timeout: Duration,
}

impl TlsRelayClient {
    /// `roots` verifies the desktop's certificate; `None` skips verification
    pub fn new(roots: Option<RootCertStore>) -> Self {
        Self {
            roots,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn username_from(message: &[u8]) -> Result<String, BridgeError> {
    let username = std::str::from_utf8(message)
        .map_err(|_| BridgeError::Protocol("username is not valid UTF-8".to_string()))?
        .trim();
    if username.is_empty() {
        return Err(BridgeError::Protocol("empty username".to_string()));
    }
    Ok(username.to_string())
}

#[async_trait]
impl RdpClient for TlsRelayClient {
    async fn run_session(&self, session: SessionConfig) -> Result<(), BridgeError> {
        let SessionConfig {
            addr,
            credentials,
            mut input,
            output,
        } = session;

        let first = input.recv().await.ok_or(BridgeError::ClientClosed)?;
        let username = username_from(&first)?;
        let credential = credentials.issue(&username).await?;
        let config = credential_client_config(&credential, self.roots.clone())?;

        let target = NetAddr::parse_with_default_port(&addr, RDP_PORT)
            .map_err(|e| BridgeError::Session(e.to_string()))?;
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| BridgeError::Session(format!("invalid desktop host: {}", e)))?;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.to_string()))
            .await
            .map_err(|_| BridgeError::Session(format!("timed out connecting to {}", target)))??;
        let tls = TlsConnector::from(config).connect(server_name, tcp).await?;
        debug!(desktop_addr = %target, username = %username, "Connected to desktop");

        let (mut desktop_read, mut desktop_write) = tokio::io::split(tls);

        let upstream = async move {
            while let Some(message) = input.recv().await {
                desktop_write.write_all(&message).await?;
            }
            debug!("Proxy closed its side");
            let _ = desktop_write.shutdown().await;
            Ok::<_, BridgeError>(())
        };

        let downstream = async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = desktop_read.read(&mut buf).await?;
                if n == 0 {
                    debug!("Desktop closed connection");
                    return Ok::<_, BridgeError>(());
                }
                if output.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return Ok(());
                }
            }
        };

        tokio::select! {
            result = upstream => result,
            result = downstream => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_from_message() {
        assert_eq!(username_from(b"alice\n").unwrap(), "alice");
        assert!(matches!(username_from(b"  "), Err(BridgeError::Protocol(_))));
        assert!(matches!(
            username_from(&[0xff, 0xfe]),
            Err(BridgeError::Protocol(_))
        ));
    }
}
