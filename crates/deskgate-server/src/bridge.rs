//! Bridges a desktop protocol connection to a remote desktop session

use async_trait::async_trait;
use bytes::Bytes;
use deskgate_cert::{CredentialIssuer, IssuanceError, IssuedCredential, TlsConfigError};
use deskgate_proto::WindowsDesktop;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::desktop_conn::DesktopConn;

/// Messages buffered in each direction between the connection and the session
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to issue credential: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Desktop protocol error: {0}")]
    Protocol(String),

    #[error("Remote desktop session failed: {0}")]
    Session(String),

    #[error("Client closed the connection before the session started")]
    ClientClosed,
}

/// Issues credentials for one desktop's domain on demand
#[derive(Clone)]
pub struct CredentialSource {
    issuer: Arc<CredentialIssuer>,
    domain: String,
}

impl CredentialSource {
    pub fn new(issuer: Arc<CredentialIssuer>, domain: impl Into<String>) -> Self {
        Self {
            issuer,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Issue a fresh credential for `username`
    pub async fn issue(&self, username: &str) -> Result<IssuedCredential, IssuanceError> {
        self.issuer.issue(username, &self.domain).await
    }
}

/// Everything a remote desktop session needs
pub struct SessionConfig {
    /// RDP address of the desktop
    pub addr: String,
    pub credentials: CredentialSource,
    /// Messages from the proxy
    pub input: mpsc::Receiver<Bytes>,
    /// Messages to the proxy
    pub output: mpsc::Sender<Bytes>,
}

/// Opens remote desktop sessions
#[async_trait]
pub trait RdpClient: Send + Sync {
    /// Run a session until either side ends it
    async fn run_session(&self, session: SessionConfig) -> Result<(), BridgeError>;
}

/// Connects proxy connections to remote desktop sessions
#[derive(Clone)]
pub struct ProtocolBridge {
    rdp: Arc<dyn RdpClient>,
    issuer: Arc<CredentialIssuer>,
}

impl ProtocolBridge {
    pub fn new(rdp: Arc<dyn RdpClient>, issuer: Arc<CredentialIssuer>) -> Self {
        Self { rdp, issuer }
    }

    /// Run a session to `desktop` over `conn`, returning when it ends
    pub async fn bridge<S>(
        &self,
        conn: DesktopConn<S>,
        desktop: &WindowsDesktop,
    ) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (mut sink, mut stream) = conn.split();

        let session = self.rdp.run_session(SessionConfig {
            addr: desktop.addr.clone(),
            credentials: CredentialSource::new(self.issuer.clone(), desktop.domain.clone()),
            input: input_rx,
            output: output_tx,
        });

        let reader = async move {
            while let Some(frame) = stream.next().await {
                if input_tx.send(frame?.freeze()).await.is_err() {
                    break;
                }
            }
            debug!("Desktop client closed its side");
            Ok::<_, BridgeError>(())
        };

        // Ends once the session drops its output sender
        let writer = async move {
            while let Some(message) = output_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Error writing to desktop client: {}", e);
                    return;
                }
            }
            let _ = sink.close().await;
        };

        let session_done = async move {
            tokio::pin!(session);
            tokio::select! {
                result = &mut session => result,
                result = reader => match result {
                    // Input is closed; let the session wind down on its own
                    Ok(()) => session.await,
                    Err(e) => Err(e),
                },
            }
        };

        let (result, ()) = tokio::join!(session_done, writer);
        result
    }
}
