//! Mutually authenticated transport

use deskgate_cert::Identity;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::service::ConnectionError;

/// A TLS stream whose client certificate has been verified
///
/// Only obtainable through [`VerifiedTransport::accept`], so holding one means
/// the handshake succeeded and the caller has an identity.
pub struct VerifiedTransport<S> {
    stream: TlsStream<S>,
    identity: Identity,
    server_name: Option<String>,
}

impl<S> VerifiedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Complete the server side handshake and extract the peer identity
    ///
    /// The client certificate must be restricted to `accepted_usage` unless
    /// that list is empty.
    pub async fn accept(
        acceptor: &TlsAcceptor,
        stream: S,
        accepted_usage: &[String],
    ) -> Result<Self, ConnectionError> {
        let stream = acceptor
            .accept(stream)
            .await
            .map_err(ConnectionError::Handshake)?;

        let (_, conn) = stream.get_ref();
        let identity = Identity::from_peer_certificates(conn.peer_certificates(), accepted_usage)?;
        let server_name = conn.server_name().map(str::to_string);

        Ok(Self {
            stream,
            identity,
            server_name,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// TLS server name sent by the client
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn into_stream(self) -> TlsStream<S> {
        self.stream
    }
}

/// Desktop name carried in a TLS server name
///
/// A name without the suffix is used as is.
pub fn desktop_name_from_sni<'a>(server_name: &'a str, suffix: &str) -> &'a str {
    server_name.strip_suffix(suffix).unwrap_or(server_name)
}
