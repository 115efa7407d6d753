//! Framed desktop protocol connection
//!
//! The proxy speaks a message oriented desktop protocol on top of the TLS
//! stream. Messages are opaque to the gateway; only their boundaries matter.
//! Each message is sent as a 4-byte big-endian length followed by the payload.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest message accepted from or sent to the proxy
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

pub type MessageSink<S> = SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>;
pub type MessageStream<S> = SplitStream<Framed<S, LengthDelimitedCodec>>;

pub struct DesktopConn<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> DesktopConn<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_MESSAGE_SIZE)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Split into the output sink and the input stream
    pub fn split(self) -> (MessageSink<S>, MessageStream<S>) {
        self.framed.split()
    }
}
