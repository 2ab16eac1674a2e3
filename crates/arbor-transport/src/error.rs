use std::io;

use crate::EntityId;

/// Errors returned by the Arbor transport layer.
///
/// Connection-level failures are classified so that a reader loop can tell
/// a peer that went away ([`is_disconnect`](Self::is_disconnect)) from a
/// single malformed frame ([`is_decode`](Self::is_decode)).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("entity {0} has no network address")]
    NoAddress(EntityId),

    #[error("connection closed")]
    Closed,

    #[error("peer closed the connection")]
    Eof,

    #[error("temporary network error: {0}")]
    Temporary(#[source] io::Error),

    #[error("network error: {0}")]
    Io(#[source] io::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("message decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid public key encoding")]
    InvalidKey,
}

impl TransportError {
    /// True when the connection can no longer be read from: local close,
    /// EOF from the peer, or a temporary condition the reader gives up on.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Eof | TransportError::Temporary(_)
        )
    }

    /// True when a single frame could not be decoded but the stream is intact.
    pub fn is_decode(&self) -> bool {
        matches!(self, TransportError::Decode(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::Eof,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransportError::Closed,
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransportError::Temporary(e)
            }
            _ => TransportError::Io(e),
        }
    }
}
