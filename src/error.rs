use std::{io, net::SocketAddr, time::Duration};

use crate::pipe::Direction;

/// A malformed endpoint in a forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported network type {0:?}")]
    UnsupportedNetwork(String),

    #[error("port {0} is outside 1..=65535")]
    PortOutOfRange(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid endpoint: {0}")]
    Validation(#[from] ValidationError),

    /// The source listener could not be created.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The destination refused or could not be reached.
    #[error("failed to connect to destination {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connecting to destination {addr} timed out after {timeout:?}")]
    DialTimeout { addr: SocketAddr, timeout: Duration },

    /// I/O failure while relaying, other than a clean end of stream.
    #[error("relay {direction} failed: {source}")]
    Stream {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The listener failed while accepting.
    #[error("accept failed on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener on {addr} was closed")]
    Closed { addr: SocketAddr },

    #[error("no source listener is bound")]
    NotBound,

    #[error("no destination is configured")]
    DestinationNotConfigured,
}

impl ProxyError {
    /// Whether this error ends the accept loop of a connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Accept { .. } | Self::Closed { .. } | Self::NotBound | Self::DestinationNotConfigured
        )
    }
}
