//! Backend and client sockets
//!
//! An [`Endpoint`] owns one TCP socket and its state machine. Replies travel
//! backend -> client through a [`PipePool`] pipe without a user-space copy.

mod endpoint;
mod pipe;

pub use endpoint::{
    Endpoint, EndpointKind, EndpointState, RelayOutcome, BACKEND_SOCKET_BUFFER,
};
pub use pipe::{Pipe, PipeGuard, PipePool, DEFAULT_POOL_SIZE, SPLICE_MAX_BYTES};

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Endpoint closed")]
    Closed,

    #[error("Write to peer failed: {0}")]
    Peer(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The failure is on the connection being read, not on the peer it relays to
    pub fn is_local(&self) -> bool {
        !matches!(self, TransportError::Peer(_))
    }
}
