//! KvStore error types.
//!
//! Only resource acquisition and configuration errors are fatal. Stale or
//! duplicate updates are never errors; per-key and per-peer failures are
//! logged where they happen and do not reach callers.

use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KvStoreError>;

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("KvStore event loop has shut down")]
    Shutdown,

    #[error(transparent)]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
