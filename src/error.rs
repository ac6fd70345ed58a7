use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum PirError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("No PIR server found on network {network}")]
    NotFound { network: String },

    #[error("Cannot determine local network: {0}")]
    NoRoute(#[source] std::io::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl PirError {
    /// Whether the caller can reasonably retry (or fall back to a manual address).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PirError::Connect { .. }
                | PirError::ConnectTimeout { .. }
                | PirError::NotFound { .. }
                | PirError::NoRoute(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PirError>;
