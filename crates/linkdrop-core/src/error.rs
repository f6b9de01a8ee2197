//! Error types for Linkdrop core

use crate::host::HostError;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in Linkdrop core
#[derive(Debug, Error)]
pub enum LinkdropError {
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Batch not found: {0}")]
    NotFound(Uuid),

    #[error("Origin is not trusted: {0}")]
    UntrustedOrigin(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for LinkdropError {
    fn from(error: serde_json::Error) -> Self {
        LinkdropError::Serialization(error.to_string())
    }
}

impl LinkdropError {
    /// Whether the host could not be reached at all
    pub fn is_disconnected(&self) -> bool {
        matches!(self, LinkdropError::Host(HostError::Disconnected))
    }
}
