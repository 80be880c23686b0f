use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlcError {
    #[error("PLC link is not connected")]
    Disconnected,
    #[error("PLC communication failed: {0}")]
    Communication(#[from] io::Error),
    #[error("PLC protocol violation: {0}")]
    Protocol(String),
    #[error("PLC rejected the request: {0}")]
    Rejected(String),
    #[error("invalid PLC address: {0}")]
    InvalidAddress(String),
    #[error("PLC request timed out after {0:?}")]
    Timeout(Duration),
}

impl PlcError {
    /// Whether the connection that produced this error can no longer be trusted.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            PlcError::Communication(_) | PlcError::Protocol(_) | PlcError::Timeout(_)
        )
    }
}
