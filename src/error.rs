//! Error types for fatwal
//!
//! Provides a unified error type for all log operations.

use thiserror::Error;

/// Result type alias using FatWalError
pub type Result<T> = std::result::Result<T, FatWalError>;

/// Unified error type for fatwal operations
#[derive(Debug, Error)]
pub enum FatWalError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    /// The log buffer cannot hold another entry; the caller must fail the transaction.
    #[error("No more space in log: need {needed} bytes, capacity is {capacity}")]
    NoMoreSpace { needed: usize, capacity: usize },

    /// A length, offset or checksum read from the log is inconsistent.
    #[error("Log file corrupt: {0}")]
    FileCorrupt(String),

    /// Unknown entry type or a sector outside the volume.
    #[error("Sector invalid: {0}")]
    SectorInvalid(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Fault tolerant log is not enabled")]
    NotEnabled,

    #[error("No transaction is open")]
    TransactionNotStarted,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for FatWalError {
    fn from(err: bincode::Error) -> Self {
        FatWalError::Serialization(err.to_string())
    }
}
