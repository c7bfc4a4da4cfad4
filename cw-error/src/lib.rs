//! Unified error handling for corewatch
//!
//! Every failure in the telemetry engine maps onto one of these variants.
//! Most of them are recovered locally by the caller (a sensor goes null,
//! a calibration keeps its previous estimate); they exist so that checked
//! accessors and the CLI can say what went wrong.

use std::io;
use std::path::PathBuf;

/// Result type alias using CorewatchError
pub type Result<T> = std::result::Result<T, CorewatchError>;

/// Unified error type for all corewatch operations
#[derive(thiserror::Error, Debug)]
pub enum CorewatchError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Register Access Errors
    // ============================================================================
    #[error("Privileged mediator unavailable: {0}")]
    MediatorUnavailable(String),

    #[error("Register session is not open")]
    SessionNotOpen,

    #[error("Register read failed: {0}")]
    RegisterRead(String),

    #[error("PCI register offset 0x{offset:X} is not 4-byte aligned")]
    UnalignedAccess {
        offset: u32,
    },

    #[error("Driver installation failed: {0}")]
    DriverInstall(String),

    #[error("Wire protocol error: {0}")]
    Protocol(String),

    // ============================================================================
    // Processor Errors
    // ============================================================================
    #[error("Failed to set thread affinity to mask 0x{mask:X}: {reason}")]
    Affinity {
        mask: u64,
        reason: String,
    },

    #[error("Clock calibration error {error:.6} above threshold {threshold}")]
    CalibrationImprecise {
        error: f64,
        threshold: f64,
    },

    #[error("Unknown microarchitecture: family 0x{family:X} model 0x{model:X}")]
    UnknownMicroarchitecture {
        family: u32,
        model: u32,
    },

    // ============================================================================
    // Identifier and Settings Errors
    // ============================================================================
    #[error("Invalid identifier token {token:?}: {reason}")]
    InvalidIdentifier {
        token: String,
        reason: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl CorewatchError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn register_read(what: impl Into<String>) -> Self {
        Self::RegisterRead(what.into())
    }

    pub fn affinity(mask: u64, reason: impl Into<String>) -> Self {
        Self::Affinity {
            mask,
            reason: reason.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::MediatorUnavailable(msg.into())
    }

    /// Errors that leave the monitoring session usable.
    ///
    /// Only lifecycle misuse is not recoverable; everything else turns a
    /// sensor null for one update and is retried on the next.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SessionNotOpen)
    }
}

// Allow converting from String to CorewatchError
impl From<String> for CorewatchError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to CorewatchError
impl From<&str> for CorewatchError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
