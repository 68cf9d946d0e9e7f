//! Error types for beacon monitoring and configuration
//!
//! Every failure that can reach a caller is a variant of [`BeaconError`]. Errors are
//! `Clone` so a single failure can be fanned out to several subscribers.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Firmware Errors
// ----------------------------------------------------------------------------

/// Terminal failures of a firmware update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FirmwareUpdateError {
    #[error("Failed to read installed firmware version: {reason}")]
    VersionCheck { reason: String },
    #[error("Failed to retrieve firmware image: {reason}")]
    Network { reason: String },
    #[error("Firmware image verification failed: expected {expected}, got {actual}")]
    Verification { expected: String, actual: String },
    #[error("Failed to write firmware image: {reason}")]
    Write { reason: String },
    #[error("Firmware update already in progress")]
    AlreadyInProgress,
}

// ----------------------------------------------------------------------------
// Beacon Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by region monitoring and beacon configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BeaconError {
    #[error("Region already active: {identifier}")]
    DuplicateRegion { identifier: String },

    #[error("Invalid region {identifier}: {reason}")]
    InvalidRegion { identifier: String, reason: String },

    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    #[error("Beacon not connected")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Unsupported value for {context}: {value}")]
    UnsupportedValue { context: String, value: String },

    #[error("Malformed {context} payload: {reason}")]
    MalformedPayload { context: String, reason: String },

    #[error("Read-back of {context} returned {actual}, expected {expected}")]
    VerificationMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Advertising failed: {reason}")]
    Advertising { reason: String },

    #[error("Firmware update failed: {0}")]
    FirmwareUpdate(#[from] FirmwareUpdateError),

    #[error("Protocol anomaly: {reason}")]
    ProtocolAnomaly { reason: String },

    #[error("Platform error: {reason}")]
    Platform { reason: String },

    #[error("Shutdown: {reason}")]
    Shutdown { reason: String },
}

impl BeaconError {
    pub fn malformed(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(context: impl Into<String>, value: impl ToString) -> Self {
        Self::UnsupportedValue {
            context: context.into(),
            value: value.to_string(),
        }
    }

    pub fn anomaly(reason: impl Into<String>) -> Self {
        Self::ProtocolAnomaly {
            reason: reason.into(),
        }
    }

    /// Whether the error ended the connection rather than a single transaction
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::NotConnected)
    }
}

pub type BeaconResult<T> = core::result::Result<T, BeaconError>;
