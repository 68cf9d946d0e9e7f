//! Errors reported by platform collaborators

use beacon_core::BeaconError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures reported by the platform Bluetooth stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Bluetooth is powered off")]
    PoweredOff,

    #[error("Peripheral not found: {address}")]
    PeripheralNotFound { address: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failure(String),
}

impl From<PlatformError> for BeaconError {
    fn from(err: PlatformError) -> Self {
        BeaconError::Platform {
            reason: err.to_string(),
        }
    }
}

impl From<btleplug::Error> for PlatformError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => PlatformError::PeripheralNotFound {
                address: "unknown".to_string(),
            },
            btleplug::Error::NotSupported(what) => PlatformError::Unsupported(what),
            other => PlatformError::Failure(other.to_string()),
        }
    }
}

/// Map a platform failure during connection establishment
pub(crate) fn connection_error(err: PlatformError) -> BeaconError {
    BeaconError::Connection {
        reason: err.to_string(),
    }
}

/// Map a platform failure reported by the advertiser
pub(crate) fn advertising_error(err: PlatformError) -> BeaconError {
    BeaconError::Advertising {
        reason: err.to_string(),
    }
}
