//! Error types for pulse-core.
//!
//! Transport-level failures never end the process. They degrade observable
//! state (scanning flag, connection state) and are published through
//! [`Fault`] values so callers can inspect them, not just read them in logs.
//!
//! # Recovery
//!
//! | Error Type | Recoverable | Observable effect |
//! |------------|-------------|-------------------|
//! | [`Error::TransportUnavailable`] | No | Returned from construction |
//! | [`Error::ScanFailure`] | Yes | Scanning flag cleared |
//! | [`Error::ConnectionLost`] | Yes | State returns to disconnected; reselect to retry |
//! | [`Error::CharacteristicNotFound`] | Yes | Subscribe is a no-op |
//! | [`Error::Decode`] | Yes | Previous sample kept, stream continues |
//! | [`Error::Timeout`] | Yes | Operation abandoned, state reverted |
//!
//! Nothing is retried automatically; reconnect policy belongs to the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pulse_types::{ConnectionState, DecodeError};

/// Errors that can occur while scanning for or talking to a heart-rate monitor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No Bluetooth adapter, or the radio stack is missing.
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The radio reported a scan failure.
    #[error("Scan failed: {0}")]
    ScanFailure(String),

    /// The link dropped or could not be established.
    #[error("Connection lost to {device_id}")]
    ConnectionLost {
        /// The peripheral identifier.
        device_id: String,
    },

    /// Required characteristic missing from the service catalog.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// A notification payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Operation attempted while not connected to a device.
    #[error("Not connected to device")]
    NotConnected,

    /// A device operation was requested with no device selected.
    #[error("No device selected")]
    NoDeviceSelected,

    /// Operation not valid in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state at the time.
        state: ConnectionState,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The persistence sink rejected a call.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The owning task has shut down.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Classification of an [`Error`], cheap to clone and publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::TransportUnavailable`].
    TransportUnavailable,
    /// See [`Error::ScanFailure`].
    ScanFailure,
    /// See [`Error::ConnectionLost`].
    ConnectionLost,
    /// See [`Error::CharacteristicNotFound`].
    CharacteristicNotFound,
    /// See [`Error::Decode`].
    Decode,
    /// See [`Error::Bluetooth`].
    Bluetooth,
    /// See [`Error::NotConnected`], [`Error::NoDeviceSelected`] and [`Error::InvalidState`].
    InvalidState,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Persistence`].
    Persistence,
    /// See [`Error::Cancelled`].
    Cancelled,
}

/// A published failure: the kind plus the rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&Error> for Fault {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error {
    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection lost error.
    pub fn connection_lost(device_id: impl Into<String>) -> Self {
        Self::ConnectionLost {
            device_id: device_id.into(),
        }
    }

    /// Create a persistence error from any displayable failure.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Error::ScanFailure(_) => ErrorKind::ScanFailure,
            Error::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Error::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Bluetooth(_) => ErrorKind::Bluetooth,
            Error::NotConnected | Error::NoDeviceSelected | Error::InvalidState { .. } => {
                ErrorKind::InvalidState
            }
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the session can continue after this error.
    ///
    /// Only a missing transport is fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::TransportUnavailable(_))
    }
}

/// Result type alias using pulse-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
