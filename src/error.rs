//! Error types for the airsense-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The requested sensor was not found during scanning.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier or family that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the sensor is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the sensor.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the sensor was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// The user cancelled the operation (e.g. dismissed the device picker).
    #[error("Operation cancelled by user")]
    UserCancelled,

    /// The platform denied Bluetooth access.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// A transport operation did not resolve within its budget.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A notification subscription could not be established.
    #[error("Subscription failed on {channel} channel: {reason}")]
    SubscriptionFailed {
        /// The logical channel that failed to subscribe.
        channel: String,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid data was received from the sensor.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// A connection state transition was requested that the transition
    /// table does not allow.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The state the session was in.
        from: String,
        /// The state that was requested.
        to: String,
    },

    /// The device picker rejected the selection.
    #[error("Device selection rejected: {reason}")]
    PickerRejected {
        /// The reason reported by the picker.
        reason: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry discipline may re-attempt an operation that
    /// failed with this error.
    ///
    /// User cancellation, permission problems, a disabled radio, and an
    /// absent device are terminal: retrying them only delays the caller.
    /// Everything else (timeouts, transient platform rejections, link
    /// failures) is fair game for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UserCancelled
            | Self::PermissionDenied
            | Self::BluetoothUnavailable
            | Self::DeviceNotFound { .. }
            | Self::PickerRejected { .. } => false,
            Self::Bluetooth(inner) => !matches!(
                inner,
                btleplug::Error::PermissionDenied | btleplug::Error::DeviceNotFound
            ),
            _ => true,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_classes() {
        assert!(!Error::UserCancelled.is_retryable());
        assert!(!Error::PermissionDenied.is_retryable());
        assert!(!Error::BluetoothUnavailable.is_retryable());
        assert!(!Error::DeviceNotFound {
            identifier: "PMScan".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Timeout {
            operation: "connect".into()
        }
        .is_retryable());
        assert!(Error::ConnectionFailed {
            reason: "radio busy".into()
        }
        .is_retryable());
        assert!(Error::ConnectionLost.is_retryable());
        assert!(Error::Bluetooth(btleplug::Error::NotConnected).is_retryable());
        assert!(!Error::Bluetooth(btleplug::Error::PermissionDenied).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::Timeout {
            operation: "read".into(),
        };
        assert_eq!(err.to_string(), "Operation timed out: read");

        let err = Error::InvalidTransition {
            from: "Idle".into(),
            to: "Connected".into(),
        };
        assert_eq!(err.to_string(), "Invalid state transition: Idle -> Connected");
    }
}
