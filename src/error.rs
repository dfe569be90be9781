//! Error types for the ble-chat-session crate.

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

    /// The operation referenced a device id absent from the registry.
    #[error("Unknown device: {id}")]
    UnknownDevice {
        /// The identifier that was looked up.
        id: String,
    },

    /// Operation requires a live link but the device is not connected.
    #[error("Device not connected: {id}")]
    NotConnected {
        /// The identifier of the device.
        id: String,
    },

    /// The stack failed to establish a connection.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The link was torn down before the operation completed.
    #[error("Disconnected: {reason}")]
    Disconnected {
        /// Why the link went away.
        reason: String,
    },

    /// A read was attempted before characteristic discovery completed.
    #[error("No characteristic resolved for device {id}")]
    NoCharacteristicResolved {
        /// The identifier of the device.
        id: String,
    },

    /// A raw signal-strength reading could not be expressed as whole dBm.
    #[error("RSSI value is not representable in dBm: {value}")]
    UnrepresentableRssi {
        /// The raw reading as received.
        value: String,
    },

    /// A deadline elapsed before the expected transition happened.
    #[error("Operation timed out")]
    Timeout,

    /// The session worker has stopped and can no longer accept commands.
    #[error("Session closed")]
    SessionClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::UnknownDevice`].
    pub fn unknown_device(id: impl std::fmt::Display) -> Self {
        Self::UnknownDevice { id: id.to_string() }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::unknown_device("unknown-id").to_string(),
            "Unknown device: unknown-id"
        );
        assert_eq!(
            Error::NoCharacteristicResolved { id: "A".into() }.to_string(),
            "No characteristic resolved for device A"
        );
        assert_eq!(
            Error::ConnectFailed {
                reason: "peer refused".into()
            }
            .to_string(),
            "Connection failed: peer refused"
        );
    }
}
