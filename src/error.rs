//! Error types surfaced through the gauge's last-error slot

use thiserror::Error;

/// Everything that can go wrong between the sensor and the fuel account.
///
/// None of these are fatal. The gauge records the most recent one and keeps
/// running; a fresh attempt only happens through the disconnect/rescan cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FuelError {
    /// The Bluetooth radio is off or otherwise unusable
    #[error("Bluetooth transport unavailable")]
    TransportUnavailable,

    /// The device does not expose the expected service/characteristic shape
    #[error("Firmware mismatch: expected {expected} {what}, found {found}")]
    FirmwareMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A payload did not have the width its decoder requires
    #[error("Invalid payload length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// A decoded fuel estimate that cannot be a volume of fuel
    #[error("Implausible fuel estimate: {0} L")]
    ImplausibleFuel(f64),

    /// Discovery, read or subscribe failed in the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// The account could not be loaded or saved
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for FuelError {
    fn from(err: std::io::Error) -> Self {
        FuelError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FuelError {
    fn from(err: serde_json::Error) -> Self {
        FuelError::Storage(err.to_string())
    }
}
