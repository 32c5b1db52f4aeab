use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The port exists but cannot be used right now (busy, or the radio link timed out).
    #[error("serial port {port} is busy or unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("serial i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected response from sensor: {0}")]
    Protocol(String),
    #[error("driver not initialized; call initialize() first")]
    NotInitialized,
}

impl DriverError {
    /// Classifies a serial open failure for `port`.
    pub fn from_open(port: &str, err: serialport::Error) -> Self {
        if is_unavailable(&err) {
            DriverError::PortUnavailable {
                port: port.to_string(),
                reason: err.description,
            }
        } else {
            DriverError::Open {
                port: port.to_string(),
                reason: err.description,
            }
        }
    }

    pub fn is_port_unavailable(&self) -> bool {
        matches!(self, DriverError::PortUnavailable { .. })
    }
}

impl From<serialport::Error> for DriverError {
    fn from(value: serialport::Error) -> Self {
        DriverError::Io(value.into())
    }
}

// Windows reports an unreachable Bluetooth COM port as OS error 121 (semaphore timeout).
fn is_unavailable(err: &serialport::Error) -> bool {
    if let serialport::ErrorKind::Io(io::ErrorKind::TimedOut) = err.kind() {
        return true;
    }
    let description = err.description.to_ascii_lowercase();
    description.contains("os error 121")
        || description.contains("semaphore timeout")
        || description.contains("busy")
}

/// The calibration formula has no physical meaning for this reading.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error(
    "gsr reading outside calibrated domain: range {range}, magnitude {magnitude}, \
     {voltage:.4} V (unguarded conductance {unguarded})"
)]
pub struct CalibrationDomainError {
    pub range: u8,
    pub magnitude: u16,
    pub voltage: f64,
    /// What the formula yields without the guard: negative or infinite.
    pub unguarded: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn timed_out_open_is_unavailable() {
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::TimedOut),
            "open timed out",
        );
        assert!(DriverError::from_open("COM9", err).is_port_unavailable());
    }
    #[test]
    fn semaphore_timeout_is_unavailable() {
        let err = serialport::Error::new(
            serialport::ErrorKind::Unknown,
            "The semaphore timeout period has expired. (os error 121)",
        );
        assert!(DriverError::from_open("COM9", err).is_port_unavailable());
    }
    #[test]
    fn missing_port_is_fatal() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "no such file");
        let classified = DriverError::from_open("/dev/ttyUSB7", err);
        assert!(!classified.is_port_unavailable());
        assert!(matches!(classified, DriverError::Open { .. }));
    }
}
