//! Error types for the NAT engine.

use crate::config::IpFamily;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Per-packet failures inside the pump are never reported through this type;
/// they are counted as [`DropReason`](crate::pump::DropReason)s instead.
#[derive(Debug, Error)]
pub enum TunatError {
    /// Invalid construction-time configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A setup command failed; the remaining commands were not run.
    #[error("Command `{command}` failed: {output}")]
    Command { command: String, output: String },

    /// Device acquisition failed.
    #[error("TUN device error: {0}")]
    TunDevice(String),

    /// Reading from or writing to the packet device failed.
    #[error("Device I/O error: {0}")]
    Device(std::io::Error),

    /// The device was closed and the packet pump has stopped.
    #[error("Device closed")]
    DeviceClosed,

    /// An accepted local connection has no matching flow.
    #[error("No tracked flow for accepted connection from {0}")]
    UntrackedConnection(SocketAddr),

    /// The requested IP family has no configured prefix.
    #[error("{0} is not configured")]
    FamilyNotConfigured(IpFamily),

    /// Spoofed datagram source and destination belong to different families.
    #[error("Address family mismatch: {src} -> {dst}")]
    AddressFamilyMismatch { src: SocketAddr, dst: SocketAddr },

    /// Payload cannot fit in a single IP frame.
    #[error("Payload of {0} bytes does not fit in a single frame")]
    PayloadTooLarge(usize),

    /// Local socket I/O error (listener bind, accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunatError {
    /// Returns true if this error means the engine is inert.
    ///
    /// Once the device has failed or been closed the pump never restarts,
    /// so every later device operation reports the same condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunatError::Device(_) | TunatError::DeviceClosed)
    }
}

/// Result type alias for engine operations.
pub type TunatResult<T> = Result<T, TunatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TunatError::DeviceClosed.is_fatal());
        assert!(TunatError::Device(std::io::Error::other("boom")).is_fatal());

        assert!(!TunatError::Config("bad".into()).is_fatal());
        assert!(!TunatError::UntrackedConnection("10.0.0.2:1".parse().unwrap()).is_fatal());
        assert!(!TunatError::PayloadTooLarge(70000).is_fatal());
    }

    #[test]
    fn test_command_error_message() {
        let err = TunatError::Command {
            command: "ip link set tun1 up".into(),
            output: "Cannot find device".into(),
        };
        assert_eq!(
            err.to_string(),
            "Command `ip link set tun1 up` failed: Cannot find device"
        );
    }
}
