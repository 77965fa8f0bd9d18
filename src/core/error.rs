//! Error types for device sessions
//!
//! `TransportError` carries whatever the transport layer reports and is passed
//! through unchanged. `SessionError` is the small taxonomy the session layer
//! adds on top of it.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a transport (libmtp, the mock transport, ...)
#[derive(Error, Debug)]
pub enum TransportError {
    /// USB subsystem or the native library could not be used
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Device is claimed by another process or session
    #[error("Device busy: {0}")]
    Busy(String),

    /// The OS refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// MTP/PTP negotiation or command failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device discovery did not complete in time
    #[error("Device discovery timed out after {0:?}")]
    Timeout(Duration),

    /// A transfer was aborted by its progress callback
    #[error("Operation cancelled")]
    Cancelled,

    /// Object, storage or folder id does not exist on the device
    #[error("Object not found: {0}")]
    NotFound(u32),

    /// Local file I/O failed during a transfer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else the transport reports
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Discovery succeeded but nothing is attached
    #[error("No MTP device found. Make sure the device is connected and unlocked.")]
    NoDevice,

    /// Failure originating in the transport
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Device operation attempted on a closed session
    #[error("Device session is already closed")]
    SessionClosed,
}

impl SessionError {
    /// The wrapped transport error, if any
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Why one device in a multi-device call failed
#[derive(Debug)]
pub enum FailureKind<E> {
    /// Opening the session failed
    Open(TransportError),
    /// The caller's callback returned an error
    Callback(E),
}

/// A per-device failure from `connect_all` / `connect_all_with`
#[derive(Debug)]
pub struct DeviceFailure<E> {
    /// Position of the device in discovery order
    pub index: usize,
    /// Description of the raw device, captured before open
    pub label: String,
    /// What went wrong
    pub kind: FailureKind<E>,
}

impl<E: fmt::Display> fmt::Display for DeviceFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Open(e) => {
                write!(f, "device #{} ({}): open failed: {}", self.index, self.label, e)
            }
            FailureKind::Callback(e) => write!(f, "device #{} ({}): {}", self.index, self.label, e),
        }
    }
}

/// Error returned by `SessionManager::connect_all_with`
#[derive(Debug)]
pub enum ConnectEachError<E> {
    /// Discovery itself failed; no device was opened
    Discovery(SessionError),
    /// One or more devices failed to open or their callback failed
    Devices(Vec<DeviceFailure<E>>),
}

impl<E> ConnectEachError<E> {
    /// Per-device failures (empty for discovery errors)
    pub fn failures(&self) -> &[DeviceFailure<E>] {
        match self {
            ConnectEachError::Discovery(_) => &[],
            ConnectEachError::Devices(failures) => failures,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ConnectEachError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectEachError::Discovery(e) => write!(f, "Device discovery failed: {}", e),
            ConnectEachError::Devices(failures) => {
                write!(f, "{} device(s) failed", failures.len())?;
                for failure in failures {
                    write!(f, "; {}", failure)?;
                }
                Ok(())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ConnectEachError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_passes_through_session_error() {
        let err: SessionError = TransportError::Busy("busy".to_string()).into();
        assert_eq!(err.to_string(), "Device busy: busy");
        assert!(matches!(err.transport(), Some(TransportError::Busy(_))));
        assert!(SessionError::NoDevice.transport().is_none());
    }

    #[test]
    fn test_connect_each_error_display() {
        let err: ConnectEachError<String> = ConnectEachError::Devices(vec![
            DeviceFailure {
                index: 1,
                label: "Creative ZEN".to_string(),
                kind: FailureKind::Open(TransportError::Busy("busy".to_string())),
            },
            DeviceFailure {
                index: 2,
                label: "Sansa".to_string(),
                kind: FailureKind::Callback("disk full".to_string()),
            },
        ]);

        let text = err.to_string();
        assert!(text.starts_with("2 device(s) failed"));
        assert!(text.contains("device #1 (Creative ZEN): open failed: Device busy: busy"));
        assert!(text.contains("device #2 (Sansa): disk full"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_discovery_error_has_no_device_failures() {
        let err: ConnectEachError<String> = ConnectEachError::Discovery(SessionError::NoDevice);
        assert!(err.failures().is_empty());
        assert!(err.to_string().contains("No MTP device found"));
    }
}
