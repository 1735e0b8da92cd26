//! Error types for devwatch.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! condition that failed rather than on message text. Per-iteration conditions
//! inside the event pump (interrupted waits, would-block receives, datagrams
//! that do not describe a device) are absorbed and never reach this layer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::monitor::PumpState;

/// Errors raised synchronously while staging or committing socket filters.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{field} cannot be empty")]
    EmptyArgument {
        field: &'static str,
    },

    #[error("{field} contains an interior NUL byte")]
    InteriorNul {
        field: &'static str,
    },

    #[error("filter program needs {instructions} instructions, limit is {max}")]
    FilterTooLarge {
        instructions: usize,
        max: usize,
    },

    #[error("unknown event source '{name}' (expected \"udev\" or \"kernel\")")]
    UnknownSource {
        name: String,
    },

    #[error("{op} failed: {source}")]
    Kernel {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Errors from the device-record collaborator.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device at {}", path.display())]
    NotFound {
        path: PathBuf,
    },

    #[error("no device {sysname} in {subsystem}")]
    NotFoundByName {
        subsystem: String,
        sysname: String,
    },

    #[error("datagram does not describe a device: missing {field}")]
    MissingField {
        field: &'static str,
    },

    #[error("malformed datagram: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("device has no parent")]
    NoParent,

    #[error("sysfs access to {} failed: {source}", path.display())]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    /// Returns true if the datagram simply did not reference a device.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::NotFoundByName { .. } | Self::MissingField { .. }
        )
    }
}

/// Startup stage that failed inside [`Monitor::start`](crate::Monitor::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    /// Switching the socket to non-blocking mode.
    SetNonBlocking,
    /// Binding the socket to its multicast group.
    EnableReceiving,
    /// Creating the default epoll multiplexer.
    CreateMultiplexer,
    /// Registering the socket with the multiplexer.
    Register,
    /// Spawning the pump thread.
    SpawnPump,
}

impl std::fmt::Display for StartupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SetNonBlocking => "set non-blocking",
            Self::EnableReceiving => "enable receiving",
            Self::CreateMultiplexer => "create multiplexer",
            Self::Register => "register descriptor",
            Self::SpawnPump => "spawn pump thread",
        };
        f.write_str(s)
    }
}

/// Top-level error type for devwatch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Readiness registration capacity exhausted (capacity {capacity})")]
    ResourceExhausted {
        capacity: usize,
    },

    #[error("Monitor startup failed at '{stage}': {source}")]
    Startup {
        stage: StartupStage,
        #[source]
        source: io::Error,
    },

    #[error("Event stream failed: {source}")]
    FatalStream {
        #[source]
        source: io::Error,
    },

    #[error("No event within {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Operation not valid while monitor is {state}")]
    InvalidState {
        state: PumpState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WatchError {
    pub(crate) fn startup(stage: StartupStage, source: io::Error) -> Self {
        Self::Startup { stage, source }
    }

    pub(crate) fn kernel(op: &'static str, source: io::Error) -> Self {
        Self::Configuration(ConfigurationError::Kernel { op, source })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if the device collaborator reported a missing device.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::Device(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// The registration capacity that was exhausted, whether reported by a
    /// multiplexer directly or as the cause of a failed start.
    #[must_use]
    pub fn exhausted_capacity(&self) -> Option<usize> {
        match self {
            Self::ResourceExhausted { capacity } => Some(*capacity),
            Self::Startup { source, .. } => source
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<Self>())
                .and_then(Self::exhausted_capacity),
            _ => None,
        }
    }

    /// Returns true if this error ended an event stream.
    #[must_use]
    pub const fn is_fatal_stream(&self) -> bool {
        matches!(self, Self::FatalStream { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// A failed `start()` leaves the monitor idle, so it can be attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Startup { .. } | Self::ResourceExhausted { .. })
    }
}

/// Result type alias for devwatch operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_empty() {
        let err = ConfigurationError::EmptyArgument { field: "subsystem" };
        assert_eq!(err.to_string(), "subsystem cannot be empty");
    }

    #[test]
    fn test_filter_too_large_message() {
        let err = ConfigurationError::FilterTooLarge {
            instructions: 600,
            max: 512,
        };
        let msg = format!("{err}");
        assert!(msg.contains("600"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_device_not_found_is_not_found() {
        let err: WatchError = DeviceError::NotFound {
            path: PathBuf::from("/sys/devices/nope"),
        }
        .into();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/sys/devices/nope"));
    }

    #[test]
    fn test_startup_is_retryable() {
        let err = WatchError::startup(
            StartupStage::EnableReceiving,
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("enable receiving"));

        let busy = WatchError::InvalidState {
            state: PumpState::Running,
        };
        assert!(!busy.is_retryable());
        assert_eq!(busy.to_string(), "Operation not valid while monitor is running");
    }

    #[test]
    fn test_exhausted_capacity_survives_startup_wrapping() {
        let err = WatchError::startup(
            StartupStage::Register,
            io::Error::other(WatchError::ResourceExhausted { capacity: 4 }),
        );
        assert_eq!(err.exhausted_capacity(), Some(4));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("capacity 4"));

        let plain = WatchError::startup(StartupStage::Register, io::Error::from(io::ErrorKind::Other));
        assert_eq!(plain.exhausted_capacity(), None);
    }

    #[test]
    fn test_kernel_error_is_configuration() {
        let err = WatchError::kernel("attach socket filter", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("attach socket filter"));
    }

    #[test]
    fn test_fatal_stream() {
        let err = WatchError::FatalStream {
            source: io::Error::from_raw_os_error(libc::ENOBUFS),
        };
        assert!(err.is_fatal_stream());
        assert!(!err.is_configuration());
    }
}
