//! Canonical error taxonomy for the wt-rtu workspace.
//!
//! Every subsystem error maps onto one of the canonical [`ErrorKind`]
//! values. Operator-facing surfaces (CLI, fieldbus record services) report
//! the kind plus a human-readable message; internal call sites match on
//! the structured [`RtuError`] variants.

use thiserror::Error;

/// Canonical error kinds shared across all subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation completed successfully.
    Ok,
    /// A parameter was outside its documented domain.
    InvalidParam,
    /// The referenced entity does not exist.
    NotFound,
    /// The entity (name, slot, pin) is already taken.
    AlreadyExists,
    /// The subsystem has not been initialised yet.
    NotInitialised,
    /// An allocation or capacity limit was exceeded.
    NoMemory,
    /// An underlying I/O operation failed.
    IoError,
    /// The operation did not complete within its deadline.
    Timeout,
    /// The operation is not supported by this device or driver.
    NotSupported,
    /// The operation is not legal in the current state.
    InvalidState,
}

impl ErrorKind {
    /// Stable tag used by the log rate limiter and diagnostics.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidParam => "invalid_param",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::NotInitialised => "not_initialised",
            Self::NoMemory => "no_memory",
            Self::IoError => "io_error",
            Self::Timeout => "timeout",
            Self::NotSupported => "not_supported",
            Self::InvalidState => "invalid_state",
        }
    }
}

/// Errors raised by the wt-rtu runtime.
#[derive(Debug, Clone, Error)]
pub enum RtuError {
    /// A parameter failed validation.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// The referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique-name, unique-slot or pin ownership conflict.
    /// The payload names the existing owner.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A subsystem was used before initialisation.
    #[error("Not initialised: {0}")]
    NotInitialised(String),

    /// A capacity limit was exceeded.
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// An I/O operation against hardware or the filesystem failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A read or transaction exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The request is not supported here.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The request is illegal in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RtuError {
    /// Canonical kind of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParam(_) => ErrorKind::InvalidParam,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotInitialised(_) => ErrorKind::NotInitialised,
            Self::NoMemory(_) => ErrorKind::NoMemory,
            Self::Io(_) => ErrorKind::IoError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

impl From<std::io::Error> for RtuError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Result alias used throughout the workspace.
pub type RtuResult<T> = Result<T, RtuError>;

/// Process exit codes for the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success.
    Success = 0,
    /// Generic failure.
    Failure = 1,
    /// Configuration error.
    Config = 2,
    /// Hardware-binding error.
    Hardware = 3,
    /// Persistent-store error.
    Store = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_message() {
        let err = RtuError::AlreadyExists("pump_1".to_string());
        assert!(err.to_string().contains("pump_1"));

        let err = RtuError::Timeout("i2c bus 1".to_string());
        assert!(err.to_string().contains("i2c bus 1"));
    }

    #[test]
    fn kind_mapping_is_stable() {
        assert_eq!(
            RtuError::InvalidParam(String::new()).kind(),
            ErrorKind::InvalidParam
        );
        assert_eq!(RtuError::Io(String::new()).kind(), ErrorKind::IoError);
        assert_eq!(
            RtuError::NotSupported(String::new()).kind(),
            ErrorKind::NotSupported
        );
    }

    #[test]
    fn io_error_conversion_maps_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RtuError = io.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::Config as i32, 2);
        assert_eq!(ExitCode::Hardware as i32, 3);
        assert_eq!(ExitCode::Store as i32, 4);
    }
}
