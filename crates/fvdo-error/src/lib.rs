#![forbid(unsafe_code)]
//! Error types for FrankenVDO.
//!
//! Defines `VdoError`, a `Result<T>` alias used throughout the workspace,
//! and the mapping from internal status codes to the system error codes
//! the host block layer understands.

use thiserror::Error;

/// Internal status codes, in the range reserved above system errnos.
///
/// Codes below [`status::BASE`] are plain (positive) errnos; codes at or
/// above it belong to the device and must be translated before they reach
/// the host.
pub mod status {
    pub const BASE: i32 = 1024;
    pub const NO_SPACE: i32 = BASE + 1;
    pub const READ_ONLY: i32 = BASE + 2;
    pub const BAD_STATE: i32 = BASE + 3;
    pub const PARAMETER_MISMATCH: i32 = BASE + 4;
    pub const COMPONENT_BUSY: i32 = BASE + 5;
    pub const INVALID_REQUEST: i32 = BASE + 6;
    pub const BAD_CONFIGURATION: i32 = BASE + 7;
    pub const INTERNAL: i32 = BASE + 8;
}

/// Unified error type for all FrankenVDO operations.
#[derive(Debug, Error)]
pub enum VdoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Classifier rejection; surfaced to the host directly.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A lifecycle transition was attempted from the wrong state.
    #[error("{operation} invoked while in state {state}")]
    BadState {
        operation: &'static str,
        state: &'static str,
    },

    /// An attempt to change an immutable configuration field.
    #[error("parameter mismatch: {0}")]
    ParameterMismatch(&'static str),

    /// An administrative operation is already in progress.
    #[error("component busy: {0}")]
    ComponentBusy(&'static str),

    /// The engine has latched read-only; only reads of already-mapped
    /// data succeed.
    #[error("device is read-only")]
    ReadOnly,

    #[error("no space left on device")]
    NoSpace,

    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    /// Any other engine failure, carrying the engine's status code.
    #[error("internal status {0}")]
    Internal(i32),
}

impl VdoError {
    /// The internal status code for this error, suitable for
    /// [`map_to_system_error`].
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidRequest(_) => status::INVALID_REQUEST,
            Self::BadState { .. } => status::BAD_STATE,
            Self::ParameterMismatch(_) => status::PARAMETER_MISMATCH,
            Self::ComponentBusy(_) => status::COMPONENT_BUSY,
            Self::ReadOnly => status::READ_ONLY,
            Self::NoSpace => status::NO_SPACE,
            Self::BadConfiguration(_) => status::BAD_CONFIGURATION,
            Self::Internal(code) => *code,
        }
    }

    /// The negative system error code to complete a host request with.
    #[must_use]
    pub fn to_system_error(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) | Self::ParameterMismatch(_) | Self::BadConfiguration(_) => {
                -libc::EINVAL
            }
            Self::BadState { .. } => -libc::EINVAL,
            Self::ComponentBusy(_) => -libc::EBUSY,
            _ => map_to_system_error(self.status_code()),
        }
    }
}

/// Map an internal status code to a system error code for the host.
///
/// Zero and negative codes pass through unchanged. Small positive codes
/// are errnos used without negation and are negated here. Device codes at
/// or above [`status::BASE`] map through a fixed table; anything
/// unrecognized becomes a generic I/O error with a log entry.
#[must_use]
pub fn map_to_system_error(error: i32) -> i32 {
    if error <= 0 {
        return error;
    }
    if error < status::BASE {
        return -error;
    }
    match error {
        status::NO_SPACE => -libc::ENOSPC,
        status::READ_ONLY => -libc::EIO,
        other => {
            tracing::info!(
                target: "fvdo::error",
                event = "status_mapped_to_eio",
                status = other
            );
            -libc::EIO
        }
    }
}

/// Result alias using `VdoError`.
pub type Result<T> = std::result::Result<T, VdoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_system_codes_pass_through() {
        assert_eq!(map_to_system_error(0), 0);
        assert_eq!(map_to_system_error(-libc::EIO), -libc::EIO);
    }

    #[test]
    fn small_positive_codes_are_negated() {
        assert_eq!(map_to_system_error(libc::EINVAL), -libc::EINVAL);
        assert_eq!(map_to_system_error(libc::EBUSY), -libc::EBUSY);
    }

    #[test]
    fn device_codes_map_through_table() {
        assert_eq!(map_to_system_error(status::NO_SPACE), -libc::ENOSPC);
        assert_eq!(map_to_system_error(status::READ_ONLY), -libc::EIO);
        assert_eq!(map_to_system_error(status::INTERNAL), -libc::EIO);
    }

    #[test]
    fn error_to_system_error() {
        assert_eq!(VdoError::NoSpace.to_system_error(), -libc::ENOSPC);
        assert_eq!(VdoError::ReadOnly.to_system_error(), -libc::EIO);
        assert_eq!(
            VdoError::InvalidRequest("flush must be empty").to_system_error(),
            -libc::EINVAL
        );
        assert_eq!(
            VdoError::ComponentBusy("resize").to_system_error(),
            -libc::EBUSY
        );
        assert_eq!(
            VdoError::BadState {
                operation: "submit",
                state: "Suspended",
            }
            .to_system_error(),
            -libc::EINVAL
        );
    }

    #[test]
    fn io_error_carries_raw_errno() {
        let err = VdoError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.status_code(), libc::ENOSPC);
        assert_eq!(err.to_system_error(), -libc::ENOSPC);
    }
}
