//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failures that can occur while sequencing
//! an experiment, from configuration and I/O issues to device faults.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps errors from the `figment` crate, typically file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: semantic errors that pass parsing but are
//!   logically invalid (an ITI range with min > max, a duplicate timeline
//!   slice). Caught during the validation step.
//! - **`UnknownTrialType`**: a trial-type name with no entry in the
//!   configured option set.
//! - **`Io`**: wraps standard `std::io::Error` for file I/O.
//! - **`FileCollision`**: a recording target already exists on disk. This
//!   is a hard stop — the rig never silently overwrites footage.
//! - **`ChainTimeout`** / **`DeviceFault`** / **`Device`**: device-chain
//!   failures. The coordinator performs no retry or rollback; the caller
//!   owns cleanup.
//! - **`Pattern`**: a filename template failed placeholder substitution.
//! - **`Log`**: the trial log sink failed; the handle is closed before
//!   this surfaces so the experiment never continues unmonitored.
//!
//! By using `#[from]`, `RigError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

use crate::core::DeviceState;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum RigError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Requested trial type is not in the configured option set.
    #[error("Unknown trial type '{0}'")]
    UnknownTrialType(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A recording target already exists on disk.
    #[error("Recording target '{}' already exists", .0.display())]
    FileCollision(std::path::PathBuf),

    /// A device chain pass did not complete within its deadline.
    #[error("Device chain timed out waiting for '{device}' to become {target:?}")]
    ChainTimeout {
        /// Device pending when the deadline expired.
        device: String,
        /// State it was being driven toward.
        target: DeviceState,
    },

    /// A device reported the error state during a chain pass.
    #[error("Device '{0}' entered the error state")]
    DeviceFault(String),

    /// General device error (illegal transition, lost state channel, ...).
    #[error("Device error: {0}")]
    Device(String),

    /// A filename template failed placeholder substitution.
    #[error("Filename pattern error: {0}")]
    Pattern(String),

    /// The trial log sink failed to write.
    #[error("Log write error: {0}")]
    Log(String),

    /// Shutdown finished but one or more steps failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RigError>),
}

impl From<strfmt::FmtError> for RigError {
    fn from(err: strfmt::FmtError) -> Self {
        RigError::Pattern(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::DeviceFault("mcdaq".to_string());
        assert_eq!(err.to_string(), "Device 'mcdaq' entered the error state");
    }

    #[test]
    fn test_chain_timeout_display() {
        let err = RigError::ChainTimeout {
            device: "writer-0".to_string(),
            target: DeviceState::Active,
        };
        assert!(err.to_string().contains("writer-0"));
        assert!(err.to_string().contains("Active"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = RigError::ShutdownFailed(vec![
            RigError::Device("player timeout".into()),
            RigError::Log("disk full".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
