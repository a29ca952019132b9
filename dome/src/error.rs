//! Dome error types
//!
//! Every controller command returns a [`DomeResult`]. `Ok(())` covers both
//! real successes and no-op successes ("already open", "already parked").
//! Failures fall into four kinds which also decide the log level.

use std::time::Duration;
use thiserror::Error;

/// Broad failure classes of the dome core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Not connected, invalid parameter, already busy. No device interaction happened.
    Precondition,
    /// A command could not be delivered or a property is missing.
    Communication,
    /// A bounded wait expired.
    Timeout,
    /// Weather or geometry makes the operation unsafe.
    Safety,
}

/// Dome coordination errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomeError {
    #[error("Dome not connected")]
    NotConnected,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Azimuth {azimuth:.2}° outside limits [{min:.2}°, {max:.2}°]")]
    OutsideLimits { azimuth: f64, min: f64, max: f64 },

    #[error("Dome busy: {0}")]
    Busy(String),

    #[error("Home position not set")]
    HomeNotSet,

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("Failed to send {property}: {message}")]
    SendFailed { property: String, message: String },

    #[error("Dome coordinator is no longer available")]
    CoordinatorDropped,

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Unsafe to operate: {0}")]
    Unsafe(String),
}

impl DomeError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomeError::NotConnected
            | DomeError::InvalidParameter(_)
            | DomeError::OutsideLimits { .. }
            | DomeError::Busy(_)
            | DomeError::HomeNotSet => ErrorKind::Precondition,
            DomeError::PropertyNotFound(_)
            | DomeError::SendFailed { .. }
            | DomeError::CoordinatorDropped => ErrorKind::Communication,
            DomeError::Timeout { .. } => ErrorKind::Timeout,
            DomeError::Unsafe(_) => ErrorKind::Safety,
        }
    }

    /// Log this error at the level its kind calls for.
    ///
    /// Precondition and safety failures are warnings; communication and
    /// timeout failures are errors.
    pub fn log(&self, device: &str, context: &str) {
        match self.kind() {
            ErrorKind::Precondition | ErrorKind::Safety => {
                tracing::warn!("[{}] {}: {}", device, context, self)
            }
            ErrorKind::Communication | ErrorKind::Timeout => {
                tracing::error!("[{}] {}: {}", device, context, self)
            }
        }
    }
}

impl From<DomeError> for String {
    fn from(err: DomeError) -> String {
        err.to_string()
    }
}

/// Result type for dome operations
pub type DomeResult<T> = Result<T, DomeError>;
