//! Error types shared by instrument plugins.
//!
//! `DaqError` is the single typed error that crosses the boundary between a
//! driver and the host. Using the `thiserror` crate, it keeps the taxonomy
//! small and explicit:
//!
//! - **`Configuration`**: the plugin was set up wrongly. A secondary controller
//!   without a shared connection, an unknown adapter, an unsupported address,
//!   or a setting value that cannot be translated.
//! - **`Connection`**: the transport could not be opened, or the first query
//!   against a freshly opened connection failed.
//! - **`DeviceCommand`**: an attribute write or read against the instrument
//!   failed, was rejected, or was out of range.
//!
//! Capability traits return `anyhow::Result`. A `DaqError` travels inside the
//! `anyhow::Error` and can be recovered with `downcast_ref::<DaqError>()`.

use thiserror::Error;

// =============================================================================
// Error Kinds
// =============================================================================

/// Coarse classification of a [`DaqError`], used in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Settings are wrong; retrying without changing them will not help.
    Configuration,
    /// The transport could not be opened or stopped answering.
    Communication,
    /// The instrument rejected or failed a command.
    Hardware,
    /// A parameter value was read-only or outside its choices.
    InvalidParameter,
    /// The driver was not in a state that allows the operation.
    State,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::State => "state",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the plugin error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for instrument plugins.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Raised before any byte reaches the instrument
///    - Recovery: fix the configuration and initialize again
///
/// 2. **Communication Errors** - `Connection`, `Io`
///    - Raised while opening or first talking to the transport
///    - Recovery: check cabling, address, adapter; initialize again
///
/// 3. **Runtime Errors** - `DeviceCommand`, `Parameter*`, `InvalidState`
///    - Raised by in-flight operations and reported to the caller
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn require_shared(handle: Option<u32>) -> Result<u32, DaqError> {
///     handle.ok_or_else(|| {
///         DaqError::Configuration("secondary controller has no shared connection".into())
///     })
/// }
///
/// assert!(require_shared(None).is_err());
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// The plugin settings parse but are semantically wrong (missing shared
    /// handle for a secondary, unsupported resource string, unknown label).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport could not be opened or did not answer.
    ///
    /// Wraps the underlying transport failure as text so the error stays
    /// `Send + Sync` regardless of the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An attribute write or read against the instrument failed.
    #[error("Device command error: {0}")]
    DeviceCommand(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attempted to modify a read-only parameter.
    #[error("Parameter is read-only")]
    ParameterReadOnly,

    /// Value is not one of the parameter's current choices.
    #[error("Invalid choice for parameter")]
    ParameterInvalidChoice,

    /// Operation attempted while the driver is not ready.
    #[error("Cannot {operation} while driver is {state}")]
    InvalidState {
        /// What was attempted, e.g. `"move"`.
        operation: &'static str,
        /// Lifecycle state at the time.
        state: String,
    },
}

impl DaqError {
    /// Classify this error for status reporting.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            DaqError::Configuration(_) => DriverErrorKind::Configuration,
            DaqError::Connection(_) | DaqError::Io(_) => DriverErrorKind::Communication,
            DaqError::DeviceCommand(_) => DriverErrorKind::Hardware,
            DaqError::ParameterReadOnly | DaqError::ParameterInvalidChoice => {
                DriverErrorKind::InvalidParameter
            }
            DaqError::InvalidState { .. } => DriverErrorKind::State,
        }
    }

    /// Find a `DaqError` inside an `anyhow::Error` chain.
    pub fn find(err: &anyhow::Error) -> Option<&DaqError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DaqError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::DeviceCommand("OF. rejected".to_string());
        assert_eq!(err.to_string(), "Device command error: OF. rejected");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            DaqError::Configuration("x".into()).kind(),
            DriverErrorKind::Configuration
        );
        assert_eq!(
            DaqError::Connection("x".into()).kind(),
            DriverErrorKind::Communication
        );
        assert_eq!(
            DaqError::InvalidState {
                operation: "move",
                state: "closed".into()
            }
            .kind()
            .to_string(),
            "state"
        );
    }

    #[test]
    fn test_find_through_context() {
        let err = anyhow::Error::new(DaqError::Connection("port busy".into()))
            .context("opening DSP7265");
        assert!(matches!(DaqError::find(&err), Some(DaqError::Connection(_))));
    }
}
