//! Error types for the compartment simulator core

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building, discretizing, or simulating
#[derive(Error, Debug)]
pub enum CoreError {
    /// Numeric format error
    #[error("Format error: {source}")]
    Format {
        #[from]
        /// Source encoding error
        source: cxemu_fmt::FmtError,
    },

    /// Invalid parameter value
    #[error("Invalid parameter {parameter}: {value} (expected {constraint})")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// A per-group hardware resource limit was exceeded
    #[error("Group capacity exceeded: {resource} ({used} > {limit})")]
    CapacityExceeded {
        /// Resource name
        resource: &'static str,
        /// Amount requested
        used: usize,
        /// Hardware limit
        limit: usize,
    },

    /// A location name did not parse
    #[error("Unknown location {name:?} (expected \"core\" or \"host\")")]
    UnknownLocation {
        /// Offending name
        name: String,
    },

    /// No feasible fixed-point scaling exists for a group
    #[error("Discretization failed: {reason}")]
    DiscretizationFailed {
        /// Reason scale selection gave up
        reason: String,
    },

    /// A runtime value left its hardware bit budget in strict mode
    #[error("Arithmetic overflow at tick {tick}: {field} outside signed {bits}-bit range")]
    Overflow {
        /// Tick at which the violation occurred
        tick: usize,
        /// State field name
        field: &'static str,
        /// Signed bit budget
        bits: u32,
    },

    /// A spike input ran out of rows before the requested step count
    #[error("Spike input {input} exhausted at tick {tick} (only {rows} rows)")]
    SpikesExhausted {
        /// Input position in the model
        input: usize,
        /// Tick that had no row
        tick: usize,
        /// Rows available
        rows: usize,
    },

    /// A probe key does not name state present on its target
    #[error("Probe key {key} not available on {target}")]
    BadProbeKey {
        /// Requested key
        key: &'static str,
        /// Target description
        target: String,
    },

    /// A handle does not refer to anything in this model
    #[error("Unknown handle: {reason}")]
    UnknownHandle {
        /// What the handle was expected to name
        reason: String,
    },

    /// The model was mutated after being frozen by discretization
    #[error("Model is frozen: {reason}")]
    Frozen {
        /// Operation that was refused
        reason: String,
    },

    /// The kernel was stepped after being closed
    #[error("Kernel is closed")]
    KernelClosed,
}

impl CoreError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(
        parameter: impl Into<String>,
        value: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
            constraint: constraint.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity(resource: &'static str, used: usize, limit: usize) -> Self {
        Self::CapacityExceeded {
            resource,
            used,
            limit,
        }
    }

    /// Create a discretization error
    pub fn discretization(reason: impl Into<String>) -> Self {
        Self::DiscretizationFailed {
            reason: reason.into(),
        }
    }

    /// Create a frozen-model error
    pub fn frozen(reason: impl Into<String>) -> Self {
        Self::Frozen {
            reason: reason.into(),
        }
    }

    /// Create an unknown-handle error
    pub fn unknown_handle(reason: impl Into<String>) -> Self {
        Self::UnknownHandle {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::invalid_parameter("tau_s", "-1", ">= 0");
        assert!(matches!(err, CoreError::InvalidParameter { .. }));

        let err = CoreError::capacity("axons", 5000, 4096);
        assert!(matches!(err, CoreError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::capacity("axons", 5000, 4096);
        let msg = format!("{}", err);
        assert!(msg.contains("axons"));
        assert!(msg.contains("5000"));
        assert!(msg.contains("4096"));

        let err = CoreError::Overflow {
            tick: 7,
            field: "u",
            bits: 23,
        };
        assert!(format!("{}", err).contains("tick 7"));
    }

    #[test]
    fn test_format_error_conversion() {
        let fmt_err = cxemu_fmt::FmtError::UnsupportedCompression { mode: 2 };
        let err: CoreError = fmt_err.into();
        assert!(matches!(err, CoreError::Format { .. }));
    }
}
