//! Error types for numeric field encodings

use thiserror::Error;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, FmtError>;

/// Errors that can occur while validating or applying a field encoding
#[derive(Error, Debug)]
pub enum FmtError {
    /// A synapse format field is outside its hardware range
    #[error("Invalid synapse format field {field}: {value} (expected {constraint})")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Offending value
        value: i64,
        /// Constraint description
        constraint: &'static str,
    },

    /// The requested compression mode has no memory-accounting rule
    #[error("Unsupported synapse compression mode {mode}")]
    UnsupportedCompression {
        /// Compression mode value
        mode: u8,
    },
}

impl FmtError {
    /// Create an invalid field error
    pub fn invalid_field(field: &'static str, value: i64, constraint: &'static str) -> Self {
        Self::InvalidField {
            field,
            value,
            constraint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FmtError::invalid_field("wgtExp", 9, "-7..=7");
        let msg = format!("{}", err);
        assert!(msg.contains("wgtExp"));
        assert!(msg.contains("9"));
    }
}
