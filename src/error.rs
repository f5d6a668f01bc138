//! Error types for Normalizar operations.
//!
//! Provides rich error context for library consumers.

use std::fmt;

/// Main error type for Normalizar operations.
///
/// Covers the three failure surfaces of the layer: shape mismatches
/// between the layer and its inputs, invalid configuration at
/// construction, and ordering violations between the forward and
/// backward passes. The remaining variants belong to the persistence
/// surface (SafeTensors state files).
///
/// # Examples
///
/// ```
/// use normalizar::error::NormalizarError;
///
/// let err = NormalizarError::ShapeMismatch {
///     expected: "[batch, 64]".to_string(),
///     actual: "[32, 16]".to_string(),
/// };
/// assert!(err.to_string().contains("shape mismatch"));
/// ```
#[derive(Debug)]
pub enum NormalizarError {
    /// Input shape doesn't match what the layer was built for.
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape found
        actual: String,
    },

    /// Invalid hyperparameter value provided at construction.
    InvalidHyperparameter {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// Operation called in a state that doesn't support it
    /// (e.g. backward before any training-mode forward).
    PreconditionViolation {
        /// What was violated
        message: String,
    },

    /// I/O error (file not found, permission denied, etc.).
    Io(std::io::Error),

    /// Serialization/deserialization error.
    Serialization(String),

    /// Invalid or corrupt state file.
    FormatError {
        /// Error description
        message: String,
    },

    /// Unsupported state-file version.
    UnsupportedVersion {
        /// Version found
        found: u32,
        /// Maximum supported version
        supported: u32,
    },

    /// Generic error with string message.
    Other(String),
}

impl fmt::Display for NormalizarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizarError::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected {expected}, got {actual}")
            }
            NormalizarError::InvalidHyperparameter {
                param,
                value,
                constraint,
            } => {
                write!(
                    f,
                    "Invalid hyperparameter: {param} = {value}, expected {constraint}"
                )
            }
            NormalizarError::PreconditionViolation { message } => {
                write!(f, "Precondition violated: {message}")
            }
            NormalizarError::Io(e) => write!(f, "I/O error: {e}"),
            NormalizarError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            NormalizarError::FormatError { message } => {
                write!(f, "Invalid state format: {message}")
            }
            NormalizarError::UnsupportedVersion { found, supported } => {
                write!(
                    f,
                    "Unsupported state version: found {found}, max supported {supported}"
                )
            }
            NormalizarError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for NormalizarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NormalizarError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NormalizarError {
    fn from(err: std::io::Error) -> Self {
        NormalizarError::Io(err)
    }
}

impl From<&str> for NormalizarError {
    fn from(msg: &str) -> Self {
        NormalizarError::Other(msg.to_string())
    }
}

impl From<String> for NormalizarError {
    fn from(msg: String) -> Self {
        NormalizarError::Other(msg)
    }
}

impl NormalizarError {
    /// Create a shape mismatch error for a `[batch, features]` input.
    #[must_use]
    pub fn batch_shape_mismatch(expected_features: usize, rows: usize, cols: usize) -> Self {
        Self::ShapeMismatch {
            expected: format!("[batch, {expected_features}]"),
            actual: format!("[{rows}, {cols}]"),
        }
    }

    /// Create a precondition violation with a descriptive message.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation {
            message: message.into(),
        }
    }

    /// Create a state-format error with a descriptive message.
    #[must_use]
    pub fn format(message: impl Into<String>) -> Self {
        Self::FormatError {
            message: message.into(),
        }
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, NormalizarError>;
