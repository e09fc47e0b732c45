//! Error types for Hablar operations.
//!
//! Provides rich error context for library consumers.

use std::fmt;

/// Main error type for Hablar operations.
///
/// Provides detailed context about failures including dimension mismatches,
/// singular covariance matrices, degenerate training runs, and invalid
/// hyperparameters.
///
/// # Examples
///
/// ```
/// use hablar::error::HablarError;
///
/// let err = HablarError::DimensionMismatch {
///     expected: "24".to_string(),
///     actual: "12".to_string(),
/// };
/// assert!(err.to_string().contains("dimension mismatch"));
/// ```
#[derive(Debug)]
pub enum HablarError {
    /// Matrix/vector dimensions don't match for the operation.
    DimensionMismatch {
        /// Expected dimensions description
        expected: String,
        /// Actual dimensions found
        actual: String,
    },

    /// Covariance matrix is singular (non-invertible).
    SingularMatrix {
        /// Determinant value (close to zero)
        det: f64,
    },

    /// Invalid hyperparameter value provided.
    InvalidHyperparameter {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// A mixture component's responsibility mass collapsed during EM.
    DegenerateTraining {
        /// EM iteration (1-based) at which the collapse was detected
        iteration: usize,
        /// What collapsed
        message: String,
    },

    /// I/O error (file not found, truncated model file, etc.).
    Io(std::io::Error),

    /// Invalid or corrupt model format.
    FormatError {
        /// Error description
        message: String,
    },

    /// Unsupported model format version.
    UnsupportedVersion {
        /// Version found in the file
        found: u32,
        /// Maximum supported version
        supported: u32,
    },
}

impl fmt::Display for HablarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HablarError::DimensionMismatch { expected, actual } => {
                write!(f, "dimension mismatch: expected {expected}, got {actual}")
            }
            HablarError::SingularMatrix { det } => {
                write!(
                    f,
                    "Singular covariance matrix: determinant = {det}, cannot invert"
                )
            }
            HablarError::InvalidHyperparameter {
                param,
                value,
                constraint,
            } => {
                write!(
                    f,
                    "Invalid hyperparameter: {param} = {value}, expected {constraint}"
                )
            }
            HablarError::DegenerateTraining { iteration, message } => {
                write!(f, "Degenerate training at iteration {iteration}: {message}")
            }
            HablarError::Io(e) => write!(f, "I/O error: {e}"),
            HablarError::FormatError { message } => {
                write!(f, "Invalid model format: {message}")
            }
            HablarError::UnsupportedVersion { found, supported } => {
                write!(
                    f,
                    "Unsupported model format version: found {found}, max supported {supported}"
                )
            }
        }
    }
}

impl std::error::Error for HablarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HablarError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HablarError {
    fn from(err: std::io::Error) -> Self {
        HablarError::Io(err)
    }
}

impl HablarError {
    /// Create a dimension mismatch error with descriptive context
    #[must_use]
    pub fn dimension_mismatch(context: &str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            expected: format!("{context}={expected}"),
            actual: format!("{actual}"),
        }
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, HablarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_display() {
        let err = HablarError::DimensionMismatch {
            expected: "40".to_string(),
            actual: "20".to_string(),
        };
        assert!(err.to_string().contains("dimension mismatch"));
        assert!(err.to_string().contains("40"));
        assert!(err.to_string().contains("20"));
    }

    #[test]
    fn test_singular_matrix_display() {
        let err = HablarError::SingularMatrix { det: 1e-15 };
        let msg = err.to_string();
        assert!(msg.contains("Singular covariance"));
    }

    #[test]
    fn test_invalid_hyperparameter_display() {
        let err = HablarError::InvalidHyperparameter {
            param: "total_components".to_string(),
            value: "0".to_string(),
            constraint: ">0".to_string(),
        };
        assert!(err.to_string().contains("Invalid hyperparameter"));
        assert!(err.to_string().contains("total_components"));
    }

    #[test]
    fn test_degenerate_training_display() {
        let err = HablarError::DegenerateTraining {
            iteration: 17,
            message: "component 3 responsibility mass is zero".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("iteration 17"));
        assert!(msg.contains("component 3"));
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = HablarError::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("found 9"));
        assert!(msg.contains("max supported 1"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let err: HablarError = io_err.into();
        assert!(matches!(err, HablarError::Io(_)));
    }

    #[test]
    fn test_error_source_io() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = HablarError::Io(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_dimension_mismatch_helper() {
        let err = HablarError::dimension_mismatch("feature dimension", 24, 12);
        let msg = err.to_string();
        assert!(msg.contains("feature dimension=24"));
        assert!(msg.contains("12"));
    }
}
