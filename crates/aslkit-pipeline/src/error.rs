//! Error types for the correction and calibration pipeline.

use aslkit_core::CoreError;
use thiserror::Error;

/// Main error type for pipeline operations.
///
/// Configuration problems that are not fatal are not errors: they are
/// logged as warnings on the run log and the affected branch is skipped.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required image or parameter was not supplied.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Unknown calibration method.
    #[error("Invalid calibration method: {0}")]
    InvalidMethod(String),

    /// Unknown reference tissue type.
    #[error("Invalid tissue type: {0}")]
    InvalidTissueType(String),

    /// An external registration or motion estimation step failed.
    #[error("Registration failed{}: {reason}", .volume.map(|v| format!(" for volume {v}")).unwrap_or_default())]
    Registration {
        volume: Option<usize>,
        reason: String,
    },

    /// An optional capability was requested but is not available.
    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    /// Any other failure reported by an external collaborator.
    #[error("External tool error: {0}")]
    External(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A stage result was merged twice into the run context.
    #[error("Stage already completed: {0}")]
    StageAlreadyCompleted(String),

    /// Error from the image and transform algebra.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a missing input error.
    pub fn missing_input(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    /// Create a registration error for one volume of a series.
    pub fn registration(volume: Option<usize>, reason: impl Into<String>) -> Self {
        Self::Registration {
            volume,
            reason: reason.into(),
        }
    }

    /// Create a missing dependency error.
    pub fn dependency_missing(msg: impl Into<String>) -> Self {
        Self::DependencyMissing(msg.into())
    }

    /// Create an external tool error.
    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Whether this error is a singular transform from the core algebra.
    pub fn is_singular_transform(&self) -> bool {
        matches!(self, Self::Core(CoreError::SingularTransform(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::missing_input("calibration image");
        assert_eq!(err.to_string(), "Missing input: calibration image");

        let err = PipelineError::registration(Some(3), "did not converge");
        assert_eq!(err.to_string(), "Registration failed for volume 3: did not converge");

        let err = PipelineError::registration(None, "boundary cost diverged");
        assert_eq!(err.to_string(), "Registration failed: boundary cost diverged");
    }

    #[test]
    fn test_core_errors_convert() {
        let err: PipelineError = CoreError::singular("det = 0").into();
        assert!(err.is_singular_transform());
    }
}
