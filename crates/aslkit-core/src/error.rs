//! Error types for image and transform operations.

use thiserror::Error;

use crate::space::Space;

/// Errors raised by the core image and transform algebra.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A transform could not be inverted.
    #[error("Singular transform: {0}")]
    SingularTransform(String),

    /// Two operands live in incompatible coordinate spaces.
    #[error("Space mismatch: expected {expected}, got {actual}")]
    SpaceMismatch { expected: Space, actual: Space },

    /// Two operands have incompatible shapes.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Warp combination requested with neither warps nor a rigid transform.
    #[error("Cannot combine an empty list of warps without a trailing transform")]
    EmptyWarpList,

    /// Image data or geometry is unusable.
    #[error("Invalid image: {0}")]
    InvalidImage(String),
}

impl CoreError {
    /// Create a singular transform error.
    pub fn singular(msg: impl Into<String>) -> Self {
        Self::SingularTransform(msg.into())
    }

    /// Create an invalid image error.
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    /// Create a shape mismatch error from any two shape slices.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a space mismatch error.
    pub fn space_mismatch(expected: &Space, actual: &Space) -> Self {
        Self::SpaceMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::shape_mismatch(&[5, 5, 5], &[4, 5, 5]);
        assert_eq!(
            err.to_string(),
            "Shape mismatch: expected [5, 5, 5], got [4, 5, 5]"
        );

        let err = CoreError::space_mismatch(&Space::NativeAsl, &Space::Structural);
        assert!(err.to_string().contains("asl"));
        assert!(err.to_string().contains("struc"));
    }

    #[test]
    fn test_singular_constructor() {
        let err = CoreError::singular("zero determinant");
        assert!(matches!(err, CoreError::SingularTransform(_)));
    }
}
