//! Transform trait for mapping batches of world points.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::space::Space;

/// A spatial mapping between two named spaces.
///
/// # Type Parameters
/// * `B` - The Burn backend
pub trait Transform<B: Backend> {
    /// Map world points of the source space into the destination space.
    ///
    /// # Arguments
    /// * `points` - `[N, 3]` world coordinates in mm
    ///
    /// # Returns
    /// `[N, 3]` world coordinates in the destination space
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Space the transform reads from.
    fn source(&self) -> &Space;

    /// Space the transform writes into.
    fn destination(&self) -> &Space;
}
