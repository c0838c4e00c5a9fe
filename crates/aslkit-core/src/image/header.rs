//! Voxel-to-world geometry shared by images and warp fields.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

use crate::error::{CoreError, Result};

/// Physical geometry of a 3D grid: origin, spacing and direction cosines.
///
/// Continuous indices are ordered `(x, y, z)` while tensor data is stored
/// `[Z, Y, X]`. The mapping is
/// `point = origin + Direction * (index * spacing)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    origin: Point3<f64>,
    spacing: Vector3<f64>,
    direction: Matrix3<f64>,
    inverse_direction: Matrix3<f64>,
}

impl Header {
    /// Create a header, validating that spacing is positive and the
    /// direction matrix is invertible.
    pub fn new(origin: Point3<f64>, spacing: Vector3<f64>, direction: Matrix3<f64>) -> Result<Self> {
        if spacing.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(CoreError::invalid_image(format!(
                "spacing must be positive, got {:?}",
                spacing.as_slice()
            )));
        }
        let inverse_direction = direction
            .try_inverse()
            .ok_or_else(|| CoreError::singular("direction matrix is not invertible"))?;
        Ok(Self {
            origin,
            spacing,
            direction,
            inverse_direction,
        })
    }

    /// Axis-aligned header with the given spacing and zero origin.
    pub fn from_spacing(spacing: [f64; 3]) -> Result<Self> {
        Self::new(Point3::origin(), Vector3::from(spacing), Matrix3::identity())
    }

    /// Decompose a voxel-to-world affine into origin, spacing and direction.
    pub fn from_affine(affine: &Matrix4<f64>) -> Result<Self> {
        let origin = Point3::new(affine[(0, 3)], affine[(1, 3)], affine[(2, 3)]);
        let linear = affine.fixed_view::<3, 3>(0, 0).into_owned();
        let mut spacing = Vector3::zeros();
        let mut direction = Matrix3::identity();
        for c in 0..3 {
            let column = linear.column(c);
            let norm = column.norm();
            if norm <= 0.0 {
                return Err(CoreError::singular(format!("affine column {c} is zero")));
            }
            spacing[c] = norm;
            direction.set_column(c, &(column / norm));
        }
        Self::new(origin, spacing, direction)
    }

    fn compose_affine(origin: &Point3<f64>, spacing: &Vector3<f64>, direction: &Matrix3<f64>) -> Matrix4<f64> {
        let linear = direction * Matrix3::from_diagonal(spacing);
        let mut affine = Matrix4::identity();
        affine.fixed_view_mut::<3, 3>(0, 0).copy_from(&linear);
        affine[(0, 3)] = origin.x;
        affine[(1, 3)] = origin.y;
        affine[(2, 3)] = origin.z;
        affine
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    /// Voxel-to-world affine.
    pub fn affine(&self) -> Matrix4<f64> {
        Self::compose_affine(&self.origin, &self.spacing, &self.direction)
    }

    /// World-to-voxel affine.
    pub fn inverse_affine(&self) -> Matrix4<f64> {
        // index = S^-1 * D^-1 * (point - origin)
        let linear = Matrix3::from_diagonal(&self.spacing.map(|s| 1.0 / s)) * self.inverse_direction;
        let offset = -(linear * self.origin.coords);
        let mut inverse = Matrix4::identity();
        inverse.fixed_view_mut::<3, 3>(0, 0).copy_from(&linear);
        inverse[(0, 3)] = offset.x;
        inverse[(1, 3)] = offset.y;
        inverse[(2, 3)] = offset.z;
        inverse
    }

    /// Volume of one voxel in mm^3.
    pub fn voxel_volume(&self) -> f64 {
        self.spacing.product()
    }

    /// Convert a continuous `(x, y, z)` index to a world point.
    pub fn index_to_world(&self, index: &Point3<f64>) -> Point3<f64> {
        self.affine().transform_point(index)
    }

    /// Convert a world point to a continuous `(x, y, z)` index.
    pub fn world_to_index(&self, point: &Point3<f64>) -> Point3<f64> {
        self.inverse_affine().transform_point(point)
    }

    /// Batch version of [`Header::index_to_world`] for `[N, 3]` tensors.
    pub fn index_to_world_tensor<B: Backend>(&self, indices: Tensor<B, 2>) -> Tensor<B, 2> {
        affine_points(&self.affine(), indices)
    }

    /// Batch version of [`Header::world_to_index`] for `[N, 3]` tensors.
    pub fn world_to_index_tensor<B: Backend>(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        affine_points(&self.inverse_affine(), points)
    }

    /// Whether two headers describe the same geometry within `tol`.
    pub fn approx_eq(&self, other: &Header, tol: f64) -> bool {
        (self.affine() - other.affine()).abs().max() <= tol
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            origin: Point3::origin(),
            spacing: Vector3::repeat(1.0),
            direction: Matrix3::identity(),
            inverse_direction: Matrix3::identity(),
        }
    }
}

/// Apply a homogeneous 4x4 matrix to a batch of row-vector points `[N, 3]`.
///
/// Computes `points @ R^T + t` where `R` is the upper-left 3x3 block and `t`
/// the translation column.
pub fn affine_points<B: Backend>(matrix: &Matrix4<f64>, points: Tensor<B, 2>) -> Tensor<B, 2> {
    let device = points.device();
    let mut rotation = Vec::with_capacity(9);
    for r in 0..3 {
        for c in 0..3 {
            rotation.push(matrix[(c, r)] as f32);
        }
    }
    let rotation = Tensor::<B, 2>::from_data(TensorData::new(rotation, Shape::new([3, 3])), &device);
    let translation: Vec<f32> = (0..3).map(|r| matrix[(r, 3)] as f32).collect();
    let translation = Tensor::<B, 2>::from_data(TensorData::new(translation, Shape::new([1, 3])), &device);
    points.matmul(rotation) + translation
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn assert_point_close(a: &Point3<f64>, b: &Point3<f64>, tol: f64) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < tol, "{a} != {b}");
        }
    }

    #[test]
    fn test_index_world_roundtrip() {
        let header = Header::new(
            Point3::new(-10.0, 5.0, 2.0),
            Vector3::new(2.0, 3.0, 4.0),
            Matrix3::identity(),
        )
        .unwrap();
        let index = Point3::new(1.0, 2.0, 3.0);
        let world = header.index_to_world(&index);
        assert_point_close(&world, &Point3::new(-8.0, 11.0, 14.0), 1e-12);
        assert_point_close(&header.world_to_index(&world), &index, 1e-12);
    }

    #[test]
    fn test_from_affine_recovers_geometry() {
        let mut affine = Matrix4::identity();
        affine[(0, 0)] = -2.0;
        affine[(1, 1)] = 2.0;
        affine[(2, 2)] = 3.0;
        affine[(0, 3)] = 90.0;
        let header = Header::from_affine(&affine).unwrap();
        assert_eq!(header.spacing(), &Vector3::new(2.0, 2.0, 3.0));
        assert_eq!(header.direction()[(0, 0)], -1.0);
        assert!((header.affine() - affine).abs().max() < 1e-12);
    }

    #[test]
    fn test_rejects_zero_spacing() {
        assert!(Header::from_spacing([1.0, 0.0, 1.0]).is_err());
    }

    #[test]
    fn test_tensor_mapping_matches_point_mapping() {
        let device = Default::default();
        let header = Header::new(
            Point3::new(1.0, 2.0, 3.0),
            Vector3::new(2.0, 2.0, 2.0),
            Matrix3::identity(),
        )
        .unwrap();
        let indices = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]], &device);
        let world = header.index_to_world_tensor(indices);
        let values = world.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 3.0, 6.0, 9.0]);
    }
}
