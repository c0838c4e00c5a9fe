//! Rigid (and general affine) world-to-world transforms between spaces.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use super::trait_::Transform;
use crate::error::{CoreError, Result};
use crate::image::affine_points;
use crate::space::Space;

/// A 4x4 homogeneous transform mapping world coordinates of `source` into
/// world coordinates of `destination`.
///
/// Registration tools may return small shears or scales, so the matrix is
/// not forced to be orthonormal; only invertibility is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    matrix: Matrix4<f64>,
    source: Space,
    destination: Space,
}

impl RigidTransform {
    pub fn new(matrix: Matrix4<f64>, source: Space, destination: Space) -> Self {
        Self {
            matrix,
            source,
            destination,
        }
    }

    /// Identity from `source` to `destination`.
    pub fn identity(source: Space, destination: Space) -> Self {
        Self::new(Matrix4::identity(), source, destination)
    }

    /// Pure translation in mm.
    pub fn from_translation(offset: [f64; 3], source: Space, destination: Space) -> Self {
        Self::new(
            Matrix4::new_translation(&Vector3::from(offset)),
            source,
            destination,
        )
    }

    /// Rotation by Euler angles (radians, `R = Rz * Ry * Rx`) about `center`,
    /// followed by a translation.
    pub fn from_euler(
        angles: [f64; 3],
        translation: [f64; 3],
        center: [f64; 3],
        source: Space,
        destination: Space,
    ) -> Self {
        let rotation: Matrix3<f64> = Rotation3::from_euler_angles(angles[0], angles[1], angles[2]).into_inner();
        let c = Vector3::from(center);
        // T(x) = R(x - c) + c + t
        let offset = c - rotation * c + Vector3::from(translation);
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&offset);
        Self::new(matrix, source, destination)
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn source(&self) -> &Space {
        &self.source
    }

    pub fn destination(&self) -> &Space {
        &self.destination
    }

    /// Map a single world point.
    pub fn apply_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.matrix.transform_point(point)
    }

    /// Apply `self` then `next`.
    pub fn then(&self, next: &RigidTransform) -> Result<RigidTransform> {
        compose_rigid(self, next)
    }

    /// Inverse transform, mapping `destination` back to `source`.
    pub fn inverse(&self) -> Result<RigidTransform> {
        invert_rigid(self)
    }

    /// Whether the matrix is the identity within `tol`.
    pub fn is_identity(&self, tol: f64) -> bool {
        (self.matrix - Matrix4::identity()).abs().max() <= tol
    }

    /// Matrix rows, for reports.
    pub fn rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.matrix[(r, c)];
            }
        }
        rows
    }
}

impl<B: Backend> Transform<B> for RigidTransform {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        affine_points(&self.matrix, points)
    }

    fn source(&self) -> &Space {
        &self.source
    }

    fn destination(&self) -> &Space {
        &self.destination
    }
}

/// Compose two transforms: the result applies `a` then `b`.
///
/// Fails with [`CoreError::SpaceMismatch`] unless `a` ends where `b` starts.
pub fn compose_rigid(a: &RigidTransform, b: &RigidTransform) -> Result<RigidTransform> {
    if a.destination != b.source {
        return Err(CoreError::space_mismatch(&b.source, &a.destination));
    }
    Ok(RigidTransform::new(
        b.matrix * a.matrix,
        a.source.clone(),
        b.destination.clone(),
    ))
}

/// Invert a transform, swapping its spaces.
pub fn invert_rigid(a: &RigidTransform) -> Result<RigidTransform> {
    let determinant = a.matrix.determinant();
    if !determinant.is_finite() || determinant.abs() < 1e-12 {
        return Err(CoreError::singular(format!(
            "transform {} -> {} has determinant {determinant}",
            a.source, a.destination
        )));
    }
    let inverse = a
        .matrix
        .try_inverse()
        .ok_or_else(|| CoreError::singular(format!("transform {} -> {}", a.source, a.destination)))?;
    Ok(RigidTransform::new(
        inverse,
        a.destination.clone(),
        a.source.clone(),
    ))
}
