//! Dense displacement fields tagged with the spaces they connect.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Shape, Tensor, TensorData};
use nalgebra::{Matrix4, Point3, Vector3};

use crate::error::{CoreError, Result};
use crate::image::{Grid, Header};
use crate::interpolation::trilinear_sample;
use crate::space::Space;

/// Relative displacement field in mm on a reference grid.
///
/// For a world point `x` of the destination grid, the matching point in the
/// source space is `x + d(x)`. The field has shape `[3, Z, Y, X]` with
/// components ordered `(dx, dy, dz)`.
#[derive(Debug, Clone)]
pub struct WarpField<B: Backend> {
    displacement: Tensor<B, 4>,
    grid: Grid,
    source: Space,
    destination: Space,
}

impl<B: Backend> WarpField<B> {
    /// Create a warp field from a `[3, Z, Y, X]` displacement tensor.
    pub fn new(displacement: Tensor<B, 4>, header: Header, source: Space, destination: Space) -> Result<Self> {
        let [c, z, y, x] = displacement.dims();
        if c != 3 {
            return Err(CoreError::shape_mismatch(&[3, z, y, x], &[c, z, y, x]));
        }
        Ok(Self {
            displacement,
            grid: Grid::new(header, [z, y, x]),
            source,
            destination,
        })
    }

    /// Zero displacement on `grid`.
    pub fn zeros(grid: &Grid, source: Space, destination: Space, device: &B::Device) -> Self {
        let [z, y, x] = grid.shape();
        Self {
            displacement: Tensor::zeros([3, z, y, x], device),
            grid: grid.clone(),
            source,
            destination,
        }
    }

    /// Build from host component planes, each `[Z, Y, X]` flattened.
    pub fn from_components(
        components: [Vec<f32>; 3],
        grid: &Grid,
        source: Space,
        destination: Space,
        device: &B::Device,
    ) -> Result<Self> {
        let n = grid.len();
        let mut values = Vec::with_capacity(3 * n);
        for plane in &components {
            if plane.len() != n {
                return Err(CoreError::shape_mismatch(&[n], &[plane.len()]));
            }
            values.extend_from_slice(plane);
        }
        let [z, y, x] = grid.shape();
        let displacement = Tensor::<B, 4>::from_data(TensorData::new(values, Shape::new([3, z, y, x])), device);
        Ok(Self {
            displacement,
            grid: grid.clone(),
            source,
            destination,
        })
    }

    pub fn displacement(&self) -> &Tensor<B, 4> {
        &self.displacement
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn header(&self) -> &Header {
        self.grid.header()
    }

    pub fn source(&self) -> &Space {
        &self.source
    }

    pub fn destination(&self) -> &Space {
        &self.destination
    }

    pub fn device(&self) -> B::Device {
        self.displacement.device()
    }

    /// Displacement of every voxel as `[N, 3]` rows, in grid order.
    pub fn displacement_rows(&self) -> Tensor<B, 2> {
        let n = self.grid.len();
        self.displacement.clone().reshape([3, n]).transpose()
    }

    /// Largest displacement magnitude component, in mm.
    pub fn max_abs_displacement(&self) -> f64 {
        self.displacement.clone().abs().max().into_scalar().elem::<f64>()
    }

    pub(crate) fn to_host(&self) -> Result<HostWarp> {
        let values = self
            .displacement
            .to_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CoreError::invalid_image(format!("cannot read warp data: {e:?}")))?;
        let n = self.grid.len();
        Ok(HostWarp {
            components: [
                values[0..n].to_vec(),
                values[n..2 * n].to_vec(),
                values[2 * n..3 * n].to_vec(),
            ],
            shape: self.grid.shape(),
            world_to_index: self.grid.header().inverse_affine(),
        })
    }
}

/// Host copy of a warp used by the per-voxel composition loops.
pub(crate) struct HostWarp {
    components: [Vec<f32>; 3],
    shape: [usize; 3],
    world_to_index: Matrix4<f64>,
}

impl HostWarp {
    /// Displacement at an arbitrary world point, trilinear with edge clamping.
    pub(crate) fn displacement_at(&self, point: &Point3<f64>) -> Vector3<f64> {
        let index = self.world_to_index.transform_point(point);
        let index = [index.x, index.y, index.z];
        Vector3::new(
            trilinear_sample(&self.components[0], self.shape, index),
            trilinear_sample(&self.components[1], self.shape, index),
            trilinear_sample(&self.components[2], self.shape, index),
        )
    }
}
