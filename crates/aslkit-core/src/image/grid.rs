//! Sampling grids: a header plus a `[Z, Y, X]` shape.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::header::Header;

/// The geometry of a 3D image without its data.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    header: Header,
    shape: [usize; 3],
}

impl Grid {
    pub fn new(header: Header, shape: [usize; 3]) -> Self {
        Self { header, shape }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Shape in tensor order `[Z, Y, X]`.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent along the `(x, y, z)` index axes.
    pub fn extent_xyz(&self) -> [usize; 3] {
        [self.shape[2], self.shape[1], self.shape[0]]
    }

    /// Whether two grids share shape and geometry within `tol` mm.
    pub fn approx_eq(&self, other: &Grid, tol: f64) -> bool {
        self.shape == other.shape && self.header.approx_eq(&other.header, tol)
    }

    /// Continuous `(x, y, z)` indices of every voxel, `[N, 3]`, in the
    /// flattening order of a `[Z, Y, X]` tensor.
    pub fn indices<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        generate_grid(self.shape, device)
    }

    /// World coordinates of every voxel centre, `[N, 3]`.
    pub fn world_points<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        self.header.index_to_world_tensor(self.indices::<B>(device))
    }
}

/// Generate a grid of continuous indices for a `[Z, Y, X]` shape.
///
/// Returns a tensor of shape `[N, 3]` whose columns are `(x, y, z)`.
pub fn generate_grid<B: Backend>(shape: [usize; 3], device: &B::Device) -> Tensor<B, 2> {
    let [d, h, w] = shape;
    let total = d * h * w;

    let z = Tensor::<B, 1, Int>::arange(0..d as i64, device)
        .reshape([d, 1, 1])
        .repeat(&[1, h, w])
        .reshape([total]);
    let y = Tensor::<B, 1, Int>::arange(0..h as i64, device)
        .reshape([1, h, 1])
        .repeat(&[d, 1, w])
        .reshape([total]);
    let x = Tensor::<B, 1, Int>::arange(0..w as i64, device)
        .reshape([1, 1, w])
        .repeat(&[d, h, 1])
        .reshape([total]);

    Tensor::cat(
        vec![
            x.float().unsqueeze_dim(1),
            y.float().unsqueeze_dim(1),
            z.float().unsqueeze_dim(1),
        ],
        1,
    )
}
