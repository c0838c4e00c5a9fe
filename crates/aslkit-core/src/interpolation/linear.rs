//! Trilinear interpolation.
//!
//! Two flavours are provided: [`LinearInterpolator`] works on tensors and is
//! used by the resampler, [`trilinear_sample`] works on host slices and is
//! used by the per-voxel warp arithmetic.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::trait_::Interpolator;

/// Trilinear interpolator with clamp-to-edge boundary handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearInterpolator;

impl LinearInterpolator {
    pub fn new() -> Self {
        Self
    }

    fn gather<B: Backend>(
        flat_data: &Tensor<B, 1>,
        xi: &Tensor<B, 1, Int>,
        yi: &Tensor<B, 1, Int>,
        zi: &Tensor<B, 1, Int>,
        stride_y: i32,
        stride_z: i32,
    ) -> Tensor<B, 1> {
        let idx = zi.clone() * stride_z + yi.clone() * stride_y + xi.clone();
        flat_data.clone().gather(0, idx)
    }
}

impl<B: Backend> Interpolator<B> for LinearInterpolator {
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let [d0, d1, d2] = data.dims(); // Z, Y, X

        let x = indices.clone().narrow(1, 0, 1).squeeze::<1>(1);
        let y = indices.clone().narrow(1, 1, 1).squeeze::<1>(1);
        let z = indices.narrow(1, 2, 1).squeeze::<1>(1);

        // Clamp the coordinates first so weights stay in [0, 1] outside the grid.
        let x = x.clamp(0.0, (d2 - 1) as f64);
        let y = y.clamp(0.0, (d1 - 1) as f64);
        let z = z.clamp(0.0, (d0 - 1) as f64);

        let x0 = x.clone().floor();
        let y0 = y.clone().floor();
        let z0 = z.clone().floor();

        let wx = x - x0.clone();
        let wy = y - y0.clone();
        let wz = z - z0.clone();

        let x1_i = (x0.clone() + 1.0).clamp(0.0, (d2 - 1) as f64).int();
        let y1_i = (y0.clone() + 1.0).clamp(0.0, (d1 - 1) as f64).int();
        let z1_i = (z0.clone() + 1.0).clamp(0.0, (d0 - 1) as f64).int();
        let x0_i = x0.int();
        let y0_i = y0.int();
        let z0_i = z0.int();

        let stride_z = (d1 * d2) as i32;
        let stride_y = d2 as i32;
        let flat_data = data.clone().reshape([d0 * d1 * d2]);

        let v000 = Self::gather(&flat_data, &x0_i, &y0_i, &z0_i, stride_y, stride_z);
        let v001 = Self::gather(&flat_data, &x0_i, &y0_i, &z1_i, stride_y, stride_z);
        let v010 = Self::gather(&flat_data, &x0_i, &y1_i, &z0_i, stride_y, stride_z);
        let v011 = Self::gather(&flat_data, &x0_i, &y1_i, &z1_i, stride_y, stride_z);
        let v100 = Self::gather(&flat_data, &x1_i, &y0_i, &z0_i, stride_y, stride_z);
        let v101 = Self::gather(&flat_data, &x1_i, &y0_i, &z1_i, stride_y, stride_z);
        let v110 = Self::gather(&flat_data, &x1_i, &y1_i, &z0_i, stride_y, stride_z);
        let v111 = Self::gather(&flat_data, &x1_i, &y1_i, &z1_i, stride_y, stride_z);

        let one_minus_wx = wx.clone().neg() + 1.0;
        let one_minus_wy = wy.clone().neg() + 1.0;
        let one_minus_wz = wz.clone().neg() + 1.0;

        // Along X
        let c00 = v000 * one_minus_wx.clone() + v100 * wx.clone();
        let c01 = v001 * one_minus_wx.clone() + v101 * wx.clone();
        let c10 = v010 * one_minus_wx.clone() + v110 * wx.clone();
        let c11 = v011 * one_minus_wx + v111 * wx;

        // Along Y
        let c0 = c00 * one_minus_wy.clone() + c10 * wy.clone();
        let c1 = c01 * one_minus_wy + c11 * wy;

        // Along Z
        c0 * one_minus_wz + c1 * wz
    }
}

/// Trilinear sample of a host volume stored `[Z, Y, X]` at a continuous
/// `(x, y, z)` index, clamping to the nearest edge outside the grid.
pub fn trilinear_sample(data: &[f32], shape: [usize; 3], index: [f64; 3]) -> f64 {
    let [nz, ny, nx] = shape;
    let extent = [nx, ny, nz];

    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut w = [0.0f64; 3];
    for k in 0..3 {
        let max = (extent[k] - 1) as f64;
        let c = index[k].clamp(0.0, max);
        let f = c.floor();
        lo[k] = f as usize;
        hi[k] = (lo[k] + 1).min(extent[k] - 1);
        w[k] = c - f;
    }

    let at = |x: usize, y: usize, z: usize| data[(z * ny + y) * nx + x] as f64;

    let c00 = at(lo[0], lo[1], lo[2]) * (1.0 - w[0]) + at(hi[0], lo[1], lo[2]) * w[0];
    let c10 = at(lo[0], hi[1], lo[2]) * (1.0 - w[0]) + at(hi[0], hi[1], lo[2]) * w[0];
    let c01 = at(lo[0], lo[1], hi[2]) * (1.0 - w[0]) + at(hi[0], lo[1], hi[2]) * w[0];
    let c11 = at(lo[0], hi[1], hi[2]) * (1.0 - w[0]) + at(hi[0], hi[1], hi[2]) * w[0];

    let c0 = c00 * (1.0 - w[1]) + c10 * w[1];
    let c1 = c01 * (1.0 - w[1]) + c11 * w[1];

    c0 * (1.0 - w[2]) + c1 * w[2]
}
