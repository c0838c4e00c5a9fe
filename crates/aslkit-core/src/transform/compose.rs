//! Composition of warp fields and rigid transforms into a single warp.

use burn::tensor::backend::Backend;
use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use super::rigid::{invert_rigid, RigidTransform};
use super::warp::{HostWarp, WarpField};
use crate::error::{CoreError, Result};
use crate::image::{Grid, Volume};
use crate::space::Space;

/// A combined warp together with the determinant of its Jacobian.
#[derive(Debug, Clone)]
pub struct CombinedWarp<B: Backend> {
    pub warp: WarpField<B>,
    pub jacobian: Volume<B>,
}

/// Combine warps applied in listed order, followed by an optional rigid
/// transform, into a single warp on `reference`.
///
/// `warps[0]` maps the input space onward, each warp's destination must be
/// the next one's source, and `postmat` (if any) must start where the last
/// warp ends. The combined field satisfies, for a reference world point `x`,
/// `x + d(x) = w1(w2(...wn(postmat^-1(x))))` where `wk(p) = p + dk(p)`.
///
/// # Errors
/// * [`CoreError::EmptyWarpList`] when there are no warps and no `postmat`
/// * [`CoreError::SpaceMismatch`] when consecutive spaces do not chain
/// * [`CoreError::SingularTransform`] when `postmat` cannot be inverted
pub fn combine_warps<B: Backend>(
    warps: &[WarpField<B>],
    postmat: Option<&RigidTransform>,
    reference: &Grid,
    device: &B::Device,
) -> Result<CombinedWarp<B>> {
    let (source, destination) = chain_spaces(warps, postmat)?;
    let postmat_inverse = postmat.map(invert_rigid).transpose()?;

    let hosts = warps.iter().map(|w| w.to_host()).collect::<Result<Vec<HostWarp>>>()?;

    let [nz, ny, nx] = reference.shape();
    let index_to_world = reference.header().affine();
    debug!(
        warps = warps.len(),
        postmat = postmat.is_some(),
        voxels = reference.len(),
        "Combining warps"
    );

    let displacement: Vec<Vector3<f64>> = (0..reference.len())
        .into_par_iter()
        .map(|n| {
            let x = n % nx;
            let y = (n / nx) % ny;
            let z = n / (nx * ny);
            let world = index_to_world.transform_point(&Point3::new(x as f64, y as f64, z as f64));
            let mut p = match &postmat_inverse {
                Some(inverse) => inverse.apply_point(&world),
                None => world,
            };
            for host in hosts.iter().rev() {
                p += host.displacement_at(&p);
            }
            p - world
        })
        .collect();
    debug_assert_eq!(displacement.len(), nx * ny * nz);

    let jacobian_values = jacobian_determinant(&displacement, reference);

    let components = [0, 1, 2].map(|k| displacement.iter().map(|d| d[k] as f32).collect::<Vec<f32>>());
    let warp = WarpField::from_components(components, reference, source, destination, device)?;
    let jacobian = Volume::from_vec(
        "jacobian",
        jacobian_values,
        reference.shape(),
        reference.header().clone(),
        device,
    )?;
    Ok(CombinedWarp { warp, jacobian })
}

/// Determinant of the Jacobian of a single warp's mapping `x -> x + d(x)`.
pub fn warp_jacobian<B: Backend>(warp: &WarpField<B>) -> Result<Volume<B>> {
    let host = warp.to_host()?;
    let grid = warp.grid();
    let [_, ny, nx] = grid.shape();
    let affine = grid.header().affine();
    let displacement: Vec<Vector3<f64>> = (0..grid.len())
        .into_par_iter()
        .map(|n| {
            let index = Point3::new((n % nx) as f64, ((n / nx) % ny) as f64, (n / (nx * ny)) as f64);
            host.displacement_at(&affine.transform_point(&index))
        })
        .collect();
    let values = jacobian_determinant(&displacement, grid);
    Volume::from_vec("jacobian", values, grid.shape(), grid.header().clone(), &warp.device())
}

fn chain_spaces<B: Backend>(warps: &[WarpField<B>], postmat: Option<&RigidTransform>) -> Result<(Space, Space)> {
    let (first, last) = match (warps.first(), warps.last(), postmat) {
        (Some(first), Some(last), _) => (first, last),
        (None, _, Some(postmat)) => {
            return Ok((postmat.source().clone(), postmat.destination().clone()));
        }
        _ => return Err(CoreError::EmptyWarpList),
    };
    for pair in warps.windows(2) {
        if pair[0].destination() != pair[1].source() {
            return Err(CoreError::space_mismatch(pair[1].source(), pair[0].destination()));
        }
    }
    let destination = match postmat {
        Some(postmat) => {
            if postmat.source() != last.destination() {
                return Err(CoreError::space_mismatch(postmat.source(), last.destination()));
            }
            postmat.destination().clone()
        }
        None => last.destination().clone(),
    };
    Ok((first.source().clone(), destination))
}

/// `det(I + grad d)` at every voxel, with central differences inside the
/// grid and one-sided differences on its faces.
fn jacobian_determinant(displacement: &[Vector3<f64>], grid: &Grid) -> Vec<f32> {
    let [nz, ny, nx] = grid.shape();
    let extent = [nx, ny, nz];
    let strides = [1, nx, nx * ny];
    // d(index)/d(world): the linear part of the world-to-index affine.
    let index_per_world: Matrix3<f64> = grid.header().inverse_affine().fixed_view::<3, 3>(0, 0).into_owned();

    (0..displacement.len())
        .into_par_iter()
        .map(|n| {
            let coords = [n % nx, (n / nx) % ny, n / (nx * ny)];
            let mut per_index = Matrix3::zeros();
            for axis in 0..3 {
                let c = coords[axis];
                let (lo, hi) = (c.saturating_sub(1), (c + 1).min(extent[axis] - 1));
                if hi == lo {
                    continue;
                }
                let a = displacement[n - (c - lo) * strides[axis]];
                let b = displacement[n + (hi - c) * strides[axis]];
                per_index.set_column(axis, &((b - a) / (hi - lo) as f64));
            }
            let gradient = per_index * index_per_world;
            (Matrix3::identity() + gradient).determinant() as f32
        })
        .collect()
}
