use std::path::Path;

use anyhow::{bail, Context, Result};
use aslkit_core::image::{Header, Series, Volume};
use burn::tensor::backend::Backend;
use nalgebra::Matrix4;
use ndarray::{Array3, Array4, ArrayD, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;

/// Read a 3D NIfTI volume. The image is named after the file stem.
///
/// A 4D file with a single volume is accepted and squeezed.
pub fn read_nifti<B: Backend, P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Volume<B>> {
    let path = path.as_ref();
    let (header, array) = read_array(path)?;
    let array = match array.ndim() {
        3 => array,
        4 if array.shape()[3] == 1 => array.index_axis_move(ndarray::Axis(3), 0),
        n => bail!("Expected a 3D NIfTI volume in {}, found {n} dimensions", path.display()),
    };
    let array = array.into_dimensionality::<Ix3>().context("Failed to view volume as 3D")?;
    let (nx, ny, nz) = array.dim();

    let mut values = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                values.push(array[(x, y, z)]);
            }
        }
    }
    debug!(path = %path.display(), shape = ?[nz, ny, nx], "Read NIfTI volume");
    Ok(Volume::from_vec(image_name(path), values, [nz, ny, nx], header, device)?)
}

/// Read a 4D NIfTI series (time is the fourth NIfTI axis). A 3D file is
/// read as a series of one volume.
pub fn read_nifti_series<B: Backend, P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Series<B>> {
    let path = path.as_ref();
    let (header, array) = read_array(path)?;
    let array = match array.ndim() {
        4 => array,
        3 => array.insert_axis(ndarray::Axis(3)),
        n => bail!("Expected a 4D NIfTI series in {}, found {n} dimensions", path.display()),
    };
    let array = array.into_dimensionality::<Ix4>().context("Failed to view series as 4D")?;
    let (nx, ny, nz, nt) = array.dim();

    let mut values = Vec::with_capacity(nx * ny * nz * nt);
    for t in 0..nt {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    values.push(array[(x, y, z, t)]);
                }
            }
        }
    }
    debug!(path = %path.display(), shape = ?[nt, nz, ny, nx], "Read NIfTI series");
    Ok(Series::from_vec(image_name(path), values, [nt, nz, ny, nx], header, device)?)
}

/// Write a 3D volume with its geometry stored as the sform.
pub fn write_nifti<B: Backend, P: AsRef<Path>>(path: P, image: &Volume<B>) -> Result<()> {
    let [nz, ny, nx] = image.spatial_shape();
    let values = image.to_vec()?;
    let array = Array3::from_shape_fn((nx, ny, nz), |(x, y, z)| values[(z * ny + y) * nx + x]);
    let header = nifti_header(image.header());

    WriterOptions::new(path.as_ref())
        .reference_header(&header)
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.as_ref().display(), e))
}

/// Write a 4D series with its geometry stored as the sform.
pub fn write_nifti_series<B: Backend, P: AsRef<Path>>(path: P, image: &Series<B>) -> Result<()> {
    let [nt, nz, ny, nx] = image.shape();
    let values = image.to_vec()?;
    let array = Array4::from_shape_fn((nx, ny, nz, nt), |(x, y, z, t)| {
        values[((t * nz + z) * ny + y) * nx + x]
    });
    let header = nifti_header(image.header());

    WriterOptions::new(path.as_ref())
        .reference_header(&header)
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.as_ref().display(), e))
}

fn read_array(path: &Path) -> Result<(Header, ArrayD<f32>)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    let affine = affine_from_header(obj.header());
    let header = Header::from_affine(&affine).context("NIfTI affine is degenerate")?;
    let array = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert volume to ndarray")?;
    Ok((header, array))
}

/// Voxel-to-world affine from the sform, else the qform, else pixdim.
fn affine_from_header(header: &NiftiHeader) -> Matrix4<f64> {
    let rows: [[f32; 4]; 3] = if header.sform_code > 0 {
        [header.srow_x, header.srow_y, header.srow_z]
    } else if header.qform_code > 0 {
        let (b, c, d) = (header.quatern_b, header.quatern_c, header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (dx, dy, dz) = (header.pixdim[1], header.pixdim[2], header.pixdim[3] * qfac);
        [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                header.quatern_x,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                header.quatern_y,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                header.quatern_z,
            ],
        ]
    } else {
        let spacing = |k: usize| if header.pixdim[k] > 0.0 { header.pixdim[k] } else { 1.0 };
        [
            [spacing(1), 0.0, 0.0, 0.0],
            [0.0, spacing(2), 0.0, 0.0],
            [0.0, 0.0, spacing(3), 0.0],
        ]
    };

    let mut affine = Matrix4::identity();
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            affine[(r, c)] = *value as f64;
        }
    }
    affine
}

fn nifti_header(header: &Header) -> NiftiHeader {
    let affine = header.affine();
    let row = |r: usize| -> [f32; 4] { [0, 1, 2, 3].map(|c| affine[(r, c)] as f32) };
    let spacing = header.spacing();
    NiftiHeader {
        sform_code: 1,
        qform_code: 0,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        pixdim: [
            1.0,
            spacing.x as f32,
            spacing.y as f32,
            spacing.z as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ],
        ..NiftiHeader::default()
    }
}

/// File name without directory and `.nii` / `.nii.gz` extension.
fn image_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.trim_end_matches(".gz").trim_end_matches(".nii").to_string()
}
