//! Rigid motion correction of the ASL series.
//!
//! Every volume is aligned to a reference: the calibration image when one is
//! supplied, otherwise the middle volume of the series. The transforms are
//! then re-centred on the middle volume so that the corrected series stays
//! in the native ASL space of that volume.

use aslkit_core::{RigidTransform, Series, Space, Volume};
use burn::tensor::backend::Backend;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::external::{MotionEstimation, VolumeAlignment};
use crate::log::RunLog;
use crate::report::ReportPage;

/// Where the motion correction reference came from.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionReference {
    /// A separately supplied image, named.
    Supplied(String),
    /// The series' own volume at this index.
    MiddleVolume(usize),
}

/// Per-volume motion transforms.
#[derive(Debug, Clone)]
pub struct MotionCorrection {
    /// One transform per volume, mapping that volume into the space of the
    /// middle volume (`NativeAsl -> NativeAsl`).
    pub transforms: Vec<RigidTransform>,
    pub reference: MotionReference,
    /// Middle volume onto the supplied reference (`NativeAsl -> Calibration`).
    pub series_to_reference: Option<RigidTransform>,
    /// Supplied reference onto the middle volume (`Calibration -> NativeAsl`).
    pub reference_to_series: Option<RigidTransform>,
}

impl MotionCorrection {
    /// Index of the volume the transforms are centred on.
    pub fn middle_index(&self) -> usize {
        self.transforms.len() / 2
    }

    /// Report page listing the reference and every matrix.
    pub fn report_page(&self) -> ReportPage {
        let mut page = ReportPage::new();
        page.heading("Motion correction", 0);
        match &self.reference {
            MotionReference::Supplied(name) => {
                page.text(format!("Reference volume: {name} (calibration image)"))
            }
            MotionReference::MiddleVolume(index) => {
                page.text(format!("Reference volume: middle volume of the series ({index})"))
            }
        }
        page.heading("Motion parameters", 1);
        for (index, transform) in self.transforms.iter().enumerate() {
            page.text(format!("Volume {index}"));
            page.matrix(transform.rows());
        }
        page
    }
}

/// Estimate per-volume motion of `series`.
///
/// # Errors
/// [`PipelineError::Registration`] when any volume fails to converge; no
/// partial result is returned.
pub fn estimate_motion<B: Backend>(
    series: &Series<B>,
    reference: Option<&Volume<B>>,
    estimator: &dyn MotionEstimation<B>,
    log: &mut RunLog,
) -> Result<MotionCorrection> {
    let n = series.num_volumes();
    let middle = n / 2;

    let (reference_image, reference_space, source) = match reference {
        Some(image) => {
            log.info(format!(
                "Motion correction: using {} as reference image",
                image.name()
            ));
            (image.clone(), Space::Calibration, MotionReference::Supplied(image.name().to_string()))
        }
        None => {
            log.info(format!("Motion correction: using middle volume ({middle}) as reference image"));
            (series.volume(middle)?, Space::NativeAsl, MotionReference::MiddleVolume(middle))
        }
    };

    let alignments = estimator.estimate_rigid_series(series, &reference_image)?;
    if alignments.len() != n {
        return Err(PipelineError::external(format!(
            "motion estimation returned {} transforms for {n} volumes",
            alignments.len()
        )));
    }

    let mut to_reference = Vec::with_capacity(n);
    for (index, alignment) in alignments.into_iter().enumerate() {
        match alignment {
            VolumeAlignment::Converged(matrix) => {
                to_reference.push(RigidTransform::new(matrix, Space::NativeAsl, reference_space.clone()))
            }
            VolumeAlignment::Failed(reason) => return Err(PipelineError::registration(Some(index), reason)),
        }
    }

    // Re-centre on the middle volume: T'_i = inv(T_mid) * T_i
    let series_to_reference = to_reference[middle].clone();
    let reference_to_series = series_to_reference.inverse()?;
    let transforms = to_reference
        .iter()
        .map(|t| t.then(&reference_to_series))
        .collect::<aslkit_core::Result<Vec<_>>>()?;
    debug!(volumes = n, middle, "Re-centred motion transforms");

    let (series_to_reference, reference_to_series) = match source {
        MotionReference::Supplied(_) => (Some(series_to_reference), Some(reference_to_series)),
        MotionReference::MiddleVolume(_) => (None, None),
    };

    Ok(MotionCorrection {
        transforms,
        reference: source,
        series_to_reference,
        reference_to_series,
    })
}
