//! Susceptibility distortion estimation.
//!
//! Three independent sources of geometric distortion correction exist:
//! a fieldmap (via boundary-based registration), a calibration image with
//! reversed phase encoding ("blip" pair) and a user-supplied gradient
//! nonlinearity warp. Fieldmap and gradient warps are combined into a single
//! ASL-space warp that is applied together with motion correction. The blip
//! correction is estimated from already-corrected calibration images and
//! applied as a separate pass.

use std::fmt;
use std::str::FromStr;

use aslkit_core::{combine_warps, CombinedWarp, Grid, RigidTransform, Space, Volume, WarpField};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::external::{
    BoundaryRegistration, BoundaryRegistrationRequest, FieldmapImages, Segmentation, SusceptibilityEstimation,
    SusceptibilityResult,
};
use crate::log::RunLog;
use crate::report::ReportPage;

/// Phase-encode direction of the EPI readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PhaseEncodeDirection {
    X,
    NegX,
    Y,
    NegY,
    Z,
    NegZ,
}

impl PhaseEncodeDirection {
    /// Spatial axis `0 = x, 1 = y, 2 = z`.
    pub fn axis(&self) -> usize {
        match self {
            Self::X | Self::NegX => 0,
            Self::Y | Self::NegY => 1,
            Self::Z | Self::NegZ => 2,
        }
    }

    /// Unit vector of the direction.
    pub fn unit(&self) -> [f64; 3] {
        let sign = match self {
            Self::X | Self::Y | Self::Z => 1.0,
            Self::NegX | Self::NegY | Self::NegZ => -1.0,
        };
        let mut v = [0.0; 3];
        v[self.axis()] = sign;
        v
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X => "x",
            Self::NegX => "-x",
            Self::Y => "y",
            Self::NegY => "-y",
            Self::Z => "z",
            Self::NegZ => "-z",
        }
    }
}

impl FromStr for PhaseEncodeDirection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "x" => Ok(Self::X),
            "-x" => Ok(Self::NegX),
            "y" => Ok(Self::Y),
            "-y" => Ok(Self::NegY),
            "z" => Ok(Self::Z),
            "-z" => Ok(Self::NegZ),
            other => Err(PipelineError::invalid_configuration(format!(
                "invalid phase encode direction '{other}' (expected x, y, z, -x, -y or -z)"
            ))),
        }
    }
}

impl TryFrom<String> for PhaseEncodeDirection {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PhaseEncodeDirection> for String {
    fn from(value: PhaseEncodeDirection) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PhaseEncodeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distortion correction options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionConfig {
    pub pedir: Option<PhaseEncodeDirection>,
    /// Effective EPI echo spacing in seconds.
    pub echo_spacing: Option<f64>,
    /// The fieldmap is already aligned with the structural image.
    pub skip_fieldmap_registration: bool,
}

impl DistortionConfig {
    pub fn with_pedir(mut self, pedir: PhaseEncodeDirection) -> Self {
        self.pedir = Some(pedir);
        self
    }

    pub fn with_echo_spacing(mut self, echo_spacing: f64) -> Self {
        self.echo_spacing = Some(echo_spacing);
        self
    }

    pub fn with_skip_fieldmap_registration(mut self, skip: bool) -> Self {
        self.skip_fieldmap_registration = skip;
        self
    }

    fn encoding(&self) -> Option<(PhaseEncodeDirection, f64)> {
        self.pedir.zip(self.echo_spacing)
    }
}

/// Acquisition parameter table for a blip-reversed pair: two rows of
/// `[dx, dy, dz, total_readout_time]`, acquired direction first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionParameters {
    rows: [[f64; 4]; 2],
}

impl AcquisitionParameters {
    /// Build the table. `voxels_along_axis` is the ASL data extent along the
    /// phase-encode axis.
    pub fn new(pedir: PhaseEncodeDirection, echo_spacing: f64, voxels_along_axis: usize) -> Self {
        let readout = echo_spacing * (voxels_along_axis.saturating_sub(1)) as f64;
        let [dx, dy, dz] = pedir.unit();
        Self {
            rows: [[dx, dy, dz, readout], [-dx, -dy, -dz, readout]],
        }
    }

    pub fn rows(&self) -> &[[f64; 4]; 2] {
        &self.rows
    }

    pub fn total_readout_time(&self) -> f64 {
        self.rows[0][3]
    }
}

/// Fieldmap distortion correction.
#[derive(Debug, Clone)]
pub struct FieldmapCorrection<B: Backend> {
    /// Warp on the structural grid (`NativeAsl -> Structural`).
    pub structural_warp: WarpField<B>,
    pub asl_to_structural: RigidTransform,
    pub structural_to_asl: RigidTransform,
    /// Warp on the ASL grid (`NativeAsl -> NativeAsl`).
    pub warp: WarpField<B>,
}

/// Inputs of the fieldmap branch, borrowed from the run context.
pub struct FieldmapInputs<'a, B: Backend> {
    pub fieldmap: Option<&'a FieldmapImages<B>>,
    /// Moving image for registration, needed only with a fieldmap.
    pub perfusion_weighted: Option<&'a Volume<B>>,
    pub structural_head: Option<&'a Volume<B>>,
    pub structural_brain: Option<&'a Volume<B>>,
    pub segmentation: Option<&'a Segmentation<B>>,
    pub asl_grid: &'a Grid,
}

/// Estimate the fieldmap warp in ASL space.
///
/// Returns `Ok(None)` when there are no fieldmap images (logged) or when
/// the phase-encode direction or echo spacing are missing (warning).
pub fn estimate_fieldmap_correction<B: Backend>(
    inputs: &FieldmapInputs<'_, B>,
    config: &DistortionConfig,
    registration: &dyn BoundaryRegistration<B>,
    log: &mut RunLog,
) -> Result<Option<FieldmapCorrection<B>>> {
    let Some(fieldmap) = inputs.fieldmap else {
        log.info("No fieldmap images for distortion correction");
        return Ok(None);
    };
    let Some((pedir, echo_spacing)) = config.encoding() else {
        log.warn("Fieldmap images supplied but pedir and echospacing required for distortion correction");
        return Ok(None);
    };
    let (Some(head), Some(brain)) = (inputs.structural_head, inputs.structural_brain) else {
        return Err(PipelineError::missing_input(
            "fieldmap distortion correction requires a structural image",
        ));
    };
    let moving = inputs
        .perfusion_weighted
        .ok_or_else(|| PipelineError::missing_input("fieldmap distortion correction requires a perfusion-weighted image"))?;
    let segmentation = inputs
        .segmentation
        .ok_or_else(|| PipelineError::missing_input("fieldmap distortion correction requires a segmentation"))?;

    log.info("Distortion correction from fieldmap images using boundary-based registration");
    let request = BoundaryRegistrationRequest {
        moving,
        structural_head: head,
        structural_brain: brain,
        white_matter_seg: &segmentation.white_matter_seg,
        fieldmap: Some(fieldmap),
        pedir: Some(pedir),
        echo_spacing: Some(echo_spacing),
        skip_fieldmap_registration: config.skip_fieldmap_registration,
    };
    let result = registration.estimate_boundary_registration(&request)?;
    let structural_warp = result
        .structural_warp
        .ok_or_else(|| PipelineError::external("boundary registration returned no fieldmap warp"))?;
    check_endpoints(&structural_warp, &Space::NativeAsl, &Space::Structural)?;

    let asl_to_structural = RigidTransform::new(result.asl_to_structural, Space::NativeAsl, Space::Structural);
    let structural_to_asl = asl_to_structural.inverse()?;
    let CombinedWarp { warp, .. } = combine_warps(
        std::slice::from_ref(&structural_warp),
        Some(&structural_to_asl),
        inputs.asl_grid,
        &structural_warp.device(),
    )?;
    debug!(max_displacement = warp.max_abs_displacement(), "Fieldmap warp in ASL space");

    Ok(Some(FieldmapCorrection {
        structural_warp,
        asl_to_structural,
        structural_to_asl,
        warp,
    }))
}

/// Report page for the fieldmap branch.
pub fn fieldmap_report(config: &DistortionConfig) -> ReportPage {
    let mut page = ReportPage::new();
    page.heading("Fieldmap distortion correction", 0);
    encoding_text(&mut page, config);
    page.heading("Correction warps", 1);
    for dim in 0..3 {
        page.text(format!("Dimension {dim}"));
        page.image(format!("fmap_warp{dim}.png"));
    }
    page
}

fn encoding_text(page: &mut ReportPage, config: &DistortionConfig) {
    if let Some(pedir) = config.pedir {
        page.text(format!("PE direction: {pedir}"));
    }
    if let Some(echo_spacing) = config.echo_spacing {
        page.text(format!("Echo spacing: {echo_spacing:.6} s"));
    }
}

/// Blip-reversed susceptibility correction.
#[derive(Debug, Clone)]
pub struct BlipCorrection<B: Backend> {
    pub pedir: PhaseEncodeDirection,
    pub echo_spacing: f64,
    pub params: AcquisitionParameters,
    pub result: SusceptibilityResult<B>,
}

impl<B: Backend> BlipCorrection<B> {
    pub fn report_page(&self) -> ReportPage {
        let mut page = ReportPage::new();
        page.heading("TOPUP distortion correction", 0);
        page.text(format!("PE direction: {}", self.pedir));
        page.text(format!("Echo spacing: {:.6} s", self.echo_spacing));
        page.text(format!("Total readout time: {:.6} s", self.params.total_readout_time()));
        page.heading("Correction image", 1);
        page.image("topup_field.png");
        page
    }
}

/// Fail with the endpoint that does not match, source first.
fn check_endpoints<B: Backend>(warp: &WarpField<B>, source: &Space, destination: &Space) -> Result<()> {
    if warp.source() != source {
        return Err(aslkit_core::CoreError::space_mismatch(source, warp.source()).into());
    }
    if warp.destination() != destination {
        return Err(aslkit_core::CoreError::space_mismatch(destination, warp.destination()).into());
    }
    Ok(())
}

/// Whether the blip branch can run, logging why not when it cannot.
pub fn blip_encoding(has_blip_image: bool, config: &DistortionConfig, log: &mut RunLog) -> Option<(PhaseEncodeDirection, f64)> {
    if !has_blip_image {
        return None;
    }
    let encoding = config.encoding();
    if encoding.is_none() {
        log.warn("Phase-encode-reversed calibration image supplied but pedir and echospacing required for distortion correction");
    }
    encoding
}

/// Estimate the blip correction from a calibration image and its
/// phase-reversed counterpart, both already resampled into ASL space.
pub fn estimate_blip_correction<B: Backend>(
    calib: &Volume<B>,
    cblip: &Volume<B>,
    asl_shape_xyz: [usize; 3],
    encoding: (PhaseEncodeDirection, f64),
    estimator: &dyn SusceptibilityEstimation<B>,
    log: &mut RunLog,
) -> Result<BlipCorrection<B>> {
    let (pedir, echo_spacing) = encoding;
    log.info("Distortion correction using phase-encode-reversed calibration image");
    let params = AcquisitionParameters::new(pedir, echo_spacing, asl_shape_xyz[pedir.axis()]);
    let pair = aslkit_core::Series::from_volumes(format!("{}_blipped", calib.name()), &[calib.clone(), cblip.clone()])?;
    let result = estimator.estimate_susceptibility_warp(&pair, &params)?;
    Ok(BlipCorrection {
        pedir,
        echo_spacing,
        params,
        result,
    })
}

/// Combine the fieldmap and gradient warps (in that order) on the ASL grid.
///
/// Returns `None` when neither warp exists.
pub fn combine_distortion_warps<B: Backend>(
    fieldmap: Option<&WarpField<B>>,
    gradient: Option<&WarpField<B>>,
    asl_grid: &Grid,
    log: &mut RunLog,
) -> Result<Option<CombinedWarp<B>>> {
    let warps: Vec<WarpField<B>> = [fieldmap, gradient].into_iter().flatten().cloned().collect();
    let Some(first) = warps.first() else {
        return Ok(None);
    };
    for warp in &warps {
        if warp.source() != &Space::NativeAsl {
            return Err(aslkit_core::CoreError::space_mismatch(&Space::NativeAsl, warp.source()).into());
        }
    }
    log.info(format!("Combining {} distortion warp(s) in ASL space", warps.len()));
    let device = first.device();
    Ok(Some(combine_warps(&warps, None, asl_grid, &device)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_parse_every_direction() {
        for (text, axis) in [("x", 0), ("-x", 0), ("y", 1), ("-y", 1), ("z", 2), ("-z", 2)] {
            let pedir: PhaseEncodeDirection = text.parse().unwrap();
            assert_eq!(pedir.axis(), axis);
            assert_eq!(pedir.to_string(), text);
        }
        assert!("+y".parse::<PhaseEncodeDirection>().is_err());
    }

    #[test]
    fn test_acquisition_parameters_for_negative_y() {
        let params = AcquisitionParameters::new(PhaseEncodeDirection::NegY, 0.00095, 64);
        let readout = 0.00095 * 63.0;
        assert_eq!(params.rows()[0][..3], [0.0, -1.0, 0.0]);
        assert_eq!(params.rows()[1][..3], [0.0, 1.0, 0.0]);
        assert!((params.rows()[0][3] - readout).abs() < 1e-12);
        assert!((params.rows()[1][3] - readout).abs() < 1e-12);
    }

    #[test]
    fn test_blip_branch_needs_encoding() {
        let mut log = RunLog::new();
        assert!(blip_encoding(false, &DistortionConfig::default(), &mut log).is_none());
        assert!(!log.has_warnings());

        assert!(blip_encoding(true, &DistortionConfig::default(), &mut log).is_none());
        assert!(log.has_warnings());

        let config = DistortionConfig::default()
            .with_pedir(PhaseEncodeDirection::Y)
            .with_echo_spacing(0.0007);
        assert_eq!(blip_encoding(true, &config, &mut log), Some((PhaseEncodeDirection::Y, 0.0007)));
    }

    #[test]
    fn test_endpoint_check_names_failing_space() {
        use crate::testing::test_grid;
        use aslkit_core::CoreError;

        let device = Default::default();
        let grid = test_grid();
        let warp = WarpField::<TestBackend>::zeros(&grid, Space::Calibration, Space::Structural, &device);
        match check_endpoints(&warp, &Space::NativeAsl, &Space::Structural) {
            Err(PipelineError::Core(CoreError::SpaceMismatch { expected, actual })) => {
                assert_eq!(expected, Space::NativeAsl);
                assert_eq!(actual, Space::Calibration);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let warp = WarpField::<TestBackend>::zeros(&grid, Space::NativeAsl, Space::Standard, &device);
        match check_endpoints(&warp, &Space::NativeAsl, &Space::Structural) {
            Err(PipelineError::Core(CoreError::SpaceMismatch { expected, actual })) => {
                assert_eq!(expected, Space::Structural);
                assert_eq!(actual, Space::Standard);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let warp = WarpField::<TestBackend>::zeros(&grid, Space::NativeAsl, Space::Structural, &device);
        assert!(check_endpoints(&warp, &Space::NativeAsl, &Space::Structural).is_ok());
    }

    #[test]
    fn test_config_json_uses_direction_strings() {
        let config: DistortionConfig = serde_json::from_str(r#"{"pedir": "-y", "echo_spacing": 0.0005}"#).unwrap();
        assert_eq!(config.pedir, Some(PhaseEncodeDirection::NegY));
        assert!(serde_json::from_str::<DistortionConfig>(r#"{"pedir": "up"}"#).is_err());
    }
}
