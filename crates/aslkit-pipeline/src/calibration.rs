//! Conversion of fitted perfusion into physiological units.
//!
//! The equilibrium magnetisation of blood (M0) is derived from a
//! calibration image, either voxel by voxel or as a single value from the
//! mean signal of a reference tissue, and the perfusion image is divided
//! by it.

use std::fmt;
use std::str::FromStr;

use aslkit_core::Volume;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::log::RunLog;

/// Partition coefficient used by voxelwise calibration when none is given.
pub const DEFAULT_PARTITION_COEFFICIENT: f64 = 0.9;
/// Repetition time of the calibration image for reference region
/// calibration (s).
pub const DEFAULT_REFERENCE_TR: f64 = 3.2;
/// T2 of arterial blood (ms).
pub const DEFAULT_T2_BLOOD: f64 = 150.0;

/// Reference tissue for reference region calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TissueType {
    #[default]
    Csf,
    WhiteMatter,
    GreyMatter,
}

/// Relaxation constants of a reference tissue. Times in s (T1) and ms (T2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TissueConstants {
    pub t1: f64,
    pub t2: f64,
    pub t2_star: f64,
    pub partition_coefficient: f64,
}

impl TissueType {
    /// Built-in constants for the tissue.
    pub fn defaults(&self) -> TissueConstants {
        match self {
            TissueType::Csf => TissueConstants {
                t1: 4.3,
                t2: 750.0,
                t2_star: 400.0,
                partition_coefficient: 1.15,
            },
            TissueType::WhiteMatter => TissueConstants {
                t1: 1.0,
                t2: 50.0,
                t2_star: 60.0,
                partition_coefficient: 0.82,
            },
            TissueType::GreyMatter => TissueConstants {
                t1: 1.3,
                t2: 100.0,
                t2_star: 60.0,
                partition_coefficient: 0.98,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TissueType::Csf => "csf",
            TissueType::WhiteMatter => "wm",
            TissueType::GreyMatter => "gm",
        }
    }
}

impl FromStr for TissueType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csf" => Ok(TissueType::Csf),
            "wm" | "white" | "white_matter" => Ok(TissueType::WhiteMatter),
            "gm" | "grey" | "gray" | "grey_matter" => Ok(TissueType::GreyMatter),
            _ => Err(PipelineError::InvalidTissueType(s.to_string())),
        }
    }
}

impl TryFrom<String> for TissueType {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TissueType> for String {
    fn from(value: TissueType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TissueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How M0 is obtained from the calibration image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CalibrationMethod {
    #[default]
    Voxelwise,
    ReferenceRegion,
}

impl CalibrationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMethod::Voxelwise => "voxelwise",
            CalibrationMethod::ReferenceRegion => "refregion",
        }
    }
}

impl FromStr for CalibrationMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voxelwise" | "voxel" => Ok(CalibrationMethod::Voxelwise),
            "refregion" | "single" => Ok(CalibrationMethod::ReferenceRegion),
            _ => Err(PipelineError::InvalidMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for CalibrationMethod {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CalibrationMethod> for String {
    fn from(value: CalibrationMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User calibration options. Unset values fall back to the method's
/// defaults when resolved into [`CalibrationParameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub method: CalibrationMethod,
    pub tissue: TissueType,
    /// Tissue T1 (s).
    pub t1: Option<f64>,
    /// Tissue T2 (ms).
    pub t2: Option<f64>,
    pub partition_coefficient: Option<f64>,
    /// Use T2* rather than T2 tissue defaults.
    pub use_t2_star: bool,
    /// Calibration image repetition time (s).
    pub tr: Option<f64>,
    /// Echo time (ms).
    pub te: Option<f64>,
    /// Blood T2 (ms).
    pub t2_blood: Option<f64>,
    pub gain: f64,
    /// Inversion efficiency.
    pub alpha: f64,
    /// Unit conversion applied to the result.
    pub multiplier: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::Voxelwise,
            tissue: TissueType::Csf,
            t1: None,
            t2: None,
            partition_coefficient: None,
            use_t2_star: false,
            tr: None,
            te: None,
            t2_blood: None,
            gain: 1.0,
            alpha: 1.0,
            multiplier: 1.0,
        }
    }
}

impl CalibrationConfig {
    pub fn with_method(mut self, method: CalibrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_tissue(mut self, tissue: TissueType) -> Self {
        self.tissue = tissue;
        self
    }

    pub fn with_t1(mut self, t1: f64) -> Self {
        self.t1 = Some(t1);
        self
    }

    pub fn with_t2(mut self, t2: f64) -> Self {
        self.t2 = Some(t2);
        self
    }

    pub fn with_partition_coefficient(mut self, pc: f64) -> Self {
        self.partition_coefficient = Some(pc);
        self
    }

    pub fn with_t2_star(mut self, use_t2_star: bool) -> Self {
        self.use_t2_star = use_t2_star;
        self
    }

    pub fn with_tr(mut self, tr: f64) -> Self {
        self.tr = Some(tr);
        self
    }

    pub fn with_te(mut self, te: f64) -> Self {
        self.te = Some(te);
        self
    }

    pub fn with_t2_blood(mut self, t2_blood: f64) -> Self {
        self.t2_blood = Some(t2_blood);
        self
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Resolve defaults for the configured method.
    ///
    /// Voxelwise calibration only uses the relaxation terms the user gave;
    /// `TR` without `T1` drops the saturation term and logs a warning.
    /// Reference region calibration fills every gap from the tissue table.
    pub fn resolve(&self, log: &mut RunLog) -> CalibrationParameters {
        let te = self.te.unwrap_or(0.0);
        let t2_blood = self.t2_blood.unwrap_or(DEFAULT_T2_BLOOD);
        match self.method {
            CalibrationMethod::Voxelwise => {
                let t1 = match (self.tr, self.t1) {
                    (Some(_), None) => {
                        log.warn("TR specified for voxelwise calibration but tissue T1 not given - will not correct for short TR");
                        None
                    }
                    (_, t1) => t1,
                };
                CalibrationParameters {
                    method: self.method,
                    tr: self.tr.filter(|_| t1.is_some()),
                    t1,
                    t2: self.t2,
                    te,
                    t2_blood,
                    partition_coefficient: self.partition_coefficient.unwrap_or(DEFAULT_PARTITION_COEFFICIENT),
                    gain: self.gain,
                    alpha: self.alpha,
                    multiplier: self.multiplier,
                }
            }
            CalibrationMethod::ReferenceRegion => {
                let tissue = self.tissue.defaults();
                let t2_default = if self.use_t2_star { tissue.t2_star } else { tissue.t2 };
                CalibrationParameters {
                    method: self.method,
                    tr: Some(self.tr.unwrap_or(DEFAULT_REFERENCE_TR)),
                    t1: Some(self.t1.unwrap_or(tissue.t1)),
                    t2: Some(self.t2.unwrap_or(t2_default)),
                    te,
                    t2_blood,
                    partition_coefficient: self.partition_coefficient.unwrap_or(tissue.partition_coefficient),
                    gain: self.gain,
                    alpha: self.alpha,
                    multiplier: self.multiplier,
                }
            }
        }
    }
}

/// Fully resolved calibration constants. A `None` relaxation time drops
/// the corresponding correction term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParameters {
    pub method: CalibrationMethod,
    pub tr: Option<f64>,
    pub t1: Option<f64>,
    pub t2: Option<f64>,
    pub te: f64,
    pub t2_blood: f64,
    pub partition_coefficient: f64,
    pub gain: f64,
    pub alpha: f64,
    pub multiplier: f64,
}

impl CalibrationParameters {
    /// Factor turning calibration signal into M0:
    /// `1 / (1 - exp(-TR/T1)) / exp(-TE/T2) * gain / pc * exp(-TE/T2b) * alpha`.
    pub fn m0_factor(&self) -> f64 {
        let mut factor = 1.0;
        if let (Some(tr), Some(t1)) = (self.tr, self.t1) {
            factor /= 1.0 - (-tr / t1).exp();
        }
        if let Some(t2) = self.t2 {
            factor /= (-self.te / t2).exp();
        }
        factor * self.gain / self.partition_coefficient * (-self.te / self.t2_blood).exp() * self.alpha
    }
}

/// Equilibrium magnetisation of blood.
#[derive(Debug, Clone)]
pub enum M0<B: Backend> {
    Voxelwise(Volume<B>),
    Scalar(f64),
}

/// Calibrated image and the M0 used.
#[derive(Debug, Clone)]
pub struct Calibrated<B: Backend> {
    pub image: Volume<B>,
    pub m0: M0<B>,
}

/// Calibrate a perfusion (or perfusion variance) image.
///
/// The result is `perfusion / M0 * multiplier`, or
/// `perfusion / M0^2 * multiplier^2` when `variance` is set, and is named
/// `<perfusion name>_calib`. Voxels where the voxelwise M0 is not positive
/// are set to zero.
///
/// # Errors
/// [`PipelineError::MissingInput`] when the perfusion or calibration image
/// is absent, or when reference region calibration has no mask.
pub fn calibrate<B: Backend>(
    perfusion: Option<&Volume<B>>,
    calib: Option<&Volume<B>>,
    mask: Option<&Volume<B>>,
    config: &CalibrationConfig,
    variance: bool,
    log: &mut RunLog,
) -> Result<Calibrated<B>> {
    let perfusion = perfusion.ok_or_else(|| PipelineError::missing_input("no perfusion data to calibrate"))?;
    let calib = calib.ok_or_else(|| PipelineError::missing_input("no calibration data"))?;
    if config.method == CalibrationMethod::ReferenceRegion && mask.is_none() {
        return Err(PipelineError::missing_input("reference region calibration requires a reference mask"));
    }

    log.info(format!("Calibrating perfusion data: {}", perfusion.name()));
    let params = config.resolve(log);
    let factor = params.m0_factor();
    let name = format!("{}_calib", perfusion.name());
    let power = if variance { 2 } else { 1 };
    let multiplier = params.multiplier.powi(power);

    let (image, m0) = match params.method {
        CalibrationMethod::Voxelwise => {
            log.info(" - Voxelwise calibration");
            let m0 = calib.mul_scalar(factor).renamed("m0");
            let m0_data = m0.data().clone();
            let denominator = match power {
                2 => m0_data.clone() * m0_data.clone(),
                _ => m0_data.clone(),
            };
            let invalid = m0_data.lower_equal_elem(0.0);
            let data = (perfusion.data().clone() / denominator.mask_fill(invalid.clone(), 1.0))
                .mask_fill(invalid, 0.0)
                .mul_scalar(multiplier);
            (perfusion.with_data(data)?, M0::Voxelwise(m0))
        }
        CalibrationMethod::ReferenceRegion => {
            log.info(format!(" - Reference region calibration using {}", config.tissue));
            let mask = mask.ok_or_else(|| PipelineError::missing_input("no reference mask"))?;
            let mean = calib
                .masked_mean(mask)?
                .ok_or_else(|| PipelineError::invalid_configuration("reference mask contains no voxels"))?;
            let m0 = mean * factor;
            log.info(format!(" - Mean calibration signal in reference region: {mean:.6}"));
            log.info(format!(" - M0: {m0:.6}"));
            if m0 <= 0.0 {
                return Err(PipelineError::invalid_configuration(format!(
                    "reference region M0 must be positive, got {m0}"
                )));
            }
            (perfusion.mul_scalar(multiplier / m0.powi(power)), M0::Scalar(m0))
        }
    };
    debug!(method = %params.method, factor, variance, "Calibration complete");

    Ok(Calibrated {
        image: image.renamed(name),
        m0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::random_volume;
    use burn_ndarray::NdArray;
    use proptest::prelude::*;

    type TestBackend = NdArray<f32>;

    fn images(seed_shape: [usize; 3]) -> (Volume<TestBackend>, Volume<TestBackend>) {
        let device = Default::default();
        (
            random_volume("perfusion", seed_shape, &device),
            random_volume("calib", seed_shape, &device),
        )
    }

    fn assert_scaled_ratio(result: &Volume<TestBackend>, perf: &Volume<TestBackend>, calib: &Volume<TestBackend>, scale: f64, power: i32) {
        let result = result.to_vec().unwrap();
        let perf = perf.to_vec().unwrap();
        let calib = calib.to_vec().unwrap();
        for ((r, p), c) in result.iter().zip(&perf).zip(&calib) {
            let expected = scale * *p as f64 / (*c as f64).powi(power);
            assert!(
                (*r as f64 - expected).abs() <= 1e-4 * expected.abs().max(1.0),
                "got {r}, expected {expected}"
            );
        }
    }

    fn run(config: &CalibrationConfig, variance: bool) -> (Calibrated<TestBackend>, Volume<TestBackend>, Volume<TestBackend>, RunLog) {
        let (perf, calib) = images([5, 5, 5]);
        let mut log = RunLog::new();
        let out = calibrate(Some(&perf), Some(&calib), None, config, variance, &mut log).unwrap();
        (out, perf, calib, log)
    }

    #[test]
    fn test_voxelwise_defaults() {
        let (out, perf, calib, _) = run(&CalibrationConfig::default(), false);
        assert_eq!(out.image.name(), "perfusion_calib");
        assert_eq!(out.image.shape(), perf.shape());
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9, 1);
    }

    #[test]
    fn test_voxelwise_gain_alpha_multiplier_pc() {
        let (out, perf, calib, _) = run(&CalibrationConfig::default().with_gain(1.567), false);
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9 / 1.567, 1);

        let (out, perf, calib, _) = run(&CalibrationConfig::default().with_alpha(0.74), false);
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9 / 0.74, 1);

        let (out, perf, calib, _) = run(&CalibrationConfig::default().with_multiplier(6000.0), false);
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9 * 6000.0, 1);

        let (out, perf, calib, _) = run(&CalibrationConfig::default().with_partition_coefficient(0.67), false);
        assert_scaled_ratio(&out.image, &perf, &calib, 0.67, 1);
    }

    #[test]
    fn test_voxelwise_short_tr() {
        let config = CalibrationConfig::default().with_tr(3.0).with_t1(1.1);
        let (out, perf, calib, log) = run(&config, false);
        let factor = 1.0 - (-3.0f64 / 1.1).exp();
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9 * factor, 1);
        assert!(!log.has_warnings());
    }

    #[test]
    fn test_voxelwise_tr_without_t1_warns() {
        let (out, perf, calib, log) = run(&CalibrationConfig::default().with_tr(3.0), false);
        assert!(log.contents().contains("WARNING"));
        assert_scaled_ratio(&out.image, &perf, &calib, 0.9, 1);
    }

    #[test]
    fn test_variance_squares_factors() {
        let config = CalibrationConfig::default().with_tr(3.0).with_t1(1.1).with_multiplier(2.0);
        let (out, perf, calib, _) = run(&config, true);
        let factor = 1.0 - (-3.0f64 / 1.1).exp();
        let scale = (0.9 * factor * 2.0f64).powi(2);
        assert_scaled_ratio(&out.image, &perf, &calib, scale, 2);
    }

    fn expected_m0(mean: f64, t1: f64, t2: f64, pc: f64) -> f64 {
        mean / (1.0 - (-3.2 / t1).exp()) / (-0.0 / t2).exp() / pc
    }

    #[test]
    fn test_reference_region_tissue_defaults() {
        let device = Default::default();
        let (perf, calib) = images([5, 5, 5]);
        let mask = Volume::<TestBackend>::from_vec("ref_mask", vec![1.0; 125], [5, 5, 5], Default::default(), &device).unwrap();
        let mean = calib.mean_value();
        for (tissue, t1, t2, t2_star, pc) in [
            (TissueType::Csf, 4.3, 750.0, 400.0, 1.15),
            (TissueType::WhiteMatter, 1.0, 50.0, 60.0, 0.82),
            (TissueType::GreyMatter, 1.3, 100.0, 60.0, 0.98),
        ] {
            for star in [false, true] {
                let config = CalibrationConfig::default()
                    .with_method(CalibrationMethod::ReferenceRegion)
                    .with_tissue(tissue)
                    .with_t2_star(star);
                let mut log = RunLog::new();
                let out = calibrate(Some(&perf), Some(&calib), Some(&mask), &config, false, &mut log).unwrap();
                let t2 = if star { t2_star } else { t2 };
                let m0 = expected_m0(mean, t1, t2, pc);
                match out.m0 {
                    M0::Scalar(value) => assert!((value - m0).abs() < 1e-4 * m0),
                    M0::Voxelwise(_) => panic!("expected scalar M0"),
                }
                let got = out.image.mean_value();
                assert!((got - perf.mean_value() / m0).abs() < 1e-4 * got.abs().max(1e-3));
            }
        }
    }

    #[test]
    fn test_reference_region_te_uses_t2() {
        let params = CalibrationConfig::default()
            .with_method(CalibrationMethod::ReferenceRegion)
            .with_tissue(TissueType::WhiteMatter)
            .with_te(13.0)
            .resolve(&mut RunLog::new());
        let expected = 1.0 / (1.0 - (-3.2f64 / 1.0).exp()) / (-13.0f64 / 50.0).exp() / 0.82 * (-13.0f64 / 150.0).exp();
        assert!((params.m0_factor() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_validation_errors() {
        let (perf, calib) = images([3, 3, 3]);
        let mut log = RunLog::new();
        let config = CalibrationConfig::default();
        assert!(matches!(
            calibrate::<TestBackend>(None, Some(&calib), None, &config, false, &mut log),
            Err(PipelineError::MissingInput(_))
        ));
        assert!(matches!(
            calibrate::<TestBackend>(Some(&perf), None, None, &config, false, &mut log),
            Err(PipelineError::MissingInput(_))
        ));
        let refregion = config.with_method(CalibrationMethod::ReferenceRegion);
        assert!(matches!(
            calibrate(Some(&perf), Some(&calib), None, &refregion, false, &mut log),
            Err(PipelineError::MissingInput(_))
        ));
        assert!(matches!("random".parse::<CalibrationMethod>(), Err(PipelineError::InvalidMethod(_))));
        assert!(matches!("kryptonite".parse::<TissueType>(), Err(PipelineError::InvalidTissueType(_))));
        assert!(serde_json::from_str::<CalibrationConfig>(r#"{"tissue": "bone"}"#).is_err());
    }

    proptest! {
        #[test]
        fn prop_factor_scales_inversely_with_partition_coefficient(pc in 0.1f64..2.0, gain in 0.1f64..5.0) {
            let base = CalibrationConfig::default().with_gain(gain).resolve(&mut RunLog::new());
            let scaled = CalibrationConfig::default()
                .with_gain(gain)
                .with_partition_coefficient(pc)
                .resolve(&mut RunLog::new());
            let ratio = scaled.m0_factor() / base.m0_factor();
            prop_assert!((ratio - DEFAULT_PARTITION_COEFFICIENT / pc).abs() < 1e-9);
        }

        #[test]
        fn prop_zero_te_ignores_t2(t2 in 1.0f64..1000.0) {
            let with_t2 = CalibrationConfig::default().with_t2(t2).resolve(&mut RunLog::new());
            let without = CalibrationConfig::default().resolve(&mut RunLog::new());
            prop_assert!((with_t2.m0_factor() - without.m0_factor()).abs() < 1e-12);
        }
    }
}
