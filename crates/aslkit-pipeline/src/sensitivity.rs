//! Coil sensitivity field estimation.

use aslkit_core::{RigidTransform, Space, Volume};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::external::SpaceTransformer;
use crate::log::RunLog;

/// Sensitivity correction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// Never apply a sensitivity correction.
    pub disabled: bool,
    /// Derive the field from the structural bias field when nothing better
    /// is available.
    pub auto: bool,
}

impl SensitivityConfig {
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }
}

/// Which rule produced the sensitivity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivitySource {
    Disabled,
    UserSupplied,
    CalibrationReference,
    BiasField,
    None,
}

/// Estimated sensitivity field in ASL space.
#[derive(Debug, Clone)]
pub struct SensitivityEstimate<B: Backend> {
    pub source: SensitivitySource,
    pub field: Option<Volume<B>>,
}

/// Images the sensitivity rules may use.
pub struct SensitivityInputs<'a, B: Backend> {
    pub user_field: Option<&'a Volume<B>>,
    pub calib: Option<&'a Volume<B>>,
    pub cref: Option<&'a Volume<B>>,
    /// Bias field in structural space, if a segmentation produced one.
    pub bias_field: Option<&'a Volume<B>>,
    /// Registration used to bring the bias field into ASL space.
    pub asl_to_structural: Option<&'a RigidTransform>,
}

/// Pick the sensitivity field by the first rule that applies: disabled,
/// user-supplied field, `calib / cref`, reciprocal bias field (when `auto`),
/// otherwise none.
pub fn estimate_sensitivity<B: Backend>(
    inputs: &SensitivityInputs<'_, B>,
    config: &SensitivityConfig,
    spaces: &dyn SpaceTransformer<B>,
    log: &mut RunLog,
) -> Result<SensitivityEstimate<B>> {
    log.info("Sensitivity correction");
    let (source, field) = if config.disabled {
        log.info(" - Sensitivity correction disabled");
        (SensitivitySource::Disabled, None)
    } else if let Some(user) = inputs.user_field {
        log.info(" - Sensitivity image supplied by user");
        (SensitivitySource::UserSupplied, Some(user.renamed("sensitivity")))
    } else if let (Some(calib), Some(cref)) = (inputs.calib, inputs.cref) {
        log.info(" - Sensitivity image calculated from calibration reference image");
        (
            SensitivitySource::CalibrationReference,
            Some(calib.ratio(cref)?.renamed("sensitivity")),
        )
    } else if let (true, Some(bias)) = (config.auto, inputs.bias_field) {
        log.info(" - Sensitivity image calculated from bias field");
        let field = spaces.transform_to_space(
            &bias.recip(),
            &Space::Structural,
            &Space::NativeAsl,
            inputs.asl_to_structural,
        )?;
        (SensitivitySource::BiasField, Some(field.renamed("sensitivity")))
    } else {
        log.info(" - No source of sensitivity correction was found");
        (SensitivitySource::None, None)
    };
    Ok(SensitivityEstimate { source, field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{constant_volume, IdentitySpaces};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn run(inputs: &SensitivityInputs<'_, TestBackend>, config: SensitivityConfig) -> SensitivityEstimate<TestBackend> {
        let mut log = RunLog::new();
        estimate_sensitivity(inputs, &config, &IdentitySpaces::default(), &mut log).unwrap()
    }

    #[test]
    fn test_precedence() {
        let device = Default::default();
        let user = constant_volume::<TestBackend>("isen", 0.5, &device);
        let calib = constant_volume::<TestBackend>("calib", 6.0, &device);
        let cref = constant_volume::<TestBackend>("cref", 3.0, &device);
        let bias = constant_volume::<TestBackend>("bias", 4.0, &device);

        let all = SensitivityInputs {
            user_field: Some(&user),
            calib: Some(&calib),
            cref: Some(&cref),
            bias_field: Some(&bias),
            asl_to_structural: None,
        };
        let auto = SensitivityConfig::default().with_auto(true);

        assert_eq!(run(&all, auto.with_disabled(true)).source, SensitivitySource::Disabled);
        let estimate = run(&all, auto);
        assert_eq!(estimate.source, SensitivitySource::UserSupplied);
        assert!((estimate.field.unwrap().mean_value() - 0.5).abs() < 1e-6);

        let no_user = SensitivityInputs { user_field: None, ..all };
        let estimate = run(&no_user, auto);
        assert_eq!(estimate.source, SensitivitySource::CalibrationReference);
        assert!((estimate.field.unwrap().mean_value() - 2.0).abs() < 1e-6);

        let bias_only = SensitivityInputs {
            calib: None,
            cref: None,
            ..no_user
        };
        let estimate = run(&bias_only, auto);
        assert_eq!(estimate.source, SensitivitySource::BiasField);
        assert!((estimate.field.unwrap().mean_value() - 0.25).abs() < 1e-6);

        assert_eq!(run(&bias_only, SensitivityConfig::default()).source, SensitivitySource::None);
    }

    #[test]
    fn test_bias_field_moved_with_registration() {
        let device = Default::default();
        let bias = constant_volume::<TestBackend>("bias", 2.0, &device);
        let registration = RigidTransform::from_translation([1.5, 0.0, 0.0], Space::NativeAsl, Space::Structural);
        let inputs = SensitivityInputs {
            user_field: None,
            calib: None,
            cref: None,
            bias_field: Some(&bias),
            asl_to_structural: Some(&registration),
        };
        let spaces = IdentitySpaces::default();
        let mut log = RunLog::new();
        let config = SensitivityConfig::default().with_auto(true);
        estimate_sensitivity(&inputs, &config, &spaces, &mut log).unwrap();

        let calls = spaces.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, Space::Structural);
        assert_eq!(calls[0].target, Space::NativeAsl);
        assert_eq!(calls[0].asl_to_structural, Some(*registration.matrix()));
    }
}
