use aslkit_core::{Image, Series, Space, WarpField};
use aslkit_pipeline::distortion::DistortionConfig;
use aslkit_pipeline::external::FieldmapImages;
use aslkit_pipeline::testing::{
    constant_series, constant_volume, test_grid, MockBoundaryRegistration, MockSuite, MockSurfacePv,
    ScaledSusceptibility, SpaceCall, TEST_SHAPE,
};
use aslkit_pipeline::{
    CalibrationConfig, CalibrationMethod, FitStage, PhaseEncodeDirection, Pipeline, PipelineConfig, PipelineError,
    PvSource, PvcConfig, RunInputs, SensitivityConfig, Stage,
};
use burn_ndarray::NdArray;
use nalgebra::{Matrix4, Vector3};

type Backend = NdArray<f32>;

/// Two-volume series whose value at every voxel is its x index.
fn ramp_series() -> Series<Backend> {
    let device = Default::default();
    let [z, y, x] = TEST_SHAPE;
    let values: Vec<f32> = (0..2 * z * y * x).map(|n| (n % x) as f32).collect();
    let grid = test_grid();
    Image::from_vec("asl", values, [2, z, y, x], grid.header().clone(), &device).unwrap()
}

fn fieldmap_images() -> FieldmapImages<Backend> {
    let device = Default::default();
    FieldmapImages {
        fieldmap: constant_volume("fmap", 10.0, &device),
        magnitude: constant_volume("fmapmag", 1.0, &device),
        magnitude_brain: constant_volume("fmapmagbrain", 1.0, &device),
    }
}

fn assert_shifted_ramp(series: &Series<Backend>) {
    let [_, _, _, nx] = series.shape();
    let values = series.to_vec().unwrap();
    for (n, v) in values.iter().enumerate() {
        let x = n % nx;
        if x + 1 < nx {
            assert!((v - (x + 1) as f32).abs() < 1e-4, "voxel {n}: got {v}, expected {}", x + 1);
        }
    }
}

#[test]
fn test_full_run_with_pv_corrections() {
    let device = Default::default();
    let mocks = MockSuite {
        surface_pv: Some(MockSurfacePv::default()),
        ..MockSuite::default()
    };
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 4, 4.0, &device))
        .with_calib(constant_volume("calib", 2.0, &device))
        .with_cref(constant_volume("cref", 1.0, &device))
        .with_structural(
            constant_volume("struc", 100.0, &device),
            constant_volume("struc_brain", 100.0, &device),
        );
    let config = PipelineConfig::default()
        .with_motion_correction(true)
        .with_pvc(
            PvcConfig::default()
                .with_pv_correction(true)
                .with_surface_pv_correction(true)
                .with_cores(3),
        );

    let mut pipeline = Pipeline::new(inputs, config, mocks.collaborators()).unwrap();
    pipeline.run().unwrap();

    let calls = mocks.fitting.calls();
    let stages: Vec<&str> = calls.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(stages, ["basil", "basil_pvcorr", "basil_surf_pvcorr"]);
    assert_eq!(calls.iter().map(|c| c.prefit).collect::<Vec<_>>(), [true, false, false]);
    assert_eq!(calls[1].pv_source, Some(PvSource::Segmentation));
    assert_eq!(calls[2].pv_source, Some(PvSource::Surface));
    assert_eq!(calls[2].mask_voxels, Some(test_grid().len() / 4));
    assert_eq!(mocks.surface_pv.as_ref().unwrap().cores_requested(), [Some(3)]);

    // segmentation is shared by re-registration and the PV fit
    assert_eq!(mocks.segmentation.calls(), 1);
    assert_eq!(mocks.boundary.calls(), 1);

    let context = pipeline.context();
    assert!(context.is_completed(&Stage::Registration));
    assert_eq!(context.fits().len(), 3);

    // sensitivity = calib / cref = 2, so ASL 4 -> 2 and calib 2 -> 1
    let plain = context.fit(&FitStage::Plain).unwrap();
    assert!((plain.output.perfusion.mean_value() - 2.0).abs() < 1e-5);
    let calibrated = plain.calibrated.as_ref().unwrap();
    assert_eq!(calibrated.image.name(), "perfusion_calib");
    assert!((calibrated.image.mean_value() - 1.8).abs() < 1e-4);
    let variance = plain.calibrated_variance.as_ref().unwrap();
    assert!((variance.image.mean_value() - 0.2 * 0.81).abs() < 1e-4);

    let report = pipeline.report();
    for page in ["moco", "basil", "reg", "basil_pvcorr", "basil_surf_pvcorr", "summary"] {
        assert!(report.page(page).is_some(), "missing report page {page}");
    }
}

#[test]
fn test_blip_pass_after_single_resampling() {
    let device = Default::default();
    let susceptibility = ScaledSusceptibility::new(0.5);
    let mocks = MockSuite {
        susceptibility: Some(susceptibility.clone()),
        ..MockSuite::default()
    };
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 8.0, &device))
        .with_calib(constant_volume("calib", 6.0, &device))
        .with_cblip(constant_volume("cblip", 6.0, &device));
    let config = PipelineConfig::default()
        .with_motion_correction(true)
        .with_distortion(
            DistortionConfig::default()
                .with_pedir(PhaseEncodeDirection::NegY)
                .with_echo_spacing(0.0005),
        );

    let mut pipeline = Pipeline::new(inputs, config, mocks.collaborators()).unwrap();
    pipeline.run().unwrap();

    assert_eq!(susceptibility.estimate_calls(), 1);
    assert_eq!(susceptibility.applied_indices(), [1, 2, 1]);

    let corrected = pipeline.context().corrected().unwrap();
    assert!(corrected.resampled);
    assert!((corrected.asl.mean_value() - 4.0).abs() < 1e-5);
    assert_eq!(corrected.asl.name(), "asl");
    assert_eq!(corrected.asl_pre_blip.as_ref().unwrap().name(), "asl_pretopup");
    assert!((corrected.asl_pre_blip.as_ref().unwrap().mean_value() - 8.0).abs() < 1e-5);
    assert_eq!(corrected.calib_pre_blip.as_ref().unwrap().name(), "calib_pretopup");
    assert_eq!(corrected.cblip_pre_blip.as_ref().unwrap().name(), "cblip_pretopup");

    let blip = corrected.blip.as_ref().unwrap();
    let readout = 0.0005 * (TEST_SHAPE[1] - 1) as f64;
    assert!((blip.params.total_readout_time() - readout).abs() < 1e-12);
    assert!(pipeline.report().page("topup").is_some());
}

#[test]
fn test_nothing_to_correct_passes_data_through() {
    let device = Default::default();
    let susceptibility = ScaledSusceptibility::new(0.5);
    let mocks = MockSuite {
        susceptibility: Some(susceptibility.clone()),
        ..MockSuite::default()
    };
    // a reversed-PE image alone does not trigger resampling
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 3.0, &device))
        .with_calib(constant_volume("calib", 1.5, &device))
        .with_cblip(constant_volume("cblip", 1.5, &device));
    let config = PipelineConfig::default().with_distortion(
        DistortionConfig::default()
            .with_pedir(PhaseEncodeDirection::Y)
            .with_echo_spacing(0.0005),
    );
    let mut pipeline = Pipeline::new(inputs, config, mocks.collaborators()).unwrap();
    pipeline.run().unwrap();

    let corrected = pipeline.context().corrected().unwrap();
    assert!(!corrected.resampled);
    assert!(corrected.blip.is_none());
    assert_eq!(susceptibility.estimate_calls(), 0);
    assert!((corrected.asl.mean_value() - 3.0).abs() < 1e-6);
    assert!(pipeline.log().contents().contains("No corrections to apply"));
}

#[test]
fn test_gradient_warp_shifts_data() {
    let device = Default::default();
    let grid = test_grid();
    let n = grid.len();
    let warp = WarpField::<Backend>::from_components(
        [vec![1.0; n], vec![0.0; n], vec![0.0; n]],
        &grid,
        Space::NativeAsl,
        Space::NativeAsl,
        &device,
    )
    .unwrap();
    let inputs = RunInputs::new(ramp_series()).with_gradient_warp(warp);
    let mut pipeline = Pipeline::new(inputs, PipelineConfig::default(), MockSuite::default().collaborators()).unwrap();
    pipeline.run().unwrap();

    let context = pipeline.context();
    let jacobian = context.corrections().unwrap().jacobian().unwrap();
    assert!((jacobian.mean_value() - 1.0).abs() < 1e-5);
    assert_shifted_ramp(&context.corrected().unwrap().asl);
}

#[test]
fn test_fieldmap_warp_moved_into_asl_space() {
    let device = Default::default();
    let mocks = MockSuite {
        boundary: MockBoundaryRegistration::default().with_shift([1.0, 0.0, 0.0]),
        ..MockSuite::default()
    };
    let inputs = RunInputs::new(ramp_series())
        .with_structural(
            constant_volume("struc", 100.0, &device),
            constant_volume("struc_brain", 100.0, &device),
        )
        .with_fieldmap(fieldmap_images());
    let config = PipelineConfig::default()
        .with_distortion(
            DistortionConfig::default()
                .with_pedir(PhaseEncodeDirection::X)
                .with_echo_spacing(0.0007),
        )
        .with_pvc(PvcConfig::default().with_reregister(false));

    let mut pipeline = Pipeline::new(inputs, config, mocks.collaborators()).unwrap();
    pipeline.run().unwrap();

    let context = pipeline.context();
    let fieldmap = context.fieldmap().unwrap();
    assert_eq!(fieldmap.warp.source(), &Space::NativeAsl);
    assert_eq!(fieldmap.warp.destination(), &Space::NativeAsl);
    assert!(context.asl_to_structural().unwrap().is_identity(1e-12));
    assert_shifted_ramp(&context.corrected().unwrap().asl);
    assert_eq!(mocks.segmentation.calls(), 1);
    assert!(pipeline.report().page("fmap").is_some());
}

#[test]
fn test_fieldmap_without_encoding_is_skipped_with_warning() {
    let device = Default::default();
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 1.0, &device))
        .with_structural(
            constant_volume("struc", 100.0, &device),
            constant_volume("struc_brain", 100.0, &device),
        )
        .with_fieldmap(fieldmap_images());
    let mut pipeline = Pipeline::new(inputs, PipelineConfig::default(), MockSuite::default().collaborators()).unwrap();
    pipeline.run().unwrap();
    assert!(pipeline.context().fieldmap().is_none());
    assert!(pipeline.log().has_warnings());
}

#[test]
fn test_fieldmap_without_structural_fails_before_merging() {
    let device = Default::default();
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 1.0, &device)).with_fieldmap(fieldmap_images());
    let config = PipelineConfig::default().with_distortion(
        DistortionConfig::default()
            .with_pedir(PhaseEncodeDirection::Y)
            .with_echo_spacing(0.0005),
    );
    let mut pipeline = Pipeline::new(inputs, config, MockSuite::default().collaborators()).unwrap();
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::MissingInput(_)));
    assert!(pipeline.context().is_completed(&Stage::Motion));
    assert!(!pipeline.context().is_completed(&Stage::Distortion));
}

#[test]
fn test_validation_before_any_stage() {
    let device = Default::default();
    let asl = constant_series::<Backend>("asl", 2, 1.0, &device);

    let surface = PipelineConfig::default().with_pvc(PvcConfig::default().with_surface_pv_correction(true));
    let err = Pipeline::new(RunInputs::new(asl.clone()), surface, MockSuite::default().collaborators()).err();
    assert!(matches!(err, Some(PipelineError::DependencyMissing(_))));

    let refregion = PipelineConfig::default()
        .with_calibration(CalibrationConfig::default().with_method(CalibrationMethod::ReferenceRegion));
    let inputs = RunInputs::new(asl).with_calib(constant_volume("calib", 1.0, &device));
    let err = Pipeline::new(inputs, refregion, MockSuite::default().collaborators()).err();
    assert!(matches!(err, Some(PipelineError::MissingInput(_))));
}

#[test]
fn test_completed_stages_are_not_rerun() {
    let device = Default::default();
    let mocks = MockSuite::default();
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 1.0, &device));
    let mut pipeline = Pipeline::new(inputs, PipelineConfig::default(), mocks.collaborators()).unwrap();
    pipeline.run_motion().unwrap();
    pipeline.run_motion().unwrap();
    pipeline.run_fit(&FitStage::Plain).unwrap();
    pipeline.run_fit(&FitStage::Plain).unwrap();
    assert_eq!(mocks.fitting.calls().len(), 1);
    assert_eq!(pipeline.context().fits().len(), 1);
}

#[test]
fn test_sensitivity_disabled_leaves_data_unscaled() {
    let device = Default::default();
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 4.0, &device))
        .with_calib(constant_volume("calib", 2.0, &device))
        .with_cref(constant_volume("cref", 1.0, &device));
    let config = PipelineConfig::default()
        .with_motion_correction(true)
        .with_sensitivity(SensitivityConfig::default().with_disabled(true));
    let mut pipeline = Pipeline::new(inputs, config, MockSuite::default().collaborators()).unwrap();
    pipeline.run().unwrap();
    let corrected = pipeline.context().corrected().unwrap();
    assert!((corrected.asl.mean_value() - 4.0).abs() < 1e-5);
    assert!((corrected.calib.as_ref().unwrap().mean_value() - 2.0).abs() < 1e-5);
}

/// Space conversions made by a run with a structural-space fit and a PV fit.
fn space_calls_with_reregistration(reregister: bool, registration: Matrix4<f64>) -> Vec<SpaceCall> {
    let device = Default::default();
    let mocks = MockSuite {
        boundary: MockBoundaryRegistration::default().with_transform(registration),
        ..MockSuite::default()
    };
    let inputs = RunInputs::new(constant_series::<Backend>("asl", 2, 4.0, &device))
        .with_calib(constant_volume("calib", 2.0, &device))
        .with_structural(
            constant_volume("struc", 100.0, &device),
            constant_volume("struc_brain", 100.0, &device),
        );
    let config = PipelineConfig::default().with_pvc(
        PvcConfig::default()
            .with_output_space(Space::Structural)
            .with_pv_correction(true)
            .with_reregister(reregister),
    );
    let mut pipeline = Pipeline::new(inputs, config, mocks.collaborators()).unwrap();
    pipeline.run().unwrap();
    assert_eq!(pipeline.context().is_completed(&Stage::Registration), reregister);
    mocks.spaces.calls()
}

#[test]
fn test_reregistration_reaches_later_space_conversions() {
    let registration = Matrix4::new_translation(&Vector3::new(2.0, -1.0, 0.5));
    let calls = space_calls_with_reregistration(true, registration);

    let to_structural: Vec<&SpaceCall> = calls
        .iter()
        .filter(|c| c.source == Space::NativeAsl && c.target == Space::Structural)
        .collect();
    let pv_maps: Vec<&SpaceCall> = calls
        .iter()
        .filter(|c| c.source == Space::Structural && c.target == Space::NativeAsl)
        .collect();
    // calibration image for the structural-space fit
    assert_eq!(to_structural.len(), 1);
    assert_eq!(to_structural[0].image, "calib");
    // grey and white matter maps for the PV fit
    assert_eq!(pv_maps.len(), 2);
    for call in to_structural.iter().chain(&pv_maps) {
        assert_eq!(call.asl_to_structural, Some(registration), "{call:?}");
    }

    let calls = space_calls_with_reregistration(false, registration);
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.asl_to_structural.is_none()));
}
