//! Synthetic images and scripted collaborators.
//!
//! The mocks implement the external tool traits with simple, predictable
//! behaviour so that a whole run can be exercised without registration or
//! fitting software. Shared counters let a caller inspect what a mock was
//! asked to do after it has been boxed into [`Collaborators`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use aslkit_core::{Grid, Header, Image, RigidTransform, Series, Space, Volume, WarpField};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use nalgebra::Matrix4;

use crate::context::RunContext;
use crate::distortion::AcquisitionParameters;
use crate::error::Result;
use crate::external::{
    BoundaryRegistration, BoundaryRegistrationRequest, BoundaryRegistrationResult, Collaborators, FitOptions,
    FitOutput, ModelFitting, MotionEstimation, Segmentation, SpaceTransformer, StructuralSegmentation,
    SurfacePvCapability, SurfacePvEstimation, SusceptibilityEstimation, SusceptibilityResult, VolumeAlignment,
};
use crate::pvc::{PartialVolumeMaps, PvSource};

/// Spatial shape `[Z, Y, X]` of the synthetic images.
pub const TEST_SHAPE: [usize; 3] = [4, 5, 6];

/// Unit-spacing grid of [`TEST_SHAPE`].
pub fn test_grid() -> Grid {
    Grid::new(Header::default(), TEST_SHAPE)
}

/// Volume of [`TEST_SHAPE`] filled with `value`.
pub fn constant_volume<B: Backend>(name: &str, value: f32, device: &B::Device) -> Volume<B> {
    Image::new(name, Tensor::full(TEST_SHAPE, value, device), Header::default())
        .expect("fixed test shape is a valid volume")
}

/// Series of `volumes` volumes of [`TEST_SHAPE`] filled with `value`.
///
/// # Panics
/// When `volumes` is zero.
pub fn constant_series<B: Backend>(name: &str, volumes: usize, value: f32, device: &B::Device) -> Series<B> {
    let [z, y, x] = TEST_SHAPE;
    Image::new(name, Tensor::full([volumes, z, y, x], value, device), Header::default())
        .expect("series needs at least one volume")
}

/// Volume with values drawn uniformly from `[0.1, 1.0)`.
///
/// # Panics
/// When `shape` has an empty axis.
pub fn random_volume<B: Backend>(name: &str, shape: [usize; 3], device: &B::Device) -> Volume<B> {
    let data = Tensor::random(shape, Distribution::Uniform(0.1, 1.0), device);
    Image::new(name, data, Header::default()).expect("shape must not have an empty axis")
}

/// Motion estimator returning a fixed list of alignments.
#[derive(Debug, Clone, Default)]
pub struct ScriptedMotion {
    alignments: Option<Vec<VolumeAlignment>>,
}

impl ScriptedMotion {
    /// Identity alignment for every volume.
    pub fn identity() -> Self {
        Self::default()
    }

    /// One converged alignment per matrix.
    pub fn converged(matrices: Vec<Matrix4<f64>>) -> Self {
        Self {
            alignments: Some(matrices.into_iter().map(VolumeAlignment::Converged).collect()),
        }
    }

    /// Make volume `index` fail to converge.
    pub fn failing_at(mut self, index: usize) -> Self {
        if let Some(alignment) = self.alignments.as_mut().and_then(|a| a.get_mut(index)) {
            *alignment = VolumeAlignment::Failed("did not converge".into());
        }
        self
    }
}

impl<B: Backend> MotionEstimation<B> for ScriptedMotion {
    fn estimate_rigid_series(&self, series: &Series<B>, _reference: &Volume<B>) -> Result<Vec<VolumeAlignment>> {
        Ok(match &self.alignments {
            Some(alignments) => alignments.clone(),
            None => vec![VolumeAlignment::Converged(Matrix4::identity()); series.num_volumes()],
        })
    }
}

/// Boundary registration returning a fixed transform and, when a fieldmap
/// is supplied, a uniform shift warp on the structural grid.
#[derive(Debug, Clone)]
pub struct MockBoundaryRegistration {
    pub asl_to_structural: Matrix4<f64>,
    /// Displacement (mm) of the returned warp, `(x, y, z)`.
    pub shift: [f32; 3],
    calls: Rc<Cell<usize>>,
}

impl Default for MockBoundaryRegistration {
    fn default() -> Self {
        Self {
            asl_to_structural: Matrix4::identity(),
            shift: [0.0; 3],
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl MockBoundaryRegistration {
    pub fn with_shift(mut self, shift: [f32; 3]) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_transform(mut self, asl_to_structural: Matrix4<f64>) -> Self {
        self.asl_to_structural = asl_to_structural;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<B: Backend> BoundaryRegistration<B> for MockBoundaryRegistration {
    fn estimate_boundary_registration(
        &self,
        request: &BoundaryRegistrationRequest<'_, B>,
    ) -> Result<BoundaryRegistrationResult<B>> {
        self.calls.set(self.calls.get() + 1);
        let structural_warp = match request.fieldmap {
            Some(_) => {
                let grid = request.structural_head.grid();
                let n = grid.len();
                let components = self.shift.map(|d| vec![d; n]);
                Some(WarpField::from_components(
                    components,
                    &grid,
                    Space::NativeAsl,
                    Space::Structural,
                    &request.structural_head.device(),
                )?)
            }
            None => None,
        };
        Ok(BoundaryRegistrationResult {
            asl_to_structural: self.asl_to_structural,
            structural_warp,
        })
    }
}

/// Susceptibility correction that scales intensities by a constant.
#[derive(Debug, Clone)]
pub struct ScaledSusceptibility {
    pub factor: f64,
    estimates: Rc<Cell<usize>>,
    applied: Rc<RefCell<Vec<usize>>>,
}

impl ScaledSusceptibility {
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            estimates: Rc::new(Cell::new(0)),
            applied: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn estimate_calls(&self) -> usize {
        self.estimates.get()
    }

    /// Acquisition row index of every correction applied, in order.
    pub fn applied_indices(&self) -> Vec<usize> {
        self.applied.borrow().clone()
    }
}

impl<B: Backend> SusceptibilityEstimation<B> for ScaledSusceptibility {
    fn estimate_susceptibility_warp(
        &self,
        pair: &Series<B>,
        _params: &AcquisitionParameters,
    ) -> Result<SusceptibilityResult<B>> {
        self.estimates.set(self.estimates.get() + 1);
        let first = pair.volume(0)?;
        Ok(SusceptibilityResult {
            field_coefficients: first.mul_scalar(0.0).renamed("topup_fieldcoef"),
            field: first.mul_scalar(0.0).renamed("topup_field"),
            movement_parameters: vec![[0.0; 6]; pair.num_volumes()],
        })
    }

    fn apply_field_correction(
        &self,
        image: &Series<B>,
        _correction: &SusceptibilityResult<B>,
        _params: &AcquisitionParameters,
        index: usize,
    ) -> Result<Series<B>> {
        self.applied.borrow_mut().push(index);
        Ok(image.mul_scalar(self.factor))
    }
}

/// Segmentation with uniform PV fractions and bias field.
#[derive(Debug, Clone)]
pub struct MockSegmentation {
    pub grey_matter: f32,
    pub white_matter: f32,
    pub bias: Option<f32>,
    calls: Rc<Cell<usize>>,
}

impl Default for MockSegmentation {
    fn default() -> Self {
        Self {
            grey_matter: 0.6,
            white_matter: 0.3,
            bias: Some(2.0),
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl MockSegmentation {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl<B: Backend> StructuralSegmentation<B> for MockSegmentation {
    fn segment_structural(&self, structural_brain: &Volume<B>) -> Result<Segmentation<B>> {
        self.calls.set(self.calls.get() + 1);
        let filled = |name: &str, value: f32| -> Result<Volume<B>> {
            let data = structural_brain.data().ones_like().mul_scalar(value);
            Ok(structural_brain.with_data(data)?.renamed(name))
        };
        Ok(Segmentation {
            grey_matter_pv: filled("gm_pv", self.grey_matter)?,
            white_matter_pv: filled("wm_pv", self.white_matter)?,
            white_matter_seg: filled("wm_seg", 1.0)?,
            bias_field: self.bias.map(|b| filled("bias", b)).transpose()?,
        })
    }
}

/// One request made of a space transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceCall {
    pub image: String,
    pub source: Space,
    pub target: Space,
    pub asl_to_structural: Option<Matrix4<f64>>,
}

/// Space transformer that assumes every space shares the ASL grid and
/// records the registration it was handed.
#[derive(Debug, Clone, Default)]
pub struct IdentitySpaces {
    calls: Rc<RefCell<Vec<SpaceCall>>>,
}

impl IdentitySpaces {
    pub fn calls(&self) -> Vec<SpaceCall> {
        self.calls.borrow().clone()
    }
}

impl<B: Backend> SpaceTransformer<B> for IdentitySpaces {
    fn transform_to_space(
        &self,
        image: &Volume<B>,
        source: &Space,
        target: &Space,
        asl_to_structural: Option<&RigidTransform>,
    ) -> Result<Volume<B>> {
        self.calls.borrow_mut().push(SpaceCall {
            image: image.name().to_string(),
            source: source.clone(),
            target: target.clone(),
            asl_to_structural: asl_to_structural.map(|t| *t.matrix()),
        });
        Ok(image.clone())
    }
}

/// What a fit was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct FitCall {
    pub stage: String,
    pub prefit: bool,
    pub output_space: Space,
    pub pv_source: Option<PvSource>,
    /// Voxels inside the analysis mask, when one was passed.
    pub mask_voxels: Option<usize>,
}

/// Model fit returning the mean of the ASL series as perfusion.
#[derive(Debug, Clone, Default)]
pub struct MockFitting {
    calls: Rc<RefCell<Vec<FitCall>>>,
}

impl MockFitting {
    pub fn calls(&self) -> Vec<FitCall> {
        self.calls.borrow().clone()
    }
}

impl<B: Backend> ModelFitting<B> for MockFitting {
    fn fit_model(&self, context: &RunContext<B>, options: &FitOptions<B>) -> Result<FitOutput<B>> {
        let mask_voxels = match &options.mask {
            Some(mask) => Some(mask.to_vec()?.iter().filter(|v| **v > 0.5).count()),
            None => None,
        };
        self.calls.borrow_mut().push(FitCall {
            stage: options.stage.clone(),
            prefit: options.prefit,
            output_space: options.output_space.clone(),
            pv_source: options.pv_maps.as_ref().map(|m| m.source),
            mask_voxels,
        });
        let perfusion = context.asl().mean_volume()?.renamed("perfusion");
        Ok(FitOutput {
            perfusion_variance: Some(perfusion.mul_scalar(0.1).renamed("perfusion_var")),
            perfusion,
            arrival: None,
        })
    }
}

/// Surface PV estimator whose grey matter fraction cycles through
/// `0, 0.004, 0.008, 0.012` so that one voxel in four exceeds the surface
/// mask threshold.
#[derive(Debug, Clone, Default)]
pub struct MockSurfacePv {
    cores: Rc<RefCell<Vec<Option<usize>>>>,
}

impl MockSurfacePv {
    /// Worker counts passed on each call.
    pub fn cores_requested(&self) -> Vec<Option<usize>> {
        self.cores.borrow().clone()
    }
}

impl<B: Backend> SurfacePvEstimation<B> for MockSurfacePv {
    fn estimate_surface_pvs(&self, context: &RunContext<B>, cores: Option<usize>) -> Result<PartialVolumeMaps<B>> {
        self.cores.borrow_mut().push(cores);
        let asl = &context.inputs().asl;
        let grid = asl.grid();
        let grey: Vec<f32> = (0..grid.len()).map(|i| (i % 4) as f32 * 0.004).collect();
        let device = asl.device();
        let grey_matter = Image::from_vec("gm_pv_surf", grey, grid.shape(), grid.header().clone(), &device)?;
        let white_matter = grey_matter.mul_scalar(0.0).renamed("wm_pv_surf");
        PartialVolumeMaps::new(grey_matter, white_matter, PvSource::Surface)
    }
}

/// One of each mock, sharing their call records with every
/// [`Collaborators`] built from it.
#[derive(Debug, Clone, Default)]
pub struct MockSuite {
    pub motion: ScriptedMotion,
    pub boundary: MockBoundaryRegistration,
    pub susceptibility: Option<ScaledSusceptibility>,
    pub segmentation: MockSegmentation,
    pub fitting: MockFitting,
    pub spaces: IdentitySpaces,
    /// Provide a surface PV estimator.
    pub surface_pv: Option<MockSurfacePv>,
}

impl MockSuite {
    pub fn collaborators<B: Backend>(&self) -> Collaborators<B> {
        let surface_pv = match &self.surface_pv {
            Some(estimator) => SurfacePvCapability::Available(Box::new(estimator.clone())),
            None => SurfacePvCapability::Unavailable,
        };
        Collaborators {
            motion: Box::new(self.motion.clone()),
            boundary: Box::new(self.boundary.clone()),
            susceptibility: Box::new(self.susceptibility.clone().unwrap_or_else(|| ScaledSusceptibility::new(1.0))),
            segmentation: Box::new(self.segmentation.clone()),
            fitting: Box::new(self.fitting.clone()),
            spaces: Box::new(self.spaces.clone()),
            surface_pv,
        }
    }
}
