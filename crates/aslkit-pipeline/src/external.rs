//! Interfaces to the external tools the pipeline delegates to.
//!
//! Registration, motion estimation, susceptibility field estimation,
//! segmentation, model fitting and space conversion are numerically heavy
//! and live outside this crate. The pipeline only sees these traits; every
//! collaborator failure surfaces as [`PipelineError::External`] or
//! [`PipelineError::Registration`].
//!
//! [`PipelineError::External`]: crate::error::PipelineError::External
//! [`PipelineError::Registration`]: crate::error::PipelineError::Registration

use std::collections::BTreeMap;

use aslkit_core::{RigidTransform, Series, Space, Volume, WarpField};
use burn::tensor::backend::Backend;
use nalgebra::Matrix4;

use crate::context::RunContext;
use crate::distortion::{AcquisitionParameters, PhaseEncodeDirection};
use crate::error::Result;
use crate::pvc::PartialVolumeMaps;

/// Outcome of aligning one volume of a series.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeAlignment {
    /// World-to-world matrix taking the volume onto the reference.
    Converged(Matrix4<f64>),
    /// The optimiser did not converge.
    Failed(String),
}

/// Rigid motion estimation of a series against a reference volume.
pub trait MotionEstimation<B: Backend> {
    /// One alignment per volume of `series`, in order.
    fn estimate_rigid_series(&self, series: &Series<B>, reference: &Volume<B>) -> Result<Vec<VolumeAlignment>>;
}

/// Fieldmap images in structural or fieldmap space.
#[derive(Debug, Clone)]
pub struct FieldmapImages<B: Backend> {
    /// Fieldmap in rad/s.
    pub fieldmap: Volume<B>,
    /// Whole-head magnitude image.
    pub magnitude: Volume<B>,
    /// Brain-extracted magnitude image.
    pub magnitude_brain: Volume<B>,
}

/// Inputs for boundary-based registration of an ASL-space image to the
/// structural image.
#[derive(Debug)]
pub struct BoundaryRegistrationRequest<'a, B: Backend> {
    pub moving: &'a Volume<B>,
    pub structural_head: &'a Volume<B>,
    pub structural_brain: &'a Volume<B>,
    pub white_matter_seg: &'a Volume<B>,
    pub fieldmap: Option<&'a FieldmapImages<B>>,
    pub pedir: Option<PhaseEncodeDirection>,
    pub echo_spacing: Option<f64>,
    /// Fieldmap is already aligned with the structural image.
    pub skip_fieldmap_registration: bool,
}

/// Result of boundary-based registration.
#[derive(Debug, Clone)]
pub struct BoundaryRegistrationResult<B: Backend> {
    /// World-to-world matrix from ASL space to structural space.
    pub asl_to_structural: Matrix4<f64>,
    /// Distortion warp on the structural grid (ASL -> structural), present
    /// when a fieldmap was supplied.
    pub structural_warp: Option<WarpField<B>>,
}

/// Boundary-based (white matter surface) registration.
pub trait BoundaryRegistration<B: Backend> {
    fn estimate_boundary_registration(
        &self,
        request: &BoundaryRegistrationRequest<'_, B>,
    ) -> Result<BoundaryRegistrationResult<B>>;
}

/// Output of susceptibility field estimation from a blip-reversed pair.
#[derive(Debug, Clone)]
pub struct SusceptibilityResult<B: Backend> {
    /// Field coefficients to pass back to [`SusceptibilityEstimation::apply_field_correction`].
    pub field_coefficients: Volume<B>,
    /// Estimated off-resonance field in Hz.
    pub field: Volume<B>,
    /// Rigid movement parameters between the two inputs.
    pub movement_parameters: Vec<[f64; 6]>,
}

/// Susceptibility field estimation from images with opposite phase encoding.
pub trait SusceptibilityEstimation<B: Backend> {
    /// Estimate the field from a two-volume series (acquired, reversed).
    fn estimate_susceptibility_warp(
        &self,
        pair: &Series<B>,
        params: &AcquisitionParameters,
    ) -> Result<SusceptibilityResult<B>>;

    /// Unwarp `image` acquired with row `index` (1-based) of `params`.
    fn apply_field_correction(
        &self,
        image: &Series<B>,
        correction: &SusceptibilityResult<B>,
        params: &AcquisitionParameters,
        index: usize,
    ) -> Result<Series<B>>;
}

/// Tissue segmentation of the structural image.
#[derive(Debug, Clone)]
pub struct Segmentation<B: Backend> {
    pub grey_matter_pv: Volume<B>,
    pub white_matter_pv: Volume<B>,
    /// Hard white matter segmentation, used as the registration boundary.
    pub white_matter_seg: Volume<B>,
    /// Multiplicative receive bias field in structural space.
    pub bias_field: Option<Volume<B>>,
}

/// Structural segmentation tool.
pub trait StructuralSegmentation<B: Backend> {
    fn segment_structural(&self, structural_brain: &Volume<B>) -> Result<Segmentation<B>>;
}

/// Options passed to one model fit.
#[derive(Debug, Clone)]
pub struct FitOptions<B: Backend> {
    /// Stage identifier, e.g. `basil_pvcorr`.
    pub stage: String,
    /// Run a non-PV fit first to initialise the PV fit.
    pub prefit: bool,
    pub output_space: Space,
    pub pv_maps: Option<PartialVolumeMaps<B>>,
    pub mask: Option<Volume<B>>,
    /// Free-form options forwarded to the fitting tool.
    pub extra: BTreeMap<String, String>,
}

/// Output of one model fit, in ASL space.
#[derive(Debug, Clone)]
pub struct FitOutput<B: Backend> {
    pub perfusion: Volume<B>,
    pub perfusion_variance: Option<Volume<B>>,
    pub arrival: Option<Volume<B>>,
}

/// Kinetic model fitting.
pub trait ModelFitting<B: Backend> {
    fn fit_model(&self, context: &RunContext<B>, options: &FitOptions<B>) -> Result<FitOutput<B>>;
}

/// Moves images between registered spaces.
///
/// `asl_to_structural` is the run's current ASL to structural registration.
/// It changes once re-registration has run, so callers pass it on every
/// call rather than the transformer caching it.
pub trait SpaceTransformer<B: Backend> {
    fn transform_to_space(
        &self,
        image: &Volume<B>,
        source: &Space,
        target: &Space,
        asl_to_structural: Option<&RigidTransform>,
    ) -> Result<Volume<B>>;
}

/// Surface-based partial volume estimation.
pub trait SurfacePvEstimation<B: Backend> {
    fn estimate_surface_pvs(&self, context: &RunContext<B>, cores: Option<usize>) -> Result<PartialVolumeMaps<B>>;
}

/// Surface PV estimation, resolved once when the collaborators are built.
pub enum SurfacePvCapability<B: Backend> {
    Available(Box<dyn SurfacePvEstimation<B>>),
    Unavailable,
}

impl<B: Backend> SurfacePvCapability<B> {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Every external tool a run may call.
pub struct Collaborators<B: Backend> {
    pub motion: Box<dyn MotionEstimation<B>>,
    pub boundary: Box<dyn BoundaryRegistration<B>>,
    pub susceptibility: Box<dyn SusceptibilityEstimation<B>>,
    pub segmentation: Box<dyn StructuralSegmentation<B>>,
    pub fitting: Box<dyn ModelFitting<B>>,
    pub spaces: Box<dyn SpaceTransformer<B>>,
    pub surface_pv: SurfacePvCapability<B>,
}
