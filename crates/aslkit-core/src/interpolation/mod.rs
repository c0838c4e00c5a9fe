//! Interpolation methods for sampling volumes at continuous coordinates.

pub mod linear;
pub mod trait_;

pub use linear::{trilinear_sample, LinearInterpolator};
pub use trait_::Interpolator;
