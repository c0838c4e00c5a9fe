//! Image filters.

pub mod resample;

pub use resample::{ResampleConfig, ResampleImageFilter, Supersampling};
