//! Core types for ASL processing: images with physical geometry, named
//! coordinate spaces, rigid transforms, warp fields and single-pass
//! resampling.

pub mod error;
pub mod filter;
pub mod image;
pub mod interpolation;
pub mod space;
pub mod transform;

pub use error::{CoreError, Result};
pub use filter::{ResampleConfig, ResampleImageFilter, Supersampling};
pub use image::{Grid, Header, Image, Series, Volume};
pub use interpolation::{Interpolator, LinearInterpolator};
pub use space::Space;
pub use transform::{combine_warps, compose_rigid, invert_rigid, CombinedWarp, RigidTransform, WarpField};
