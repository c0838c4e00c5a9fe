//! Image types and their geometry.

pub mod grid;
pub mod header;
pub mod image;

pub use grid::{generate_grid, Grid};
pub use header::{affine_points, Header};
pub use image::{Image, Series, Volume};
