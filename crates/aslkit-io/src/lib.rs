//! NIfTI adapters for [`aslkit_core::Image`].

pub mod nifti_io;

pub use nifti_io::{read_nifti, read_nifti_series, write_nifti, write_nifti_series};
