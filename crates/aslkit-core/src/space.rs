//! Named coordinate spaces.
//!
//! Every rigid transform and warp is tagged with the space it maps from and
//! the space it maps into. Composition checks these tags so that, for
//! example, a structural-space warp is never applied directly to ASL data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A coordinate space an image or transform lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    /// Native space of the ASL series.
    NativeAsl,
    /// Space of the calibration (M0) image.
    Calibration,
    /// Space of the structural (T1-weighted) image.
    Structural,
    /// Standard template space.
    Standard,
    /// A user-defined output space.
    Custom(String),
}

impl Space {
    /// Short identifier used in stage and file names.
    pub fn short_name(&self) -> &str {
        match self {
            Space::NativeAsl => "asl",
            Space::Calibration => "calib",
            Space::Structural => "struc",
            Space::Standard => "std",
            Space::Custom(name) => name,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for Space {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "asl" | "native" => Space::NativeAsl,
            "calib" | "calibration" => Space::Calibration,
            "struc" | "structural" => Space::Structural,
            "std" | "standard" => Space::Standard,
            _ => Space::Custom(s.trim().to_string()),
        })
    }
}
