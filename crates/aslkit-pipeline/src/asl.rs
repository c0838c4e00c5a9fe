//! Label/control ordering of an ASL series.

use std::fmt;
use std::str::FromStr;

use aslkit_core::{Series, Volume};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// How the volumes of an ASL series are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AslOrder {
    /// Alternating label then control.
    #[default]
    TagControl,
    /// Alternating control then label.
    ControlTag,
    /// Already subtracted.
    Differenced,
}

impl FromStr for AslOrder {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tc" => Ok(AslOrder::TagControl),
            "ct" => Ok(AslOrder::ControlTag),
            "diff" => Ok(AslOrder::Differenced),
            other => Err(PipelineError::invalid_configuration(format!(
                "unknown ASL ordering '{other}' (expected tc, ct or diff)"
            ))),
        }
    }
}

impl fmt::Display for AslOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AslOrder::TagControl => "tc",
            AslOrder::ControlTag => "ct",
            AslOrder::Differenced => "diff",
        })
    }
}

/// Mean control minus label signal, the image used as the moving image
/// when registering ASL data.
pub fn perfusion_weighted<B: Backend>(asl: &Series<B>, order: AslOrder) -> Result<Volume<B>> {
    let [n, z, y, x] = asl.shape();
    let name = format!("{}_pwi", asl.name());
    let (label, control) = match order {
        AslOrder::Differenced => return Ok(asl.mean_volume()?.renamed(name)),
        AslOrder::TagControl => (0, 1),
        AslOrder::ControlTag => (1, 0),
    };
    if n % 2 != 0 {
        return Err(PipelineError::invalid_configuration(format!(
            "label/control series must have an even number of volumes, got {n}"
        )));
    }
    let pairs = asl.data().clone().reshape([n / 2, 2, z, y, x]);
    let label_volumes = pairs.clone().slice([0..n / 2, label..label + 1, 0..z, 0..y, 0..x]);
    let control_volumes = pairs.slice([0..n / 2, control..control + 1, 0..z, 0..y, 0..x]);
    let difference = (control_volumes - label_volumes).mean_dim(0).reshape([z, y, x]);
    Ok(Volume::new(name, difference, asl.header().clone())?)
}
