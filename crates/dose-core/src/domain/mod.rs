pub mod beam;
pub mod errors;
pub mod grid;
pub mod warnings;

pub use beam::{
    ArcDirection, ArcRecord, ArcSpec, BeamRecord, BeamSpec, FieldAperture, MlcAperture,
    RadiationType, WedgeOrientation, WedgeSpec, wrap_degrees,
};
pub use errors::{DoseError, DoseErrorCategory, DoseResult, ExitStatus};
pub use grid::{DoseGrid, Grid3, StructureMask, VolumeGrid, VolumeKind, validate_spacing};
pub use warnings::NumericalWarning;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

impl ExecutionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
        }
    }
}

impl Display for ExecutionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}
