//! Radiotherapy dose engine: CT-derived material model, beam geometry and
//! interchangeable dose algorithms behind the [`DoseCalculator`] facade.

pub mod algorithms;
pub mod archive;
pub mod backend;
pub mod common;
pub mod domain;
pub mod facade;
pub mod geometry;
pub mod material;
pub mod monte_carlo;
pub mod numerics;

pub use algorithms::AlgorithmKind;
pub use archive::{ArchiveMetadata, DoseArchive};
pub use common::config::{CalculationOptions, Normalization, OptionsPatch};
pub use domain::{
    BeamRecord, BeamSpec, DoseError, DoseErrorCategory, DoseGrid, DoseResult, Grid3,
    NumericalWarning, StructureMask, VolumeGrid, VolumeKind,
};
pub use facade::{CalculationReport, DoseCalculator};
pub use material::MaterialModel;
