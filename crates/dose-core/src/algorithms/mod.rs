pub mod convolution;
pub mod depth_dose;
pub mod grid_tracer;
pub mod pencil_beam;
pub mod profile;
pub mod transport;

pub use convolution::{ConvolutionSuperposition, ScatterKernel};
pub use depth_dose::{DepthDoseCurve, PhotonDepthDose};
pub use grid_tracer::GridTracer;
pub use pencil_beam::PencilBeam;
pub use profile::{PenumbraModel, lateral_profile};
pub use transport::{ConvergenceState, IterativeTransport, TransportReport};

use crate::common::config::CalculationOptions;
use crate::domain::{
    BeamSpec, DoseError, DoseGrid, DoseResult, ExecutionMode, Grid3, NumericalWarning,
    RadiationType, VolumeGrid,
};
use crate::geometry::{BeamFrame, RayTracer, VoxelFrame};
use crate::material::{MaterialGrid, MaterialModel};
use crate::monte_carlo::MonteCarlo;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    PencilBeam,
    Convolution,
    Transport,
    GridTracer,
    MonteCarlo,
}

impl AlgorithmKind {
    pub const ALL: [Self; 5] = [
        Self::PencilBeam,
        Self::Convolution,
        Self::Transport,
        Self::GridTracer,
        Self::MonteCarlo,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PencilBeam => "pencil_beam",
            Self::Convolution => "convolution",
            Self::Transport => "transport",
            Self::GridTracer => "grid_tracer",
            Self::MonteCarlo => "monte_carlo",
        }
    }

    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::PencilBeam => &["pencil_beam", "pencil", "ray_trace"],
            Self::Convolution => &["convolution", "convolution_superposition", "collapsed_cone"],
            Self::Transport => &["transport", "iterative_transport", "acuros_xb"],
            Self::GridTracer => &["grid_tracer", "grid_based"],
            Self::MonteCarlo => &["monte_carlo", "mc"],
        }
    }

    pub fn algorithm(self) -> &'static dyn DoseAlgorithm {
        match self {
            Self::PencilBeam => &PencilBeam,
            Self::Convolution => &ConvolutionSuperposition,
            Self::Transport => &IterativeTransport,
            Self::GridTracer => &GridTracer,
            Self::MonteCarlo => &MonteCarlo,
        }
    }
}

impl Display for AlgorithmKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = DoseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.aliases().contains(&normalized.as_str()))
            .ok_or_else(|| {
                DoseError::validation(
                    "INPUT.UNKNOWN_ALGORITHM",
                    format!("unknown dose algorithm '{value}'"),
                )
            })
    }
}

/// Read-only inputs shared by every beam of one calculation.
#[derive(Debug, Clone, Copy)]
pub struct CalculationContext<'a> {
    pub volume: &'a VolumeGrid,
    pub frame: VoxelFrame,
    pub materials: &'a MaterialGrid,
    pub model: &'a MaterialModel,
    pub options: &'a CalculationOptions,
}

impl<'a> CalculationContext<'a> {
    pub fn new(
        volume: &'a VolumeGrid,
        materials: &'a MaterialGrid,
        model: &'a MaterialModel,
        options: &'a CalculationOptions,
    ) -> DoseResult<Self> {
        materials.ensure_matches(volume)?;
        Ok(Self {
            volume,
            frame: VoxelFrame::of(volume),
            materials,
            model,
            options,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.frame.shape
    }

    /// Beam frame about the beam's isocenter, else the grid centre. A beam
    /// with an SSD and no explicit isocenter is moved along its axis until
    /// the source sits SSD millimetres from the body surface.
    pub fn beam_frame(&self, beam: &BeamSpec) -> BeamFrame {
        let frame = BeamFrame::new(beam, self.frame.geometric_center());
        let (Some(ssd), None) = (beam.ssd_mm(), beam.isocenter()) else {
            return frame;
        };
        match self.tracer().surface_distance(frame.source, frame.direction) {
            Some(surface) => frame.shifted_along_axis(surface - ssd),
            None => frame,
        }
    }

    pub fn tracer(&self) -> RayTracer<'_> {
        RayTracer::new(
            &self.frame,
            self.materials.density(),
            self.options.resolution_mm,
        )
    }
}

/// Where voxel and beam work runs: inline, or on a rayon pool.
#[derive(Debug, Clone, Copy)]
pub enum Executor<'a> {
    Serial,
    Pool(&'a rayon::ThreadPool),
}

impl Executor<'_> {
    pub const fn mode(&self) -> ExecutionMode {
        match self {
            Self::Serial => ExecutionMode::Serial,
            Self::Pool(_) => ExecutionMode::Parallel,
        }
    }

    /// Evaluates `value` for every flat index; output order is index order.
    pub fn fill<F>(&self, len: usize, value: F) -> Vec<f64>
    where
        F: Fn(usize) -> f64 + Sync + Send,
    {
        match self {
            Self::Serial => (0..len).map(value).collect(),
            Self::Pool(pool) => pool.install(|| (0..len).into_par_iter().map(value).collect()),
        }
    }

    /// Maps `items` preserving order.
    pub fn map<T, R, F>(&self, items: &[T], map: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> R + Sync + Send,
    {
        match self {
            Self::Serial => items
                .iter()
                .enumerate()
                .map(|(index, item)| map(index, item))
                .collect(),
            Self::Pool(pool) => pool.install(|| {
                items
                    .par_iter()
                    .enumerate()
                    .map(|(index, item)| map(index, item))
                    .collect()
            }),
        }
    }
}

/// One beam's unweighted contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamDose {
    pub dose: DoseGrid,
    /// Variance of the dose estimate, for stochastic algorithms.
    pub variance: Option<Grid3<f64>>,
    pub warnings: Vec<NumericalWarning>,
    pub transport: Option<TransportReport>,
}

impl BeamDose {
    pub fn deterministic(dose: DoseGrid) -> Self {
        Self {
            dose,
            variance: None,
            warnings: Vec::new(),
            transport: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmOutput {
    pub dose: DoseGrid,
    pub variance: Option<Grid3<f64>>,
    pub uncertainty: Option<f64>,
    pub warnings: Vec<NumericalWarning>,
    pub transport: Vec<(String, TransportReport)>,
}

pub trait DoseAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    fn supports(&self, radiation: RadiationType) -> bool {
        radiation == RadiationType::Photon
    }

    fn beam_dose(
        &self,
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        beam_index: usize,
        executor: &Executor<'_>,
    ) -> DoseResult<BeamDose>;

    /// Post-processing once every beam has been accumulated.
    fn finalize(&self, _output: &mut AlgorithmOutput, _options: &CalculationOptions) {}
}

pub fn check_beam_support(kind: AlgorithmKind, beams: &[BeamSpec]) -> DoseResult<()> {
    let algorithm = kind.algorithm();
    match beams
        .iter()
        .find(|beam| !algorithm.supports(beam.radiation()))
    {
        Some(beam) => Err(DoseError::validation(
            "INPUT.UNSUPPORTED_RADIATION",
            format!(
                "algorithm '{kind}' does not support {} beam '{}'",
                beam.radiation(),
                beam.id()
            ),
        )),
        None => Ok(()),
    }
}

/// Computes every beam and sums them in beam order, each scaled by its weight.
pub fn compute_dose(
    kind: AlgorithmKind,
    context: &CalculationContext<'_>,
    beams: &[BeamSpec],
    executor: &Executor<'_>,
) -> DoseResult<AlgorithmOutput> {
    let algorithm = kind.algorithm();
    tracing::debug!(
        algorithm = %kind,
        beams = beams.len(),
        mode = %executor.mode(),
        "computing beam contributions"
    );
    let contributions = executor.map(beams, |index, beam| {
        algorithm.beam_dose(context, beam, index, executor)
    });

    let mut output = AlgorithmOutput {
        dose: Grid3::zeros(context.shape()),
        variance: None,
        uncertainty: None,
        warnings: Vec::new(),
        transport: Vec::new(),
    };
    for (beam, contribution) in beams.iter().zip(contributions) {
        let contribution = contribution?;
        output.dose.accumulate(&contribution.dose, beam.weight())?;
        if let Some(variance) = &contribution.variance {
            output
                .variance
                .get_or_insert_with(|| Grid3::zeros(context.shape()))
                .accumulate(variance, beam.weight() * beam.weight())?;
        }
        output.warnings.extend(contribution.warnings);
        if let Some(report) = contribution.transport {
            output.transport.push((beam.id().to_string(), report));
        }
    }
    algorithm.finalize(&mut output, context.options);
    Ok(output)
}
