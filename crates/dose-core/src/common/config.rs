//! Calculation options and the JSON patch format used to update them.
//!
//! Options are never replaced wholesale: callers send an [`OptionsPatch`] and
//! only the fields it carries overwrite the current values.

use super::constants::{
    DEFAULT_CONVERGENCE_EPSILON, DEFAULT_CONVOLUTION_STRIDE, DEFAULT_KERNEL_SIZE,
    DEFAULT_MAX_ITERATIONS, DEFAULT_NUM_PARTICLES, DEFAULT_SEED, MIN_RESOLUTION_MM,
};
use crate::domain::{DoseError, DoseResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// Dose at one voxel equals `value`.
    Point { voxel: [usize; 3], value: f64 },
    /// Dose received by at least `coverage` percent of a structure equals `value`.
    Percentile {
        structure: String,
        coverage: f64,
        value: f64,
    },
    /// Mean dose inside a structure equals `value`.
    Mean { structure: String, value: f64 },
}

impl Normalization {
    pub const fn value(&self) -> f64 {
        match self {
            Self::Point { value, .. } | Self::Percentile { value, .. } | Self::Mean { value, .. } => {
                *value
            }
        }
    }

    pub fn structure(&self) -> Option<&str> {
        match self {
            Self::Point { .. } => None,
            Self::Percentile { structure, .. } | Self::Mean { structure, .. } => Some(structure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvolutionMethod {
    #[default]
    Fft,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub accelerated: bool,
    pub threads: Option<usize>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            accelerated: true,
            threads: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionOptions {
    pub kernel_size: usize,
    pub stride: usize,
    pub method: ConvolutionMethod,
}

impl Default for ConvolutionOptions {
    fn default() -> Self {
        Self {
            kernel_size: DEFAULT_KERNEL_SIZE,
            stride: DEFAULT_CONVOLUTION_STRIDE,
            method: ConvolutionMethod::Fft,
        }
    }
}

impl ConvolutionOptions {
    /// Odd kernel edge length, at least 3 voxels.
    pub fn effective_kernel_size(&self) -> usize {
        let size = self.kernel_size.max(3);
        if size % 2 == 0 { size + 1 } else { size }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub max_iterations: usize,
    pub convergence_epsilon: f64,
    pub scatter_albedo: f64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_epsilon: DEFAULT_CONVERGENCE_EPSILON,
            scatter_albedo: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloOptions {
    pub num_particles: usize,
    pub workers: Option<usize>,
    pub seed: u64,
    pub output_percent: bool,
}

impl Default for MonteCarloOptions {
    fn default() -> Self {
        Self {
            num_particles: DEFAULT_NUM_PARTICLES,
            workers: None,
            seed: DEFAULT_SEED,
            output_percent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationOptions {
    /// Ray-march step override in mm; the grid itself is never resampled.
    pub resolution_mm: Option<f64>,
    pub heterogeneity_correction: bool,
    pub normalization: Option<Normalization>,
    pub execution: ExecutionOptions,
    pub convolution: ConvolutionOptions,
    pub transport: TransportOptions,
    pub monte_carlo: MonteCarloOptions,
}

impl Default for CalculationOptions {
    fn default() -> Self {
        Self {
            resolution_mm: None,
            heterogeneity_correction: true,
            normalization: None,
            execution: ExecutionOptions::default(),
            convolution: ConvolutionOptions::default(),
            transport: TransportOptions::default(),
            monte_carlo: MonteCarloOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPatch {
    pub accelerated: Option<bool>,
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionPatch {
    pub kernel_size: Option<usize>,
    pub stride: Option<usize>,
    pub method: Option<ConvolutionMethod>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportPatch {
    pub max_iterations: Option<usize>,
    pub convergence_epsilon: Option<f64>,
    pub scatter_albedo: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloPatch {
    pub num_particles: Option<usize>,
    pub workers: Option<usize>,
    pub seed: Option<u64>,
    pub output_percent: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsPatch {
    pub resolution_mm: Option<f64>,
    pub heterogeneity_correction: Option<bool>,
    /// Absent keeps the current mode; `Some(None)` (JSON `null`) clears it.
    #[serde(
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub normalization: Option<Option<Normalization>>,
    pub execution: Option<ExecutionPatch>,
    pub convolution: Option<ConvolutionPatch>,
    pub transport: Option<TransportPatch>,
    pub monte_carlo: Option<MonteCarloPatch>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn assign<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl CalculationOptions {
    pub fn merge(&mut self, patch: OptionsPatch) {
        if patch.resolution_mm.is_some() {
            self.resolution_mm = patch.resolution_mm;
        }
        assign(
            &mut self.heterogeneity_correction,
            patch.heterogeneity_correction,
        );
        assign(&mut self.normalization, patch.normalization);
        if let Some(execution) = patch.execution {
            assign(&mut self.execution.accelerated, execution.accelerated);
            if execution.threads.is_some() {
                self.execution.threads = execution.threads;
            }
        }
        if let Some(convolution) = patch.convolution {
            assign(&mut self.convolution.kernel_size, convolution.kernel_size);
            assign(&mut self.convolution.stride, convolution.stride);
            assign(&mut self.convolution.method, convolution.method);
        }
        if let Some(transport) = patch.transport {
            assign(&mut self.transport.max_iterations, transport.max_iterations);
            assign(
                &mut self.transport.convergence_epsilon,
                transport.convergence_epsilon,
            );
            assign(&mut self.transport.scatter_albedo, transport.scatter_albedo);
        }
        if let Some(monte_carlo) = patch.monte_carlo {
            assign(&mut self.monte_carlo.num_particles, monte_carlo.num_particles);
            if monte_carlo.workers.is_some() {
                self.monte_carlo.workers = monte_carlo.workers;
            }
            assign(&mut self.monte_carlo.seed, monte_carlo.seed);
            assign(
                &mut self.monte_carlo.output_percent,
                monte_carlo.output_percent,
            );
        }
    }

    pub fn validate(&self) -> DoseResult<()> {
        if let Some(resolution) = self
            .resolution_mm
            .filter(|value| !(value.is_finite() && *value >= MIN_RESOLUTION_MM))
        {
            return Err(invalid_option(format!(
                "resolution_mm must be at least {MIN_RESOLUTION_MM} mm, got {resolution}"
            )));
        }
        if self.execution.threads == Some(0) {
            return Err(invalid_option("execution.threads must be at least 1"));
        }
        if self.convolution.stride == 0 {
            return Err(invalid_option("convolution.stride must be at least 1"));
        }
        if self.transport.max_iterations == 0 {
            return Err(invalid_option("transport.max_iterations must be at least 1"));
        }
        let epsilon = self.transport.convergence_epsilon;
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(invalid_option(format!(
                "transport.convergence_epsilon must be positive, got {epsilon}"
            )));
        }
        let albedo = self.transport.scatter_albedo;
        if !albedo.is_finite() || !(0.0..1.0).contains(&albedo) {
            return Err(invalid_option(format!(
                "transport.scatter_albedo must lie in [0, 1), got {albedo}"
            )));
        }
        if self.monte_carlo.num_particles == 0 {
            return Err(invalid_option("monte_carlo.num_particles must be at least 1"));
        }
        if self.monte_carlo.workers == Some(0) {
            return Err(invalid_option("monte_carlo.workers must be at least 1"));
        }
        if let Some(normalization) = &self.normalization {
            let value = normalization.value();
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid_option(format!(
                    "normalization value must be positive, got {value}"
                )));
            }
            if let Normalization::Percentile { coverage, .. } = normalization {
                if !(*coverage > 0.0 && *coverage <= 100.0) {
                    return Err(invalid_option(format!(
                        "normalization coverage must lie in (0, 100], got {coverage}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid_option(message: impl Into<String>) -> DoseError {
    DoseError::validation("INPUT.INVALID_OPTION", message)
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsFileError {
    #[error("failed to read options file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse options file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<OptionsFileError> for DoseError {
    fn from(error: OptionsFileError) -> Self {
        match &error {
            OptionsFileError::Read { .. } => DoseError::io_system("IO.OPTIONS_READ", error.to_string()),
            OptionsFileError::Parse { .. } => {
                DoseError::validation("INPUT.OPTIONS_PARSE", error.to_string())
            }
        }
    }
}

pub fn load_options_patch(path: impl AsRef<Path>) -> Result<OptionsPatch, OptionsFileError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| OptionsFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&source).map_err(|source| OptionsFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
