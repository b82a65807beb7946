use super::CliError;
use super::plan::load_plan;
use anyhow::Context;
use dose_core::archive::read_archive;
use dose_core::common::config::{ExecutionPatch, load_options_patch};
use dose_core::numerics::stable_sum;
use dose_core::{
    AlgorithmKind, ArchiveMetadata, CalculationReport, DoseCalculator, DoseError, DoseGrid,
    NumericalWarning, OptionsPatch,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(clap::Args)]
pub(super) struct CalculateArgs {
    /// Plan file (JSON) with volume, beams, structures and options
    #[arg(long)]
    plan: PathBuf,

    /// Dose archive output path
    #[arg(long)]
    output: PathBuf,

    /// Algorithm name or alias; overrides the plan
    #[arg(long)]
    algorithm: Option<String>,

    /// Options patch file (JSON) merged over the plan options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Disable the accelerated backend
    #[arg(long)]
    serial: bool,
}

#[derive(clap::Args)]
pub(super) struct InspectArgs {
    /// Dose archive to read
    #[arg(long)]
    archive: PathBuf,
}

#[derive(Serialize)]
struct CalculationSummary<'a> {
    #[serde(flatten)]
    report: &'a CalculationReport,
    shape: [usize; 3],
    max_dose: f64,
    warnings: &'a [NumericalWarning],
    output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct DoseStatistics {
    min: f64,
    max: f64,
    mean: f64,
    nonzero_voxels: usize,
}

impl DoseStatistics {
    fn of(dose: &DoseGrid) -> Self {
        let values = dose.as_slice();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let mean = if values.is_empty() {
            0.0
        } else {
            stable_sum(values.iter().copied()) / values.len() as f64
        };
        Self {
            min: if values.is_empty() { 0.0 } else { min },
            max: dose.max_value(),
            mean,
            nonzero_voxels: values.iter().filter(|value| **value != 0.0).count(),
        }
    }
}

#[derive(Serialize)]
struct ArchiveSummary<'a> {
    archive: String,
    metadata: &'a ArchiveMetadata,
    statistics: DoseStatistics,
}

pub(super) fn run_calculate_command(args: CalculateArgs) -> Result<i32, CliError> {
    let loaded = load_plan(&args.plan).map_err(DoseError::from)?;
    tracing::debug!(
        plan = %args.plan.display(),
        beams = loaded.plan.beams.len(),
        structures = loaded.plan.structures.len(),
        "plan loaded"
    );
    let mut calculator = DoseCalculator::new();
    loaded.apply(&mut calculator)?;

    if let Some(path) = &args.options {
        calculator.set_options(load_options_patch(path).map_err(DoseError::from)?)?;
    }
    if args.serial {
        calculator.set_options(OptionsPatch {
            execution: Some(ExecutionPatch {
                accelerated: Some(false),
                threads: None,
            }),
            ..OptionsPatch::default()
        })?;
    }
    if let Some(name) = args.algorithm.as_deref().or(loaded.plan.algorithm.as_deref()) {
        calculator.set_algorithm(name.parse::<AlgorithmKind>()?);
    }

    let dose = calculator.calculate_dose()?;
    calculator.save_dose_matrix(&args.output)?;

    let report = calculator
        .last_report()
        .context("calculation finished without a report")?;
    let summary = CalculationSummary {
        report,
        shape: dose.shape(),
        max_dose: dose.max_value(),
        warnings: calculator.warnings(),
        output: display_path(&args.output),
    };
    let rendered =
        serde_json::to_string_pretty(&summary).context("failed to render calculation summary")?;
    println!("{rendered}");
    Ok(0)
}

pub(super) fn run_inspect_command(args: InspectArgs) -> Result<i32, CliError> {
    let archive = read_archive(&args.archive).map_err(DoseError::from)?;
    let summary = ArchiveSummary {
        archive: display_path(&args.archive),
        metadata: &archive.metadata,
        statistics: DoseStatistics::of(&archive.dose),
    };
    let rendered =
        serde_json::to_string_pretty(&summary).context("failed to render archive summary")?;
    println!("{rendered}");
    Ok(0)
}

/// One line per algorithm: the canonical name first, then its aliases.
pub(super) fn run_algorithms_command() -> Result<i32, CliError> {
    for kind in AlgorithmKind::ALL {
        println!("{}", kind.aliases().join(", "));
    }
    Ok(0)
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
