//! Photon Monte Carlo with shared-nothing worker shares.
//!
//! Each beam's histories are split into [`WorkerShare`]s with their own seed.
//! A share returns private `sum` / `sum_sq` tallies, and tallies are added in
//! worker-index order, so the pooled and serial paths produce identical grids.
//! Cancellation is not supported; a run completes or fails.

pub mod history;
pub mod tally;

pub use history::{TransportMedium, simulate_share};
pub use tally::{BEAM_SEED_STRIDE, WorkerShare, WorkerTally, combine_tallies, partition};

use crate::algorithms::{
    AlgorithmKind, AlgorithmOutput, BeamDose, CalculationContext, DoseAlgorithm, Executor,
};
use crate::common::config::CalculationOptions;
use crate::domain::warnings::WARN_MONTE_CARLO_EMPTY_TALLY;
use crate::domain::{BeamSpec, DoseResult, Grid3, NumericalWarning};
use std::thread;

/// Worker count: the configured value, else hardware concurrency minus one.
pub fn resolve_workers(options: &CalculationOptions) -> usize {
    options.monte_carlo.workers.unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|count| count.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    })
}

/// Mean relative uncertainty `sqrt(var) / dose` over voxels above half the
/// maximum dose, as a fraction.
pub fn summary_uncertainty(dose: &Grid3<f64>, variance: &Grid3<f64>) -> Option<f64> {
    let threshold = 0.5 * dose.max_value();
    if threshold <= 0.0 {
        return None;
    }
    let (total, count) = dose
        .as_slice()
        .iter()
        .zip(variance.as_slice())
        .filter(|(value, _)| **value > threshold)
        .fold((0.0, 0usize), |(total, count), (value, variance)| {
            (total + variance.max(0.0).sqrt() / value, count + 1)
        });
    (count > 0).then(|| total / count as f64)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonteCarlo;

impl MonteCarlo {
    fn run_shares(
        medium: &TransportMedium<'_>,
        beam: &BeamSpec,
        context: &CalculationContext<'_>,
        shares: &[WorkerShare],
        executor: &Executor<'_>,
    ) -> Vec<WorkerTally> {
        let frame = context.beam_frame(beam);
        let simulate = |_: usize, share: &WorkerShare| simulate_share(medium, beam, &frame, *share);
        executor.map(shares, simulate)
    }
}

impl DoseAlgorithm for MonteCarlo {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::MonteCarlo
    }

    fn beam_dose(
        &self,
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        beam_index: usize,
        executor: &Executor<'_>,
    ) -> DoseResult<BeamDose> {
        let density = context.materials.density();
        let attenuation = density.map(|rho| context.model.attenuation_per_mm(*rho, beam.energy()));
        let compton = density.map(|rho| context.model.compton_fraction(*rho));
        let medium = TransportMedium {
            frame: &context.frame,
            attenuation: &attenuation,
            compton: &compton,
        };

        let options = &context.options.monte_carlo;
        let workers = resolve_workers(context.options);
        let shares = partition(options.num_particles, workers, options.seed, beam_index);
        tracing::debug!(
            beam = beam.id(),
            particles = options.num_particles,
            workers,
            shares = shares.len(),
            mode = %executor.mode(),
            "partitioned Monte Carlo histories"
        );

        let tallies = Self::run_shares(&medium, beam, context, &shares, executor);
        let combined = combine_tallies(tallies, density.len())?;
        let histories = combined.histories.max(1) as f64;

        let mut warnings = Vec::new();
        if combined.is_empty() {
            warnings.push(NumericalWarning::new(
                WARN_MONTE_CARLO_EMPTY_TALLY,
                format!("no history of beam '{}' deposited dose in the volume", beam.id()),
            ));
        }

        let mean: Vec<f64> = combined.sum.iter().map(|sum| sum / histories).collect();
        let variance: Vec<f64> = combined
            .sum_sq
            .iter()
            .zip(&mean)
            .map(|(sum_sq, mean)| {
                if histories > 1.0 {
                    ((sum_sq / histories - mean * mean) / (histories - 1.0)).max(0.0)
                } else {
                    0.0
                }
            })
            .collect();

        let shape = context.shape();
        Ok(BeamDose {
            dose: Grid3::from_vec(shape, mean)?,
            variance: Some(Grid3::from_vec(shape, variance)?),
            warnings,
            transport: None,
        })
    }

    fn finalize(&self, output: &mut AlgorithmOutput, options: &CalculationOptions) {
        output.uncertainty = output
            .variance
            .as_ref()
            .and_then(|variance| summary_uncertainty(&output.dose, variance));
        if options.monte_carlo.output_percent {
            let peak = output.dose.max_value();
            if peak > 0.0 {
                let factor = 100.0 / peak;
                output.dose.scale(factor);
                if let Some(variance) = output.variance.as_mut() {
                    variance.scale(factor * factor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MonteCarlo, resolve_workers, summary_uncertainty};
    use crate::algorithms::{AlgorithmKind, CalculationContext, DoseAlgorithm, Executor, compute_dose};
    use crate::common::config::CalculationOptions;
    use crate::domain::{BeamRecord, BeamSpec, Grid3, VolumeGrid, VolumeKind};
    use crate::material::{MaterialGrid, MaterialModel};

    fn water() -> VolumeGrid {
        VolumeGrid::new(Grid3::filled([8, 12, 8], 0.0), &[5.0; 3], VolumeKind::Hounsfield)
            .expect("volume should be valid")
    }

    fn options(particles: usize, workers: usize) -> CalculationOptions {
        let mut options = CalculationOptions::default();
        options.monte_carlo.num_particles = particles;
        options.monte_carlo.workers = Some(workers);
        options
    }

    #[test]
    fn pooled_and_serial_runs_are_bit_identical() {
        let volume = water();
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(&volume, &model);
        let options = options(3_001, 4);
        let context = CalculationContext::new(&volume, &materials, &model, &options)
            .expect("context should build");
        let beams = vec![
            BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam"),
            BeamSpec::from_record(&BeamRecord::new("lat", 10.0, 90.0)).expect("beam"),
        ];
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .expect("pool should build");

        let serial = compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Serial)
            .expect("serial run");
        let pooled = compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Pool(&pool))
            .expect("pooled run");
        assert_eq!(serial.dose, pooled.dose);
        assert_eq!(serial.variance, pooled.variance);
        assert!(serial.dose.max_value() > 0.0);
        assert!(serial.uncertainty.is_some());
    }

    #[test]
    fn shares_run_on_the_backend_pool_regardless_of_its_width() {
        let volume = water();
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(&volume, &model);
        let options = options(1_200, 6);
        let context = CalculationContext::new(&volume, &materials, &model, &options)
            .expect("context should build");
        let beams = vec![BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam")];
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .expect("pool should build");

        let serial = compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Serial)
            .expect("serial run");
        let pooled = compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Pool(&single))
            .expect("pooled run");
        assert_eq!(serial.dose, pooled.dose);
        assert_eq!(serial.variance, pooled.variance);
    }

    #[test]
    fn seed_changes_the_sample() {
        let volume = water();
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(&volume, &model);
        let first = options(500, 2);
        let mut second = options(500, 2);
        second.monte_carlo.seed += 1;
        let beams = vec![BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam")];

        let run = |options: &CalculationOptions| {
            let context = CalculationContext::new(&volume, &materials, &model, options)
                .expect("context should build");
            compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Serial)
                .expect("run")
                .dose
        };
        assert_ne!(run(&first), run(&second));
        assert_eq!(run(&first), run(&first));
    }

    #[test]
    fn percent_output_peaks_at_one_hundred() {
        let volume = water();
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(&volume, &model);
        let mut options = options(800, 2);
        options.monte_carlo.output_percent = true;
        let context = CalculationContext::new(&volume, &materials, &model, &options)
            .expect("context should build");
        let beams = vec![BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam")];
        let output = compute_dose(AlgorithmKind::MonteCarlo, &context, &beams, &Executor::Serial)
            .expect("run");
        assert!((output.dose.max_value() - 100.0).abs() < 1.0e-9);
    }

    #[test]
    fn uncertainty_summary_only_counts_the_high_dose_region() {
        let dose = Grid3::from_vec([1, 1, 3], vec![10.0, 8.0, 1.0]).expect("grid");
        let variance = Grid3::from_vec([1, 1, 3], vec![1.0, 0.64, 100.0]).expect("grid");
        let summary = summary_uncertainty(&dose, &variance).expect("summary");
        assert!((summary - 0.1).abs() < 1.0e-12);
        assert!(summary_uncertainty(&Grid3::zeros([1, 1, 3]), &variance).is_none());
    }

    #[test]
    fn configured_workers_override_hardware_concurrency() {
        assert_eq!(resolve_workers(&options(10, 5)), 5);
        assert!(resolve_workers(&CalculationOptions::default()) >= 1);
        assert_eq!(MonteCarlo.kind(), AlgorithmKind::MonteCarlo);
    }
}
