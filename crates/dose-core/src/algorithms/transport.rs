//! Deterministic fluence transport solved by Jacobi upwind sweeps.

use super::{
    AlgorithmKind, BeamDose, CalculationContext, DoseAlgorithm, Executor, PenumbraModel,
    lateral_profile,
};
use crate::domain::warnings::WARN_TRANSPORT_NOT_CONVERGED;
use crate::domain::{BeamSpec, DoseResult, Grid3, NumericalWarning};
use crate::geometry::{scale, sub};
use crate::numerics::sample_trilinear;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Iterating,
    Converged,
    MaxIterationsReached,
}

impl ConvergenceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iterating => "iterating",
            Self::Converged => "converged",
            Self::MaxIterationsReached => "max_iterations_reached",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Iterating)
    }

    /// State after `iterations` completed sweeps. Terminal states never change.
    pub const fn advance(self, converged: bool, iterations: usize, max_iterations: usize) -> Self {
        match self {
            Self::Iterating if converged => Self::Converged,
            Self::Iterating if iterations >= max_iterations => Self::MaxIterationsReached,
            other => other,
        }
    }
}

impl Display for ConvergenceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportReport {
    pub state: ConvergenceState,
    pub iterations: usize,
    /// Final `max |delta phi| / max phi`.
    pub residual: f64,
}

/// Per-voxel coefficients of one sweep.
struct SweepTerms {
    /// Continuous index one step upstream, or `None` past the grid boundary.
    upstream: Vec<Option<[f64; 3]>>,
    inflow: Vec<f64>,
    transmission: Vec<f64>,
    scatter: Vec<f64>,
}

fn neighbour_mean(phi: &Grid3<f64>, [i, j, k]: [usize; 3]) -> f64 {
    let shape = phi.shape();
    let mut sum = 0.0;
    let mut count = 0usize;
    let index = [i, j, k];
    for axis in 0..3 {
        if index[axis] > 0 {
            let mut lower = index;
            lower[axis] -= 1;
            sum += phi[lower];
            count += 1;
        }
        if index[axis] + 1 < shape[axis] {
            let mut upper = index;
            upper[axis] += 1;
            sum += phi[upper];
            count += 1;
        }
    }
    if count == 0 { phi[index] } else { sum / count as f64 }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IterativeTransport;

impl DoseAlgorithm for IterativeTransport {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Transport
    }

    fn beam_dose(
        &self,
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        _beam_index: usize,
        executor: &Executor<'_>,
    ) -> DoseResult<BeamDose> {
        let frame = context.beam_frame(beam);
        let penumbra = PenumbraModel::for_energy(beam.energy());
        let density = context.materials.density();
        let classes = context.materials.classes();
        let options = &context.options.transport;
        let shape = context.shape();
        let step = context.frame.min_spacing();
        let back = scale(frame.direction, step);

        let mut terms = SweepTerms {
            upstream: Vec::with_capacity(density.len()),
            inflow: Vec::with_capacity(density.len()),
            transmission: Vec::with_capacity(density.len()),
            scatter: Vec::with_capacity(density.len()),
        };
        let mut initial = Vec::with_capacity(density.len());
        for flat in 0..density.len() {
            let index = density.coords(flat);
            let point = context.frame.position(index);
            let field = frame.field_point(point);
            let footprint = lateral_profile(beam, &penumbra, &field, 0.0);
            let upstream = context.frame.continuous_index(sub(point, back));
            let mu = context.model.attenuation_per_mm(density[index], beam.energy());
            let transmission = (-mu * step).exp();

            terms.upstream.push(
                sample_trilinear(density, upstream)
                    .is_some()
                    .then_some(upstream),
            );
            terms.inflow.push(footprint);
            terms.transmission.push(transmission);
            terms
                .scatter
                .push(options.scatter_albedo * (1.0 - transmission));
            initial.push(if field.axial <= frame.sad_mm { footprint } else { 0.0 });
        }

        let mut phi = Grid3::from_vec(shape, initial)?;
        let mut state = ConvergenceState::Iterating;
        let mut iterations = 0;
        let mut residual = f64::INFINITY;
        while !state.is_terminal() {
            let current = &phi;
            let next = executor.fill(current.len(), |flat| {
                let index = current.coords(flat);
                let upstream = terms.upstream[flat]
                    .and_then(|position| sample_trilinear(current, position))
                    .unwrap_or(terms.inflow[flat]);
                upstream * terms.transmission[flat]
                    + terms.scatter[flat] * neighbour_mean(current, index)
            });
            let delta = next
                .iter()
                .zip(current.as_slice())
                .fold(0.0_f64, |max, (lhs, rhs)| max.max((lhs - rhs).abs()));
            phi = Grid3::from_vec(shape, next)?;
            iterations += 1;

            let peak = phi.max_value();
            residual = if peak > 0.0 { delta / peak } else { 0.0 };
            state = state.advance(
                residual <= options.convergence_epsilon,
                iterations,
                options.max_iterations,
            );
            tracing::trace!(beam = beam.id(), iterations, residual, "transport sweep");
        }
        tracing::debug!(beam = beam.id(), %state, iterations, residual, "transport finished");

        let mut warnings = Vec::new();
        if state == ConvergenceState::MaxIterationsReached {
            warnings.push(NumericalWarning::new(
                WARN_TRANSPORT_NOT_CONVERGED,
                format!(
                    "transport for beam '{}' stopped after {iterations} iterations with residual {residual:.3e}",
                    beam.id()
                ),
            ));
        }

        let dose = Grid3::from_fn(shape, |index| {
            let field = frame.field_point(context.frame.position(index));
            phi[index] * classes[index].dose_conversion() * frame.inverse_square(field.axial)
        });
        Ok(BeamDose {
            dose,
            variance: None,
            warnings,
            transport: Some(TransportReport {
                state,
                iterations,
                residual,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConvergenceState, IterativeTransport};
    use crate::algorithms::{BeamDose, CalculationContext, DoseAlgorithm, Executor};
    use crate::common::config::CalculationOptions;
    use crate::domain::{BeamRecord, BeamSpec, Grid3, VolumeGrid, VolumeKind};
    use crate::material::{MaterialGrid, MaterialModel};

    fn run(hu: impl FnMut([usize; 3]) -> f64, options: &CalculationOptions) -> BeamDose {
        let volume = VolumeGrid::new(
            Grid3::from_fn([7, 31, 7], hu),
            &[5.0, 2.0, 5.0],
            VolumeKind::Hounsfield,
        )
        .expect("volume should be valid");
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(&volume, &model);
        let context = CalculationContext::new(&volume, &materials, &model, options)
            .expect("context should build");
        let beam = BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
        IterativeTransport
            .beam_dose(&context, &beam, 0, &Executor::Serial)
            .expect("transport should compute")
    }

    #[test]
    fn state_machine_stops_in_exactly_one_terminal_state() {
        let state = ConvergenceState::Iterating;
        assert_eq!(state.advance(false, 3, 10), ConvergenceState::Iterating);
        assert_eq!(state.advance(true, 3, 10), ConvergenceState::Converged);
        assert_eq!(state.advance(false, 10, 10), ConvergenceState::MaxIterationsReached);
        assert_eq!(state.advance(true, 10, 10), ConvergenceState::Converged);
        assert_eq!(
            ConvergenceState::Converged.advance(false, 50, 10),
            ConvergenceState::Converged
        );
        assert!(!ConvergenceState::Iterating.is_terminal());
        assert!(ConvergenceState::MaxIterationsReached.is_terminal());
    }

    #[test]
    fn water_slab_converges_and_attenuates_with_depth() {
        let result = run(|_| 0.0, &CalculationOptions::default());
        let report = result.transport.expect("report");
        assert_eq!(report.state, ConvergenceState::Converged);
        assert!(report.iterations < 200);
        assert!(result.warnings.is_empty());

        let fluence: Vec<f64> = (0..31).map(|j| result.dose[[3, j, 3]]).collect();
        assert!(fluence[0] > 0.0);
        assert!(fluence.windows(2).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn iteration_cap_is_reported_as_a_warning() {
        let mut options = CalculationOptions::default();
        options.transport.max_iterations = 3;
        let result = run(|_| 0.0, &options);
        let report = result.transport.expect("report");
        assert_eq!(report.state, ConvergenceState::MaxIterationsReached);
        assert_eq!(report.iterations, 3);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn repeated_runs_are_identical_and_material_scales_dose() {
        let options = CalculationOptions::default();
        let bony = |[_, j, _]: [usize; 3]| if j == 20 { 700.0 } else { 0.0 };
        let first = run(bony, &options);
        let second = run(bony, &options);
        assert_eq!(first.dose, second.dose);

        let water = run(|_| 0.0, &options);
        assert!(first.dose[[3, 20, 3]] > water.dose[[3, 20, 3]]);
    }
}
