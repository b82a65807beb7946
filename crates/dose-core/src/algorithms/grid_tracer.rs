//! Raw grid tracer: tabulated depth dose with a hard-edged Gaussian field.

use super::{AlgorithmKind, BeamDose, CalculationContext, DepthDoseCurve, DoseAlgorithm, Executor};
use crate::common::constants::BODY_DENSITY_THRESHOLD;
use crate::domain::{BeamSpec, DoseResult, Grid3, RadiationType};
use crate::numerics::linear_grid;

const TABLE_SAMPLES: usize = 500;
const TABLE_DEPTH_MM: f64 = 500.0;

/// Depth dose sampled on a fixed 0-500 mm table, looked up by nearest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDoseTable {
    step_mm: f64,
    values: Vec<f64>,
}

impl DepthDoseTable {
    pub fn new(curve: &DepthDoseCurve) -> Self {
        let depths = linear_grid(0.0, TABLE_DEPTH_MM, TABLE_SAMPLES).unwrap_or_default();
        Self {
            step_mm: TABLE_DEPTH_MM / (TABLE_SAMPLES - 1) as f64,
            values: depths.iter().map(|depth| curve.relative(*depth)).collect(),
        }
    }

    pub fn lookup(&self, depth_mm: f64) -> f64 {
        if depth_mm <= 0.0 || self.values.is_empty() {
            return 0.0;
        }
        let index = (depth_mm / self.step_mm).round() as usize;
        self.values[index.min(self.values.len() - 1)]
    }
}

pub fn profile_sigma_mm(energy_mv: f64) -> f64 {
    if energy_mv <= 6.0 {
        40.0
    } else if energy_mv <= 10.0 {
        45.0
    } else {
        50.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GridTracer;

impl DoseAlgorithm for GridTracer {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::GridTracer
    }

    fn supports(&self, _radiation: RadiationType) -> bool {
        true
    }

    fn beam_dose(
        &self,
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        _beam_index: usize,
        executor: &Executor<'_>,
    ) -> DoseResult<BeamDose> {
        let frame = context.beam_frame(beam);
        let tracer = context.tracer();
        let table = DepthDoseTable::new(&DepthDoseCurve::for_beam(beam));
        let sigma = profile_sigma_mm(beam.energy());
        let water_mu = context.model.attenuation_per_mm(1.0, beam.energy());
        let density = context.materials.density();
        let heterogeneity = context.options.heterogeneity_correction;

        let values = executor.fill(density.len(), |flat| {
            let index = density.coords(flat);
            if density[index] < BODY_DENSITY_THRESHOLD {
                return 0.0;
            }
            let point = context.frame.position(index);
            let field = frame.field_point(point);
            if field.axial <= 0.0 {
                return 0.0;
            }
            let (u, v) = field.at_isocenter_plane(frame.sad_mm);
            if !beam.aperture().contains(u, v) {
                return 0.0;
            }
            let depths = tracer.trace(frame.source, point, frame.direction);
            let profile = (-(u * u) / (2.0 * sigma * sigma)).exp()
                * (-(v * v) / (2.0 * sigma * sigma)).exp();
            let correction = if heterogeneity {
                (-water_mu * (depths.radiological - depths.geometric)).exp()
            } else {
                1.0
            };
            table.lookup(depths.geometric)
                * profile
                * beam.fluence_modifier(u, v)
                * frame.inverse_square(field.axial)
                * correction
        });
        Ok(BeamDose::deterministic(Grid3::from_vec(context.shape(), values)?))
    }
}
