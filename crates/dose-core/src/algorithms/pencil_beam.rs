//! Ray-traced pencil-beam superposition.

use super::{
    AlgorithmKind, BeamDose, CalculationContext, DepthDoseCurve, DoseAlgorithm, Executor,
    PenumbraModel, lateral_profile,
};
use crate::common::constants::BODY_DENSITY_THRESHOLD;
use crate::domain::{BeamSpec, DoseResult, Grid3, RadiationType};

#[derive(Debug, Clone, Copy, Default)]
pub struct PencilBeam;

impl DoseAlgorithm for PencilBeam {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::PencilBeam
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
        let curve = DepthDoseCurve::for_beam(beam);
        let penumbra = PenumbraModel::for_energy(beam.energy());
        let density = context.materials.density();
        let heterogeneity = context.options.heterogeneity_correction;
        let shape = context.shape();

        let values = executor.fill(density.len(), |flat| {
            let index = density.coords(flat);
            if density[index] < BODY_DENSITY_THRESHOLD {
                return 0.0;
            }
            let point = context.frame.position(index);
            let field = frame.field_point(point);
            let depths = tracer.trace(frame.source, point, frame.direction);
            let pdd = curve.relative(depths.geometric);
            if pdd <= 0.0 {
                return 0.0;
            }
            let correction = if heterogeneity {
                curve.density_correction(depths.geometric, depths.radiological)
            } else {
                1.0
            };
            pdd * lateral_profile(beam, &penumbra, &field, depths.geometric)
                * frame.inverse_square(field.axial)
                * correction
        });
        Ok(BeamDose::deterministic(Grid3::from_vec(shape, values)?))
    }
}

#[cfg(test)]
mod tests {
    use super::PencilBeam;
    use crate::algorithms::{CalculationContext, DoseAlgorithm, Executor};
    use crate::common::config::CalculationOptions;
    use crate::domain::{BeamRecord, BeamSpec, Grid3, VolumeGrid, VolumeKind};
    use crate::material::{MaterialGrid, MaterialModel};

    fn slab(shape: [usize; 3], hu: impl FnMut([usize; 3]) -> f64) -> VolumeGrid {
        VolumeGrid::new(Grid3::from_fn(shape, hu), &[5.0, 2.0, 5.0], VolumeKind::Hounsfield)
            .expect("volume should be valid")
    }

    fn run(volume: &VolumeGrid, options: &CalculationOptions) -> Grid3<f64> {
        let model = MaterialModel::default();
        let materials = MaterialGrid::build(volume, &model);
        let context = CalculationContext::new(volume, &materials, &model, options)
            .expect("context should build");
        let beam = BeamSpec::from_record(&BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
        PencilBeam
            .beam_dose(&context, &beam, 0, &Executor::Serial)
            .expect("pencil beam should compute")
            .dose
    }

    #[test]
    fn water_depth_curve_builds_up_then_falls() {
        let volume = slab([11, 61, 11], |_| 0.0);
        let dose = run(&volume, &CalculationOptions::default());
        let column: Vec<f64> = (0..61).map(|j| dose[[5, j, 5]]).collect();
        let peak = column
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (index, value)| {
                if *value > best.1 { (index, *value) } else { best }
            });
        // Voxel centres sit 2 mm apart starting 1 mm below the entrance face.
        let peak_depth = 1.0 + 2.0 * peak.0 as f64;
        assert!((11.0..=17.0).contains(&peak_depth), "peak at {peak_depth} mm");
        assert!(column[0] < 0.5 * peak.1);
        assert!(column.windows(2).skip(peak.0).all(|pair| pair[1] < pair[0]));
    }

    #[test]
    fn air_voxels_receive_no_dose_and_lung_raises_dose_beyond_it() {
        let water = slab([11, 61, 11], |_| 0.0);
        let lung = slab([11, 61, 11], |[_, j, _]| if (30..45).contains(&j) { -700.0 } else { 0.0 });
        let with_air = slab([11, 61, 11], |[i, _, _]| if i == 0 { -1000.0 } else { 0.0 });

        let options = CalculationOptions::default();
        let water_dose = run(&water, &options);
        let lung_dose = run(&lung, &options);
        assert!((lung_dose[[5, 10, 5]] - water_dose[[5, 10, 5]]).abs() < 1.0e-12);
        assert!(lung_dose[[5, 50, 5]] > water_dose[[5, 50, 5]]);

        let mut uncorrected = CalculationOptions::default();
        uncorrected.heterogeneity_correction = false;
        let flat = run(&lung, &uncorrected);
        assert!((flat[[5, 50, 5]] - water_dose[[5, 50, 5]]).abs() < 1.0e-12);

        let air_dose = run(&with_air, &options);
        assert!((0..61).all(|j| air_dose[[0, j, 5]] == 0.0));
    }
}
