use dose_core::algorithms::AlgorithmKind;
use dose_core::common::config::MonteCarloPatch;
use dose_core::{BeamRecord, DoseCalculator, Grid3, OptionsPatch};

fn uncertainty_with(particles: usize) -> f64 {
    let mut calculator = DoseCalculator::new();
    calculator
        .set_patient_data(Grid3::filled([8, 12, 8], 0.0), &[5.0, 5.0, 5.0])
        .expect("phantom");
    let mut beam = BeamRecord::new("ap", 6.0, 0.0);
    beam.field_size = Some([40.0, 40.0]);
    calculator.add_beam(beam).expect("beam");
    calculator.set_algorithm(AlgorithmKind::MonteCarlo);
    calculator
        .set_options(OptionsPatch {
            monte_carlo: Some(MonteCarloPatch {
                num_particles: Some(particles),
                workers: Some(2),
                seed: Some(17),
                output_percent: None,
            }),
            ..OptionsPatch::default()
        })
        .expect("monte carlo options");
    calculator.calculate_dose().expect("dose");
    let uncertainty = calculator.uncertainty().expect("uncertainty");
    assert!(uncertainty.is_finite() && uncertainty > 0.0);
    uncertainty
}

#[test]
fn quadrupling_histories_does_not_increase_uncertainty() {
    let coarse = uncertainty_with(4_000);
    let fine = uncertainty_with(16_000);
    assert!(fine <= 1.1 * coarse, "{fine} vs {coarse}");
    assert!(fine < coarse);
}
