use dose_core::algorithms::AlgorithmKind;
use dose_core::backend::{BackendAvailability, BackendProvider, RayonBackendProvider};
use dose_core::common::config::ExecutionPatch;
use dose_core::domain::{ArcDirection, ArcRecord, RadiationType};
use dose_core::{
    BeamRecord, CalculationOptions, DoseCalculator, DoseErrorCategory, Grid3, OptionsPatch,
};

fn water_calculator() -> DoseCalculator {
    let mut calculator = DoseCalculator::new();
    calculator
        .set_patient_data(Grid3::filled([10, 20, 10], 0.0), &[4.0, 2.0, 4.0])
        .expect("water phantom should be accepted");
    calculator
}

#[test]
fn patient_data_requires_three_positive_spacings() {
    let mut calculator = DoseCalculator::new();
    let error = calculator
        .set_patient_data(Grid3::filled([4, 4, 4], 0.0), &[1.0, 1.0])
        .expect_err("two spacings should be rejected");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert_eq!(error.exit_code(), 2);

    let error = calculator
        .set_patient_data(Grid3::filled([4, 4, 4], 0.0), &[1.0, 0.0, 1.0])
        .expect_err("zero spacing should be rejected");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert!(calculator.volume().is_none());
}

#[test]
fn volumes_with_an_empty_axis_never_reach_the_calculation() {
    let mut calculator = DoseCalculator::new();
    calculator.add_beam(BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
    for shape in [[0, 20, 10], [10, 0, 10], [10, 20, 0]] {
        let error = calculator
            .set_patient_data(Grid3::filled(shape, 0.0), &[4.0, 2.0, 4.0])
            .expect_err("empty axis should be rejected");
        assert_eq!(error.category(), DoseErrorCategory::Validation);
        assert_eq!(error.placeholder(), "INPUT.EMPTY_VOLUME");
        assert!(calculator.volume().is_none());
    }
    let error = calculator.calculate_dose().expect_err("no volume was accepted");
    assert_eq!(error.placeholder(), "RUN.NO_VOLUME");
}

#[test]
fn degenerate_arc_spacing_and_ray_resolution_are_refused() {
    let mut calculator = water_calculator();
    let mut arc = BeamRecord::new("arc", 6.0, 0.0);
    arc.arc = Some(ArcRecord {
        start: 0.0,
        stop: 359.0,
        direction: ArcDirection::Clockwise,
        spacing_deg: Some(1.0e-9),
    });
    let error = calculator.add_beam(arc).expect_err("arc spacing too fine");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert_eq!(error.placeholder(), "INPUT.BEAM_INVALID_ARC");
    assert!(calculator.beams().is_empty());

    let patch: OptionsPatch =
        serde_json::from_str(r#"{"resolution_mm": 1e-9}"#).expect("patch");
    let error = calculator.set_options(patch).expect_err("resolution too fine");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert_eq!(error.placeholder(), "INPUT.INVALID_OPTION");
    assert_eq!(calculator.options().resolution_mm, None);
}

#[test]
fn invalid_beams_leave_the_beam_list_unchanged() {
    let mut calculator = water_calculator();
    calculator
        .add_beam(BeamRecord::new("ap", 6.0, 0.0))
        .expect("valid beam should be added");

    let mut missing_energy = BeamRecord::new("lat", 6.0, 90.0);
    missing_energy.energy = None;
    let before = calculator.beams().len();
    let error = calculator
        .add_beam(missing_energy)
        .expect_err("missing energy should fail");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert_eq!(error.placeholder(), "INPUT.BEAM_MISSING_FIELD");
    assert_eq!(calculator.beams().len(), before);

    let duplicate = calculator
        .add_beam(BeamRecord::new("ap", 10.0, 180.0))
        .expect_err("duplicate id should fail");
    assert_eq!(duplicate.category(), DoseErrorCategory::Validation);
    assert_eq!(calculator.beams()[0].energy(), 6.0);
}

#[test]
fn beams_are_replaced_and_removed_by_id() {
    let mut calculator = water_calculator();
    calculator.add_beam(BeamRecord::new("a", 6.0, 0.0)).expect("beam a");
    calculator.add_beam(BeamRecord::new("b", 6.0, 90.0)).expect("beam b");

    calculator
        .replace_beam(BeamRecord::new("a", 18.0, 0.0))
        .expect("replace should succeed");
    assert_eq!(calculator.beams()[0].energy(), 18.0);
    assert!(calculator.replace_beam(BeamRecord::new("zz", 6.0, 0.0)).is_err());

    let removed = calculator.remove_beam("b").expect("remove should succeed");
    assert_eq!(removed.id(), "b");
    assert_eq!(calculator.beams().len(), 1);
    assert!(calculator.remove_beam("b").is_err());
}

#[test]
fn structures_must_match_the_volume_shape() {
    let mut calculator = water_calculator();
    let error = calculator
        .add_structure("ptv", Grid3::filled([10, 20, 9], true))
        .expect_err("mismatched mask should fail");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    calculator
        .add_structure("ptv", Grid3::filled([10, 20, 10], true))
        .expect("matching mask should be accepted");
    assert_eq!(calculator.structures().collect::<Vec<_>>(), vec!["ptv"]);

    // A new volume with another shape invalidates the mask before any computation.
    calculator
        .set_patient_data(Grid3::filled([8, 8, 8], 0.0), &[4.0; 3])
        .expect("new volume");
    calculator.add_beam(BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
    let error = calculator.calculate_dose().expect_err("stale mask should fail");
    assert_eq!(error.placeholder(), "INPUT.SHAPE_MISMATCH");
    assert!(calculator.dose().is_none());
}

#[test]
fn calculation_requires_a_volume_and_beams() {
    let mut calculator = DoseCalculator::new();
    calculator.add_beam(BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
    let error = calculator.calculate_dose().expect_err("no volume");
    assert_eq!(error.category(), DoseErrorCategory::Calculation);
    assert_eq!(error.placeholder(), "RUN.NO_VOLUME");

    let mut calculator = water_calculator();
    let error = calculator.calculate_dose().expect_err("no beams");
    assert_eq!(error.category(), DoseErrorCategory::Calculation);
    assert_eq!(error.placeholder(), "RUN.NO_BEAMS");
}

#[test]
fn charged_particles_are_rejected_by_photon_only_algorithms() {
    let mut calculator = water_calculator();
    let mut electron = BeamRecord::new("e", 12.0, 0.0);
    electron.radiation_type = Some(RadiationType::Electron);
    calculator.add_beam(electron).expect("electron beam");

    calculator.set_algorithm(AlgorithmKind::Convolution);
    let error = calculator.calculate_dose().expect_err("convolution is photon only");
    assert_eq!(error.category(), DoseErrorCategory::Validation);
    assert_eq!(error.placeholder(), "INPUT.UNSUPPORTED_RADIATION");

    calculator.set_algorithm(AlgorithmKind::PencilBeam);
    let dose = calculator.calculate_dose().expect("pencil beam handles electrons");
    assert!(dose.max_value() > 0.0);
}

#[test]
fn options_merge_and_invalid_patches_are_refused() {
    let mut calculator = water_calculator();
    let patch: OptionsPatch =
        serde_json::from_str(r#"{"transport": {"max_iterations": 12}}"#).expect("patch");
    calculator.set_options(patch).expect("patch should apply");
    let patch: OptionsPatch =
        serde_json::from_str(r#"{"monte_carlo": {"num_particles": 10}}"#).expect("patch");
    calculator.set_options(patch).expect("patch should apply");
    assert_eq!(calculator.options().transport.max_iterations, 12);
    assert_eq!(calculator.options().monte_carlo.num_particles, 10);

    let invalid: OptionsPatch =
        serde_json::from_str(r#"{"convolution": {"stride": 0}}"#).expect("patch");
    assert!(calculator.set_options(invalid).is_err());
    assert_eq!(
        calculator.options().convolution.stride,
        CalculationOptions::default().convolution.stride
    );
}

#[test]
fn beams_added_after_backend_initialization_are_registered() {
    let mut options = CalculationOptions::default();
    options.execution.threads = Some(2);
    if !matches!(
        RayonBackendProvider.probe(AlgorithmKind::PencilBeam, &options),
        BackendAvailability::Available(_)
    ) {
        return;
    }

    let mut calculator = water_calculator();
    calculator
        .set_options(OptionsPatch {
            execution: Some(ExecutionPatch {
                accelerated: Some(true),
                threads: Some(2),
            }),
            ..OptionsPatch::default()
        })
        .expect("threads patch");
    calculator.add_beam(BeamRecord::new("ap", 6.0, 0.0)).expect("beam");
    assert!(calculator.backend_beams().is_none());

    calculator.calculate_dose().expect("first calculation");
    assert_eq!(calculator.last_report().map(|report| report.backend.as_str()), Some("rayon"));
    calculator.add_beam(BeamRecord::new("lat", 6.0, 90.0)).expect("second beam");
    let registered: Vec<&str> = calculator
        .backend_beams()
        .expect("backend should be initialized")
        .iter()
        .map(|beam| beam.id())
        .collect();
    assert_eq!(registered, vec!["ap", "lat"]);
}
