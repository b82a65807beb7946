use crate::common::config::Normalization;
use crate::domain::warnings::WARN_NORMALIZATION_NON_POSITIVE;
use crate::domain::{DoseError, DoseGrid, DoseResult, NumericalWarning, StructureMask};
use crate::numerics::{coverage_dose, stable_sum};
use std::collections::BTreeMap;

fn structure_values(
    dose: &DoseGrid,
    structures: &BTreeMap<String, StructureMask>,
    name: &str,
) -> DoseResult<Vec<f64>> {
    let mask = structures.get(name).ok_or_else(|| {
        DoseError::validation(
            "INPUT.UNKNOWN_STRUCTURE",
            format!("normalization references unknown structure '{name}'"),
        )
    })?;
    mask.ensure_shape(dose.shape(), &format!("structure '{name}'"))?;
    Ok(mask
        .as_slice()
        .iter()
        .zip(dose.as_slice())
        .filter_map(|(inside, value)| inside.then_some(*value))
        .collect())
}

/// Checks that `normalization` can be evaluated before any dose is computed.
pub fn validate_reference(
    normalization: &Normalization,
    shape: [usize; 3],
    structures: &BTreeMap<String, StructureMask>,
) -> DoseResult<()> {
    match normalization {
        Normalization::Point { voxel, .. } => {
            if (0..3).any(|axis| voxel[axis] >= shape[axis]) {
                return Err(DoseError::validation(
                    "INPUT.NORMALIZATION_POINT",
                    format!("normalization voxel {voxel:?} lies outside shape {shape:?}"),
                ));
            }
            Ok(())
        }
        Normalization::Percentile { structure, .. } | Normalization::Mean { structure, .. } => {
            if structures.contains_key(structure) {
                Ok(())
            } else {
                Err(DoseError::validation(
                    "INPUT.UNKNOWN_STRUCTURE",
                    format!("normalization references unknown structure '{structure}'"),
                ))
            }
        }
    }
}

/// Dose at the normalization reference before scaling.
pub fn reference_dose(
    dose: &DoseGrid,
    normalization: &Normalization,
    structures: &BTreeMap<String, StructureMask>,
) -> DoseResult<f64> {
    match normalization {
        Normalization::Point { voxel, .. } => dose.get(*voxel).copied().ok_or_else(|| {
            DoseError::validation(
                "INPUT.NORMALIZATION_POINT",
                format!("normalization voxel {voxel:?} lies outside the dose grid"),
            )
        }),
        Normalization::Percentile {
            structure,
            coverage,
            ..
        } => {
            let values = structure_values(dose, structures, structure)?;
            Ok(coverage_dose(&values, *coverage).unwrap_or(0.0))
        }
        Normalization::Mean { structure, .. } => {
            let values = structure_values(dose, structures, structure)?;
            if values.is_empty() {
                return Ok(0.0);
            }
            Ok(stable_sum(values.iter().copied()) / values.len() as f64)
        }
    }
}

/// Scales `dose` so the reference equals the prescription. A non-positive
/// reference leaves the grid untouched and yields a warning.
pub fn apply_normalization(
    dose: &mut DoseGrid,
    normalization: &Normalization,
    structures: &BTreeMap<String, StructureMask>,
) -> DoseResult<Option<NumericalWarning>> {
    let reference = reference_dose(dose, normalization, structures)?;
    if !(reference.is_finite() && reference > 0.0) {
        return Ok(Some(NumericalWarning::new(
            WARN_NORMALIZATION_NON_POSITIVE,
            format!("normalization reference dose is {reference}; dose left unscaled"),
        )));
    }
    dose.scale(normalization.value() / reference);
    Ok(None)
}
