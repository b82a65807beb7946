use crate::domain::{BeamSpec, FieldAperture};
use crate::geometry::FieldPoint;
use crate::numerics::blurred_box;

/// Penumbra width `sigma0 + growth * depth`, in mm at the isocenter plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenumbraModel {
    pub sigma0_mm: f64,
    pub growth_per_mm: f64,
}

impl PenumbraModel {
    pub fn for_energy(energy_mv: f64) -> Self {
        if energy_mv <= 6.0 {
            Self {
                sigma0_mm: 3.0,
                growth_per_mm: 0.02,
            }
        } else if energy_mv <= 10.0 {
            Self {
                sigma0_mm: 3.5,
                growth_per_mm: 0.022,
            }
        } else {
            Self {
                sigma0_mm: 4.0,
                growth_per_mm: 0.025,
            }
        }
    }

    pub fn sigma(&self, depth_mm: f64) -> f64 {
        self.sigma0_mm + self.growth_per_mm * depth_mm.max(0.0)
    }
}

/// Off-axis factor for a point: blurred aperture times wedge transmission.
pub fn lateral_profile(
    beam: &BeamSpec,
    penumbra: &PenumbraModel,
    field: &FieldPoint,
    depth_mm: f64,
) -> f64 {
    if field.axial <= 0.0 {
        return 0.0;
    }
    let (u, v) = field.at_isocenter_plane(beam.sad_mm());
    let sigma = penumbra.sigma(depth_mm);
    aperture_profile(beam.aperture(), u, v, sigma) * beam.fluence_modifier(u, v)
}

pub fn aperture_profile(aperture: &FieldAperture, u: f64, v: f64, sigma: f64) -> f64 {
    let (v_min, v_max) = aperture.v_extent();
    let Some((left, right)) = aperture.edges_at(v.clamp(v_min, v_max)) else {
        return 0.0;
    };
    blurred_box(u, left, right, sigma) * blurred_box(v, v_min, v_max, sigma)
}
