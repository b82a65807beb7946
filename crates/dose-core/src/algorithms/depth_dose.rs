//! Central-axis depth-dose curves, normalised to 1 at their maximum.

use crate::domain::{BeamSpec, RadiationType};
use crate::numerics::PiecewiseLinear;

/// `(energy MV, depth of maximum mm, effective attenuation 1/mm)`.
const PHOTON_BEAM_DATA: [(f64, f64, f64); 4] = [
    (6.0, 15.0, 0.005),
    (10.0, 23.0, 0.0042),
    (15.0, 28.0, 0.0038),
    (18.0, 32.0, 0.0035),
];

/// Build-up/attenuation product `(1 - exp(-d / lambda)) * exp(-mu * d)`.
///
/// `lambda` is solved so the maximum falls on the tabulated `d_max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhotonDepthDose {
    d_max_mm: f64,
    mu_per_mm: f64,
    buildup_mm: f64,
    peak: f64,
}

impl PhotonDepthDose {
    pub fn for_energy(energy_mv: f64) -> Self {
        let energies: Vec<f64> = PHOTON_BEAM_DATA.iter().map(|row| row.0).collect();
        let d_max = PiecewiseLinear::from_trusted(
            energies.clone(),
            PHOTON_BEAM_DATA.iter().map(|row| row.1).collect(),
        );
        let mu = PiecewiseLinear::from_trusted(
            energies,
            PHOTON_BEAM_DATA.iter().map(|row| row.2).collect(),
        );
        Self::from_parameters(d_max.eval(energy_mv), mu.eval(energy_mv))
    }

    pub fn from_parameters(d_max_mm: f64, mu_per_mm: f64) -> Self {
        let peak_depth = |lambda: f64| lambda * (1.0 + 1.0 / (mu_per_mm * lambda)).ln();
        let mut lo = 1.0e-6;
        let mut hi = d_max_mm;
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if peak_depth(mid) < d_max_mm {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let buildup_mm = 0.5 * (lo + hi);
        let mut curve = Self {
            d_max_mm,
            mu_per_mm,
            buildup_mm,
            peak: 1.0,
        };
        curve.peak = curve.raw(d_max_mm);
        curve
    }

    fn raw(&self, depth_mm: f64) -> f64 {
        (1.0 - (-depth_mm / self.buildup_mm).exp()) * (-self.mu_per_mm * depth_mm).exp()
    }

    pub const fn d_max_mm(&self) -> f64 {
        self.d_max_mm
    }

    pub const fn mu_per_mm(&self) -> f64 {
        self.mu_per_mm
    }

    pub fn relative(&self, depth_mm: f64) -> f64 {
        if depth_mm <= 0.0 {
            return 0.0;
        }
        self.raw(depth_mm) / self.peak
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthDoseCurve {
    Photon(PhotonDepthDose),
    /// Practical range in mm.
    Electron { range_mm: f64 },
    /// Bragg peak depth in mm.
    Proton { range_mm: f64 },
}

impl DepthDoseCurve {
    pub fn for_beam(beam: &BeamSpec) -> Self {
        let energy = beam.energy();
        match beam.radiation() {
            RadiationType::Photon => Self::Photon(PhotonDepthDose::for_energy(energy)),
            RadiationType::Electron => Self::Electron {
                range_mm: 4.5 * energy,
            },
            RadiationType::Proton => Self::Proton {
                range_mm: 10.0 * 0.0022 * energy.powf(1.77),
            },
        }
    }

    pub fn relative(&self, depth_mm: f64) -> f64 {
        if depth_mm <= 0.0 {
            return 0.0;
        }
        match *self {
            Self::Photon(curve) => curve.relative(depth_mm),
            Self::Electron { range_mm } => {
                let x = depth_mm / range_mm;
                if x >= 1.0 {
                    return 0.0;
                }
                let peak_x = 1.0 - 0.125_f64.sqrt();
                let shape = |x: f64| (1.0 - x) * (-4.0 * (x - 1.0).powi(2)).exp();
                shape(x) / shape(peak_x)
            }
            Self::Proton { range_mm } => {
                let x = depth_mm / range_mm;
                let bragg = 0.8 + 5.0 * (-20.0 * (x - 1.0).powi(2)).exp();
                let distal = if x > 1.0 {
                    let straggling = 0.012 * range_mm;
                    (-((depth_mm - range_mm) / straggling).powi(2)).exp()
                } else {
                    1.0
                };
                bragg * distal / 5.8
            }
        }
    }

    /// Density correction `PDD(radiological) / PDD(geometric)`; 1 where the
    /// geometric depth dose vanishes.
    pub fn density_correction(&self, geometric_mm: f64, radiological_mm: f64) -> f64 {
        let geometric = self.relative(geometric_mm);
        if geometric <= crate::common::constants::EPSILON {
            return 1.0;
        }
        self.relative(radiological_mm) / geometric
    }
}
