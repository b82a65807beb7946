//! Convolution/superposition: TERMA convolved with a point-spread scatter kernel.

use super::{
    AlgorithmKind, BeamDose, CalculationContext, DoseAlgorithm, Executor, PenumbraModel,
    lateral_profile,
};
use crate::common::config::{ConvolutionMethod, ConvolutionOptions};
use crate::common::constants::BODY_DENSITY_THRESHOLD;
use crate::domain::warnings::WARN_CONVOLUTION_NON_FINITE;
use crate::domain::{BeamSpec, DoseResult, Grid3, NumericalWarning};
use crate::numerics::{fft_convolve_same, stable_sum, strided_convolve_same};
use std::f64::consts::PI;

/// Two-term radial kernel `A e^{-a r} / r^2 + B e^{-b r} / r^2`, r in mm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScatterKernel {
    pub primary: f64,
    pub primary_decay: f64,
    pub scatter: f64,
    pub scatter_decay: f64,
}

impl ScatterKernel {
    pub fn for_energy(energy_mv: f64) -> Self {
        let (primary_decay, scatter, scatter_decay) = if energy_mv <= 6.0 {
            (0.6, 0.02, 0.05)
        } else if energy_mv <= 10.0 {
            (0.45, 0.018, 0.045)
        } else {
            (0.35, 0.016, 0.04)
        };
        Self {
            primary: 1.0,
            primary_decay,
            scatter,
            scatter_decay,
        }
    }

    fn radial(&self, r: f64) -> f64 {
        (self.primary * (-self.primary_decay * r).exp()
            + self.scatter * (-self.scatter_decay * r).exp())
            / (r * r)
    }

    /// Kernel integrated over a sphere of radius `r` around the singularity.
    fn central(&self, r: f64) -> f64 {
        4.0 * PI
            * (self.primary * (1.0 - (-self.primary_decay * r).exp()) / self.primary_decay
                + self.scatter * (1.0 - (-self.scatter_decay * r).exp()) / self.scatter_decay)
    }

    /// Voxelized kernel with unit sum. Each axis holds `size` taps, capped at
    /// `2 n - 1` for a grid axis of `n` voxels.
    pub fn discretize(&self, size: usize, spacing: [f64; 3], grid_shape: [usize; 3]) -> Grid3<f64> {
        let size = if size % 2 == 0 { size + 1 } else { size };
        let shape = [
            size.min(2 * grid_shape[0] - 1),
            size.min(2 * grid_shape[1] - 1),
            size.min(2 * grid_shape[2] - 1),
        ];
        let half = [shape[0] / 2, shape[1] / 2, shape[2] / 2];
        let volume = spacing[0] * spacing[1] * spacing[2];
        let equivalent_radius = (3.0 * volume / (4.0 * PI)).cbrt();

        let mut kernel = Grid3::from_fn(shape, |index| {
            let mut r2 = 0.0;
            for axis in 0..3 {
                let offset = (index[axis] as f64 - half[axis] as f64) * spacing[axis];
                r2 += offset * offset;
            }
            if r2 == 0.0 {
                self.central(equivalent_radius)
            } else {
                volume * self.radial(r2.sqrt())
            }
        });
        let total = stable_sum(kernel.as_slice().iter().copied());
        if total > 0.0 {
            kernel.scale(1.0 / total);
        }
        kernel
    }
}

/// Convolves `terma` with `kernel` using the configured path, recording a
/// warning for every path whose result is not finite.
pub fn convolve_terma(
    terma: &Grid3<f64>,
    kernel: &Grid3<f64>,
    options: &ConvolutionOptions,
    warnings: &mut Vec<NumericalWarning>,
) -> DoseResult<Grid3<f64>> {
    if options.method == ConvolutionMethod::Fft {
        match fft_convolve_same(terma, kernel) {
            Ok(dose) if dose.all_finite() => return Ok(clamp_rounding(dose)),
            Ok(_) => warnings.push(NumericalWarning::new(
                WARN_CONVOLUTION_NON_FINITE,
                "FFT convolution produced non-finite values; using strided direct convolution",
            )),
            Err(error) => warnings.push(NumericalWarning::new(
                WARN_CONVOLUTION_NON_FINITE,
                format!("FFT convolution failed ({error}); using strided direct convolution"),
            )),
        }
    }

    let dose = strided_convolve_same(terma, kernel, options.stride)?;
    if dose.all_finite() {
        return Ok(clamp_rounding(dose));
    }
    warnings.push(NumericalWarning::new(
        WARN_CONVOLUTION_NON_FINITE,
        "direct convolution produced non-finite values; keeping unconvolved TERMA",
    ));
    Ok(terma.clone())
}

fn clamp_rounding(mut dose: Grid3<f64>) -> Grid3<f64> {
    for value in dose.as_mut_slice() {
        *value = value.max(0.0);
    }
    dose
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvolutionSuperposition;

impl ConvolutionSuperposition {
    /// Total energy released per unit mass for one beam.
    pub fn terma(
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        executor: &Executor<'_>,
    ) -> DoseResult<Grid3<f64>> {
        let frame = context.beam_frame(beam);
        let tracer = context.tracer();
        let penumbra = PenumbraModel::for_energy(beam.energy());
        let density = context.materials.density();
        let water_mu = context.model.attenuation_per_mm(1.0, beam.energy());

        let values = executor.fill(density.len(), |flat| {
            let index = density.coords(flat);
            let rho = density[index];
            if rho < BODY_DENSITY_THRESHOLD {
                return 0.0;
            }
            let point = context.frame.position(index);
            let field = frame.field_point(point);
            let depths = tracer.trace(frame.source, point, frame.direction);
            let fluence = lateral_profile(beam, &penumbra, &field, depths.geometric)
                * frame.inverse_square(field.axial);
            let depth = if context.options.heterogeneity_correction {
                depths.radiological
            } else {
                depths.geometric
            };
            fluence
                * context.model.attenuation_per_mm(rho, beam.energy())
                * (-water_mu * depth).exp()
                * rho
        });
        Grid3::from_vec(context.shape(), values)
    }
}

impl DoseAlgorithm for ConvolutionSuperposition {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Convolution
    }

    fn beam_dose(
        &self,
        context: &CalculationContext<'_>,
        beam: &BeamSpec,
        _beam_index: usize,
        executor: &Executor<'_>,
    ) -> DoseResult<BeamDose> {
        let terma = Self::terma(context, beam, executor)?;
        let options = &context.options.convolution;
        let kernel = ScatterKernel::for_energy(beam.energy()).discretize(
            options.effective_kernel_size(),
            context.frame.spacing,
            context.shape(),
        );
        tracing::debug!(
            beam = beam.id(),
            kernel = ?kernel.shape(),
            method = ?options.method,
            "convolving TERMA"
        );
        let mut warnings = Vec::new();
        let dose = convolve_terma(&terma, &kernel, options, &mut warnings)?;
        Ok(BeamDose {
            warnings,
            ..BeamDose::deterministic(dose)
        })
    }
}
