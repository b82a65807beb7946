//! Same-size 3-D convolution of a signal grid with an odd-sized kernel.
//!
//! `fft_convolve_same` is exact up to rounding. `strided_convolve_same`
//! evaluates the direct sum only on a stride lattice and fills the remaining
//! voxels from it, trading accuracy for speed.

use crate::domain::{DoseError, DoseResult, Grid3};
use num_complex::Complex64;
use rustfft::{FftDirection, FftPlanner};

fn kernel_half_sizes(kernel: &Grid3<f64>) -> DoseResult<[usize; 3]> {
    let shape = kernel.shape();
    if shape.iter().any(|size| size % 2 == 0) {
        return Err(DoseError::internal(
            "SYS.KERNEL_EVEN",
            format!("convolution kernel shape {shape:?} must be odd on every axis"),
        ));
    }
    Ok([shape[0] / 2, shape[1] / 2, shape[2] / 2])
}

/// Forward or inverse transform of every axis line of an x-major buffer.
/// The inverse pass applies the `1/N` scaling of the full volume.
fn transform_volume(
    planner: &mut FftPlanner<f64>,
    data: &mut [Complex64],
    shape: [usize; 3],
    direction: FftDirection,
) {
    let [nx, ny, nz] = shape;
    let strides = [ny * nz, nz, 1];
    let mut line = Vec::new();
    for axis in 0..3 {
        let length = shape[axis];
        if length <= 1 {
            continue;
        }
        let fft = planner.plan_fft(length, direction);
        let mut scratch = vec![Complex64::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let stride = strides[axis];
        if stride == 1 {
            for row in data.chunks_exact_mut(length) {
                fft.process_with_scratch(row, &mut scratch);
            }
            continue;
        }
        line.resize(length, Complex64::new(0.0, 0.0));
        let [a_len, b_len] = match axis {
            0 => [ny, nz],
            _ => [nx, nz],
        };
        for a in 0..a_len {
            for b in 0..b_len {
                let base = match axis {
                    0 => a * nz + b,
                    _ => a * ny * nz + b,
                };
                for (step, value) in line.iter_mut().enumerate() {
                    *value = data[base + step * stride];
                }
                fft.process_with_scratch(&mut line, &mut scratch);
                for (step, value) in line.iter().enumerate() {
                    data[base + step * stride] = *value;
                }
            }
        }
    }

    if direction == FftDirection::Inverse {
        let scale = 1.0 / (nx * ny * nz) as f64;
        for value in data.iter_mut() {
            *value *= scale;
        }
    }
}

pub fn fft_convolve_same(signal: &Grid3<f64>, kernel: &Grid3<f64>) -> DoseResult<Grid3<f64>> {
    let half = kernel_half_sizes(kernel)?;
    let shape = signal.shape();
    let kernel_shape = kernel.shape();
    let padded = [
        shape[0] + kernel_shape[0] - 1,
        shape[1] + kernel_shape[1] - 1,
        shape[2] + kernel_shape[2] - 1,
    ];
    let padded_index = |[i, j, k]: [usize; 3]| (i * padded[1] + j) * padded[2] + k;
    let len = padded[0] * padded[1] * padded[2];

    let mut signal_buffer = vec![Complex64::new(0.0, 0.0); len];
    for (flat, value) in signal.as_slice().iter().enumerate() {
        signal_buffer[padded_index(signal.coords(flat))] = Complex64::new(*value, 0.0);
    }
    let mut kernel_buffer = vec![Complex64::new(0.0, 0.0); len];
    for (flat, value) in kernel.as_slice().iter().enumerate() {
        kernel_buffer[padded_index(kernel.coords(flat))] = Complex64::new(*value, 0.0);
    }

    let mut planner = FftPlanner::new();
    transform_volume(&mut planner, &mut signal_buffer, padded, FftDirection::Forward);
    transform_volume(&mut planner, &mut kernel_buffer, padded, FftDirection::Forward);
    for (value, kernel_value) in signal_buffer.iter_mut().zip(&kernel_buffer) {
        *value *= kernel_value;
    }
    transform_volume(&mut planner, &mut signal_buffer, padded, FftDirection::Inverse);

    Ok(Grid3::from_fn(shape, |[i, j, k]| {
        signal_buffer[padded_index([i + half[0], j + half[1], k + half[2]])].re
    }))
}

/// Direct convolution sum at one output voxel; taps outside the grid read zero.
pub fn direct_convolve_at(signal: &Grid3<f64>, kernel: &Grid3<f64>, index: [usize; 3]) -> f64 {
    let shape = signal.shape();
    let kernel_shape = kernel.shape();
    let half = [kernel_shape[0] / 2, kernel_shape[1] / 2, kernel_shape[2] / 2];
    let range = |axis: usize| {
        let reach = index[axis] + half[axis];
        reach.saturating_sub(shape[axis] - 1)..=reach.min(kernel_shape[axis] - 1)
    };

    let mut total = 0.0;
    for a in range(0) {
        for b in range(1) {
            let row = [index[0] + half[0] - a, index[1] + half[1] - b];
            for c in range(2) {
                let kernel_value = kernel[[a, b, c]];
                if kernel_value != 0.0 {
                    total += kernel_value * signal[[row[0], row[1], index[2] + half[2] - c]];
                }
            }
        }
    }
    total
}

pub fn direct_convolve_same(signal: &Grid3<f64>, kernel: &Grid3<f64>) -> DoseResult<Grid3<f64>> {
    kernel_half_sizes(kernel)?;
    Ok(Grid3::from_fn(signal.shape(), |index| {
        direct_convolve_at(signal, kernel, index)
    }))
}

/// Lattice voxels along one axis: every `stride`-th index plus the last one.
fn axis_lattice(size: usize, stride: usize) -> Vec<usize> {
    let mut lattice: Vec<usize> = (0..size).step_by(stride.max(1)).collect();
    if lattice.last() != Some(&(size - 1)) {
        lattice.push(size - 1);
    }
    lattice
}

/// Bracketing lattice indices and interpolation fraction for every voxel.
fn axis_brackets(size: usize, lattice: &[usize]) -> Vec<(usize, usize, f64)> {
    let mut brackets = Vec::with_capacity(size);
    let mut segment = 0;
    for index in 0..size {
        while segment + 1 < lattice.len() && lattice[segment + 1] <= index {
            segment += 1;
        }
        let lo = lattice[segment];
        if index == lo || segment + 1 == lattice.len() {
            brackets.push((lo, lo, 0.0));
            continue;
        }
        let hi = lattice[segment + 1];
        brackets.push((lo, hi, (index - lo) as f64 / (hi - lo) as f64));
    }
    brackets
}

/// Summed-volume table over the kernel, padded by one on the low side.
struct KernelMass {
    shape: [usize; 3],
    half: [usize; 3],
    prefix: Vec<f64>,
}

impl KernelMass {
    fn new(kernel: &Grid3<f64>) -> Self {
        let shape = kernel.shape();
        let padded = [shape[0] + 1, shape[1] + 1, shape[2] + 1];
        let at = |i: usize, j: usize, k: usize| (i * padded[1] + j) * padded[2] + k;
        let mut prefix = vec![0.0; padded[0] * padded[1] * padded[2]];
        for i in 1..padded[0] {
            for j in 1..padded[1] {
                for k in 1..padded[2] {
                    prefix[at(i, j, k)] = kernel[[i - 1, j - 1, k - 1]]
                        + prefix[at(i - 1, j, k)]
                        + prefix[at(i, j - 1, k)]
                        + prefix[at(i, j, k - 1)]
                        - prefix[at(i - 1, j - 1, k)]
                        - prefix[at(i - 1, j, k - 1)]
                        - prefix[at(i, j - 1, k - 1)]
                        + prefix[at(i - 1, j - 1, k - 1)];
                }
            }
        }
        Self {
            shape,
            half: [shape[0] / 2, shape[1] / 2, shape[2] / 2],
            prefix,
        }
    }

    /// Kernel weight whose taps land inside a grid of `grid_shape` from `index`.
    fn inside(&self, grid_shape: [usize; 3], index: [usize; 3]) -> f64 {
        let padded = [self.shape[0] + 1, self.shape[1] + 1, self.shape[2] + 1];
        let at = |i: usize, j: usize, k: usize| self.prefix[(i * padded[1] + j) * padded[2] + k];
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            let reach = index[axis] + self.half[axis];
            lo[axis] = reach.saturating_sub(grid_shape[axis] - 1);
            hi[axis] = (reach + 1).min(self.shape[axis]);
        }
        at(hi[0], hi[1], hi[2]) - at(lo[0], hi[1], hi[2]) - at(hi[0], lo[1], hi[2])
            - at(hi[0], hi[1], lo[2])
            + at(lo[0], lo[1], hi[2])
            + at(lo[0], hi[1], lo[2])
            + at(hi[0], lo[1], lo[2])
            - at(lo[0], lo[1], lo[2])
    }
}

/// Stride-decimated direct convolution.
///
/// The direct sum runs only on lattice voxels (every `stride`-th index per
/// axis, last index always included, so no voxel needs extrapolation). A
/// skipped voxel `p` is filled by trilinear interpolation of the ratio
/// `D / (S * M)` between its bracketing lattice voxels, where `S` is the
/// signal and `M` the kernel mass falling inside the grid, then multiplied
/// back by `S(p) * M(p)`. Corners with zero signal are left out. When `S(p)`
/// is zero or no corner carries signal, plain trilinear interpolation of `D`
/// is used instead.
pub fn strided_convolve_same(
    signal: &Grid3<f64>,
    kernel: &Grid3<f64>,
    stride: usize,
) -> DoseResult<Grid3<f64>> {
    kernel_half_sizes(kernel)?;
    let shape = signal.shape();
    let lattices = [
        axis_lattice(shape[0], stride),
        axis_lattice(shape[1], stride),
        axis_lattice(shape[2], stride),
    ];
    let brackets = [
        axis_brackets(shape[0], &lattices[0]),
        axis_brackets(shape[1], &lattices[1]),
        axis_brackets(shape[2], &lattices[2]),
    ];
    let mass = KernelMass::new(kernel);

    let mut result = Grid3::zeros(shape);
    let mut ratio = Grid3::zeros(shape);
    for &i in &lattices[0] {
        for &j in &lattices[1] {
            for &k in &lattices[2] {
                let index = [i, j, k];
                let dose = direct_convolve_at(signal, kernel, index);
                result[index] = dose;
                let denominator = signal[index] * mass.inside(shape, index);
                if denominator > 0.0 {
                    ratio[index] = dose / denominator;
                }
            }
        }
    }

    for i in 0..shape[0] {
        for j in 0..shape[1] {
            for k in 0..shape[2] {
                let index = [i, j, k];
                let axes = [brackets[0][i], brackets[1][j], brackets[2][k]];
                if axes.iter().all(|(lo, hi, _)| lo == hi) {
                    continue;
                }

                let mut ratio_sum = 0.0;
                let mut ratio_weight = 0.0;
                let mut plain = 0.0;
                for corner in 0..8 {
                    let mut weight = 1.0;
                    let mut lattice_index = [0usize; 3];
                    for axis in 0..3 {
                        let (lo, hi, t) = axes[axis];
                        if (corner >> axis) & 1 == 1 {
                            weight *= t;
                            lattice_index[axis] = hi;
                        } else {
                            weight *= 1.0 - t;
                            lattice_index[axis] = lo;
                        }
                    }
                    if weight == 0.0 {
                        continue;
                    }
                    plain += weight * result[lattice_index];
                    if signal[lattice_index] > 0.0 {
                        ratio_sum += weight * ratio[lattice_index];
                        ratio_weight += weight;
                    }
                }

                let local_signal = signal[index];
                result[index] = if local_signal > 0.0 && ratio_weight > 0.0 {
                    local_signal * mass.inside(shape, index) * ratio_sum / ratio_weight
                } else {
                    plain
                };
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::{
        KernelMass, axis_brackets, axis_lattice, direct_convolve_same, fft_convolve_same,
        strided_convolve_same,
    };
    use crate::domain::Grid3;

    fn smooth_kernel() -> Grid3<f64> {
        let raw = Grid3::from_fn([3, 3, 3], |[a, b, c]| {
            let r2 = [a, b, c]
                .iter()
                .map(|value| (*value as f64 - 1.0).powi(2))
                .sum::<f64>();
            (-r2).exp()
        });
        let total: f64 = raw.as_slice().iter().sum();
        raw.map(|value| value / total)
    }

    #[test]
    fn lattice_always_contains_the_last_index() {
        assert_eq!(axis_lattice(8, 2), vec![0, 2, 4, 6, 7]);
        assert_eq!(axis_lattice(7, 3), vec![0, 3, 6]);
        assert_eq!(axis_lattice(1, 2), vec![0]);
        let brackets = axis_brackets(8, &axis_lattice(8, 2));
        assert_eq!(brackets[5], (4, 6, 0.5));
        assert_eq!(brackets[6], (6, 6, 0.0));
        assert_eq!(brackets[7], (7, 7, 0.0));
    }

    #[test]
    fn fft_convolution_matches_direct_sum() {
        let signal = Grid3::from_fn([5, 6, 4], |[i, j, k]| ((i * 7 + j * 3 + k) % 5) as f64);
        let kernel = smooth_kernel();
        let fft = fft_convolve_same(&signal, &kernel).expect("odd kernel");
        let direct = direct_convolve_same(&signal, &kernel).expect("odd kernel");
        for (lhs, rhs) in fft.as_slice().iter().zip(direct.as_slice()) {
            assert!((lhs - rhs).abs() < 1.0e-10, "{lhs} vs {rhs}");
        }
    }

    #[test]
    fn fft_convolution_handles_prime_padded_lengths() {
        let signal = Grid3::from_fn([7, 3, 9], |[i, j, k]| ((i + 2 * j + 3 * k) % 4) as f64 - 1.0);
        let kernel = Grid3::from_fn([5, 3, 3], |[a, b, c]| 1.0 / (1.0 + (a + b * 2 + c) as f64));
        let fft = fft_convolve_same(&signal, &kernel).expect("odd kernel");
        let direct = direct_convolve_same(&signal, &kernel).expect("odd kernel");
        for (lhs, rhs) in fft.as_slice().iter().zip(direct.as_slice()) {
            assert!((lhs - rhs).abs() < 1.0e-10, "{lhs} vs {rhs}");
        }
    }

    #[test]
    fn kernel_mass_counts_only_taps_inside_the_grid() {
        let kernel = smooth_kernel();
        let mass = KernelMass::new(&kernel);
        assert!((mass.inside([5, 5, 5], [2, 2, 2]) - 1.0).abs() < 1.0e-12);
        let corner = mass.inside([5, 5, 5], [0, 0, 0]);
        let mut expected = 0.0;
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    expected += kernel[[a, b, c]];
                }
            }
        }
        assert!((corner - expected).abs() < 1.0e-12);
    }

    #[test]
    fn strided_convolution_is_exact_for_uniform_signal() {
        let signal = Grid3::filled([7, 7, 7], 2.0);
        let kernel = smooth_kernel();
        let exact = direct_convolve_same(&signal, &kernel).expect("odd kernel");
        let strided = strided_convolve_same(&signal, &kernel, 2).expect("odd kernel");
        for (lhs, rhs) in strided.as_slice().iter().zip(exact.as_slice()) {
            assert!((lhs - rhs).abs() < 1.0e-12);
        }
    }

    #[test]
    fn even_kernels_are_rejected() {
        let signal = Grid3::filled([4, 4, 4], 1.0);
        let kernel = Grid3::filled([2, 3, 3], 1.0);
        assert!(fft_convolve_same(&signal, &kernel).is_err());
        assert!(strided_convolve_same(&signal, &kernel, 2).is_err());
    }
}
