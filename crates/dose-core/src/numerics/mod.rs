pub mod convolution;

pub use convolution::{
    direct_convolve_at, direct_convolve_same, fft_convolve_same, strided_convolve_same,
};

use crate::domain::Grid3;

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;

    for value in values {
        kahan_add(&mut sum, &mut correction, value);
    }

    sum
}

/// Piecewise-linear lookup over strictly increasing knots, clamped at both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseLinear {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl PiecewiseLinear {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Option<Self> {
        if xs.len() < 2 || xs.len() != ys.len() {
            return None;
        }
        if xs.iter().chain(&ys).any(|value| !value.is_finite()) {
            return None;
        }
        if !xs.windows(2).all(|window| window[0] < window[1]) {
            return None;
        }
        Some(Self { xs, ys })
    }

    /// Skips validation; for compile-time tables known to be well formed.
    pub(crate) fn from_trusted(xs: Vec<f64>, ys: Vec<f64>) -> Self {
        debug_assert!(xs.len() >= 2 && xs.len() == ys.len());
        Self { xs, ys }
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Option<Self> {
        Self::new(
            pairs.iter().map(|pair| pair.0).collect(),
            pairs.iter().map(|pair| pair.1).collect(),
        )
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn eval(&self, x: f64) -> f64 {
        let last = self.xs.len() - 1;
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[last] {
            return self.ys[last];
        }
        let upper = self.xs.partition_point(|knot| *knot < x);
        let lower = upper - 1;
        let t = (x - self.xs[lower]) / (self.xs[upper] - self.xs[lower]);
        self.ys[lower] + t * (self.ys[upper] - self.ys[lower])
    }

    /// Inverse lookup; requires `ys` to be strictly increasing as well.
    pub fn inverse(&self) -> Option<Self> {
        Self::new(self.ys.clone(), self.xs.clone())
    }
}

pub fn linear_grid(start: f64, end: f64, count: usize) -> Option<Vec<f64>> {
    if count < 2 {
        return None;
    }

    let step = (end - start) / ((count - 1) as f64);
    let mut grid: Vec<f64> = (0..count).map(|index| start + step * index as f64).collect();
    if let Some(last) = grid.last_mut() {
        *last = end;
    }

    Some(grid)
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
pub fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, coefficient| acc * t + coefficient) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Fraction of a unit-height box `[lo, hi]` seen at `x` after Gaussian blur `sigma`.
pub fn blurred_box(x: f64, lo: f64, hi: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return if x >= lo && x <= hi { 1.0 } else { 0.0 };
    }
    let scale = std::f64::consts::SQRT_2 * sigma;
    (0.5 * (erf((hi - x) / scale) - erf((lo - x) / scale))).clamp(0.0, 1.0)
}

/// Trilinear sample at continuous voxel coordinates. `None` once the point
/// leaves the voxel extent `[-0.5, n - 0.5]` on any axis.
pub fn sample_trilinear(grid: &Grid3<f64>, position: [f64; 3]) -> Option<f64> {
    let shape = grid.shape();
    let mut lower = [0usize; 3];
    let mut fraction = [0.0; 3];
    for axis in 0..3 {
        let extent = shape[axis] as f64;
        let coordinate = position[axis];
        if coordinate < -0.5 || coordinate > extent - 0.5 {
            return None;
        }
        let clamped = coordinate.clamp(0.0, extent - 1.0);
        let base = (clamped.floor() as usize).min(shape[axis].saturating_sub(2));
        lower[axis] = base;
        fraction[axis] = if shape[axis] == 1 {
            0.0
        } else {
            clamped - base as f64
        };
    }

    let mut value = 0.0;
    for corner in 0..8 {
        let mut weight = 1.0;
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let upper = (corner >> axis) & 1 == 1;
            if upper {
                if shape[axis] == 1 {
                    weight = 0.0;
                    break;
                }
                weight *= fraction[axis];
                index[axis] = lower[axis] + 1;
            } else {
                weight *= 1.0 - fraction[axis];
                index[axis] = lower[axis];
            }
        }
        if weight > 0.0 {
            value += weight * grid[index];
        }
    }
    Some(value)
}

/// Dose received by at least `coverage` percent of `values` (D_coverage).
pub fn coverage_dose(values: &[f64], coverage: f64) -> Option<f64> {
    if values.is_empty() || !(coverage > 0.0 && coverage <= 100.0) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|lhs, rhs| rhs.total_cmp(lhs));
    let rank = ((coverage / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

#[cfg(test)]
mod tests {
    use super::{
        PiecewiseLinear, blurred_box, coverage_dose, erf, linear_grid, sample_trilinear,
        stable_sum,
    };
    use crate::domain::Grid3;

    #[test]
    fn stable_sum_reduces_order_loss_for_large_and_small_values() {
        assert_eq!(stable_sum([1.0e16, 1.0, -1.0e16]), 0.0);
    }

    #[test]
    fn piecewise_linear_clamps_and_interpolates() {
        let table = PiecewiseLinear::new(vec![0.0, 1.0, 2.0], vec![10.0, 20.0, 40.0])
            .expect("valid table");
        assert_eq!(table.eval(-1.0), 10.0);
        assert_eq!(table.eval(3.0), 40.0);
        assert_eq!(table.eval(0.5), 15.0);
        assert_eq!(table.eval(1.5), 30.0);
        assert_eq!(table.eval(1.0), 20.0);
    }

    #[test]
    fn piecewise_linear_rejects_unsorted_or_short_tables() {
        assert!(PiecewiseLinear::new(vec![0.0], vec![1.0]).is_none());
        assert!(PiecewiseLinear::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_none());
        assert!(PiecewiseLinear::new(vec![0.0, 1.0], vec![1.0]).is_none());
    }

    #[test]
    fn inverse_table_round_trips_monotone_data() {
        let table = PiecewiseLinear::new(vec![-1000.0, 0.0, 1000.0], vec![0.0, 1.0, 1.5])
            .expect("valid table");
        let inverse = table.inverse().expect("monotone table inverts");
        assert!((inverse.eval(table.eval(-250.0)) + 250.0).abs() < 1.0e-9);
    }

    #[test]
    fn linear_grid_is_inclusive_and_rejects_invalid_counts() {
        assert_eq!(linear_grid(0.0, 1.0, 1), None);
        assert_eq!(
            linear_grid(0.0, 2.0, 5).expect("grid"),
            vec![0.0, 0.5, 1.0, 1.5, 2.0]
        );
    }

    #[test]
    fn erf_matches_reference_values() {
        assert!(erf(0.0).abs() < 1.0e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 2.0e-7);
        assert!((erf(-0.5) + 0.520_499_88).abs() < 2.0e-7);
        assert!((erf(3.0) - 0.999_977_91).abs() < 2.0e-7);
    }

    #[test]
    fn blurred_box_is_half_at_the_edge() {
        assert!((blurred_box(5.0, -5.0, 5.0, 2.0) - 0.5).abs() < 1.0e-3);
        assert!(blurred_box(0.0, -50.0, 50.0, 2.0) > 0.999_999);
        assert_eq!(blurred_box(6.0, -5.0, 5.0, 0.0), 0.0);
    }

    #[test]
    fn trilinear_sampling_interpolates_and_rejects_outside_points() {
        let grid = Grid3::from_fn([2, 2, 2], |[i, j, k]| (i + 2 * j + 4 * k) as f64);
        let value = sample_trilinear(&grid, [0.5, 0.5, 0.5]).expect("inside");
        assert!((value - 3.5).abs() < 1.0e-12);
        assert_eq!(sample_trilinear(&grid, [1.0, 0.0, 1.0]), Some(5.0));
        assert_eq!(sample_trilinear(&grid, [1.4, 0.0, 0.0]), Some(1.0));
        assert_eq!(sample_trilinear(&grid, [1.6, 0.0, 0.0]), None);
    }

    #[test]
    fn coverage_dose_picks_the_minimum_of_the_covered_fraction() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(coverage_dose(&values, 95.0), Some(6.0));
        assert_eq!(coverage_dose(&values, 100.0), Some(1.0));
        assert_eq!(coverage_dose(&values, 0.5), Some(100.0));
        assert_eq!(coverage_dose(&[], 50.0), None);
    }
}
