pub const DEFAULT_SAD_MM: f64 = 1000.0;
pub const DEFAULT_FIELD_SIZE_MM: f64 = 100.0;

/// Input floors that keep control-point and ray-step counts bounded.
pub const MIN_ARC_SPACING_DEG: f64 = 0.1;
pub const MIN_RESOLUTION_MM: f64 = 0.01;

/// Relative electron density below which a sample counts as outside the body.
pub const BODY_DENSITY_THRESHOLD: f64 = 0.1;

/// Guard for divisions by depths, distances and reference doses.
pub const EPSILON: f64 = 1.0e-9;

pub const REFERENCE_ENERGY_MV: f64 = 6.0;

pub const DEFAULT_KERNEL_SIZE: usize = 15;
pub const DEFAULT_CONVOLUTION_STRIDE: usize = 2;
pub const DEFAULT_MAX_ITERATIONS: usize = 200;
pub const DEFAULT_CONVERGENCE_EPSILON: f64 = 1.0e-4;
pub const DEFAULT_NUM_PARTICLES: usize = 100_000;
pub const DEFAULT_SEED: u64 = 12_345;
