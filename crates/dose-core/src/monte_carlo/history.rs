//! Photon histories for one worker share.

use super::tally::{WorkerShare, WorkerTally};
use crate::domain::{BeamSpec, FieldAperture, Grid3};
use crate::geometry::{BeamFrame, Vec3, VoxelFrame, add, cross, normalize, scale, sub};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::f64::consts::PI;

const DIRECTION_JITTER_RAD: f64 = 0.01;
const COMPTON_ANGLE_SIGMA_RAD: f64 = 0.2;
const COMPTON_WEIGHT_FACTOR: f64 = 0.8;
const LOCAL_ABSORPTION_COMPTON: f64 = 0.2;
const WEIGHT_CUTOFF: f64 = 0.05;
const MLC_SAMPLING_ATTEMPTS: usize = 64;

/// Interaction data shared read-only by every worker of a beam.
#[derive(Debug, Clone, Copy)]
pub struct TransportMedium<'a> {
    pub frame: &'a VoxelFrame,
    pub attenuation: &'a Grid3<f64>,
    pub compton: &'a Grid3<f64>,
}

pub fn gaussian(rng: &mut Pcg64Mcg) -> f64 {
    let radius = (-2.0 * (1.0 - rng.r#gen::<f64>()).ln()).sqrt();
    radius * (2.0 * PI * rng.r#gen::<f64>()).cos()
}

/// Any unit vector orthogonal to `direction`.
fn orthogonal(direction: Vec3) -> Vec3 {
    let helper = if direction[0].abs() < 0.9 {
        [1.0, 0.0, 0.0]
    } else {
        [0.0, 1.0, 0.0]
    };
    normalize(cross(direction, helper)).unwrap_or([0.0, 0.0, 1.0])
}

fn deflect(direction: Vec3, polar: f64, azimuth: f64) -> Vec3 {
    let first = orthogonal(direction);
    let second = cross(direction, first);
    let (polar_sin, polar_cos) = polar.sin_cos();
    let (azimuth_sin, azimuth_cos) = azimuth.sin_cos();
    let turned = add(
        scale(direction, polar_cos),
        scale(
            add(scale(first, azimuth_cos), scale(second, azimuth_sin)),
            polar_sin,
        ),
    );
    normalize(turned).unwrap_or(direction)
}

/// Uniform point inside the aperture at the isocenter plane, as `(u, v)`.
fn sample_aperture(aperture: &FieldAperture, rng: &mut Pcg64Mcg) -> Option<(f64, f64)> {
    let (u_min, u_max) = aperture.u_extent();
    let (v_min, v_max) = aperture.v_extent();
    let draw = |rng: &mut Pcg64Mcg| {
        (
            u_min + (u_max - u_min) * rng.r#gen::<f64>(),
            v_min + (v_max - v_min) * rng.r#gen::<f64>(),
        )
    };
    match aperture {
        FieldAperture::Rectangular { .. } => Some(draw(rng)),
        FieldAperture::Mlc(_) => (0..MLC_SAMPLING_ATTEMPTS)
            .map(|_| draw(rng))
            .find(|(u, v)| aperture.contains(*u, *v)),
    }
}

/// Distance along `direction` to the nearest face of `voxel`.
fn distance_to_boundary(frame: &VoxelFrame, voxel: [usize; 3], position: Vec3, direction: Vec3) -> f64 {
    let mut distance = f64::INFINITY;
    for axis in 0..3 {
        let centre = frame.origin[axis] + voxel[axis] as f64 * frame.spacing[axis];
        let face = if direction[axis] > 1.0e-15 {
            centre + 0.5 * frame.spacing[axis]
        } else if direction[axis] < -1.0e-15 {
            centre - 0.5 * frame.spacing[axis]
        } else {
            continue;
        };
        distance = distance.min(((face - position[axis]) / direction[axis]).max(0.0));
    }
    distance
}

struct HistoryScratch {
    score: Vec<f64>,
    touched: Vec<usize>,
}

impl HistoryScratch {
    fn deposit(&mut self, flat: usize, energy: f64) {
        if energy <= 0.0 {
            return;
        }
        if self.score[flat] == 0.0 {
            self.touched.push(flat);
        }
        self.score[flat] += energy;
    }

    fn flush(&mut self, tally: &mut WorkerTally) {
        for flat in self.touched.drain(..) {
            let score = self.score[flat];
            tally.sum[flat] += score;
            tally.sum_sq[flat] += score * score;
            self.score[flat] = 0.0;
        }
    }
}

/// Simulates every history of `share` with its own random stream.
pub fn simulate_share(
    medium: &TransportMedium<'_>,
    beam: &BeamSpec,
    beam_frame: &BeamFrame,
    share: WorkerShare,
) -> WorkerTally {
    let len = medium.attenuation.len();
    let mut rng = Pcg64Mcg::seed_from_u64(share.seed);
    let mut tally = WorkerTally::new(share.worker_index, len);
    let mut scratch = HistoryScratch {
        score: vec![0.0; len],
        touched: Vec::new(),
    };
    let shape = medium.frame.shape;
    let max_steps = 64 * (shape[0] + shape[1] + shape[2]);
    let nudge = 1.0e-6 * medium.frame.min_spacing();

    for _ in 0..share.histories {
        tally.histories += 1;
        let Some((u, v)) = sample_aperture(beam.aperture(), &mut rng) else {
            continue;
        };
        let target = beam_frame.isocenter_plane_point(u, v);
        let Some(aimed) = normalize(sub(target, beam_frame.source)) else {
            continue;
        };
        let jitter_u = DIRECTION_JITTER_RAD * gaussian(&mut rng);
        let jitter_v = DIRECTION_JITTER_RAD * gaussian(&mut rng);
        let Some(mut direction) = normalize(add(
            aimed,
            add(
                scale(beam_frame.u_axis, jitter_u),
                scale(beam_frame.v_axis, jitter_v),
            ),
        )) else {
            continue;
        };
        let Some((enter, _)) = medium.frame.ray_box(beam_frame.source, direction) else {
            continue;
        };
        let mut position = add(beam_frame.source, scale(direction, enter.max(0.0) + nudge));
        let mut weight = beam.fluence_modifier(u, v);

        for _ in 0..max_steps {
            if weight < WEIGHT_CUTOFF {
                break;
            }
            let Some(voxel) = medium.frame.voxel_containing(position) else {
                break;
            };
            let flat = medium.attenuation.flat_index(voxel);
            let step = distance_to_boundary(medium.frame, voxel, position, direction) + nudge;
            let mu = medium.attenuation.as_slice()[flat];
            let compton = medium.compton.as_slice()[flat];
            let interaction = 1.0 - (-mu * step).exp();
            scratch.deposit(
                flat,
                weight * interaction * (1.0 - compton + LOCAL_ABSORPTION_COMPTON * compton),
            );
            position = add(position, scale(direction, step));

            if rng.r#gen::<f64>() < interaction {
                if rng.r#gen::<f64>() < compton {
                    weight *= COMPTON_WEIGHT_FACTOR;
                    let polar = COMPTON_ANGLE_SIGMA_RAD * gaussian(&mut rng);
                    let azimuth = 2.0 * PI * rng.r#gen::<f64>();
                    direction = deflect(direction, polar, azimuth);
                } else {
                    break;
                }
            }
        }
        scratch.flush(&mut tally);
    }
    tally
}
