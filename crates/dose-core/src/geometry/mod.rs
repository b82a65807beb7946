//! Beam and voxel coordinate systems.
//!
//! World axes follow the voxel axes. Gantry 0 points the beam along +y, the
//! gantry turns in the x-y plane and the couch turns the gantry plane about y.

pub mod ray;

pub use ray::{RayDepths, RayTracer};

use crate::domain::{BeamSpec, VolumeGrid};

pub type Vec3 = [f64; 3];

pub fn add(lhs: Vec3, rhs: Vec3) -> Vec3 {
    [lhs[0] + rhs[0], lhs[1] + rhs[1], lhs[2] + rhs[2]]
}

pub fn sub(lhs: Vec3, rhs: Vec3) -> Vec3 {
    [lhs[0] - rhs[0], lhs[1] - rhs[1], lhs[2] - rhs[2]]
}

pub fn scale(vector: Vec3, factor: f64) -> Vec3 {
    [vector[0] * factor, vector[1] * factor, vector[2] * factor]
}

pub fn dot(lhs: Vec3, rhs: Vec3) -> f64 {
    lhs[0] * rhs[0] + lhs[1] * rhs[1] + lhs[2] * rhs[2]
}

pub fn cross(lhs: Vec3, rhs: Vec3) -> Vec3 {
    [
        lhs[1] * rhs[2] - lhs[2] * rhs[1],
        lhs[2] * rhs[0] - lhs[0] * rhs[2],
        lhs[0] * rhs[1] - lhs[1] * rhs[0],
    ]
}

pub fn norm(vector: Vec3) -> f64 {
    dot(vector, vector).sqrt()
}

pub fn normalize(vector: Vec3) -> Option<Vec3> {
    let length = norm(vector);
    (length > 0.0 && length.is_finite()).then(|| scale(vector, 1.0 / length))
}

/// Unit beam axis from source towards isocenter.
pub fn beam_direction(gantry_deg: f64, couch_deg: f64) -> Vec3 {
    let (gantry_sin, gantry_cos) = gantry_deg.to_radians().sin_cos();
    let (couch_sin, couch_cos) = couch_deg.to_radians().sin_cos();
    [gantry_sin * couch_cos, gantry_cos, gantry_sin * couch_sin]
}

pub fn source_position(isocenter: Vec3, sad_mm: f64, direction: Vec3) -> Vec3 {
    sub(isocenter, scale(direction, sad_mm))
}

/// Signed depth of `point` along `direction` from `source`, and the distance
/// from the axis.
pub fn project(point: Vec3, source: Vec3, direction: Vec3) -> (f64, f64) {
    let relative = sub(point, source);
    let depth = dot(relative, direction);
    let lateral = norm(sub(relative, scale(direction, depth)));
    (depth, lateral)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPoint {
    /// Distance from the source along the beam axis.
    pub axial: f64,
    /// Field x / y offsets at the point's own distance.
    pub u: f64,
    pub v: f64,
}

impl FieldPoint {
    /// Offsets scaled back to the isocenter plane.
    pub fn at_isocenter_plane(&self, sad_mm: f64) -> (f64, f64) {
        let magnification = sad_mm / self.axial.max(f64::MIN_POSITIVE);
        (self.u * magnification, self.v * magnification)
    }
}

/// Beam eye view: source, axis and the collimator-rotated field axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamFrame {
    pub isocenter: Vec3,
    pub source: Vec3,
    pub direction: Vec3,
    pub u_axis: Vec3,
    pub v_axis: Vec3,
    pub sad_mm: f64,
}

impl BeamFrame {
    pub fn new(beam: &BeamSpec, default_isocenter: Vec3) -> Self {
        let isocenter = beam.isocenter().unwrap_or(default_isocenter);
        let direction = beam_direction(beam.gantry_deg(), beam.couch_deg());
        let (couch_sin, couch_cos) = beam.couch_deg().to_radians().sin_cos();
        let v_base = [-couch_sin, 0.0, couch_cos];
        let u_base = cross(direction, v_base);
        let (collimator_sin, collimator_cos) = beam.collimator_deg().to_radians().sin_cos();
        Self {
            isocenter,
            source: source_position(isocenter, beam.sad_mm(), direction),
            direction,
            u_axis: add(scale(u_base, collimator_cos), scale(v_base, collimator_sin)),
            v_axis: sub(scale(v_base, collimator_cos), scale(u_base, collimator_sin)),
            sad_mm: beam.sad_mm(),
        }
    }

    /// Same frame with source and isocenter moved `offset` mm along the axis.
    pub fn shifted_along_axis(&self, offset: f64) -> Self {
        let shift = scale(self.direction, offset);
        Self {
            isocenter: add(self.isocenter, shift),
            source: add(self.source, shift),
            ..*self
        }
    }

    pub fn field_point(&self, point: Vec3) -> FieldPoint {
        let relative = sub(point, self.source);
        FieldPoint {
            axial: dot(relative, self.direction),
            u: dot(relative, self.u_axis),
            v: dot(relative, self.v_axis),
        }
    }

    /// Point at isocenter-plane field coordinates `(u, v)`.
    pub fn isocenter_plane_point(&self, u: f64, v: f64) -> Vec3 {
        add(
            self.isocenter,
            add(scale(self.u_axis, u), scale(self.v_axis, v)),
        )
    }

    pub fn inverse_square(&self, axial: f64) -> f64 {
        let distance = axial.max(crate::common::constants::EPSILON);
        (self.sad_mm / distance).powi(2)
    }
}

/// Mapping between voxel indices and world millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelFrame {
    pub shape: [usize; 3],
    pub spacing: Vec3,
    pub origin: Vec3,
}

impl VoxelFrame {
    pub fn of(volume: &VolumeGrid) -> Self {
        Self {
            shape: volume.shape(),
            spacing: volume.spacing(),
            origin: volume.origin(),
        }
    }

    pub fn position(&self, index: [usize; 3]) -> Vec3 {
        [
            self.origin[0] + index[0] as f64 * self.spacing[0],
            self.origin[1] + index[1] as f64 * self.spacing[1],
            self.origin[2] + index[2] as f64 * self.spacing[2],
        ]
    }

    /// Continuous voxel coordinates; voxel centres sit on integers.
    pub fn continuous_index(&self, point: Vec3) -> Vec3 {
        [
            (point[0] - self.origin[0]) / self.spacing[0],
            (point[1] - self.origin[1]) / self.spacing[1],
            (point[2] - self.origin[2]) / self.spacing[2],
        ]
    }

    pub fn voxel_containing(&self, point: Vec3) -> Option<[usize; 3]> {
        let continuous = self.continuous_index(point);
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let rounded = (continuous[axis] + 0.5).floor();
            if rounded < 0.0 || rounded >= self.shape[axis] as f64 {
                return None;
            }
            index[axis] = rounded as usize;
        }
        Some(index)
    }

    pub fn geometric_center(&self) -> Vec3 {
        [
            self.origin[0] + 0.5 * (self.shape[0] as f64 - 1.0) * self.spacing[0],
            self.origin[1] + 0.5 * (self.shape[1] as f64 - 1.0) * self.spacing[1],
            self.origin[2] + 0.5 * (self.shape[2] as f64 - 1.0) * self.spacing[2],
        ]
    }

    /// Outer faces of the voxel box.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        let mut lower = [0.0; 3];
        let mut upper = [0.0; 3];
        for axis in 0..3 {
            lower[axis] = self.origin[axis] - 0.5 * self.spacing[axis];
            upper[axis] = self.origin[axis] + (self.shape[axis] as f64 - 0.5) * self.spacing[axis];
        }
        (lower, upper)
    }

    pub fn min_spacing(&self) -> f64 {
        self.spacing.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Slab intersection of the ray `start + t * direction` with the box.
    pub fn ray_box(&self, start: Vec3, direction: Vec3) -> Option<(f64, f64)> {
        let (lower, upper) = self.bounds();
        let mut enter = f64::NEG_INFINITY;
        let mut exit = f64::INFINITY;
        for axis in 0..3 {
            if direction[axis].abs() < 1.0e-15 {
                if start[axis] < lower[axis] || start[axis] > upper[axis] {
                    return None;
                }
                continue;
            }
            let t_lower = (lower[axis] - start[axis]) / direction[axis];
            let t_upper = (upper[axis] - start[axis]) / direction[axis];
            enter = enter.max(t_lower.min(t_upper));
            exit = exit.min(t_lower.max(t_upper));
        }
        (enter <= exit).then_some((enter, exit))
    }
}
