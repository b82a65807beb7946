use super::{Vec3, VoxelFrame, add, dot, norm, scale, sub};
use crate::common::constants::BODY_DENSITY_THRESHOLD;
use crate::domain::Grid3;

/// In-body path lengths from the source to a point, projected onto the
/// central beam axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RayDepths {
    pub geometric: f64,
    pub radiological: f64,
}

/// Fixed-step ray marcher over a relative-density grid.
#[derive(Debug, Clone, Copy)]
pub struct RayTracer<'a> {
    frame: &'a VoxelFrame,
    density: &'a Grid3<f64>,
    step_mm: f64,
}

impl<'a> RayTracer<'a> {
    pub fn new(frame: &'a VoxelFrame, density: &'a Grid3<f64>, step_mm: Option<f64>) -> Self {
        Self {
            frame,
            density,
            step_mm: step_mm.unwrap_or_else(|| 0.5 * frame.min_spacing()),
        }
    }

    pub const fn step_mm(&self) -> f64 {
        self.step_mm
    }

    /// Nearest-voxel density; samples outside the grid read as vacuum.
    pub fn density_at(&self, point: Vec3) -> f64 {
        self.frame
            .voxel_containing(point)
            .map_or(0.0, |index| self.density[index])
    }

    /// Distance from `source` along the unit `direction` to the first
    /// in-body step, resolved to the march step.
    pub fn surface_distance(&self, source: Vec3, direction: Vec3) -> Option<f64> {
        let (enter, exit) = self.frame.ray_box(source, direction)?;
        let start = enter.max(0.0);
        if exit <= start {
            return None;
        }
        let steps = ((exit - start) / self.step_mm).ceil().max(1.0) as usize;
        let step = (exit - start) / steps as f64;
        (0..steps)
            .map(|index| start + index as f64 * step)
            .find(|t| {
                self.density_at(add(source, scale(direction, t + 0.5 * step)))
                    >= BODY_DENSITY_THRESHOLD
            })
    }

    pub fn trace(&self, source: Vec3, point: Vec3, axis: Vec3) -> RayDepths {
        let path = sub(point, source);
        let length = norm(path);
        if length <= 0.0 {
            return RayDepths::default();
        }
        let direction = scale(path, 1.0 / length);
        let Some((enter, exit)) = self.frame.ray_box(source, direction) else {
            return RayDepths::default();
        };
        let start = enter.max(0.0);
        let end = exit.min(length);
        if end <= start {
            return RayDepths::default();
        }

        let steps = ((end - start) / self.step_mm).ceil().max(1.0) as usize;
        let step = (end - start) / steps as f64;
        let mut depths = RayDepths::default();
        for index in 0..steps {
            let t = start + (index as f64 + 0.5) * step;
            let density = self.density_at(add(source, scale(direction, t)));
            if density >= BODY_DENSITY_THRESHOLD {
                depths.geometric += step;
                depths.radiological += step * density;
            }
        }

        let cosine = (dot(path, axis) / length).clamp(0.0, 1.0);
        depths.geometric *= cosine;
        depths.radiological *= cosine;
        depths
    }
}

#[cfg(test)]
mod tests {
    use super::RayTracer;
    use crate::domain::Grid3;
    use crate::geometry::VoxelFrame;

    fn slab_frame() -> VoxelFrame {
        VoxelFrame {
            shape: [3, 20, 3],
            spacing: [5.0, 2.0, 5.0],
            origin: [0.0, 0.0, 0.0],
        }
    }

    #[test]
    fn water_depth_counts_from_the_entrance_face() {
        let frame = slab_frame();
        let density = Grid3::filled(frame.shape, 1.0);
        let tracer = RayTracer::new(&frame, &density, None);
        let point = frame.position([1, 4, 1]);
        let source = [point[0], -1000.0, point[2]];
        let depths = tracer.trace(source, point, [0.0, 1.0, 0.0]);
        assert!((depths.geometric - 9.0).abs() < 1.0e-9);
        assert!((depths.radiological - 9.0).abs() < 1.0e-9);
    }

    #[test]
    fn air_gap_is_excluded_and_dense_layers_weigh_more() {
        let frame = slab_frame();
        let density = Grid3::from_fn(frame.shape, |[_, j, _]| match j {
            0..=4 => 0.001,
            5..=9 => 2.0,
            _ => 1.0,
        });
        let tracer = RayTracer::new(&frame, &density, None);
        let point = frame.position([1, 12, 1]);
        let source = [point[0], -1000.0, point[2]];
        let depths = tracer.trace(source, point, [0.0, 1.0, 0.0]);
        assert!((depths.geometric - 15.0).abs() < 1.0e-9);
        assert!((depths.radiological - 25.0).abs() < 1.0e-9);
    }

    #[test]
    fn surface_is_found_past_the_air_gap() {
        let frame = slab_frame();
        let density = Grid3::from_fn(frame.shape, |[_, j, _]| if j < 6 { 0.0 } else { 1.0 });
        let tracer = RayTracer::new(&frame, &density, Some(0.5));
        let source = [5.0, -1000.0, 5.0];
        let surface = tracer
            .surface_distance(source, [0.0, 1.0, 0.0])
            .expect("slab should be hit");
        assert!((surface - 1011.0).abs() < 1.0e-9, "{surface}");

        let empty = Grid3::filled(frame.shape, 0.0);
        let tracer = RayTracer::new(&frame, &empty, None);
        assert_eq!(tracer.surface_distance(source, [0.0, 1.0, 0.0]), None);
    }

    #[test]
    fn oblique_rays_are_projected_onto_the_axis() {
        let frame = slab_frame();
        let density = Grid3::filled(frame.shape, 1.0);
        let tracer = RayTracer::new(&frame, &density, Some(0.1));
        let point = frame.position([2, 10, 1]);
        let source = [point[0] - 100.0, -1000.0, point[2]];
        let depths = tracer.trace(source, point, [0.0, 1.0, 0.0]);
        assert!((depths.geometric - 21.0).abs() < 0.2, "{depths:?}");
    }
}
