use super::errors::{DoseError, DoseResult};
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// Dense voxel container in x-major order: `index = (i * ny + j) * nz + k`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid3<T> {
    shape: [usize; 3],
    data: Vec<T>,
}

pub type DoseGrid = Grid3<f64>;
pub type StructureMask = Grid3<bool>;

impl<T> Grid3<T> {
    pub fn from_vec(shape: [usize; 3], data: Vec<T>) -> DoseResult<Self> {
        if shape.contains(&0) {
            return Err(DoseError::validation(
                "INPUT.GRID_EMPTY_AXIS",
                format!("grid shape {shape:?} has an empty axis"),
            ));
        }
        let expected = shape[0] * shape[1] * shape[2];
        if data.len() != expected {
            return Err(DoseError::validation(
                "INPUT.GRID_SIZE_MISMATCH",
                format!(
                    "grid shape {shape:?} needs {expected} values, got {}",
                    data.len()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn from_fn(shape: [usize; 3], mut value: impl FnMut([usize; 3]) -> T) -> Self {
        let len = shape[0] * shape[1] * shape[2];
        let mut data = Vec::with_capacity(len);
        for i in 0..shape[0] {
            for j in 0..shape[1] {
                for k in 0..shape[2] {
                    data.push(value([i, j, k]));
                }
            }
        }
        Self { shape, data }
    }

    pub const fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn flat_index(&self, index: [usize; 3]) -> usize {
        (index[0] * self.shape[1] + index[1]) * self.shape[2] + index[2]
    }

    pub fn coords(&self, flat: usize) -> [usize; 3] {
        let k = flat % self.shape[2];
        let rest = flat / self.shape[2];
        [rest / self.shape[1], rest % self.shape[1], k]
    }

    pub fn contains(&self, index: [usize; 3]) -> bool {
        index[0] < self.shape[0] && index[1] < self.shape[1] && index[2] < self.shape[2]
    }

    pub fn get(&self, index: [usize; 3]) -> Option<&T> {
        self.contains(index)
            .then(|| &self.data[self.flat_index(index)])
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid3<U> {
        Grid3 {
            shape: self.shape,
            data: self.data.iter().map(f).collect(),
        }
    }

    pub fn ensure_shape(&self, expected: [usize; 3], what: &str) -> DoseResult<()> {
        if self.shape != expected {
            return Err(DoseError::validation(
                "INPUT.SHAPE_MISMATCH",
                format!(
                    "{what} shape {:?} does not match volume shape {expected:?}",
                    self.shape
                ),
            ));
        }
        Ok(())
    }
}

impl<T: Clone> Grid3<T> {
    pub fn filled(shape: [usize; 3], value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape[0] * shape[1] * shape[2]],
        }
    }
}

impl Grid3<f64> {
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Adds `weight * other` voxel by voxel.
    pub fn accumulate(&mut self, other: &Grid3<f64>, weight: f64) -> DoseResult<()> {
        if other.shape != self.shape {
            return Err(DoseError::internal(
                "SYS.ACCUMULATE_SHAPE",
                format!(
                    "cannot accumulate grid {:?} into grid {:?}",
                    other.shape, self.shape
                ),
            ));
        }
        for (target, value) in self.data.iter_mut().zip(&other.data) {
            *target += weight * value;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        for value in &mut self.data {
            *value *= factor;
        }
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().copied().fold(0.0, f64::max)
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|value| value.is_finite())
    }
}

impl<T> Index<[usize; 3]> for Grid3<T> {
    type Output = T;

    fn index(&self, index: [usize; 3]) -> &T {
        &self.data[self.flat_index(index)]
    }
}

impl<T> IndexMut<[usize; 3]> for Grid3<T> {
    fn index_mut(&mut self, index: [usize; 3]) -> &mut T {
        let flat = self.flat_index(index);
        &mut self.data[flat]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    #[default]
    Hounsfield,
    #[serde(alias = "density")]
    RelativeDensity,
}

/// CT-derived input volume. Voxel `(0, 0, 0)` is centred on `origin`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGrid {
    values: Grid3<f64>,
    spacing: [f64; 3],
    origin: [f64; 3],
    kind: VolumeKind,
}

impl VolumeGrid {
    pub fn new(values: Grid3<f64>, spacing: &[f64], kind: VolumeKind) -> DoseResult<Self> {
        let spacing = validate_spacing(spacing)?;
        if values.shape().contains(&0) {
            return Err(DoseError::validation(
                "INPUT.EMPTY_VOLUME",
                format!("volume shape {:?} has a zero-length axis", values.shape()),
            ));
        }
        if let Some(position) = values.as_slice().iter().position(|value| !value.is_finite()) {
            return Err(DoseError::validation(
                "INPUT.VOLUME_NON_FINITE",
                format!(
                    "volume value at voxel {:?} is not finite",
                    values.coords(position)
                ),
            ));
        }
        Ok(Self {
            values,
            spacing,
            origin: [0.0; 3],
            kind,
        })
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn values(&self) -> &Grid3<f64> {
        &self.values
    }

    pub const fn shape(&self) -> [usize; 3] {
        self.values.shape()
    }

    pub const fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub const fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub const fn kind(&self) -> VolumeKind {
        self.kind
    }
}

pub fn validate_spacing(spacing: &[f64]) -> DoseResult<[f64; 3]> {
    let [x, y, z] = spacing else {
        return Err(DoseError::validation(
            "INPUT.SPACING_ARITY",
            format!("spacing needs exactly 3 entries, got {}", spacing.len()),
        ));
    };
    let spacing = [*x, *y, *z];
    if spacing.iter().any(|value| !value.is_finite() || *value <= 0.0) {
        return Err(DoseError::validation(
            "INPUT.SPACING_NON_POSITIVE",
            format!("spacing entries must be positive and finite, got {spacing:?}"),
        ));
    }
    Ok(spacing)
}
