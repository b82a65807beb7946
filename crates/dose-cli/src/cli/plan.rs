//! JSON plan files: a volume, beams, optional structures and options.

use byteorder::{LittleEndian, ReadBytesExt};
use dose_core::domain::validate_spacing;
use dose_core::{
    BeamRecord, DoseCalculator, DoseError, DoseResult, Grid3, MaterialModel, OptionsPatch,
    StructureMask, VolumeGrid, VolumeKind,
};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub volume: VolumeSource,
    #[serde(default)]
    pub beams: Vec<BeamRecord>,
    #[serde(default)]
    pub structures: Vec<StructureBoxes>,
    #[serde(default)]
    pub options: Option<OptionsPatch>,
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Two-column `hu density` table replacing the default calibration.
    #[serde(default)]
    pub material_table: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    Phantom(PhantomVolume),
    Raw(RawVolume),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhantomVolume {
    pub shape: [usize; 3],
    pub spacing: Vec<f64>,
    #[serde(default)]
    pub origin: [f64; 3],
    #[serde(default)]
    pub hu: f64,
    #[serde(default)]
    pub inserts: Vec<Insert>,
}

/// Half-open voxel box `[i0, i1, j0, j1, k0, k1]` filled with `hu`.
#[derive(Debug, Clone, Deserialize)]
pub struct Insert {
    #[serde(rename = "box")]
    pub bounds: [usize; 6],
    pub hu: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawDtype {
    I16,
    F32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVolume {
    pub path: PathBuf,
    pub shape: [usize; 3],
    pub spacing: Vec<f64>,
    pub dtype: RawDtype,
    #[serde(default)]
    pub kind: VolumeKind,
    /// World position of voxel `(0, 0, 0)` in mm.
    #[serde(default)]
    pub origin: [f64; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureBoxes {
    pub name: String,
    pub boxes: Vec<[usize; 6]>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse plan '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("raw volume '{}' holds {actual} bytes, shape {shape:?} needs {expected}", path.display())]
    RawSize {
        path: PathBuf,
        shape: [usize; 3],
        expected: u64,
        actual: u64,
    },
    #[error("box {bounds:?} of {owner} does not fit shape {shape:?}")]
    Box {
        owner: String,
        bounds: [usize; 6],
        shape: [usize; 3],
    },
}

impl From<PlanError> for DoseError {
    fn from(error: PlanError) -> Self {
        match &error {
            PlanError::Read { .. } => DoseError::io_system("IO.PLAN_READ", error.to_string()),
            PlanError::Parse { .. } => DoseError::validation("INPUT.PLAN_PARSE", error.to_string()),
            PlanError::RawSize { .. } => DoseError::validation("INPUT.RAW_VOLUME", error.to_string()),
            PlanError::Box { .. } => DoseError::validation("INPUT.PLAN_BOX", error.to_string()),
        }
    }
}

/// A parsed plan plus the directory relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub plan: PlanFile,
    pub base_dir: PathBuf,
}

pub fn load_plan(path: &Path) -> Result<LoadedPlan, PlanError> {
    let source = fs::read_to_string(path).map_err(|source| PlanError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let plan = serde_json::from_str(&source).map_err(|source| PlanError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(LoadedPlan { plan, base_dir })
}

impl LoadedPlan {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn volume(&self) -> DoseResult<VolumeGrid> {
        match &self.plan.volume {
            VolumeSource::Phantom(phantom) => {
                let mut values = Grid3::filled(phantom.shape, phantom.hu);
                for insert in &phantom.inserts {
                    let ranges = box_ranges(insert.bounds, phantom.shape, "phantom insert")?;
                    for_each_in_box(ranges, |index| values[index] = insert.hu);
                }
                Ok(VolumeGrid::new(values, &phantom.spacing, VolumeKind::Hounsfield)?
                    .with_origin(phantom.origin))
            }
            VolumeSource::Raw(raw) => {
                validate_spacing(&raw.spacing)?;
                let path = self.resolve(&raw.path);
                let values = read_raw(&path, raw.shape, raw.dtype)?;
                Ok(
                    VolumeGrid::new(Grid3::from_vec(raw.shape, values)?, &raw.spacing, raw.kind)?
                        .with_origin(raw.origin),
                )
            }
        }
    }

    pub fn material_model(&self) -> DoseResult<Option<MaterialModel>> {
        match &self.plan.material_table {
            Some(path) => Ok(Some(MaterialModel::from_table_file(self.resolve(path))?)),
            None => Ok(None),
        }
    }

    pub fn structures(&self, shape: [usize; 3]) -> DoseResult<Vec<(String, StructureMask)>> {
        self.plan
            .structures
            .iter()
            .map(|structure| {
                let mut mask = Grid3::filled(shape, false);
                for bounds in &structure.boxes {
                    let owner = format!("structure '{}'", structure.name);
                    let ranges = box_ranges(*bounds, shape, &owner)?;
                    for_each_in_box(ranges, |index| mask[index] = true);
                }
                Ok((structure.name.clone(), mask))
            })
            .collect()
    }

    /// Applies volume, material model, structures, options and beams in the
    /// order the calculator validates them.
    pub fn apply(&self, calculator: &mut DoseCalculator) -> DoseResult<()> {
        if let Some(model) = self.material_model()? {
            calculator.set_material_model(model);
        }
        let volume = self.volume()?;
        let shape = volume.shape();
        calculator.set_volume(volume);
        for (name, mask) in self.structures(shape)? {
            calculator.add_structure(name, mask)?;
        }
        if let Some(patch) = &self.plan.options {
            calculator.set_options(patch.clone())?;
        }
        for beam in &self.plan.beams {
            calculator.add_beam(beam.clone())?;
        }
        Ok(())
    }
}

type BoxRanges = [std::ops::Range<usize>; 3];

fn box_ranges(bounds: [usize; 6], shape: [usize; 3], owner: &str) -> Result<BoxRanges, PlanError> {
    let fits = (0..3).all(|axis| {
        let (lo, hi) = (bounds[2 * axis], bounds[2 * axis + 1]);
        lo <= hi && hi <= shape[axis]
    });
    if !fits {
        return Err(PlanError::Box {
            owner: owner.to_string(),
            bounds,
            shape,
        });
    }
    Ok([bounds[0]..bounds[1], bounds[2]..bounds[3], bounds[4]..bounds[5]])
}

fn for_each_in_box(ranges: BoxRanges, mut visit: impl FnMut([usize; 3])) {
    let [is, js, ks] = ranges;
    for i in is {
        for j in js.clone() {
            for k in ks.clone() {
                visit([i, j, k]);
            }
        }
    }
}

/// Little-endian voxel values in x-major order.
fn read_raw(path: &Path, shape: [usize; 3], dtype: RawDtype) -> Result<Vec<f64>, PlanError> {
    let read_error = |source| PlanError::Read {
        path: path.to_path_buf(),
        source,
    };
    let width = match dtype {
        RawDtype::I16 => 2,
        RawDtype::F32 => 4,
    };
    // An overflowing shape can never match a real file length.
    let count = shape[0].checked_mul(shape[1]).and_then(|count| count.checked_mul(shape[2]));
    let expected = count
        .and_then(|count| count.checked_mul(width))
        .map_or(u64::MAX, |bytes| bytes as u64);
    let actual = fs::metadata(path).map_err(read_error)?.len();
    if actual != expected {
        return Err(PlanError::RawSize {
            path: path.to_path_buf(),
            shape,
            expected,
            actual,
        });
    }

    let count = count.unwrap_or_default();
    let mut reader = BufReader::new(File::open(path).map_err(read_error)?);
    match dtype {
        RawDtype::I16 => {
            let mut values = vec![0i16; count];
            reader
                .read_i16_into::<LittleEndian>(&mut values)
                .map_err(read_error)?;
            Ok(values.into_iter().map(f64::from).collect())
        }
        RawDtype::F32 => {
            let mut values = vec![0f32; count];
            reader
                .read_f32_into::<LittleEndian>(&mut values)
                .map_err(read_error)?;
            Ok(values.into_iter().map(f64::from).collect())
        }
    }
}
