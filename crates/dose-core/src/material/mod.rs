//! Hounsfield-unit calibration shared by every algorithm.

use crate::common::constants::REFERENCE_ENERGY_MV;
use crate::domain::{DoseError, DoseResult, Grid3, VolumeGrid, VolumeKind};
use crate::numerics::PiecewiseLinear;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_DENSITY_TABLE: [(f64, f64); 11] = [
    (-1000.0, 0.001),
    (-950.0, 0.05),
    (-700.0, 0.25),
    (-300.0, 0.6),
    (-100.0, 0.92),
    (0.0, 1.0),
    (200.0, 1.07),
    (800.0, 1.3),
    (1500.0, 1.6),
    (2000.0, 1.8),
    (3000.0, 2.0),
];

/// Relative electron density knots for the interaction tables below.
const INTERACTION_DENSITIES: [f64; 11] = [0.001, 0.05, 0.25, 0.6, 0.92, 1.0, 1.07, 1.3, 1.6, 1.8, 2.0];
/// Linear attenuation at 6 MV, 1/mm.
const ATTENUATION_PER_MM: [f64; 11] = [
    0.000_004, 0.0019, 0.0019, 0.003, 0.003, 0.004, 0.0043, 0.005, 0.006, 0.007, 0.008,
];
const COMPTON_FRACTION: [f64; 11] = [0.9999, 0.99, 0.98, 0.97, 0.95, 0.95, 0.93, 0.9, 0.85, 0.8, 0.7];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MaterialClass {
    Air,
    Lung,
    SoftTissue,
    Bone,
    Metal,
}

impl MaterialClass {
    pub const ALL: [Self; 5] = [
        Self::Air,
        Self::Lung,
        Self::SoftTissue,
        Self::Bone,
        Self::Metal,
    ];

    /// Buckets: air < -900 <= lung < -400 <= soft < 200 <= bone < 1200 <= metal.
    pub fn from_hounsfield(hu: f64) -> Self {
        if hu < -900.0 {
            Self::Air
        } else if hu < -400.0 {
            Self::Lung
        } else if hu < 200.0 {
            Self::SoftTissue
        } else if hu < 1200.0 {
            Self::Bone
        } else {
            Self::Metal
        }
    }

    pub const fn dose_conversion(self) -> f64 {
        match self {
            Self::Air => 0.0,
            Self::Lung => 0.8,
            Self::SoftTissue => 1.0,
            Self::Bone => 1.1,
            Self::Metal => 0.9,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Air => "air",
            Self::Lung => "lung",
            Self::SoftTissue => "soft_tissue",
            Self::Bone => "bone",
            Self::Metal => "metal",
        }
    }
}

impl Display for MaterialClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MaterialTableError {
    #[error("failed to read calibration table '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("calibration table '{}' line {line}: expected 'hu density', got '{content}'", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("calibration table is invalid: {reason}")]
    Invalid { reason: String },
}

impl From<MaterialTableError> for DoseError {
    fn from(error: MaterialTableError) -> Self {
        match &error {
            MaterialTableError::Read { .. } => {
                DoseError::io_system("IO.CALIBRATION_READ", error.to_string())
            }
            _ => DoseError::validation("INPUT.CALIBRATION_TABLE", error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialModel {
    density: PiecewiseLinear,
    hounsfield: PiecewiseLinear,
    attenuation: PiecewiseLinear,
    compton: PiecewiseLinear,
}

impl Default for MaterialModel {
    fn default() -> Self {
        let (hu, density): (Vec<f64>, Vec<f64>) = DEFAULT_DENSITY_TABLE.iter().copied().unzip();
        Self {
            density: PiecewiseLinear::from_trusted(hu.clone(), density.clone()),
            hounsfield: PiecewiseLinear::from_trusted(density, hu),
            attenuation: PiecewiseLinear::from_trusted(
                INTERACTION_DENSITIES.to_vec(),
                ATTENUATION_PER_MM.to_vec(),
            ),
            compton: PiecewiseLinear::from_trusted(
                INTERACTION_DENSITIES.to_vec(),
                COMPTON_FRACTION.to_vec(),
            ),
        }
    }
}

impl MaterialModel {
    /// Builds a model from `(hu, relative electron density)` breakpoints.
    /// Both columns must be strictly increasing.
    pub fn from_density_pairs(pairs: &[(f64, f64)]) -> Result<Self, MaterialTableError> {
        let density = PiecewiseLinear::from_pairs(pairs).ok_or_else(|| MaterialTableError::Invalid {
            reason: "need at least two finite rows with strictly increasing HU".to_string(),
        })?;
        if density.ys().iter().any(|value| *value <= 0.0) {
            return Err(MaterialTableError::Invalid {
                reason: "relative density must be positive".to_string(),
            });
        }
        let hounsfield = density.inverse().ok_or_else(|| MaterialTableError::Invalid {
            reason: "relative density must increase strictly with HU".to_string(),
        })?;
        let defaults = Self::default();
        Ok(Self {
            density,
            hounsfield,
            ..defaults
        })
    }

    /// Reads a whitespace-separated `hu density` table; `#` starts a comment.
    pub fn from_table_file(path: impl AsRef<Path>) -> Result<Self, MaterialTableError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| MaterialTableError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut pairs = Vec::new();
        for (line_index, line) in source.lines().enumerate() {
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let parse_error = || MaterialTableError::Parse {
                path: path.to_path_buf(),
                line: line_index + 1,
                content: content.to_string(),
            };
            let mut fields = content.split_whitespace();
            let (Some(hu), Some(density), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(parse_error());
            };
            let hu = hu.parse::<f64>().map_err(|_| parse_error())?;
            let density = density.parse::<f64>().map_err(|_| parse_error())?;
            pairs.push((hu, density));
        }
        Self::from_density_pairs(&pairs)
    }

    pub fn density_table(&self) -> Vec<(f64, f64)> {
        self.density
            .xs()
            .iter()
            .copied()
            .zip(self.density.ys().iter().copied())
            .collect()
    }

    pub fn relative_density(&self, hu: f64) -> f64 {
        self.density.eval(hu)
    }

    pub fn hounsfield_for_density(&self, density: f64) -> f64 {
        self.hounsfield.eval(density)
    }

    /// Linear attenuation in 1/mm, scaled from 6 MV by `6 / energy`
    /// (factor clamped to `[0.25, 4]`).
    pub fn attenuation_per_mm(&self, density: f64, energy: f64) -> f64 {
        let scale = (REFERENCE_ENERGY_MV / energy.max(f64::MIN_POSITIVE)).clamp(0.25, 4.0);
        self.attenuation.eval(density) * scale
    }

    pub fn compton_fraction(&self, density: f64) -> f64 {
        self.compton.eval(density)
    }

    pub fn classify(&self, hu: f64) -> MaterialClass {
        MaterialClass::from_hounsfield(hu)
    }
}

/// Per-voxel derived material data, computed once per calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialGrid {
    classes: Grid3<MaterialClass>,
    density: Grid3<f64>,
}

impl MaterialGrid {
    pub fn build(volume: &VolumeGrid, model: &MaterialModel) -> Self {
        let values = volume.values();
        let (classes, density) = match volume.kind() {
            VolumeKind::Hounsfield => (
                values.map(|hu| model.classify(*hu)),
                values.map(|hu| model.relative_density(*hu)),
            ),
            VolumeKind::RelativeDensity => (
                values.map(|density| model.classify(model.hounsfield_for_density(*density))),
                values.map(|density| density.max(0.0)),
            ),
        };
        Self { classes, density }
    }

    pub const fn shape(&self) -> [usize; 3] {
        self.classes.shape()
    }

    pub fn classes(&self) -> &Grid3<MaterialClass> {
        &self.classes
    }

    pub fn density(&self) -> &Grid3<f64> {
        &self.density
    }

    pub fn ensure_matches(&self, volume: &VolumeGrid) -> DoseResult<()> {
        if self.classes.shape() != volume.shape() || self.density.shape() != volume.shape() {
            return Err(DoseError::calculation(
                "RUN.MATERIAL_SHAPE",
                format!(
                    "material grid shape {:?} does not match volume shape {:?}",
                    self.classes.shape(),
                    volume.shape()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MaterialClass, MaterialGrid, MaterialModel};
    use crate::domain::{Grid3, VolumeGrid, VolumeKind};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_table_maps_water_and_air() {
        let model = MaterialModel::default();
        assert_eq!(model.relative_density(0.0), 1.0);
        assert_eq!(model.relative_density(-2000.0), 0.001);
        assert!((model.relative_density(-50.0) - 0.96).abs() < 1.0e-12);
        assert!((model.hounsfield_for_density(1.07) - 200.0).abs() < 1.0e-9);
    }

    #[test]
    fn classification_uses_five_buckets() {
        let cases = [
            (-1000.0, MaterialClass::Air),
            (-900.0, MaterialClass::Lung),
            (-401.0, MaterialClass::Lung),
            (-400.0, MaterialClass::SoftTissue),
            (199.0, MaterialClass::SoftTissue),
            (200.0, MaterialClass::Bone),
            (1199.0, MaterialClass::Bone),
            (1200.0, MaterialClass::Metal),
        ];
        for (hu, expected) in cases {
            assert_eq!(MaterialClass::from_hounsfield(hu), expected, "hu={hu}");
        }
        assert_eq!(MaterialClass::Air.dose_conversion(), 0.0);
        assert_eq!(MaterialClass::Bone.dose_conversion(), 1.1);
    }

    #[test]
    fn attenuation_scales_inversely_with_energy() {
        let model = MaterialModel::default();
        let six = model.attenuation_per_mm(1.0, 6.0);
        let twelve = model.attenuation_per_mm(1.0, 12.0);
        assert!((six - 0.004).abs() < 1.0e-12);
        assert!((twelve - 0.002).abs() < 1.0e-12);
        assert!(model.attenuation_per_mm(1.0, 0.1) <= 4.0 * six + 1.0e-15);
        assert!(model.compton_fraction(1.0) > model.compton_fraction(2.0));
    }

    #[test]
    fn table_file_parses_comments_and_rejects_bad_rows() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("calibration.txt");
        fs::write(&path, "# hu density\n-1000 0.001\n0 1.0 # water\n1000 1.5\n")
            .expect("table should be written");
        let model = MaterialModel::from_table_file(&path).expect("table should load");
        assert_eq!(model.density_table().len(), 3);
        assert!((model.relative_density(500.0) - 1.25).abs() < 1.0e-12);

        fs::write(&path, "-1000 0.001\n0 water\n").expect("table should be written");
        let error = MaterialModel::from_table_file(&path).expect_err("bad row should fail");
        assert!(error.to_string().contains("line 2"));

        fs::write(&path, "0 1.0\n-100 0.9\n").expect("table should be written");
        assert!(MaterialModel::from_table_file(&path).is_err());
    }

    #[test]
    fn material_grid_accepts_density_volumes() {
        let model = MaterialModel::default();
        let values = Grid3::from_vec([1, 1, 3], vec![0.001, 1.0, 1.6]).expect("grid");
        let volume = VolumeGrid::new(values, &[1.0, 1.0, 1.0], VolumeKind::RelativeDensity)
            .expect("volume");
        let materials = MaterialGrid::build(&volume, &model);
        assert_eq!(
            materials.classes().as_slice(),
            &[MaterialClass::Air, MaterialClass::SoftTissue, MaterialClass::Metal]
        );
        assert_eq!(materials.density().as_slice(), &[0.001, 1.0, 1.6]);
        assert!(materials.ensure_matches(&volume).is_ok());
    }
}
