use super::errors::{DoseError, DoseResult};
use crate::common::constants::{DEFAULT_FIELD_SIZE_MM, DEFAULT_SAD_MM, MIN_ARC_SPACING_DEG};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadiationType {
    #[default]
    Photon,
    Electron,
    Proton,
}

impl RadiationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Photon => "photon",
            Self::Electron => "electron",
            Self::Proton => "proton",
        }
    }
}

impl Display for RadiationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Leaf pairs `[left, right]` along the field x axis, stacked along field y
/// and centred on the beam axis. Positions are in mm at the isocenter plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlcAperture {
    pub leaf_width_mm: f64,
    pub leaves: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldAperture {
    Rectangular { width_mm: f64, height_mm: f64 },
    Mlc(MlcAperture),
}

impl FieldAperture {
    /// Field-x opening edges of the row containing `v`, if `v` lies inside
    /// the aperture's y extent.
    pub fn edges_at(&self, v: f64) -> Option<(f64, f64)> {
        let (v_min, v_max) = self.v_extent();
        if v < v_min || v > v_max {
            return None;
        }
        match self {
            Self::Rectangular { width_mm, .. } => Some((-0.5 * width_mm, 0.5 * width_mm)),
            Self::Mlc(mlc) => {
                let row = ((v - v_min) / mlc.leaf_width_mm).floor() as usize;
                let [left, right] = mlc.leaves[row.min(mlc.leaves.len() - 1)];
                Some((left, right))
            }
        }
    }

    pub fn v_extent(&self) -> (f64, f64) {
        let height = match self {
            Self::Rectangular { height_mm, .. } => *height_mm,
            Self::Mlc(mlc) => mlc.leaf_width_mm * mlc.leaves.len() as f64,
        };
        (-0.5 * height, 0.5 * height)
    }

    pub fn u_extent(&self) -> (f64, f64) {
        match self {
            Self::Rectangular { width_mm, .. } => (-0.5 * width_mm, 0.5 * width_mm),
            Self::Mlc(mlc) => mlc.leaves.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), [left, right]| (lo.min(*left), hi.max(*right)),
            ),
        }
    }

    pub fn contains(&self, u: f64, v: f64) -> bool {
        self.edges_at(v)
            .is_some_and(|(left, right)| u >= left && u <= right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArcDirection {
    #[default]
    #[serde(rename = "cw")]
    Clockwise,
    #[serde(rename = "ccw")]
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArcRecord {
    pub start: f64,
    pub stop: f64,
    #[serde(default)]
    pub direction: ArcDirection,
    #[serde(default)]
    pub spacing_deg: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcSpec {
    pub start_deg: f64,
    pub stop_deg: f64,
    pub direction: ArcDirection,
    pub spacing_deg: f64,
}

impl ArcSpec {
    /// Control-point gantry angles. Coincident start/stop means a full rotation.
    pub fn control_angles(&self) -> Vec<f64> {
        let sign = match self.direction {
            ArcDirection::Clockwise => 1.0,
            ArcDirection::CounterClockwise => -1.0,
        };
        let sweep = (sign * (self.stop_deg - self.start_deg)).rem_euclid(360.0);
        if sweep == 0.0 {
            let count = ((360.0 / self.spacing_deg).ceil() as usize).max(2);
            let step = 360.0 / count as f64;
            return (0..count)
                .map(|index| wrap_degrees(self.start_deg + sign * step * index as f64))
                .collect();
        }
        let count = ((sweep / self.spacing_deg).ceil() as usize + 1).max(2);
        let step = sweep / (count - 1) as f64;
        (0..count)
            .map(|index| wrap_degrees(self.start_deg + sign * step * index as f64))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WedgeOrientation {
    #[serde(rename = "+x")]
    PositiveX,
    #[serde(rename = "-x")]
    NegativeX,
    #[serde(rename = "+y")]
    PositiveY,
    #[serde(rename = "-y")]
    NegativeY,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WedgeSpec {
    pub angle_deg: f64,
    pub orientation: WedgeOrientation,
}

impl WedgeSpec {
    /// Fluence transmission at field coordinates `(u, v)`; the thick end sits
    /// on the side the orientation points to.
    pub fn transmission(&self, u: f64, v: f64) -> f64 {
        let along = match self.orientation {
            WedgeOrientation::PositiveX => u,
            WedgeOrientation::NegativeX => -u,
            WedgeOrientation::PositiveY => v,
            WedgeOrientation::NegativeY => -v,
        };
        let steepness = 1.0 - self.angle_deg.to_radians().cos();
        (1.0 - steepness * along / 100.0).max(0.1)
    }
}

/// Raw beam description as it arrives from a plan file; nothing is validated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BeamRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub radiation_type: Option<RadiationType>,
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub gantry_angle: Option<f64>,
    #[serde(default)]
    pub collimator_angle: Option<f64>,
    #[serde(default)]
    pub couch_angle: Option<f64>,
    #[serde(default)]
    pub isocenter: Option<[f64; 3]>,
    #[serde(default)]
    pub sad: Option<f64>,
    #[serde(default)]
    pub ssd: Option<f64>,
    #[serde(default)]
    pub field_size: Option<[f64; 2]>,
    #[serde(default)]
    pub mlc: Option<MlcAperture>,
    #[serde(default)]
    pub arc: Option<ArcRecord>,
    #[serde(default)]
    pub wedge: Option<WedgeSpec>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl BeamRecord {
    pub fn new(id: impl Into<String>, energy: f64, gantry_angle: f64) -> Self {
        Self {
            id: Some(id.into()),
            energy: Some(energy),
            gantry_angle: Some(gantry_angle),
            ..Self::default()
        }
    }
}

/// Validated, immutable beam. Angles are wrapped into `[0, 360)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSpec {
    id: String,
    radiation: RadiationType,
    energy: f64,
    gantry_deg: f64,
    collimator_deg: f64,
    couch_deg: f64,
    isocenter: Option<[f64; 3]>,
    sad_mm: f64,
    ssd_mm: Option<f64>,
    aperture: FieldAperture,
    arc: Option<ArcSpec>,
    wedge: Option<WedgeSpec>,
    weight: f64,
}

impl BeamSpec {
    pub fn from_record(record: &BeamRecord) -> DoseResult<Self> {
        let id = match record.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(missing_field("id")),
        };
        let energy = record.energy.ok_or_else(|| missing_field("energy"))?;
        if !energy.is_finite() || energy <= 0.0 {
            return Err(DoseError::validation(
                "INPUT.BEAM_INVALID_ENERGY",
                format!("beam '{id}' energy must be positive, got {energy}"),
            ));
        }
        let gantry_deg = record
            .gantry_angle
            .ok_or_else(|| missing_field("gantry_angle"))?;
        let gantry_deg = checked_angle(&id, "gantry_angle", gantry_deg)?;
        let collimator_deg =
            checked_angle(&id, "collimator_angle", record.collimator_angle.unwrap_or(0.0))?;
        let couch_deg = checked_angle(&id, "couch_angle", record.couch_angle.unwrap_or(0.0))?;

        let sad_mm = record.sad.unwrap_or(DEFAULT_SAD_MM);
        if !sad_mm.is_finite() || sad_mm <= 0.0 {
            return Err(DoseError::validation(
                "INPUT.BEAM_INVALID_SAD",
                format!("beam '{id}' SAD must be positive, got {sad_mm}"),
            ));
        }
        if let Some(ssd) = record.ssd.filter(|ssd| !ssd.is_finite() || *ssd <= 0.0) {
            return Err(DoseError::validation(
                "INPUT.BEAM_INVALID_SSD",
                format!("beam '{id}' SSD must be positive, got {ssd}"),
            ));
        }
        if let Some(isocenter) = record
            .isocenter
            .filter(|isocenter| isocenter.iter().any(|value| !value.is_finite()))
        {
            return Err(DoseError::validation(
                "INPUT.BEAM_INVALID_ISOCENTER",
                format!("beam '{id}' isocenter must be finite, got {isocenter:?}"),
            ));
        }

        let weight = record.weight.unwrap_or(1.0);
        if !weight.is_finite() || weight < 0.0 {
            return Err(DoseError::validation(
                "INPUT.BEAM_INVALID_WEIGHT",
                format!("beam '{id}' weight must be finite and non-negative, got {weight}"),
            ));
        }

        Ok(Self {
            aperture: aperture_from_record(&id, record)?,
            arc: record
                .arc
                .map(|arc| arc_from_record(&id, arc))
                .transpose()?,
            wedge: record
                .wedge
                .map(|wedge| wedge_from_record(&id, wedge))
                .transpose()?,
            radiation: record.radiation_type.unwrap_or_default(),
            isocenter: record.isocenter,
            ssd_mm: record.ssd,
            id,
            energy,
            gantry_deg,
            collimator_deg,
            couch_deg,
            sad_mm,
            weight,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn radiation(&self) -> RadiationType {
        self.radiation
    }

    pub const fn energy(&self) -> f64 {
        self.energy
    }

    pub const fn gantry_deg(&self) -> f64 {
        self.gantry_deg
    }

    pub const fn collimator_deg(&self) -> f64 {
        self.collimator_deg
    }

    pub const fn couch_deg(&self) -> f64 {
        self.couch_deg
    }

    pub const fn isocenter(&self) -> Option<[f64; 3]> {
        self.isocenter
    }

    pub const fn sad_mm(&self) -> f64 {
        self.sad_mm
    }

    pub const fn ssd_mm(&self) -> Option<f64> {
        self.ssd_mm
    }

    pub const fn aperture(&self) -> &FieldAperture {
        &self.aperture
    }

    pub const fn arc(&self) -> Option<&ArcSpec> {
        self.arc.as_ref()
    }

    pub const fn wedge(&self) -> Option<&WedgeSpec> {
        self.wedge.as_ref()
    }

    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Static beams this beam delivers: itself, or one beam per arc control
    /// point sharing the weight equally.
    pub fn control_points(&self) -> Vec<BeamSpec> {
        let Some(arc) = self.arc else {
            return vec![self.clone()];
        };
        let angles = arc.control_angles();
        let weight = self.weight / angles.len() as f64;
        angles
            .into_iter()
            .enumerate()
            .map(|(index, gantry_deg)| BeamSpec {
                id: format!("{}#cp{index}", self.id),
                gantry_deg,
                arc: None,
                weight,
                ..self.clone()
            })
            .collect()
    }

    /// Wedge transmission at field coordinates, 1 without a wedge.
    pub fn fluence_modifier(&self, u: f64, v: f64) -> f64 {
        self.wedge
            .as_ref()
            .map_or(1.0, |wedge| wedge.transmission(u, v))
    }
}

pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

fn missing_field(field: &str) -> DoseError {
    DoseError::validation(
        "INPUT.BEAM_MISSING_FIELD",
        format!("beam record is missing required field '{field}'"),
    )
}

fn checked_angle(id: &str, field: &str, angle: f64) -> DoseResult<f64> {
    if !angle.is_finite() {
        return Err(DoseError::validation(
            "INPUT.BEAM_INVALID_ANGLE",
            format!("beam '{id}' {field} must be finite, got {angle}"),
        ));
    }
    Ok(wrap_degrees(angle))
}

fn aperture_from_record(id: &str, record: &BeamRecord) -> DoseResult<FieldAperture> {
    match (&record.field_size, &record.mlc) {
        (Some(_), Some(_)) => Err(DoseError::validation(
            "INPUT.BEAM_APERTURE_CONFLICT",
            format!("beam '{id}' defines both field_size and mlc"),
        )),
        (_, Some(mlc)) => {
            if !mlc.leaf_width_mm.is_finite() || mlc.leaf_width_mm <= 0.0 {
                return Err(DoseError::validation(
                    "INPUT.BEAM_INVALID_MLC",
                    format!("beam '{id}' MLC leaf width must be positive"),
                ));
            }
            if mlc.leaves.is_empty() {
                return Err(DoseError::validation(
                    "INPUT.BEAM_INVALID_MLC",
                    format!("beam '{id}' MLC has no leaf pairs"),
                ));
            }
            if let Some(row) = mlc.leaves.iter().position(|[left, right]| {
                !left.is_finite() || !right.is_finite() || left > right
            }) {
                return Err(DoseError::validation(
                    "INPUT.BEAM_INVALID_MLC",
                    format!("beam '{id}' MLC leaf pair {row} is not an ordered finite pair"),
                ));
            }
            Ok(FieldAperture::Mlc(mlc.clone()))
        }
        (field_size, None) => {
            let [width_mm, height_mm] =
                field_size.unwrap_or([DEFAULT_FIELD_SIZE_MM, DEFAULT_FIELD_SIZE_MM]);
            if [width_mm, height_mm]
                .iter()
                .any(|value| !value.is_finite() || *value <= 0.0)
            {
                return Err(DoseError::validation(
                    "INPUT.BEAM_INVALID_FIELD_SIZE",
                    format!("beam '{id}' field size must be positive, got {field_size:?}"),
                ));
            }
            Ok(FieldAperture::Rectangular {
                width_mm,
                height_mm,
            })
        }
    }
}

fn arc_from_record(id: &str, arc: ArcRecord) -> DoseResult<ArcSpec> {
    let spacing_deg = arc.spacing_deg.unwrap_or(2.0);
    if !arc.start.is_finite() || !arc.stop.is_finite() {
        return Err(DoseError::validation(
            "INPUT.BEAM_INVALID_ARC",
            format!("beam '{id}' arc angles must be finite"),
        ));
    }
    if !spacing_deg.is_finite() || spacing_deg < MIN_ARC_SPACING_DEG {
        return Err(DoseError::validation(
            "INPUT.BEAM_INVALID_ARC",
            format!(
                "beam '{id}' arc spacing must be at least {MIN_ARC_SPACING_DEG} degrees, got {spacing_deg}"
            ),
        ));
    }
    Ok(ArcSpec {
        start_deg: wrap_degrees(arc.start),
        stop_deg: wrap_degrees(arc.stop),
        direction: arc.direction,
        spacing_deg,
    })
}

fn wedge_from_record(id: &str, wedge: WedgeSpec) -> DoseResult<WedgeSpec> {
    if !wedge.angle_deg.is_finite() || !(0.0..90.0).contains(&wedge.angle_deg) {
        return Err(DoseError::validation(
            "INPUT.BEAM_INVALID_WEDGE",
            format!(
                "beam '{id}' wedge angle must lie in [0, 90), got {}",
                wedge.angle_deg
            ),
        ));
    }
    Ok(wedge)
}
