//! [`DoseCalculator`]: the single entry point callers configure and run.

pub mod normalization;

pub use normalization::{apply_normalization, reference_dose, validate_reference};

use crate::algorithms::{AlgorithmKind, CalculationContext, TransportReport, check_beam_support};
use crate::archive::{
    ARCHIVE_FORMAT_VERSION, ArchiveMetadata, DoseArchive, read_archive, write_archive,
};
use crate::backend::{
    BackendAvailability, BackendHandle, BackendProvider, RayonBackendProvider, run_with_fallback,
};
use crate::common::config::{CalculationOptions, OptionsPatch};
use crate::domain::{
    BeamRecord, BeamSpec, DoseError, DoseGrid, DoseResult, ExecutionMode, Grid3, NumericalWarning,
    StructureMask, VolumeGrid, VolumeKind,
};
use crate::material::{MaterialGrid, MaterialModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamConvergence {
    pub beam: String,
    #[serde(flatten)]
    pub report: TransportReport,
}

/// Summary of the most recent `calculate_dose` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationReport {
    pub algorithm: AlgorithmKind,
    pub backend: String,
    pub execution_mode: ExecutionMode,
    pub fallback_reason: Option<String>,
    pub beams: usize,
    pub transport: Vec<BeamConvergence>,
    pub uncertainty: Option<f64>,
    pub normalized: bool,
}

#[derive(Debug, Default)]
enum BackendState {
    #[default]
    Unprobed,
    Ready(BackendHandle),
    Unavailable(String),
}

/// Owns the volume, beams, structures and options of one plan and turns them
/// into a dose grid.
pub struct DoseCalculator {
    volume: Option<VolumeGrid>,
    model: MaterialModel,
    beams: Vec<BeamSpec>,
    structures: BTreeMap<String, StructureMask>,
    options: CalculationOptions,
    algorithm: AlgorithmKind,
    provider: Box<dyn BackendProvider>,
    backend: BackendState,
    dose: Option<DoseGrid>,
    uncertainty: Option<f64>,
    warnings: Vec<NumericalWarning>,
    report: Option<CalculationReport>,
    dose_provenance: Option<DoseProvenance>,
}

/// Settings the current dose was computed with.
#[derive(Debug, Clone, PartialEq)]
struct DoseProvenance {
    algorithm: AlgorithmKind,
    options: CalculationOptions,
    spacing: [f64; 3],
}

impl Default for DoseCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl DoseCalculator {
    pub fn new() -> Self {
        Self::with_provider(RayonBackendProvider)
    }

    pub fn with_provider(provider: impl BackendProvider + 'static) -> Self {
        Self {
            volume: None,
            model: MaterialModel::default(),
            beams: Vec::new(),
            structures: BTreeMap::new(),
            options: CalculationOptions::default(),
            algorithm: AlgorithmKind::PencilBeam,
            provider: Box::new(provider),
            backend: BackendState::Unprobed,
            dose: None,
            uncertainty: None,
            warnings: Vec::new(),
            report: None,
            dose_provenance: None,
        }
    }

    /// Sets a Hounsfield volume with per-axis spacing in mm.
    pub fn set_patient_data(&mut self, hounsfield: Grid3<f64>, spacing: &[f64]) -> DoseResult<()> {
        let volume = VolumeGrid::new(hounsfield, spacing, VolumeKind::Hounsfield)?;
        self.set_volume(volume);
        Ok(())
    }

    pub fn set_volume(&mut self, volume: VolumeGrid) {
        tracing::debug!(shape = ?volume.shape(), spacing = ?volume.spacing(), "volume set");
        self.volume = Some(volume);
        self.clear_results();
    }

    pub fn volume(&self) -> Option<&VolumeGrid> {
        self.volume.as_ref()
    }

    pub fn set_material_model(&mut self, model: MaterialModel) {
        self.model = model;
    }

    pub fn material_model(&self) -> &MaterialModel {
        &self.model
    }

    /// Validates and appends a beam. Existing beams are left untouched on error.
    pub fn add_beam(&mut self, record: BeamRecord) -> DoseResult<()> {
        let beam = BeamSpec::from_record(&record)?;
        if self.beams.iter().any(|existing| existing.id() == beam.id()) {
            return Err(DoseError::validation(
                "INPUT.DUPLICATE_BEAM",
                format!("a beam with id '{}' already exists", beam.id()),
            ));
        }
        if let BackendState::Ready(handle) = &mut self.backend {
            handle.register_beam(beam.clone());
        }
        self.beams.push(beam);
        Ok(())
    }

    /// Swaps in a new spec for the beam with the record's id.
    pub fn replace_beam(&mut self, record: BeamRecord) -> DoseResult<()> {
        let beam = BeamSpec::from_record(&record)?;
        let slot = self
            .beams
            .iter_mut()
            .find(|existing| existing.id() == beam.id())
            .ok_or_else(|| unknown_beam(beam.id()))?;
        if let BackendState::Ready(handle) = &mut self.backend {
            handle.register_beam(beam.clone());
        }
        *slot = beam;
        Ok(())
    }

    pub fn remove_beam(&mut self, id: &str) -> DoseResult<BeamSpec> {
        let position = self
            .beams
            .iter()
            .position(|beam| beam.id() == id)
            .ok_or_else(|| unknown_beam(id))?;
        if let BackendState::Ready(handle) = &mut self.backend {
            handle.unregister_beam(id);
        }
        Ok(self.beams.remove(position))
    }

    pub fn beams(&self) -> &[BeamSpec] {
        &self.beams
    }

    pub fn add_structure(&mut self, name: impl Into<String>, mask: StructureMask) -> DoseResult<()> {
        let name = name.into();
        let volume = self.volume.as_ref().ok_or_else(|| {
            DoseError::validation(
                "INPUT.NO_VOLUME",
                format!("structure '{name}' needs a volume to be set first"),
            )
        })?;
        mask.ensure_shape(volume.shape(), &format!("structure '{name}'"))?;
        self.structures.insert(name, mask);
        Ok(())
    }

    pub fn structures(&self) -> impl Iterator<Item = &str> {
        self.structures.keys().map(String::as_str)
    }

    pub fn structure(&self, name: &str) -> Option<&StructureMask> {
        self.structures.get(name)
    }

    /// Merges `patch` into the current options; nothing changes if the
    /// merged options are invalid.
    pub fn set_options(&mut self, patch: OptionsPatch) -> DoseResult<()> {
        let mut merged = self.options.clone();
        merged.merge(patch);
        merged.validate()?;
        if merged.execution != self.options.execution {
            self.backend = BackendState::Unprobed;
        }
        self.options = merged;
        Ok(())
    }

    pub fn options(&self) -> &CalculationOptions {
        &self.options
    }

    pub fn set_algorithm(&mut self, algorithm: AlgorithmKind) {
        if algorithm != self.algorithm {
            self.algorithm = algorithm;
            self.backend = BackendState::Unprobed;
        }
    }

    pub const fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    /// Beams registered with the accelerated backend, once one is initialized.
    pub fn backend_beams(&self) -> Option<&[BeamSpec]> {
        match &self.backend {
            BackendState::Ready(handle) => Some(handle.beams()),
            _ => None,
        }
    }

    pub fn dose(&self) -> Option<&DoseGrid> {
        self.dose.as_ref()
    }

    pub const fn uncertainty(&self) -> Option<f64> {
        self.uncertainty
    }

    pub fn warnings(&self) -> &[NumericalWarning] {
        &self.warnings
    }

    pub fn last_report(&self) -> Option<&CalculationReport> {
        self.report.as_ref()
    }

    fn clear_results(&mut self) {
        self.dose = None;
        self.uncertainty = None;
        self.warnings.clear();
        self.report = None;
        self.dose_provenance = None;
    }

    fn check_before_run(&self, volume: &VolumeGrid) -> DoseResult<()> {
        for (name, mask) in &self.structures {
            mask.ensure_shape(volume.shape(), &format!("structure '{name}'"))?;
        }
        if let Some(normalization) = &self.options.normalization {
            validate_reference(normalization, volume.shape(), &self.structures)?;
        }
        check_beam_support(self.algorithm, &self.beams)
    }

    pub fn calculate_dose(&mut self) -> DoseResult<DoseGrid> {
        let Some(volume) = self.volume.as_ref() else {
            return Err(DoseError::calculation(
                "RUN.NO_VOLUME",
                "no patient volume has been set",
            ));
        };
        if self.beams.is_empty() {
            return Err(DoseError::calculation("RUN.NO_BEAMS", "no beams have been added"));
        }
        self.check_before_run(volume)?;
        probe_backend(
            &mut self.backend,
            self.provider.as_ref(),
            self.algorithm,
            &self.options,
            &self.beams,
        );

        tracing::info!(
            algorithm = %self.algorithm,
            beams = self.beams.len(),
            shape = ?volume.shape(),
            "dose calculation started"
        );
        let materials = MaterialGrid::build(volume, &self.model);
        let context = CalculationContext::new(volume, &materials, &self.model, &self.options)?;
        let (handle, unavailable) = match &self.backend {
            BackendState::Ready(handle) => (Some(handle), None),
            BackendState::Unavailable(reason) => (None, Some(reason.as_str())),
            BackendState::Unprobed => (None, None),
        };
        let run = run_with_fallback(handle, unavailable, &context, self.algorithm, &self.beams)?;

        let mut output = run.output;
        let mut warnings = output.warnings;
        let mut normalized = false;
        if let Some(normalization) = &self.options.normalization {
            match apply_normalization(&mut output.dose, normalization, &self.structures)? {
                Some(warning) => warnings.push(warning),
                None => normalized = true,
            }
        }

        let report = CalculationReport {
            algorithm: self.algorithm,
            backend: run.backend,
            execution_mode: run.mode,
            fallback_reason: run.fallback_reason,
            beams: self.beams.len(),
            transport: output
                .transport
                .into_iter()
                .map(|(beam, report)| BeamConvergence { beam, report })
                .collect(),
            uncertainty: output.uncertainty,
            normalized,
        };
        tracing::info!(
            algorithm = %report.algorithm,
            backend = %report.backend,
            max_dose = output.dose.max_value(),
            warnings = warnings.len(),
            "dose calculation finished"
        );

        self.dose = Some(output.dose.clone());
        self.uncertainty = output.uncertainty;
        self.warnings = warnings;
        self.report = Some(report);
        self.dose_provenance = Some(DoseProvenance {
            algorithm: self.algorithm,
            options: self.options.clone(),
            spacing: volume.spacing(),
        });
        Ok(output.dose)
    }

    /// Archive of the current dose and the settings it was computed with.
    pub fn archive(&self) -> DoseResult<DoseArchive> {
        let (Some(dose), Some(provenance)) = (&self.dose, &self.dose_provenance) else {
            return Err(DoseError::calculation(
                "RUN.NO_DOSE",
                "no dose has been calculated or loaded",
            ));
        };
        Ok(DoseArchive {
            metadata: ArchiveMetadata {
                format_version: ARCHIVE_FORMAT_VERSION,
                algorithm: provenance.algorithm,
                resolution_mm: provenance.options.resolution_mm,
                spacing: provenance.spacing,
                heterogeneity_correction: provenance.options.heterogeneity_correction,
                options: provenance.options.clone(),
                shape: dose.shape(),
                uncertainty: self.uncertainty,
            },
            dose: dose.clone(),
        })
    }

    pub fn save_dose_matrix(&self, path: impl AsRef<Path>) -> DoseResult<()> {
        let archive = self.archive()?;
        write_archive(path.as_ref(), &archive)?;
        tracing::info!(path = %path.as_ref().display(), "dose archive written");
        Ok(())
    }

    /// Restores dose, uncertainty and provenance from an archive. The shape
    /// must match the current volume when one is set.
    pub fn load_dose_matrix(&mut self, path: impl AsRef<Path>) -> DoseResult<DoseArchive> {
        let archive = read_archive(path.as_ref())?;
        if let Some(volume) = &self.volume {
            archive.dose.ensure_shape(volume.shape(), "archived dose")?;
        }
        self.dose = Some(archive.dose.clone());
        self.uncertainty = archive.metadata.uncertainty;
        self.warnings.clear();
        self.report = None;
        self.dose_provenance = Some(DoseProvenance {
            algorithm: archive.metadata.algorithm,
            options: archive.metadata.options.clone(),
            spacing: archive.metadata.spacing,
        });
        Ok(archive)
    }
}

/// Probes once per configuration; beams added later are registered by
/// `add_beam`.
fn probe_backend(
    state: &mut BackendState,
    provider: &dyn BackendProvider,
    algorithm: AlgorithmKind,
    options: &CalculationOptions,
    beams: &[BeamSpec],
) {
    if !matches!(state, BackendState::Unprobed) {
        return;
    }
    *state = match provider.probe(algorithm, options) {
        BackendAvailability::Available(mut handle) => {
            for beam in beams {
                handle.register_beam(beam.clone());
            }
            tracing::debug!(backend = handle.name(), "accelerated backend initialized");
            BackendState::Ready(handle)
        }
        BackendAvailability::Unavailable(reason) => {
            tracing::warn!(%algorithm, %reason, "accelerated backend unavailable");
            BackendState::Unavailable(reason)
        }
    };
}

fn unknown_beam(id: &str) -> DoseError {
    DoseError::validation("INPUT.UNKNOWN_BEAM", format!("no beam with id '{id}'"))
}
