//! Accelerated and fallback execution paths.
//!
//! A [`BackendProvider`] is probed once per calculator configuration. The
//! handle it returns keeps its own beam registry; when probing fails the
//! facade runs the same algorithm code serially.

use crate::algorithms::{
    AlgorithmKind, AlgorithmOutput, CalculationContext, Executor, check_beam_support, compute_dose,
};
use crate::common::config::CalculationOptions;
use crate::domain::{BeamSpec, DoseError, DoseResult, ExecutionMode};
use std::fmt::{Debug, Formatter};
use std::thread;

pub const SERIAL_BACKEND_NAME: &str = "serial";
pub const RAYON_BACKEND_NAME: &str = "rayon";

/// Static beams with every arc replaced by its control points.
pub fn expand_beams(beams: &[BeamSpec]) -> Vec<BeamSpec> {
    beams.iter().flat_map(BeamSpec::control_points).collect()
}

pub trait AcceleratedBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Adds `beam`, or replaces the registered beam with the same id in place.
    fn register_beam(&mut self, beam: BeamSpec);

    fn unregister_beam(&mut self, id: &str) -> bool;

    fn beams(&self) -> &[BeamSpec];

    fn compute(
        &self,
        context: &CalculationContext<'_>,
        kind: AlgorithmKind,
    ) -> DoseResult<AlgorithmOutput>;
}

pub struct BackendHandle(Box<dyn AcceleratedBackend>);

impl BackendHandle {
    pub fn new(backend: impl AcceleratedBackend + 'static) -> Self {
        Self(Box::new(backend))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn register_beam(&mut self, beam: BeamSpec) {
        self.0.register_beam(beam);
    }

    pub fn unregister_beam(&mut self, id: &str) -> bool {
        self.0.unregister_beam(id)
    }

    pub fn beams(&self) -> &[BeamSpec] {
        self.0.beams()
    }

    pub fn compute(
        &self,
        context: &CalculationContext<'_>,
        kind: AlgorithmKind,
    ) -> DoseResult<AlgorithmOutput> {
        self.0.compute(context, kind)
    }
}

impl Debug for BackendHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name())
            .field("beams", &self.beams().len())
            .finish()
    }
}

#[derive(Debug)]
pub enum BackendAvailability {
    Available(BackendHandle),
    Unavailable(String),
}

pub trait BackendProvider: Send + Sync {
    fn probe(&self, kind: AlgorithmKind, options: &CalculationOptions) -> BackendAvailability;
}

/// Beam-parallel and voxel-parallel execution on a dedicated rayon pool.
pub struct RayonBackend {
    pool: rayon::ThreadPool,
    beams: Vec<BeamSpec>,
}

impl RayonBackend {
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl AcceleratedBackend for RayonBackend {
    fn name(&self) -> &str {
        RAYON_BACKEND_NAME
    }

    fn register_beam(&mut self, beam: BeamSpec) {
        match self
            .beams
            .iter_mut()
            .find(|registered| registered.id() == beam.id())
        {
            Some(registered) => *registered = beam,
            None => self.beams.push(beam),
        }
    }

    fn unregister_beam(&mut self, id: &str) -> bool {
        let before = self.beams.len();
        self.beams.retain(|beam| beam.id() != id);
        self.beams.len() != before
    }

    fn beams(&self) -> &[BeamSpec] {
        &self.beams
    }

    fn compute(
        &self,
        context: &CalculationContext<'_>,
        kind: AlgorithmKind,
    ) -> DoseResult<AlgorithmOutput> {
        check_beam_support(kind, &self.beams)?;
        compute_dose(
            kind,
            context,
            &expand_beams(&self.beams),
            &Executor::Pool(&self.pool),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RayonBackendProvider;

impl BackendProvider for RayonBackendProvider {
    fn probe(&self, kind: AlgorithmKind, options: &CalculationOptions) -> BackendAvailability {
        if !options.execution.accelerated {
            return BackendAvailability::Unavailable("acceleration disabled by options".to_string());
        }
        let threads = options.execution.threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        });
        if threads <= 1 {
            return BackendAvailability::Unavailable(
                "only one worker thread is available".to_string(),
            );
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("dose-worker-{index}"))
            .build()
        {
            Ok(pool) => {
                tracing::debug!(algorithm = %kind, threads, "rayon backend ready");
                BackendAvailability::Available(BackendHandle::new(RayonBackend {
                    pool,
                    beams: Vec::new(),
                }))
            }
            Err(error) => {
                BackendAvailability::Unavailable(format!("thread pool failed to build: {error}"))
            }
        }
    }
}

/// The pure fallback: identical algorithm code in the calling thread.
pub fn compute_serial(
    context: &CalculationContext<'_>,
    kind: AlgorithmKind,
    beams: &[BeamSpec],
) -> DoseResult<AlgorithmOutput> {
    check_beam_support(kind, beams)?;
    compute_dose(kind, context, &expand_beams(beams), &Executor::Serial)
}

/// Output of one execution path, tagged with where it ran.
#[derive(Debug)]
pub struct BackendRun {
    pub output: AlgorithmOutput,
    pub backend: String,
    pub mode: ExecutionMode,
    pub fallback_reason: Option<String>,
}

/// Runs on `handle` when present, else (or on failure) serially.
pub fn run_with_fallback(
    handle: Option<&BackendHandle>,
    unavailable_reason: Option<&str>,
    context: &CalculationContext<'_>,
    kind: AlgorithmKind,
    beams: &[BeamSpec],
) -> DoseResult<BackendRun> {
    let fallback_reason = match handle {
        Some(handle) => match handle.compute(context, kind) {
            Ok(output) => {
                return finish(BackendRun {
                    output,
                    backend: handle.name().to_string(),
                    mode: ExecutionMode::Parallel,
                    fallback_reason: None,
                });
            }
            Err(error) if error.is_validation() => return Err(error),
            Err(error) => format!("backend '{}' failed: {error}", handle.name()),
        },
        None => unavailable_reason
            .unwrap_or("no accelerated backend configured")
            .to_string(),
    };
    tracing::warn!(algorithm = %kind, reason = %fallback_reason, "using serial fallback");
    let output = compute_serial(context, kind, beams)?;
    finish(BackendRun {
        output,
        backend: SERIAL_BACKEND_NAME.to_string(),
        mode: ExecutionMode::Serial,
        fallback_reason: Some(fallback_reason),
    })
}

fn finish(run: BackendRun) -> DoseResult<BackendRun> {
    if run.output.dose.all_finite() {
        Ok(run)
    } else {
        Err(DoseError::calculation(
            "RUN.NON_FINITE_DOSE",
            format!("backend '{}' produced a non-finite dose grid", run.backend),
        ))
    }
}
