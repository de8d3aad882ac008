//! Two-phase render pipeline task.
//!
//! One pipeline runs per active job: scene preparation, then the batch
//! render. Exit code 0 means success for either phase; anything else (or a
//! missing render scene between the phases) fails the job. The scheduler
//! observes the pipeline exclusively through [`PipelineEvent`]s and stops it
//! through the [`CancellationToken`] in the returned [`PipelineHandle`],
//! which force-kills whichever child is running.

use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{build_prep_command, build_render_command, render_scene_path};
use crate::monitor::drain_stream;

/// The two sequential subprocess phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    ScenePreparation,
    BatchRender,
}

impl std::fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderPhase::ScenePreparation => write!(f, "scene preparation"),
            RenderPhase::BatchRender => write!(f, "batch render"),
        }
    }
}

/// Pipeline lifecycle events relayed to the scheduler loop.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A phase's subprocess has been spawned.
    PhaseStarted { job_id: Uuid, phase: RenderPhase },

    /// Scene preparation reported how many render layers it created.
    LayerCount { job_id: Uuid, count: u32 },

    /// Both phases exited successfully.
    Completed { job_id: Uuid },

    /// A phase failed, was cancelled, or could not be spawned.
    Failed { job_id: Uuid, phase: RenderPhase },
}

/// Everything the pipeline needs to run one job.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub job_id: Uuid,
    pub scene_file: PathBuf,
    pub render_dir: PathBuf,
    pub engine: String,
    pub ignore_hidden: String,
    pub delete_hidden: String,
    pub use_scene_settings: String,
    pub res_x: u32,
    pub res_y: u32,
    pub output_format: String,
    pub scene_prep_cmd: PathBuf,
    pub render_cmd: PathBuf,
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl PipelineHandle {
    pub fn new(cancel: CancellationToken, task: tokio::task::JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Request forced termination of the running subprocess.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Seam between the scheduler and the pipeline, so tests can drive the
/// scheduler with a launcher that spawns no processes.
pub trait PipelineLauncher: Send + Sync + 'static {
    fn launch(&self, spec: PipelineSpec, events: mpsc::Sender<PipelineEvent>) -> PipelineHandle;
}

/// Production launcher: spawns the external tools as subprocesses.
pub struct ProcessLauncher;

impl PipelineLauncher for ProcessLauncher {
    fn launch(&self, spec: PipelineSpec, events: mpsc::Sender<PipelineEvent>) -> PipelineHandle {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run(spec, events, task_cancel).await;
        });
        PipelineHandle { cancel, task }
    }
}

async fn run(spec: PipelineSpec, events: mpsc::Sender<PipelineEvent>, cancel: CancellationToken) {
    let job_id = spec.job_id;

    // Phase 1: scene preparation.
    let _ = events
        .send(PipelineEvent::PhaseStarted {
            job_id,
            phase: RenderPhase::ScenePreparation,
        })
        .await;

    let prep = build_prep_command(&spec);
    match run_phase(prep, &spec, RenderPhase::ScenePreparation, &events, &cancel).await {
        Some(status) if status.success() => {}
        _ => {
            let _ = events
                .send(PipelineEvent::Failed {
                    job_id,
                    phase: RenderPhase::ScenePreparation,
                })
                .await;
            return;
        }
    }

    // The preparation phase must have written the render scene.
    let render_scene = render_scene_path(&spec.scene_file);
    if !render_scene.exists() {
        tracing::error!(
            job_id = %job_id,
            render_scene = %render_scene.display(),
            "Scene preparation did not produce a render scene"
        );
        let _ = events
            .send(PipelineEvent::Failed {
                job_id,
                phase: RenderPhase::ScenePreparation,
            })
            .await;
        return;
    }

    // Phase 2: batch render.
    let _ = events
        .send(PipelineEvent::PhaseStarted {
            job_id,
            phase: RenderPhase::BatchRender,
        })
        .await;

    let render = build_render_command(&spec, &render_scene);
    match run_phase(render, &spec, RenderPhase::BatchRender, &events, &cancel).await {
        Some(status) if status.success() => {
            let _ = events.send(PipelineEvent::Completed { job_id }).await;
        }
        _ => {
            let _ = events
                .send(PipelineEvent::Failed {
                    job_id,
                    phase: RenderPhase::BatchRender,
                })
                .await;
        }
    }
}

/// Spawn one phase, drain its output, and wait for it to exit.
///
/// Returns `None` when the spawn failed or the phase was cancelled; the
/// child is killed on cancellation before the function returns.
async fn run_phase(
    mut cmd: Command,
    spec: &PipelineSpec,
    phase: RenderPhase,
    events: &mpsc::Sender<PipelineEvent>,
    cancel: &CancellationToken,
) -> Option<ExitStatus> {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job_id = %spec.job_id, phase = %phase, error = %e, "Failed to spawn phase");
            return None;
        }
    };

    // Drain stdout/stderr in their own tasks so the wait below stays
    // responsive to cancellation.
    let mut drains = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain_stream(
            stdout,
            spec.job_id,
            phase,
            events.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain_stream(
            stderr,
            spec.job_id,
            phase,
            events.clone(),
        )));
    }

    let status = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                tracing::info!(job_id = %spec.job_id, phase = %phase, code = ?status.code(), "Phase exited");
                Some(status)
            }
            Err(e) => {
                tracing::error!(job_id = %spec.job_id, phase = %phase, error = %e, "Failed to wait on phase");
                None
            }
        },
        _ = cancel.cancelled() => {
            tracing::info!(job_id = %spec.job_id, phase = %phase, "Killing phase on cancellation");
            if let Err(e) = child.kill().await {
                tracing::warn!(job_id = %spec.job_id, phase = %phase, error = %e, "Failed to kill phase");
            }
            None
        }
    };

    for drain in drains {
        let _ = drain.await;
    }

    status
}

#[cfg(test)]
pub(crate) fn test_spec() -> PipelineSpec {
    PipelineSpec {
        job_id: Uuid::now_v7(),
        scene_file: PathBuf::from("/scenes/seats.mb"),
        render_dir: PathBuf::from("/out/render"),
        engine: "software".to_string(),
        ignore_hidden: "1".to_string(),
        delete_hidden: "1".to_string(),
        use_scene_settings: "0".to_string(),
        res_x: 3840,
        res_y: 2160,
        output_format: "sgi".to_string(),
        scene_prep_cmd: PathBuf::from("layersmith-prep"),
        render_cmd: PathBuf::from("layersmith-render"),
    }
}
