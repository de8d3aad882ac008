//! The scheduler actor.
//!
//! One loop task owns the queue, the snapshot cache, and the active-job
//! slot. Protocol handlers reach it through [`SchedulerHandle`]; the render
//! pipeline, the staging tasks, the output watcher, and the expiry timer
//! feed events into the same loop. Because every mutation happens on this
//! task, the single-active-job invariant holds by construction.

use std::path::PathBuf;
use std::sync::Arc;

use layersmith_core::config::Settings;
use layersmith_core::job::{Job, JobDescriptor, JobStatus};
use layersmith_core::paths::{file_safe_name, unique_render_path};
use layersmith_events::NotifierHandle;
use layersmith_renderer::{
    PipelineEvent, PipelineHandle, PipelineLauncher, PipelineSpec, RenderPhase,
};
use layersmith_watcher::{WatcherCommand, WatcherEvent, WatcherHandle};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::queue::JobQueue;
use crate::report::write_job_report;
use crate::snapshot::SnapshotCache;
use crate::staging::stage_scene_file;

const CHANNEL_CAPACITY: usize = 64;

/// The scheduler loop is gone; the controller is shutting down.
#[derive(Debug, thiserror::Error)]
#[error("Scheduler is not running")]
pub struct SchedulerError;

/// Answer to `GET_STATUS`.
#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub active_title: Option<String>,
    pub produced: u32,
    pub expected: u32,
    pub queued: usize,
}

/// Client-facing requests, each carrying its response channel.
enum Command {
    AddJob {
        raw: String,
        client: String,
        resp: oneshot::Sender<Option<usize>>,
    },
    MoveJob {
        index: usize,
        to_top: bool,
        resp: oneshot::Sender<Option<String>>,
    },
    CancelJob {
        index: usize,
        resp: oneshot::Sender<Option<String>>,
    },
    ForceAssembly {
        index: usize,
        resp: oneshot::Sender<Option<String>>,
    },
    JobData {
        resp: oneshot::Sender<String>,
    },
    Status {
        resp: oneshot::Sender<StatusSummary>,
    },
}

/// Result of one staging task.
struct StagingOutcome {
    job_id: Uuid,
    local: Option<PathBuf>,
}

/// Cloneable entry point into the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Submit a job descriptor. `Some(index)` is the queue position shown
    /// to the client; `None` means the job was rejected.
    pub async fn add_job(
        &self,
        raw: impl Into<String>,
        client: impl Into<String>,
    ) -> Result<Option<usize>, SchedulerError> {
        self.request(|resp| Command::AddJob {
            raw: raw.into(),
            client: client.into(),
            resp,
        })
        .await
    }

    /// Reposition the job at `index`; returns its title on success.
    pub async fn move_job(
        &self,
        index: usize,
        to_top: bool,
    ) -> Result<Option<String>, SchedulerError> {
        self.request(|resp| Command::MoveJob {
            index,
            to_top,
            resp,
        })
        .await
    }

    /// Cancel the job at `index`; returns its title when the index exists.
    pub async fn cancel_job(&self, index: usize) -> Result<Option<String>, SchedulerError> {
        self.request(|resp| Command::CancelJob { index, resp }).await
    }

    /// Force composite assembly for the active job at `index`.
    pub async fn force_assembly(&self, index: usize) -> Result<Option<String>, SchedulerError> {
        self.request(|resp| Command::ForceAssembly { index, resp })
            .await
    }

    /// The serialized queue snapshot including its sentinels.
    pub async fn job_data(&self) -> Result<String, SchedulerError> {
        self.request(|resp| Command::JobData { resp }).await
    }

    pub async fn status(&self) -> Result<StatusSummary, SchedulerError> {
        self.request(|resp| Command::Status { resp }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| SchedulerError)?;
        rx.await.map_err(|_| SchedulerError)
    }
}

pub struct Scheduler {
    settings: Arc<Settings>,
    launcher: Box<dyn PipelineLauncher>,
    watcher: WatcherHandle,
    notifier: NotifierHandle,

    queue: JobQueue,
    cache: SnapshotCache,

    active: Option<Uuid>,
    abort_requested: bool,
    pipeline: Option<PipelineHandle>,

    pipeline_tx: mpsc::Sender<PipelineEvent>,
    staging_tx: mpsc::Sender<StagingOutcome>,
}

impl Scheduler {
    /// Spawn the scheduler loop and return its handle.
    ///
    /// `watcher_events` is the receiving side of the output watcher's event
    /// channel; the watcher itself is addressed through `watcher`.
    pub fn spawn(
        settings: Arc<Settings>,
        launcher: Box<dyn PipelineLauncher>,
        watcher: WatcherHandle,
        watcher_events: mpsc::Receiver<WatcherEvent>,
        notifier: NotifierHandle,
        cancel: CancellationToken,
    ) -> SchedulerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (staging_tx, staging_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let scheduler = Self {
            settings,
            launcher,
            watcher,
            notifier,
            queue: JobQueue::new(),
            cache: SnapshotCache::new(),
            active: None,
            abort_requested: false,
            pipeline: None,
            pipeline_tx,
            staging_tx,
        };

        tokio::spawn(scheduler.run(cmd_rx, pipeline_rx, staging_rx, watcher_events, cancel));

        SchedulerHandle { tx: cmd_tx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut pipeline_events: mpsc::Receiver<PipelineEvent>,
        mut staging_results: mpsc::Receiver<StagingOutcome>,
        mut watcher_events: mpsc::Receiver<WatcherEvent>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Scheduler starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = pipeline_events.recv() => match event {
                    Some(event) => self.handle_pipeline_event(event).await,
                    None => break,
                },
                outcome = staging_results.recv() => match outcome {
                    Some(outcome) => self.handle_staging(outcome).await,
                    None => break,
                },
                event = watcher_events.recv() => match event {
                    Some(event) => self.handle_watcher_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        if let Some(pipeline) = &self.pipeline {
            pipeline.abort();
        }
        tracing::info!("Scheduler shut down");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddJob { raw, client, resp } => {
                let result = self.add_job(&raw, &client).await;
                let _ = resp.send(result);
            }
            Command::MoveJob {
                index,
                to_top,
                resp,
            } => {
                let _ = resp.send(self.move_job(index, to_top));
            }
            Command::CancelJob { index, resp } => {
                let result = self.cancel_job(index).await;
                let _ = resp.send(result);
            }
            Command::ForceAssembly { index, resp } => {
                let result = self.force_assembly(index).await;
                let _ = resp.send(result);
            }
            Command::JobData { resp } => {
                let _ = resp.send(self.cache.payload(&self.queue));
            }
            Command::Status { resp } => {
                let _ = resp.send(self.status());
            }
        }
    }

    // ---- client operations ----

    async fn add_job(&mut self, raw: &str, client: &str) -> Option<usize> {
        let descriptor = match JobDescriptor::parse(raw) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::info!(client, error = %e, "Rejecting malformed job submission");
                return None;
            }
        };

        if !descriptor.scene_file.exists() || !descriptor.render_dir.exists() {
            tracing::info!(
                client,
                scene = %descriptor.scene_file.display(),
                render_dir = %descriptor.render_dir.display(),
                "Rejecting job with unreachable paths"
            );
            return None;
        }

        let mut job = Job::new(descriptor, client);
        let index = self.queue.history_len();

        match self.settings.staging_dir.as_deref() {
            Some(staging) if !job.remote_file.starts_with(staging) => {
                let scene = job.remote_file.clone();
                let staging = staging.to_path_buf();
                let job_id = job.id;
                let tx = self.staging_tx.clone();
                tokio::spawn(async move {
                    let local = stage_scene_file(&scene, &staging).await;
                    let _ = tx.send(StagingOutcome { job_id, local }).await;
                });
            }
            _ => job.set_status(JobStatus::Queued),
        }

        tracing::info!(title = %job.title, client, index, "Job accepted");
        self.notifier
            .notify(format!("Job \"{}\" submitted by {}", job.title, job.client));

        self.queue.insert(job);
        self.cache.invalidate();
        self.start_job().await;

        Some(index)
    }

    fn move_job(&mut self, index: usize, to_top: bool) -> Option<String> {
        let id = self.queue.id_at(index)?;
        let title = self.queue.get(&id)?.title.clone();

        self.queue.move_job(id, to_top);

        // The running job must stay at the top of the visible queue.
        if let Some(active) = self.active {
            if active != id {
                self.queue.pin_to_top(active);
            } else if !to_top {
                self.queue.pin_to_top(id);
            }
        }

        self.cache.invalidate();
        tracing::info!(title = %title, to_top, "Job moved");
        Some(title)
    }

    async fn cancel_job(&mut self, index: usize) -> Option<String> {
        let id = self.queue.id_at(index)?;
        let job = self.queue.get(&id)?;
        let title = job.title.clone();

        if job.status().is_terminal() {
            tracing::debug!(title = %title, "Cancel of terminal job ignored");
            return Some(title);
        }

        if self.active == Some(id) {
            tracing::info!(title = %title, "Aborting the running job");
            self.notifier
                .notify(format!("Job \"{title}\" aborted by user request"));
            if let Some(job) = self.queue.get_mut(&id) {
                job.set_canceled();
            }
            self.abort_requested = true;

            let pipeline_running = self
                .pipeline
                .as_ref()
                .map_or(false, |pipeline| !pipeline.is_finished());
            if pipeline_running {
                // The kill surfaces as a pipeline failure event, which
                // advances the queue.
                if let Some(pipeline) = &self.pipeline {
                    pipeline.abort();
                }
            } else {
                // Pipeline already over (e.g. detection phase): advance
                // directly.
                self.finish_active(JobOutcome::Aborted).await;
            }
        } else {
            self.queue.remove_from_working(id);
            if let Some(job) = self.queue.get_mut(&id) {
                job.set_canceled();
            }
            tracing::info!(title = %title, "Queued job canceled");
        }

        self.cache.invalidate();
        Some(title)
    }

    async fn force_assembly(&mut self, index: usize) -> Option<String> {
        let id = self.queue.id_at(index)?;
        if self.active != Some(id) {
            return None;
        }
        let title = self.queue.get(&id)?.title.clone();
        tracing::info!(title = %title, "Forcing composite assembly");
        self.watcher.send(WatcherCommand::RequestAssembly).await;
        Some(title)
    }

    fn status(&self) -> StatusSummary {
        let active = self.active.and_then(|id| self.queue.get(&id));
        StatusSummary {
            active_title: active.map(|job| job.title.clone()),
            produced: active.map_or(0, |job| job.produced),
            expected: active.map_or(0, |job| job.expected),
            queued: self.queue.working_len(),
        }
    }

    // ---- queue advancement ----

    async fn start_job(&mut self) {
        while self.active.is_none() {
            let Some(id) = self.queue.pop_ready() else {
                return;
            };
            let Some(job) = self.queue.get_mut(&id) else {
                continue;
            };

            let render_dir = match unique_render_path(Some(job.file()), &job.render_dir) {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::error!(title = %job.title, error = %e, "Cannot create render directory");
                    job.set_failed();
                    self.cache.invalidate();
                    continue;
                }
            };
            job.render_dir = render_dir.clone();
            job.set_status(JobStatus::ScenePreparation);

            let scene_stem = job
                .file()
                .file_stem()
                .map(|stem| file_safe_name(&stem.to_string_lossy()))
                .unwrap_or_else(|| "untitled".to_string());

            let spec = PipelineSpec {
                job_id: id,
                scene_file: job.file().to_path_buf(),
                render_dir: render_dir.clone(),
                engine: job.engine.clone(),
                ignore_hidden: job.ignore_hidden.clone(),
                delete_hidden: job.delete_hidden.clone(),
                use_scene_settings: job.use_scene_settings.clone(),
                res_x: self.settings.res_x,
                res_y: self.settings.res_y,
                output_format: self.settings.output_format.clone(),
                scene_prep_cmd: self.settings.scene_prep_cmd.clone(),
                render_cmd: self.settings.render_cmd.clone(),
            };

            tracing::info!(
                title = %job.title,
                engine = %job.engine,
                render_dir = %render_dir.display(),
                "Starting job"
            );
            self.notifier.notify(format!(
                "Starting \"{}\" with {} engine, output {}",
                job.title,
                job.engine,
                render_dir.display()
            ));

            self.active = Some(id);
            self.abort_requested = false;
            self.pipeline = Some(self.launcher.launch(spec, self.pipeline_tx.clone()));

            self.watcher
                .send(WatcherCommand::Watch {
                    dir: render_dir,
                    scene_stem,
                })
                .await;
            self.watcher.send(WatcherCommand::RenderActive(true)).await;

            self.cache.invalidate();
            return;
        }
    }

    async fn finish_active(&mut self, outcome: JobOutcome) {
        let Some(id) = self.active.take() else {
            return;
        };
        self.pipeline = None;
        self.abort_requested = false;

        if let Some(job) = self.queue.get_mut(&id) {
            match outcome {
                JobOutcome::Finished => job.set_finished(),
                JobOutcome::Failed => job.set_failed(),
                JobOutcome::Aborted => job.set_canceled(),
            }
            tracing::info!(title = %job.title, status = job.status().label(), "Job left the execution boundary");
            self.notifier
                .notify(format!("Job \"{}\" {}", job.title, job.status().label()));
            write_job_report(job).await;
        }

        match outcome {
            JobOutcome::Finished => {
                self.watcher.send(WatcherCommand::Deactivate).await;
            }
            JobOutcome::Failed | JobOutcome::Aborted => {
                self.watcher.send(WatcherCommand::Reset).await;
                self.watcher.send(WatcherCommand::Deactivate).await;
            }
        }

        self.cache.invalidate();
        self.start_job().await;
    }

    // ---- event relays ----

    async fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::PhaseStarted { job_id, phase } => {
                if self.active != Some(job_id) {
                    return;
                }
                let status = match phase {
                    RenderPhase::ScenePreparation => JobStatus::ScenePreparation,
                    RenderPhase::BatchRender => JobStatus::Rendering,
                };
                if let Some(job) = self.queue.get_mut(&job_id) {
                    job.set_status(status);
                    self.cache.invalidate();
                }
            }
            PipelineEvent::LayerCount { job_id, count } => {
                if self.active != Some(job_id) {
                    return;
                }
                if let Some(job) = self.queue.get_mut(&job_id) {
                    // One extra artifact for the master layer.
                    job.set_expected(count + 1);
                    self.cache.invalidate();
                }
            }
            PipelineEvent::Completed { job_id } => {
                if self.active != Some(job_id) {
                    return;
                }
                if self.abort_requested {
                    self.finish_active(JobOutcome::Aborted).await;
                    return;
                }
                if let Some(job) = self.queue.get_mut(&job_id) {
                    job.set_status(JobStatus::ArtifactDetection);
                    self.notifier.notify(format!(
                        "Render finished for \"{}\", detecting artifacts",
                        job.title
                    ));
                }
                self.watcher.send(WatcherCommand::RenderActive(false)).await;
                self.watcher.send(WatcherCommand::RequestAssembly).await;
                self.cache.invalidate();
            }
            PipelineEvent::Failed { job_id, phase } => {
                if self.active != Some(job_id) {
                    return;
                }
                let outcome = if self.abort_requested {
                    JobOutcome::Aborted
                } else {
                    tracing::error!(%job_id, phase = %phase, "Render pipeline failed");
                    JobOutcome::Failed
                };
                self.finish_active(outcome).await;
            }
        }
    }

    async fn handle_staging(&mut self, outcome: StagingOutcome) {
        let Some(job) = self.queue.get_mut(&outcome.job_id) else {
            return;
        };
        if job.status().is_terminal() {
            return;
        }

        // A failed transfer falls back to the submitted path.
        job.local_file = outcome.local;
        job.set_status(JobStatus::Queued);
        self.cache.invalidate();
        self.start_job().await;
    }

    async fn handle_watcher_event(&mut self, event: WatcherEvent) {
        match event {
            WatcherEvent::ArtifactCount(count) => {
                let Some(id) = self.active else {
                    return;
                };
                if let Some(job) = self.queue.get_mut(&id) {
                    job.set_produced(count);
                    self.cache.invalidate();
                }
            }
            WatcherEvent::AssemblyFinished { file } => {
                let Some(id) = self.active else {
                    return;
                };
                // Guard against a composite from a previous run arriving
                // after the queue advanced.
                let stale = self
                    .queue
                    .get(&id)
                    .map_or(true, |job| file.parent() != Some(job.render_dir.as_path()));
                if stale {
                    tracing::debug!(file = %file.display(), "Ignoring stale assembly result");
                    return;
                }

                self.notifier
                    .notify(format!("Composite created: {}", file.display()));
                self.finish_active(JobOutcome::Finished).await;
            }
        }
    }

    fn sweep(&mut self) {
        let removed = self.queue.sweep_expired(self.settings.job_expiry, self.active);
        if removed > 0 {
            tracing::info!(removed, "Expired jobs removed from history");
            self.cache.invalidate();
        }
    }
}

/// How the active job leaves the execution boundary.
#[derive(Debug, Clone, Copy)]
enum JobOutcome {
    Finished,
    Failed,
    Aborted,
}
