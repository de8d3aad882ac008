//! The output-directory watch loop.
//!
//! One task owns the [`ArtifactIndex`] and everything that mutates it.
//! Commands arrive from the scheduler, verification and assembly results
//! arrive from worker tasks over an internal channel, and a periodic tick
//! re-scans the watched directory. Workers never touch the index.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use layersmith_core::config::Settings;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::assemble::{assemble_layers, composite_file_name};
use crate::index::ArtifactIndex;
use crate::pool::{default_pool_size, WorkerPool};
use crate::verify::{verify_artifact, VerifyOutcome};

/// Capacity of the command and result channels.
const CHANNEL_CAPACITY: usize = 64;

/// Instructions from the scheduler loop.
#[derive(Debug, Clone)]
pub enum WatcherCommand {
    /// Bind the watcher to a job's render directory.
    Watch { dir: PathBuf, scene_stem: String },

    /// Whether the batch render is still writing into the directory.
    RenderActive(bool),

    /// The render phase finished (or a client forced it): assemble the
    /// composite once every artifact is accounted for.
    RequestAssembly,

    /// Drop all per-job state.
    Reset,

    /// Stop scanning until the next `Watch`.
    Deactivate,
}

/// Observations reported back to the scheduler loop.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// The number of indexed artifacts changed.
    ArtifactCount(u32),

    /// The assembly task finished (successfully or not).
    AssemblyFinished { file: PathBuf },
}

/// Completions flowing back from worker tasks into the watch loop.
#[derive(Debug)]
enum WorkerResult {
    Verified(VerifyOutcome),
    Assembled(PathBuf),
}

/// Cloneable command sender for the watch loop.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    tx: mpsc::Sender<WatcherCommand>,
}

impl WatcherHandle {
    /// Pair a handle with its command receiver.
    pub fn channel() -> (Self, mpsc::Receiver<WatcherCommand>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: WatcherCommand) {
        if self.tx.send(command).await.is_err() {
            tracing::warn!("Watcher loop is gone, command dropped");
        }
    }
}

/// What to do with an assembly request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyAction {
    Wait,
    Dispatch,
    /// The wait bound expired with artifacts still unresolved.
    Force,
}

fn assembly_action(
    requested: bool,
    in_flight: bool,
    all_processed: bool,
    pool_idle: bool,
    waited: Duration,
    timeout: Duration,
) -> AssemblyAction {
    if !requested || in_flight {
        return AssemblyAction::Wait;
    }
    if all_processed && pool_idle {
        return AssemblyAction::Dispatch;
    }
    if waited >= timeout {
        return AssemblyAction::Force;
    }
    AssemblyAction::Wait
}

/// Decide which freshly discovered artifacts to verify this tick.
///
/// While the render is still writing, the newest batch is parked for one
/// tick and only the previously parked batch is dispatched; a parked file
/// that has disappeared in the meantime is simply dropped.
fn split_dispatch(
    new: BTreeSet<String>,
    parked: BTreeSet<String>,
    render_active: bool,
) -> (BTreeSet<String>, BTreeSet<String>) {
    if render_active {
        (parked, new)
    } else {
        let mut dispatch = parked;
        dispatch.extend(new);
        (dispatch, BTreeSet::new())
    }
}

pub struct OutputWatcher {
    settings: Arc<Settings>,
    events: mpsc::Sender<WatcherEvent>,

    active: bool,
    render_active: bool,
    dir: PathBuf,
    scene_stem: String,

    index: ArtifactIndex,
    parked: BTreeSet<String>,
    last_count: Option<u32>,

    assembly_requested_at: Option<Instant>,
    assembly_in_flight: bool,

    pool: WorkerPool,
    results_tx: mpsc::Sender<WorkerResult>,
    results_rx: Option<mpsc::Receiver<WorkerResult>>,
}

impl OutputWatcher {
    pub fn new(settings: Arc<Settings>, events: mpsc::Sender<WatcherEvent>) -> Self {
        Self::with_pool_size(settings, events, default_pool_size())
    }

    fn with_pool_size(
        settings: Arc<Settings>,
        events: mpsc::Sender<WatcherEvent>,
        pool_size: usize,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tracing::info!(workers = pool_size, "Artifact verification pool sized");
        Self {
            settings,
            events,
            active: false,
            render_active: false,
            dir: PathBuf::new(),
            scene_stem: String::new(),
            index: ArtifactIndex::default(),
            parked: BTreeSet::new(),
            last_count: None,
            assembly_requested_at: None,
            assembly_in_flight: false,
            pool: WorkerPool::new(pool_size),
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    /// Spawn the watch loop, returning its command handle.
    pub fn spawn(
        settings: Arc<Settings>,
        events: mpsc::Sender<WatcherEvent>,
        cancel: CancellationToken,
    ) -> WatcherHandle {
        let (handle, rx) = WatcherHandle::channel();
        let watcher = Self::new(settings, events);
        tokio::spawn(watcher.run(rx, cancel));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<WatcherCommand>, cancel: CancellationToken) {
        let Some(mut results) = self.results_rx.take() else {
            return;
        };

        let mut ticker = tokio::time::interval(self.settings.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Output watcher starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                res = results.recv() => {
                    if let Some(res) = res {
                        self.handle_result(res).await;
                    }
                }
            }
        }
        tracing::info!("Output watcher shutting down");
    }

    async fn tick(&mut self) {
        if self.active {
            self.scan_and_dispatch().await;
        }
        self.maybe_assemble().await;
    }

    async fn handle_command(&mut self, command: WatcherCommand) {
        match command {
            WatcherCommand::Watch { dir, scene_stem } => {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    tracing::error!(dir = %dir.display(), error = %e, "Cannot create watch directory");
                }

                self.dir = dir;
                self.scene_stem = scene_stem;
                self.active = true;
                self.parked.clear();
                self.assembly_requested_at = None;
                self.last_count = None;

                // Files already present are not this job's output; index
                // them as processed so they only feed the composite.
                let mut index = ArtifactIndex::scan(
                    &self.dir,
                    &self.settings.artifact_ext,
                    self.settings.min_artifact_bytes,
                );
                index.mark_all_processed();
                tracing::info!(
                    dir = %self.dir.display(),
                    existing = index.len(),
                    "Watch directory changed"
                );
                self.index = index;
            }
            WatcherCommand::RenderActive(active) => {
                self.render_active = active;
            }
            WatcherCommand::RequestAssembly => {
                if self.assembly_in_flight || self.assembly_requested_at.is_some() {
                    tracing::debug!("Assembly already pending, request ignored");
                    return;
                }
                self.assembly_requested_at = Some(Instant::now());
                self.maybe_assemble().await;
            }
            WatcherCommand::Reset => {
                self.index.clear();
                self.parked.clear();
                self.assembly_requested_at = None;
                self.last_count = None;
            }
            WatcherCommand::Deactivate => {
                self.active = false;
                self.render_active = false;
                tracing::info!("Directory watch deactivated");
            }
        }
    }

    async fn handle_result(&mut self, result: WorkerResult) {
        match result {
            WorkerResult::Verified(outcome) => {
                if outcome.retained {
                    self.index.mark_processed(&outcome.key);
                } else {
                    self.index.remove(&outcome.key);
                    self.report_count().await;
                }
                self.maybe_assemble().await;
            }
            WorkerResult::Assembled(file) => {
                self.assembly_in_flight = false;
                // Per-artifact state belongs to the finished job. A stale
                // composite from a directory we no longer watch must not
                // wipe the current job's index.
                if file.parent() == Some(self.dir.as_path()) {
                    self.index.clear();
                    self.parked.clear();
                    self.last_count = None;
                }
                let _ = self
                    .events
                    .send(WatcherEvent::AssemblyFinished { file })
                    .await;
            }
        }
    }

    async fn scan_and_dispatch(&mut self) {
        let mut fresh = ArtifactIndex::scan(
            &self.dir,
            &self.settings.artifact_ext,
            self.settings.min_artifact_bytes,
        );
        fresh.carry_processed_from(&self.index);

        let new = fresh.new_keys(&self.index);
        let removed = fresh.removed_keys(&self.index);
        if !removed.is_empty() {
            tracing::debug!(?removed, "Artifacts disappeared from the watch directory");
            self.parked.retain(|k| !removed.contains(k));
        }
        if !new.is_empty() {
            tracing::debug!(?new, "New artifacts discovered");
        }

        self.index = fresh;

        let parked = std::mem::take(&mut self.parked);
        let (dispatch, park) = split_dispatch(new, parked, self.render_active);
        self.parked = park;

        for key in dispatch {
            if let Some(entry) = self.index.get(&key) {
                self.spawn_verification(key, entry.path.clone());
            }
        }

        self.report_count().await;
    }

    fn spawn_verification(&self, key: String, path: PathBuf) {
        let pool = self.pool.clone();
        let results = self.results_tx.clone();
        let verify_cmd = self.settings.verify_cmd.clone();
        let format = self.settings.output_format.clone();
        let timeout = self.settings.verify_timeout;

        tokio::spawn(async move {
            let _permit = pool.acquire().await;
            let outcome = verify_artifact(&verify_cmd, key, path, &format, timeout).await;
            let _ = results.send(WorkerResult::Verified(outcome)).await;
        });
    }

    async fn maybe_assemble(&mut self) {
        let waited = self
            .assembly_requested_at
            .map_or(Duration::ZERO, |t| t.elapsed());

        let action = assembly_action(
            self.assembly_requested_at.is_some(),
            self.assembly_in_flight,
            self.index.all_processed(),
            self.pool.is_idle(),
            waited,
            self.settings.assembly_timeout,
        );

        match action {
            AssemblyAction::Wait => {}
            AssemblyAction::Dispatch => self.dispatch_assembly(),
            AssemblyAction::Force => {
                tracing::warn!(
                    unresolved = ?self.index.unprocessed_keys(),
                    waited_secs = waited.as_secs(),
                    "Assembly wait bound expired, forcing composite creation"
                );
                self.dispatch_assembly();
            }
        }
    }

    fn dispatch_assembly(&mut self) {
        self.assembly_requested_at = None;
        self.assembly_in_flight = true;

        let target = self.dir.join(composite_file_name(&self.scene_stem));
        let dir = self.dir.clone();
        let pool = self.pool.clone();
        let results = self.results_tx.clone();
        let assemble_cmd = self.settings.assemble_cmd.clone();
        let format = self.settings.output_format.clone();

        tokio::spawn(async move {
            // Taking every permit keeps assembly mutually exclusive with
            // verification workers.
            let _all = pool.acquire_all().await;
            let file = assemble_layers(&assemble_cmd, target, &dir, &format).await;
            let _ = results.send(WorkerResult::Assembled(file)).await;
        });
    }

    async fn report_count(&mut self) {
        let count = self.index.len() as u32;
        if self.last_count != Some(count) {
            self.last_count = Some(count);
            let _ = self.events.send(WatcherEvent::ArtifactCount(count)).await;
        }
    }
}
