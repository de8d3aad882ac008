//! Render job entity and its status state machine.
//!
//! A [`Job`] is a value entity owned exclusively by the scheduler loop.
//! Status and progress are private so every mutation goes through the
//! transition methods, which enforce the machine's invariants:
//!
//! - progress stays within 0..=100,
//! - transitions are monotonic except the explicit cancel path,
//! - a finished job reports 100, a failed or aborted job reports 0,
//! - a failed or aborted job can never become finished.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::engine;
use crate::error::CoreError;

/// Share of the progress bar reserved for artifact detection and assembly
/// once every expected artifact has been rendered.
const DETECTION_PROGRESS_RESERVE: f64 = 0.95;

/// Lifecycle states of a render job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Scene file is being staged to local storage.
    FileTransfer = 0,
    /// Waiting in the working queue.
    Queued = 1,
    /// Scene-preparation subprocess is running.
    ScenePreparation = 2,
    /// Batch-render subprocess is running.
    Rendering = 3,
    /// Render finished; the output watcher is verifying artifacts.
    ArtifactDetection = 4,
    /// Composite created, job complete.
    Finished = 5,
    /// An execution phase failed.
    Failed = 6,
    /// Failed because the user requested cancellation.
    Aborted = 7,
}

impl JobStatus {
    /// Finished, Failed, and Aborted are terminal: the job leaves the
    /// execution boundary and never re-enters it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Failed or Aborted.
    pub fn is_failure(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Aborted)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::FileTransfer => "file transfer",
            JobStatus::Queued => "queued",
            JobStatus::ScenePreparation => "preparing scene",
            JobStatus::Rendering => "rendering",
            JobStatus::ArtifactDetection => "detecting artifacts",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

/// The parsed form of an `ADD_JOB` argument string:
/// `title;scene;outdir;engine;ignore_hidden;delete_hidden;use_scene_settings`.
///
/// A trailing semicolon is tolerated. Title, scene file, and output
/// directory are required; the engine defaults to the first available one
/// and the option flags keep the wire format's `'1'`/`'0'` convention.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub title: String,
    pub scene_file: PathBuf,
    pub render_dir: PathBuf,
    pub engine: String,
    pub ignore_hidden: String,
    pub delete_hidden: String,
    pub use_scene_settings: String,
}

impl JobDescriptor {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.strip_suffix(';').unwrap_or(raw);
        let fields: Vec<&str> = raw.split(';').map(str::trim).collect();

        if fields.len() < 3 {
            return Err(CoreError::Validation(format!(
                "Job descriptor needs at least title;scene;outdir, got {} fields",
                fields.len()
            )));
        }
        if fields[..3].iter().any(|f| f.is_empty()) {
            return Err(CoreError::Validation(
                "Job title, scene file, and output directory must not be empty".to_string(),
            ));
        }

        let field = |idx: usize, default: &str| -> String {
            fields
                .get(idx)
                .filter(|f| !f.is_empty())
                .map_or_else(|| default.to_string(), |f| f.to_string())
        };

        let engine = match engine::resolve(&field(3, engine::default_engine())) {
            Some(engine) => engine.to_string(),
            None => {
                return Err(CoreError::Validation(format!(
                    "Unknown render engine \"{}\"",
                    fields[3]
                )))
            }
        };

        Ok(Self {
            title: fields[0].to_string(),
            scene_file: PathBuf::from(fields[1]),
            render_dir: PathBuf::from(fields[2]),
            engine,
            ignore_hidden: field(4, "1"),
            delete_hidden: field(5, "1"),
            use_scene_settings: field(6, "0"),
        })
    }
}

/// One unit of render work tracked by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    /// Queue position shown to clients; refreshed after every reorder.
    pub remote_index: usize,
    pub title: String,
    /// Submitting host, `"server"` for locally created jobs.
    pub client: String,
    /// Scene file as submitted by the client.
    pub remote_file: PathBuf,
    /// Locally staged copy, set once the file transfer completes.
    pub local_file: Option<PathBuf>,
    /// Output directory; rewritten to the unique per-run subdirectory when
    /// the job starts.
    pub render_dir: PathBuf,
    pub engine: String,
    pub ignore_hidden: String,
    pub delete_hidden: String,
    pub use_scene_settings: String,
    /// Artifacts found in the output directory so far.
    pub produced: u32,
    /// Expected artifact count reported by scene preparation.
    pub expected: u32,
    status: JobStatus,
    progress: u8,
    pub in_progress: bool,
    pub created: DateTime<Utc>,
}

impl Job {
    pub fn new(descriptor: JobDescriptor, client: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            remote_index: 0,
            title: descriptor.title,
            client: client.into(),
            remote_file: descriptor.scene_file,
            local_file: None,
            render_dir: descriptor.render_dir,
            engine: descriptor.engine,
            ignore_hidden: descriptor.ignore_hidden,
            delete_hidden: descriptor.delete_hidden,
            use_scene_settings: descriptor.use_scene_settings,
            produced: 0,
            expected: 0,
            status: JobStatus::FileTransfer,
            progress: 0,
            in_progress: false,
            created: Utc::now(),
        }
    }

    /// The scene file to render, preferring the locally staged copy.
    pub fn file(&self) -> &Path {
        self.local_file.as_deref().unwrap_or(&self.remote_file)
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Advance to `status`. Transitions that would move the job backwards
    /// are ignored; use [`Job::set_canceled`] for the cancel path.
    pub fn set_status(&mut self, status: JobStatus) {
        if status < self.status {
            return;
        }
        self.apply_status(status);
    }

    /// Mark the job failed. An already aborted job keeps its Aborted status.
    pub fn set_failed(&mut self) {
        if self.status == JobStatus::Aborted {
            return;
        }
        self.apply_status(JobStatus::Failed);
    }

    /// Mark the job aborted on user request. Overrides Failed: a job the
    /// user cancelled must not appear as merely failed.
    pub fn set_canceled(&mut self) {
        self.apply_status(JobStatus::Aborted);
    }

    /// Mark the job finished. Guarded no-op when the job already failed or
    /// was aborted.
    pub fn set_finished(&mut self) {
        if self.status.is_failure() {
            return;
        }
        self.apply_status(JobStatus::Finished);
    }

    /// Update the produced-artifact counter and re-derive progress.
    pub fn set_produced(&mut self, produced: u32) {
        self.produced = produced;
        self.update_progress();
    }

    /// Update the expected-artifact counter and re-derive progress.
    pub fn set_expected(&mut self, expected: u32) {
        self.expected = expected;
        self.update_progress();
    }

    /// Derive progress from the artifact counters, reserving a fixed tail
    /// for detection and assembly.
    pub fn update_progress(&mut self) {
        if self.status > JobStatus::ArtifactDetection {
            return;
        }
        let expected = f64::from(self.expected.max(1));
        let pct = DETECTION_PROGRESS_RESERVE * 100.0 * f64::from(self.produced) / expected;
        self.progress = pct.round().min(100.0) as u8;
    }

    fn apply_status(&mut self, status: JobStatus) {
        self.in_progress = matches!(
            status,
            JobStatus::ScenePreparation | JobStatus::Rendering | JobStatus::ArtifactDetection
        );

        match status {
            JobStatus::Finished => self.progress = 100,
            JobStatus::Failed | JobStatus::Aborted => self.progress = 0,
            _ => {}
        }

        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            title: "seat covers".to_string(),
            scene_file: PathBuf::from("/scenes/seats.mb"),
            render_dir: PathBuf::from("/out"),
            engine: "software".to_string(),
            ignore_hidden: "1".to_string(),
            delete_hidden: "1".to_string(),
            use_scene_settings: "0".to_string(),
        }
    }

    fn job() -> Job {
        Job::new(descriptor(), "server")
    }

    // -- descriptor parsing ---------------------------------------------------

    #[test]
    fn parse_full_descriptor() {
        let d = JobDescriptor::parse("door;/scenes/door.mb;/out;hardware;0;1;1").unwrap();
        assert_eq!(d.title, "door");
        assert_eq!(d.engine, "hardware");
        assert_eq!(d.ignore_hidden, "0");
        assert_eq!(d.use_scene_settings, "1");
    }

    #[test]
    fn parse_minimal_descriptor_applies_defaults() {
        let d = JobDescriptor::parse("door;/scenes/door.mb;/out").unwrap();
        assert_eq!(d.engine, "software");
        assert_eq!(d.ignore_hidden, "1");
        assert_eq!(d.delete_hidden, "1");
        assert_eq!(d.use_scene_settings, "0");
    }

    #[test]
    fn parse_tolerates_trailing_semicolon() {
        assert!(JobDescriptor::parse("door;/scenes/door.mb;/out;").is_ok());
    }

    #[test]
    fn parse_rejects_too_few_fields() {
        assert!(JobDescriptor::parse("door;/scenes/door.mb").is_err());
    }

    #[test]
    fn parse_rejects_empty_required_field() {
        assert!(JobDescriptor::parse("door;;/out").is_err());
    }

    #[test]
    fn parse_rejects_unknown_engine() {
        assert!(JobDescriptor::parse("door;/scenes/door.mb;/out;raytracer").is_err());
    }

    // -- status transitions ---------------------------------------------------

    #[test]
    fn new_job_is_in_file_transfer() {
        let job = job();
        assert_eq!(job.status(), JobStatus::FileTransfer);
        assert!(!job.in_progress);
    }

    #[test]
    fn execution_states_set_in_progress() {
        let mut job = job();
        job.set_status(JobStatus::ScenePreparation);
        assert!(job.in_progress);
        job.set_status(JobStatus::Rendering);
        assert!(job.in_progress);
        job.set_status(JobStatus::ArtifactDetection);
        assert!(job.in_progress);
    }

    #[test]
    fn queued_does_not_set_in_progress() {
        let mut job = job();
        job.set_status(JobStatus::Queued);
        assert!(!job.in_progress);
    }

    #[test]
    fn finished_forces_progress_100_and_clears_in_progress() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_finished();
        assert_eq!(job.status(), JobStatus::Finished);
        assert_eq!(job.progress(), 100);
        assert!(!job.in_progress);
    }

    #[test]
    fn failed_forces_progress_zero() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_produced(4);
        job.set_failed();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 0);
        assert!(!job.in_progress);
    }

    #[test]
    fn finished_unreachable_from_failed() {
        let mut job = job();
        job.set_failed();
        job.set_finished();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn finished_unreachable_from_aborted() {
        let mut job = job();
        job.set_canceled();
        job.set_finished();
        assert_eq!(job.status(), JobStatus::Aborted);
    }

    #[test]
    fn cancel_overrides_failed() {
        let mut job = job();
        job.set_failed();
        job.set_canceled();
        assert_eq!(job.status(), JobStatus::Aborted);
    }

    #[test]
    fn failed_does_not_downgrade_aborted() {
        let mut job = job();
        job.set_canceled();
        job.set_failed();
        assert_eq!(job.status(), JobStatus::Aborted);
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_status(JobStatus::Queued);
        assert_eq!(job.status(), JobStatus::Rendering);
    }

    // -- progress derivation --------------------------------------------------

    #[test]
    fn progress_derived_from_artifact_counters() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_expected(10);
        job.set_produced(5);
        // 0.95 * 100 * 5/10 = 47.5 -> 48
        assert_eq!(job.progress(), 48);
    }

    #[test]
    fn progress_reserves_detection_tail_at_full_count() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_expected(10);
        job.set_produced(10);
        assert_eq!(job.progress(), 95);
    }

    #[test]
    fn progress_is_capped_at_100() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_expected(1);
        job.set_produced(50);
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn progress_with_zero_expected_does_not_divide_by_zero() {
        let mut job = job();
        job.set_status(JobStatus::Rendering);
        job.set_produced(3);
        // expected clamps to 1: 0.95 * 100 * 3 = 285 -> capped
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn progress_not_recomputed_after_terminal_state() {
        let mut job = job();
        job.set_finished();
        job.set_produced(1);
        assert_eq!(job.progress(), 100);
    }

    // -- file accessor --------------------------------------------------------

    #[test]
    fn file_prefers_staged_copy() {
        let mut job = job();
        assert_eq!(job.file(), Path::new("/scenes/seats.mb"));
        job.local_file = Some(PathBuf::from("/staging/seats.mb"));
        assert_eq!(job.file(), Path::new("/staging/seats.mb"));
    }
}
