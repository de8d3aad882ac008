//! Two ordered views over one set of jobs.
//!
//! The *working* view holds jobs that have not started yet, in start order;
//! the *history* view holds every submitted job in the order clients see it
//! when polling. The active job is owned by the scheduler and appears only
//! in the history view.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use layersmith_core::job::{Job, JobStatus};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    working: VecDeque<Uuid>,
    history: Vec<Uuid>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to both views and return its id.
    pub fn insert(&mut self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.insert(id, job);
        self.working.push_back(id);
        self.history.push(id);
        self.refresh_remote_indices();
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Id of the job at `index` in the history view.
    pub fn id_at(&self, index: usize) -> Option<Uuid> {
        self.history.get(index).copied()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    /// Jobs in history order, for serialization.
    pub fn history_jobs(&self) -> impl Iterator<Item = &Job> {
        self.history.iter().filter_map(|id| self.jobs.get(id))
    }

    /// Pop the working-queue head if it is ready to start. A job still in
    /// file transfer blocks the head until staging finishes.
    pub fn pop_ready(&mut self) -> Option<Uuid> {
        let id = *self.working.front()?;
        if self.jobs.get(&id)?.status() != JobStatus::Queued {
            return None;
        }
        self.working.pop_front()
    }

    pub fn remove_from_working(&mut self, id: Uuid) -> bool {
        match self.working.iter().position(|w| *w == id) {
            Some(pos) => {
                self.working.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Reposition a job at the head or tail of both views.
    pub fn move_job(&mut self, id: Uuid, to_top: bool) {
        if let Some(pos) = self.working.iter().position(|w| *w == id) {
            self.working.remove(pos);
            if to_top {
                self.working.push_front(id);
            } else {
                self.working.push_back(id);
            }
        }
        if let Some(pos) = self.history.iter().position(|h| *h == id) {
            self.history.remove(pos);
            if to_top {
                self.history.insert(0, id);
            } else {
                self.history.push(id);
            }
        }
        self.refresh_remote_indices();
    }

    /// Move a job to index 0 of the history view only.
    pub fn pin_to_top(&mut self, id: Uuid) {
        if let Some(pos) = self.history.iter().position(|h| *h == id) {
            self.history.remove(pos);
            self.history.insert(0, id);
        }
        self.refresh_remote_indices();
    }

    /// Drop history entries older than `max_age`, independent of status.
    /// `keep` protects the active job from being swept mid-run.
    pub fn sweep_expired(&mut self, max_age: Duration, keep: Option<Uuid>) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = Utc::now() - max_age;

        let expired: Vec<Uuid> = self
            .history
            .iter()
            .copied()
            .filter(|id| Some(*id) != keep)
            .filter(|id| self.jobs.get(id).map_or(true, |job| job.created < cutoff))
            .collect();

        for id in &expired {
            self.jobs.remove(id);
            self.remove_from_working(*id);
        }
        self.history.retain(|id| !expired.contains(id));
        self.refresh_remote_indices();

        expired.len()
    }

    /// True when the queue has jobs and every one of them is terminal;
    /// clients can stop polling.
    pub fn all_terminal(&self) -> bool {
        !self.history.is_empty()
            && self
                .history_jobs()
                .all(|job| job.status().is_terminal())
    }

    /// The number of jobs currently flagged in progress. The scheduler
    /// keeps this at 0 or 1.
    pub fn in_progress_count(&self) -> usize {
        self.jobs.values().filter(|j| j.in_progress).count()
    }

    fn refresh_remote_indices(&mut self) {
        for (index, id) in self.history.iter().enumerate() {
            if let Some(job) = self.jobs.get_mut(id) {
                job.remote_index = index;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersmith_core::job::JobDescriptor;
    use std::path::PathBuf;

    fn job(title: &str) -> Job {
        Job::new(
            JobDescriptor {
                title: title.to_string(),
                scene_file: PathBuf::from("/scenes/a.mb"),
                render_dir: PathBuf::from("/out"),
                engine: "software".to_string(),
                ignore_hidden: "1".to_string(),
                delete_hidden: "1".to_string(),
                use_scene_settings: "0".to_string(),
            },
            "server",
        )
    }

    fn queued_job(title: &str) -> Job {
        let mut job = job(title);
        job.set_status(JobStatus::Queued);
        job
    }

    fn titles(queue: &JobQueue) -> Vec<String> {
        queue.history_jobs().map(|j| j.title.clone()).collect()
    }

    #[test]
    fn insert_appends_to_both_views() {
        let mut queue = JobQueue::new();
        queue.insert(queued_job("a"));
        queue.insert(queued_job("b"));
        assert_eq!(queue.history_len(), 2);
        assert_eq!(queue.working_len(), 2);
        assert_eq!(titles(&queue), ["a", "b"]);
    }

    #[test]
    fn remote_indices_follow_history_order() {
        let mut queue = JobQueue::new();
        queue.insert(queued_job("a"));
        let b = queue.insert(queued_job("b"));
        queue.move_job(b, true);
        assert_eq!(queue.get(&b).unwrap().remote_index, 0);
    }

    #[test]
    fn pop_ready_skips_job_in_file_transfer() {
        let mut queue = JobQueue::new();
        queue.insert(job("staging"));
        assert_eq!(queue.pop_ready(), None);
    }

    #[test]
    fn pop_ready_returns_queued_head() {
        let mut queue = JobQueue::new();
        let a = queue.insert(queued_job("a"));
        queue.insert(queued_job("b"));
        assert_eq!(queue.pop_ready(), Some(a));
        assert_eq!(queue.working_len(), 1);
        // Still in history for clients.
        assert_eq!(queue.history_len(), 2);
    }

    #[test]
    fn move_to_top_reorders_both_views() {
        let mut queue = JobQueue::new();
        queue.insert(queued_job("a"));
        queue.insert(queued_job("b"));
        let c = queue.insert(queued_job("c"));
        queue.move_job(c, true);
        assert_eq!(titles(&queue), ["c", "a", "b"]);
        assert_eq!(queue.pop_ready(), Some(c));
    }

    #[test]
    fn move_to_back_reorders_both_views() {
        let mut queue = JobQueue::new();
        let a = queue.insert(queued_job("a"));
        queue.insert(queued_job("b"));
        queue.move_job(a, false);
        assert_eq!(titles(&queue), ["b", "a"]);
    }

    #[test]
    fn pin_to_top_touches_history_only() {
        let mut queue = JobQueue::new();
        queue.insert(queued_job("a"));
        let b = queue.insert(queued_job("b"));
        let a = queue.id_at(0).unwrap();
        queue.pin_to_top(b);
        assert_eq!(titles(&queue), ["b", "a"]);
        // Working order is unchanged.
        assert_eq!(queue.pop_ready(), Some(a));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let mut queue = JobQueue::new();
        let old = queue.insert(queued_job("old"));
        queue.insert(queued_job("fresh"));
        queue.get_mut(&old).unwrap().created = Utc::now() - chrono::Duration::hours(25);

        let removed = queue.sweep_expired(Duration::from_secs(24 * 60 * 60), None);
        assert_eq!(removed, 1);
        assert_eq!(titles(&queue), ["fresh"]);
        assert_eq!(queue.working_len(), 1);
    }

    #[test]
    fn sweep_spares_the_active_job() {
        let mut queue = JobQueue::new();
        let active = queue.insert(queued_job("active"));
        queue.get_mut(&active).unwrap().created = Utc::now() - chrono::Duration::hours(25);

        let removed = queue.sweep_expired(Duration::from_secs(24 * 60 * 60), Some(active));
        assert_eq!(removed, 0);
        assert_eq!(queue.history_len(), 1);
    }

    #[test]
    fn sweep_removes_expired_terminal_and_pending_alike() {
        let mut queue = JobQueue::new();
        let done = queue.insert(queued_job("done"));
        queue.get_mut(&done).unwrap().set_finished();
        queue.get_mut(&done).unwrap().created = Utc::now() - chrono::Duration::hours(30);

        let removed = queue.sweep_expired(Duration::from_secs(24 * 60 * 60), None);
        assert_eq!(removed, 1);
        assert_eq!(queue.history_len(), 0);
    }

    #[test]
    fn all_terminal_requires_jobs() {
        let queue = JobQueue::new();
        assert!(!queue.all_terminal());
    }

    #[test]
    fn all_terminal_tracks_statuses() {
        let mut queue = JobQueue::new();
        let a = queue.insert(queued_job("a"));
        assert!(!queue.all_terminal());
        queue.get_mut(&a).unwrap().set_finished();
        assert!(queue.all_terminal());
    }

    #[test]
    fn in_progress_count_is_bounded_by_scheduler_usage() {
        let mut queue = JobQueue::new();
        let a = queue.insert(queued_job("a"));
        queue.insert(queued_job("b"));
        queue.get_mut(&a).unwrap().set_status(JobStatus::Rendering);
        assert_eq!(queue.in_progress_count(), 1);
    }
}
