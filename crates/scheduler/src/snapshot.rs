//! Cached queue serialization for client polling.
//!
//! Clients poll `GET_JOB_DATA` at high frequency, so the serialized form is
//! cached and only rebuilt after a mutation invalidated it. The payload is
//! framed with a fixed end-of-data sentinel, preceded by a queue-finished
//! sentinel once every history entry is terminal so clients know to stop
//! polling.

use serde_json::{Map, Value};

use crate::queue::JobQueue;

/// Terminates every `GET_JOB_DATA` payload.
pub const JOB_DATA_EOS: &str = "End-Of-Job-Data";

/// Inserted before the end sentinel once all jobs are terminal.
pub const QUEUE_FINISHED: &str = "Queue-Finished";

#[derive(Debug, Default)]
pub struct SnapshotCache {
    cached: Option<String>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached serialization. Called by every mutating queue
    /// operation.
    pub fn invalidate(&mut self) {
        if self.cached.take().is_some() {
            tracing::debug!("Queue snapshot cache invalidated");
        }
    }

    /// The full `GET_JOB_DATA` payload, rebuilding the snapshot if needed.
    pub fn payload(&mut self, queue: &JobQueue) -> String {
        let serialized = self
            .cached
            .get_or_insert_with(|| serialize_queue(queue))
            .clone();

        let mut payload = serialized;
        if queue.all_terminal() {
            tracing::debug!("All jobs terminal, signalling queue finished");
            payload.push_str(QUEUE_FINISHED);
        }
        payload.push_str(JOB_DATA_EOS);
        payload
    }
}

/// Serialize the history view as a JSON object keyed by queue position.
fn serialize_queue(queue: &JobQueue) -> String {
    let mut map = Map::new();
    for (index, job) in queue.history_jobs().enumerate() {
        match serde_json::to_value(job) {
            Ok(value) => {
                map.insert(index.to_string(), value);
            }
            Err(e) => {
                tracing::error!(job = %job.title, error = %e, "Failed to serialize job");
            }
        }
    }
    Value::Object(map).to_string()
}
