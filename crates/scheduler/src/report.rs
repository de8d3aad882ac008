//! Job report file.
//!
//! When a job leaves the active slot a plain-text summary is written next
//! to its render output, so whoever picks up the directory later can see
//! what produced it. Best-effort: a report that cannot be written is logged
//! and forgotten.

use layersmith_core::job::Job;

const REPORT_FILE_NAME: &str = "report.txt";

fn render_report(job: &Job) -> String {
    format!(
        "job:      {title}\n\
         client:   {client}\n\
         scene:    {scene}\n\
         engine:   {engine}\n\
         status:   {status}\n\
         progress: {progress}%\n\
         layers:   {produced}/{expected}\n\
         created:  {created}\n",
        title = job.title,
        client = job.client,
        scene = job.file().display(),
        engine = job.engine,
        status = job.status().label(),
        progress = job.progress(),
        produced = job.produced,
        expected = job.expected,
        created = job.created.to_rfc3339(),
    )
}

/// Write the summary into the job's render directory.
pub async fn write_job_report(job: &Job) {
    if !job.render_dir.exists() {
        return;
    }

    let path = job.render_dir.join(REPORT_FILE_NAME);
    if let Err(e) = tokio::fs::write(&path, render_report(job)).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write job report");
    }
}
