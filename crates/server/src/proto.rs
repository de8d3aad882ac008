//! Control protocol grammar and response texts.
//!
//! Requests are single UTF-8 text messages: a verb, optionally followed by
//! one space and its arguments. Responses are free-form text; only
//! `GET_JOB_DATA` has structure (a JSON snapshot framed by sentinels,
//! produced by the scheduler).

use layersmith_core::engine;
use layersmith_scheduler::StatusSummary;

/// Minimum client protocol version the greeting accepts.
pub const MIN_CLIENT_VERSION: u32 = 2;

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Greeting { version: u32 },
    GetRenderer,
    AddJob { args: String },
    GetStatus,
    GetJobData,
    MoveJobTop { index: usize },
    MoveJobBack { index: usize },
    CancelJob { index: usize },
    ForcePsdCreation { index: usize },
    Unknown,
}

impl Request {
    pub fn parse(message: &str) -> Self {
        let message = message.trim();

        if let Some(rest) = message.strip_prefix("GREETING") {
            // The version is whatever trailing integer the client sent;
            // absent or malformed counts as unsupported.
            let version = rest.trim().parse().unwrap_or(0);
            return Request::Greeting { version };
        }
        if message == "GET_RENDERER" {
            return Request::GetRenderer;
        }
        if let Some(args) = message.strip_prefix("ADD_JOB ") {
            return Request::AddJob {
                args: args.to_string(),
            };
        }
        if message == "GET_STATUS" {
            return Request::GetStatus;
        }
        if message == "GET_JOB_DATA" {
            return Request::GetJobData;
        }
        if let Some(index) = parse_index(message, "MOVE_JOB_TOP ") {
            return Request::MoveJobTop { index };
        }
        if let Some(index) = parse_index(message, "MOVE_JOB_BACK ") {
            return Request::MoveJobBack { index };
        }
        if let Some(index) = parse_index(message, "CANCEL_JOB ") {
            return Request::CancelJob { index };
        }
        if let Some(index) = parse_index(message, "FORCE_PSD_CREATION ") {
            return Request::ForcePsdCreation { index };
        }

        Request::Unknown
    }
}

fn parse_index(message: &str, prefix: &str) -> Option<usize> {
    message.strip_prefix(prefix)?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Response texts
// ---------------------------------------------------------------------------

pub fn unknown_command() -> String {
    "Unknown command".to_string()
}

pub fn greeting(version: u32, hostname: &str) -> String {
    if version >= MIN_CLIENT_VERSION {
        tracing::info!(version, "Client connected");
        format!("Render service available @ {hostname}")
    } else {
        tracing::info!(version, "Unsupported client version connected");
        format!(
            "Render service available @ {hostname} - \
             this client version is not supported, please update"
        )
    }
}

pub fn renderer_listing() -> String {
    format!("RENDERER {}", engine::listing())
}

pub fn job_added(index: usize) -> String {
    format!("Job #{index:02} added to the running queue.")
}

pub fn job_rejected() -> String {
    "Job rejected: the scene file or output directory is not reachable from the server."
        .to_string()
}

pub fn job_moved(title: &str) -> String {
    format!("{title} moved in the queue.")
}

pub fn job_move_failed(index: usize) -> String {
    format!("Job with index {index} could not be moved.")
}

pub fn job_canceling(title: &str) -> String {
    format!("{title} is being canceled.")
}

pub fn job_cancel_failed(index: usize) -> String {
    format!("Job with index {index} could not be canceled.")
}

pub fn forcing_assembly(title: &str) -> String {
    format!("Forcing composite creation for job {title}.")
}

pub fn force_assembly_failed(index: usize) -> String {
    format!("Cannot force composite creation for job at index {index}.")
}

pub fn status_summary(status: &StatusSummary) -> String {
    match &status.active_title {
        Some(title) => format!(
            "Currently rendering: {title} - {produced:03}/{expected:03} layers created. \
             {queued:02} jobs in the queue.",
            produced = status.produced,
            expected = status.expected,
            queued = status.queued,
        ),
        None => format!(
            "No job in progress. {queued:02} jobs in the queue.",
            queued = status.queued
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- parsing --------------------------------------------------------------

    #[test]
    fn parses_greeting_with_version() {
        assert_eq!(Request::parse("GREETING 3"), Request::Greeting { version: 3 });
    }

    #[test]
    fn greeting_without_version_is_version_zero() {
        assert_eq!(Request::parse("GREETING"), Request::Greeting { version: 0 });
    }

    #[test]
    fn parses_get_renderer() {
        assert_eq!(Request::parse("GET_RENDERER"), Request::GetRenderer);
    }

    #[test]
    fn parses_add_job_with_raw_args() {
        assert_eq!(
            Request::parse("ADD_JOB seats;/scenes/seats.mb;/out;software"),
            Request::AddJob {
                args: "seats;/scenes/seats.mb;/out;software".to_string()
            }
        );
    }

    #[test]
    fn parses_queue_queries() {
        assert_eq!(Request::parse("GET_STATUS"), Request::GetStatus);
        assert_eq!(Request::parse("GET_JOB_DATA"), Request::GetJobData);
    }

    #[test]
    fn parses_move_verbs() {
        assert_eq!(Request::parse("MOVE_JOB_TOP 2"), Request::MoveJobTop { index: 2 });
        assert_eq!(
            Request::parse("MOVE_JOB_BACK 0"),
            Request::MoveJobBack { index: 0 }
        );
    }

    #[test]
    fn parses_cancel_and_force() {
        assert_eq!(Request::parse("CANCEL_JOB 1"), Request::CancelJob { index: 1 });
        assert_eq!(
            Request::parse("FORCE_PSD_CREATION 0"),
            Request::ForcePsdCreation { index: 0 }
        );
    }

    #[test]
    fn malformed_index_is_unknown() {
        assert_eq!(Request::parse("CANCEL_JOB seven"), Request::Unknown);
        assert_eq!(Request::parse("MOVE_JOB_TOP"), Request::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(Request::parse("MAKE_COFFEE"), Request::Unknown);
        assert_eq!(Request::parse(""), Request::Unknown);
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        assert_eq!(Request::parse("  GET_STATUS \r\n"), Request::GetStatus);
    }

    // -- responses ------------------------------------------------------------

    #[test]
    fn greeting_accepts_supported_version() {
        let text = greeting(MIN_CLIENT_VERSION, "renderhost");
        assert_eq!(text, "Render service available @ renderhost");
    }

    #[test]
    fn greeting_flags_unsupported_version() {
        let text = greeting(1, "renderhost");
        assert!(text.contains("not supported"));
    }

    #[test]
    fn renderer_listing_uses_engine_names() {
        assert_eq!(renderer_listing(), "RENDERER software;hardware");
    }

    #[test]
    fn status_text_without_active_job() {
        let status = StatusSummary {
            active_title: None,
            produced: 0,
            expected: 0,
            queued: 3,
        };
        assert_eq!(
            status_summary(&status),
            "No job in progress. 03 jobs in the queue."
        );
    }

    #[test]
    fn status_text_with_active_job() {
        let status = StatusSummary {
            active_title: Some("seats".to_string()),
            produced: 4,
            expected: 12,
            queued: 1,
        };
        let text = status_summary(&status);
        assert!(text.contains("seats"));
        assert!(text.contains("004/012"));
    }
}
