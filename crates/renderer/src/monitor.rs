//! Subprocess output draining.
//!
//! Each phase's stdout and stderr are read line by line into the log while
//! the pipeline task waits on the child. Scene preparation additionally
//! reports how many render layers it created through a stdout marker line,
//! `layer count: <n>`, which we parse to size the job's expected artifact
//! count.

use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pipeline::{PipelineEvent, RenderPhase};

fn layer_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)layer count:\s*(\d+)").unwrap())
}

/// Extract the layer count from a preparation stdout line, if present.
pub fn parse_layer_count(line: &str) -> Option<u32> {
    layer_count_re()
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Drain one output stream into the log until EOF.
///
/// For the preparation phase, marker lines are translated into
/// [`PipelineEvent::LayerCount`] events.
pub async fn drain_stream<R>(
    reader: R,
    job_id: Uuid,
    phase: RenderPhase,
    events: mpsc::Sender<PipelineEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                tracing::info!(phase = %phase, "{line}");

                if phase == RenderPhase::ScenePreparation {
                    if let Some(count) = parse_layer_count(line) {
                        let _ = events
                            .send(PipelineEvent::LayerCount { job_id, count })
                            .await;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(phase = %phase, error = %e, "Error reading process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layer_count_marker() {
        assert_eq!(parse_layer_count("layer count: 12"), Some(12));
    }

    #[test]
    fn parses_marker_with_surrounding_output() {
        assert_eq!(
            parse_layer_count("[prep] done, layer count: 7 (materials)"),
            Some(7)
        );
    }

    #[test]
    fn marker_is_case_insensitive() {
        assert_eq!(parse_layer_count("Layer Count: 3"), Some(3));
    }

    #[test]
    fn ordinary_lines_have_no_count() {
        assert_eq!(parse_layer_count("rendering frame 4"), None);
    }
}
