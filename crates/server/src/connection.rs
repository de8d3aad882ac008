//! Control connection handling.
//!
//! One task per accepted connection, capped by a semaphore so a flood of
//! clients cannot exhaust the process. Each connection serves exactly one
//! request: read (bounded in size and time), forward to the scheduler, wait
//! up to the response timeout, answer, close. A timed-out request closes
//! the connection without payload; the client retries and no state is
//! corrupted because the scheduler processed or will process the command
//! exactly once either way.

use std::sync::Arc;

use layersmith_core::config::Settings;
use layersmith_scheduler::{SchedulerError, SchedulerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::proto::{self, Request};

/// Accept control connections until cancelled.
pub async fn serve_control(
    listener: TcpListener,
    scheduler: SchedulerHandle,
    settings: Arc<Settings>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(settings.max_connections));
    tracing::info!(addr = %settings.control_addr(), "Control protocol server listening");

    loop {
        // Waiting for a permit before accepting applies backpressure to
        // the listen queue instead of spawning without bound.
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let scheduler = scheduler.clone();
                    let settings = Arc::clone(&settings);
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, peer.ip().to_string(), scheduler, settings).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept control connection");
                }
            },
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client: String,
    scheduler: SchedulerHandle,
    settings: Arc<Settings>,
) {
    let message = match read_request(&mut stream, &settings).await {
        Some(message) => message,
        None => return,
    };

    let request = Request::parse(&message);
    if !matches!(request, Request::GetJobData) {
        tracing::debug!(client = %client, request = %message, "Control request received");
    }

    let response = tokio::time::timeout(
        settings.response_timeout,
        dispatch(request, &client, &scheduler, &settings),
    )
    .await;

    match response {
        Ok(Ok(response)) => {
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                tracing::debug!(client = %client, error = %e, "Failed to write response");
            }
        }
        Ok(Err(SchedulerError)) => {
            tracing::warn!(client = %client, "Scheduler gone, closing connection");
        }
        Err(_) => {
            // Close without payload; the client is expected to retry.
            tracing::warn!(client = %client, "Response timed out, closing connection");
        }
    }
}

/// Read one request, bounded by the receive timeout and the maximum
/// request size.
async fn read_request(stream: &mut TcpStream, settings: &Settings) -> Option<String> {
    let mut buf = vec![0u8; settings.max_request_bytes];
    let mut filled = 0;

    loop {
        let read = tokio::time::timeout(settings.recv_timeout, stream.read(&mut buf[filled..]));
        match read.await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                filled += n;
                if filled == buf.len() {
                    break;
                }
                // A complete request is a single message; a short gap after
                // the first chunk means the client is done sending.
                let mut probe = [0u8; 1];
                let settle = tokio::time::timeout(
                    std::time::Duration::from_millis(50),
                    stream.peek(&mut probe),
                )
                .await;
                match settle {
                    Ok(Ok(n)) if n > 0 => continue,
                    _ => break,
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Control connection read failed");
                return None;
            }
            Err(_) => break,
        }
    }

    if filled == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..filled]).into_owned())
}

async fn dispatch(
    request: Request,
    client: &str,
    scheduler: &SchedulerHandle,
    settings: &Settings,
) -> Result<String, SchedulerError> {
    match request {
        Request::Greeting { version } => Ok(proto::greeting(version, &settings.hostname)),
        Request::GetRenderer => Ok(proto::renderer_listing()),
        Request::AddJob { args } => {
            let result = scheduler.add_job(args, client).await?;
            Ok(match result {
                Some(index) => proto::job_added(index),
                None => proto::job_rejected(),
            })
        }
        Request::GetStatus => {
            let status = scheduler.status().await?;
            Ok(proto::status_summary(&status))
        }
        Request::GetJobData => scheduler.job_data().await,
        Request::MoveJobTop { index } => {
            let moved = scheduler.move_job(index, true).await?;
            Ok(match moved {
                Some(title) => proto::job_moved(&title),
                None => proto::job_move_failed(index),
            })
        }
        Request::MoveJobBack { index } => {
            let moved = scheduler.move_job(index, false).await?;
            Ok(match moved {
                Some(title) => proto::job_moved(&title),
                None => proto::job_move_failed(index),
            })
        }
        Request::CancelJob { index } => {
            let canceled = scheduler.cancel_job(index).await?;
            Ok(match canceled {
                Some(title) => proto::job_canceling(&title),
                None => proto::job_cancel_failed(index),
            })
        }
        Request::ForcePsdCreation { index } => {
            let forced = scheduler.force_assembly(index).await?;
            Ok(match forced {
                Some(title) => proto::forcing_assembly(&title),
                None => proto::force_assembly_failed(index),
            })
        }
        Request::Unknown => Ok(proto::unknown_command()),
    }
}
