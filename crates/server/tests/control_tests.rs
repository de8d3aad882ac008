//! Protocol round-trips against a full controller stack on ephemeral ports.
//!
//! Only commands that never reach the external render tools are exercised
//! here; scheduler lifecycle behavior is covered in the scheduler crate.

use std::net::SocketAddr;
use std::sync::Arc;

use layersmith_core::config::Settings;
use layersmith_events::StatusNotifier;
use layersmith_renderer::ProcessLauncher;
use layersmith_scheduler::Scheduler;
use layersmith_server::serve_control;
use layersmith_watcher::OutputWatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Stack {
    addr: SocketAddr,
    _cancel: CancellationToken,
}

async fn spawn_stack() -> Stack {
    let settings = Arc::new(Settings::default());
    let cancel = CancellationToken::new();

    let (watcher_events_tx, watcher_events_rx) = mpsc::channel(64);
    let watcher =
        OutputWatcher::spawn(Arc::clone(&settings), watcher_events_tx, cancel.clone());

    let notifier = StatusNotifier::new();
    let scheduler = Scheduler::spawn(
        Arc::clone(&settings),
        Box::new(ProcessLauncher),
        watcher,
        watcher_events_rx,
        notifier.handle(),
        cancel.clone(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_control(listener, scheduler, settings, cancel.clone()));

    Stack {
        addr,
        _cancel: cancel,
    }
}

async fn send(addr: SocketAddr, message: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(message.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn greeting_reports_availability() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "GREETING 3").await;
    assert_eq!(response, "Render service available @ localhost");
}

#[tokio::test]
async fn outdated_client_is_told_to_update() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "GREETING 1").await;
    assert!(response.contains("not supported"));
}

#[tokio::test]
async fn renderer_listing_is_transferred() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "GET_RENDERER").await;
    assert_eq!(response, "RENDERER software;hardware");
}

#[tokio::test]
async fn empty_queue_snapshot_has_end_sentinel() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "GET_JOB_DATA").await;
    assert_eq!(response, "{}End-Of-Job-Data");
}

#[tokio::test]
async fn unknown_verbs_are_answered() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "MAKE_COFFEE now").await;
    assert_eq!(response, "Unknown command");
}

#[tokio::test]
async fn submission_with_unreachable_paths_is_rejected() {
    let stack = spawn_stack().await;
    let response = send(
        stack.addr,
        "ADD_JOB ghost;/nonexistent/scene.mb;/nonexistent/out;software",
    )
    .await;
    assert!(response.starts_with("Job rejected"));
}

#[tokio::test]
async fn cancel_with_bad_index_reports_failure() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "CANCEL_JOB 5").await;
    assert_eq!(response, "Job with index 5 could not be canceled.");
}

#[tokio::test]
async fn status_is_reported_with_empty_queue() {
    let stack = spawn_stack().await;
    let response = send(stack.addr, "GET_STATUS").await;
    assert_eq!(response, "No job in progress. 00 jobs in the queue.");
}
