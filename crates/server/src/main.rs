use std::sync::Arc;

use anyhow::Context;
use layersmith_core::config::Settings;
use layersmith_events::{announcer, StatusNotifier};
use layersmith_renderer::ProcessLauncher;
use layersmith_scheduler::Scheduler;
use layersmith_server::serve_control;
use layersmith_watcher::OutputWatcher;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "layersmith=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env());
    let cancel = CancellationToken::new();

    // Status notification channel.
    let notifier = StatusNotifier::new();
    let notifier_handle = notifier.handle();
    let notify_listener = TcpListener::bind(settings.notify_addr())
        .await
        .with_context(|| format!("binding notification listener on {}", settings.notify_addr()))?;
    tokio::spawn(notifier.serve(notify_listener, Arc::clone(&settings), cancel.clone()));

    // Output watcher.
    let (watcher_events_tx, watcher_events_rx) = mpsc::channel(64);
    let watcher_handle =
        OutputWatcher::spawn(Arc::clone(&settings), watcher_events_tx, cancel.clone());

    // Scheduler loop.
    let scheduler = Scheduler::spawn(
        Arc::clone(&settings),
        Box::new(ProcessLauncher),
        watcher_handle,
        watcher_events_rx,
        notifier_handle.clone(),
        cancel.clone(),
    );

    // Service announcement.
    tokio::spawn(announcer::announce(Arc::clone(&settings), cancel.clone()));

    // Control protocol server.
    let control_listener = TcpListener::bind(settings.control_addr())
        .await
        .with_context(|| format!("binding control listener on {}", settings.control_addr()))?;
    let control = tokio::spawn(serve_control(
        control_listener,
        scheduler,
        Arc::clone(&settings),
        cancel.clone(),
    ));

    notifier_handle.notify(format!("Render service available @ {}", settings.hostname));
    tracing::info!(
        control = %settings.control_addr(),
        notify = %settings.notify_addr(),
        "layersmith controller running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), control).await;
    tracing::info!("Controller shut down");
    Ok(())
}
