//! One-way status notification channel.
//!
//! Clients connect to the notification port and receive UTF-8 status lines
//! as they happen. The channel is strictly best-effort: no acknowledgement,
//! no retry, and a client that cannot keep up or whose connection breaks is
//! silently dropped.

use std::sync::Arc;

use layersmith_core::config::Settings;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Broadcast capacity; a slow client lags past this and gets dropped.
const CHANNEL_CAPACITY: usize = 256;

/// Cloneable sender for status messages.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: broadcast::Sender<String>,
}

impl NotifierHandle {
    /// Queue a status line for every connected client. Never blocks and
    /// never fails; with no clients connected the message evaporates.
    pub fn notify(&self, message: impl Into<String>) {
        let _ = self.tx.send(message.into());
    }
}

pub struct StatusNotifier {
    tx: broadcast::Sender<String>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn handle(&self) -> NotifierHandle {
        NotifierHandle {
            tx: self.tx.clone(),
        }
    }

    /// Accept notification subscribers until cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        settings: Arc<Settings>,
        cancel: CancellationToken,
    ) {
        tracing::info!(addr = %settings.notify_addr(), "Status notification channel listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Notification client connected");
                        let rx = self.tx.subscribe();
                        tokio::spawn(forward_to_client(stream, rx, cancel.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept notification client");
                    }
                },
            }
        }
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy broadcast messages to one client until it misbehaves or we shut
/// down. Lagged receivers skip ahead; that loss is the contract.
async fn forward_to_client(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Notification client lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        let line = format!("{message}\n");
        if stream.write_all(line.as_bytes()).await.is_err() {
            tracing::debug!("Notification client dropped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn connected_client_receives_status_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notifier = StatusNotifier::new();
        let handle = notifier.handle();
        let cancel = CancellationToken::new();

        let settings = Arc::new(Settings::default());
        tokio::spawn(notifier.serve(listener, settings, cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Give the accept loop a moment to subscribe the client.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        handle.notify("job accepted");

        let mut buf = vec![0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"job accepted\n");

        cancel.cancel();
    }

    #[test]
    fn notify_without_clients_is_a_no_op() {
        let notifier = StatusNotifier::new();
        notifier.handle().notify("nobody is listening");
    }
}
