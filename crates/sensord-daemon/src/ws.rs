//! WebSocket push endpoint client.
//!
//! One background task per endpoint keeps a connection open, reconnecting
//! with exponential backoff. Published messages are queued to that task;
//! while the endpoint is disconnected they are logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::sinks::EventPublisher;

/// How long registration waits for the first connection
pub const CONNECT_WAIT: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct WsClient {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    connected: watch::Receiver<bool>,
    closed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsClient {
    /// Validate `uri` and spawn the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidUri`] unless `uri` uses `ws://` or `wss://`.
    pub fn spawn(name: &str, uri: &str) -> Result<Arc<Self>, SinkError> {
        validate_uri(uri)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(ws_loop(
            name.to_string(),
            uri.to_string(),
            rx,
            connected_tx,
            cancel.clone(),
        ));

        Ok(Arc::new(Self {
            name: name.to_string(),
            tx,
            connected,
            closed: AtomicBool::new(false),
            cancel,
            task: Mutex::new(Some(task)),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the endpoint is connected; false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        matches!(
            tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await,
            Ok(Ok(_))
        )
    }
}

impl EventPublisher for WsClient {
    fn publish(&self, _topic: Option<&str>, payload: &str) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed(self.name.clone()));
        }

        if !self.is_connected() {
            warn!(
                "[websocket_message_not_sent] name=[{}] reason=[disconnected]",
                self.name
            );
            return Err(SinkError::Disconnected(self.name.clone()));
        }

        self.tx
            .send(payload.to_string())
            .map_err(|_| SinkError::Closed(self.name.clone()))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.cancel.cancel();

            let task = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task
                && let Err(e) = task.await
            {
                debug!("[websocket_task_failed] name=[{}] error=[{}]", self.name, e);
            }
            debug!("[websocket_closed] name=[{}]", self.name);
        }
        .boxed()
    }
}

fn validate_uri(uri: &str) -> Result<(), SinkError> {
    let invalid = |reason: &str| SinkError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let rest = uri
        .strip_prefix("ws://")
        .or_else(|| uri.strip_prefix("wss://"))
        .ok_or_else(|| invalid("scheme must be ws or wss"))?;

    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid("missing host"));
    }
    Ok(())
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(MAX_BACKOFF)
}

async fn ws_loop(
    name: String,
    uri: String,
    mut rx: mpsc::UnboundedReceiver<String>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    while !cancel.is_cancelled() {
        let result = connect_and_serve(&name, &uri, &mut rx, &connected, &cancel).await;
        connected.send_replace(false);
        if cancel.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => {
                info!("[websocket_disconnected] name=[{}]", name);
                attempt = 0;
            }
            Err(e) => {
                warn!("[websocket_error] name=[{}] attempt=[{}] error=[{}]", name, attempt, e);
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff(attempt)) => {}
        }
        attempt = attempt.saturating_add(1);
    }

    connected.send_replace(false);
    debug!("[websocket_loop_exit] name=[{}]", name);
}

async fn connect_and_serve(
    name: &str,
    uri: &str,
    rx: &mut mpsc::UnboundedReceiver<String>,
    connected: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (stream, _response) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        connected = tokio_tungstenite::connect_async(uri) => connected?,
    };
    let (mut write, mut read) = stream.split();

    // Anything queued while disconnected was already reported as dropped
    while rx.try_recv().is_ok() {}

    connected.send_replace(true);
    info!("[websocket_connected] name=[{}] uri=[{}]", name, uri);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("[websocket_close_frame_failed] name=[{}] error=[{}]", name, e);
                }
                return Ok(());
            }
            message = rx.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                write.send(Message::text(message)).await?;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_uri() {
        assert!(validate_uri("ws://localhost:8080/events").is_ok());
        assert!(validate_uri("wss://hub.example.org").is_ok());
        assert!(matches!(
            validate_uri("http://localhost"),
            Err(SinkError::InvalidUri { .. })
        ));
        assert!(validate_uri("ws://").is_err());
        assert!(validate_uri("ws:///path").is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(10), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_close_sends_close_frame() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let closing = message.is_close();
                let _ = seen_tx.send(message);
                if closing {
                    break;
                }
            }
        });

        let client = WsClient::spawn("hub", &format!("ws://{addr}/")).unwrap();
        assert!(client.wait_connected(Duration::from_secs(5)).await);
        client.publish(None, r#"{"presence":true}"#).unwrap();

        let wait = Duration::from_secs(5);
        let first = tokio::time::timeout(wait, seen.recv()).await.unwrap().unwrap();
        assert_eq!(first, Message::text(r#"{"presence":true}"#));

        client.close().await;
        let last = tokio::time::timeout(wait, seen.recv()).await.unwrap().unwrap();
        assert!(last.is_close());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_drops_messages() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let client = WsClient::spawn("hub", "ws://127.0.0.1:9/").unwrap();

        assert!(!client.wait_connected(Duration::from_millis(200)).await);
        assert!(matches!(
            client.publish(None, "{}"),
            Err(SinkError::Disconnected(name)) if name == "hub"
        ));

        client.close().await;
        assert!(matches!(
            client.publish(None, "{}"),
            Err(SinkError::Closed(_))
        ));
        // Second close is a no-op
        client.close().await;
    }
}
