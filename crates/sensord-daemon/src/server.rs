//! Local socket server.
//!
//! Owns one `.api` endpoint in the socket directory. Before binding, every
//! endpoint already in the directory is pinged: a live or hung server makes
//! startup fail, endpoints nobody listens on are removed. Each accepted
//! connection carries exactly one request frame and gets one response frame.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use sensord_rpc::transport::{FrameCodec, PING, PONG};
use sensord_rpc::{PING_TIMEOUT, endpoint_file_name, ping, search_api_sockets};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DaemonError, Result};

/// How long a client may take to send its request frame
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKET_MODE: u32 = 0o660;

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Turns one request payload into one response payload
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, payload: Bytes) -> BoxFuture<'_, Bytes>;
}

struct RunningServer {
    path: PathBuf,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

pub struct SocketServer<H: RequestHandler> {
    socket_dir: PathBuf,
    handler: Arc<H>,
    running: Option<RunningServer>,
}

impl<H: RequestHandler> SocketServer<H> {
    #[must_use]
    pub fn new(socket_dir: impl Into<PathBuf>, handler: Arc<H>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            handler,
            running: None,
        }
    }

    #[must_use]
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Endpoint file of the running server
    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        self.running.as_ref().map(|r| r.path.as_path())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Ping existing endpoints, clean up stale ones and start listening.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ServiceAlreadyRunning`] when another server
    /// answers or hangs on one of the endpoints, [`DaemonError::Bind`] when
    /// the new endpoint cannot be created, and I/O or ping errors otherwise.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.socket_dir).await?;

        let existing = search_api_sockets(&self.socket_dir)?;
        let pinged = ping(&existing, PING_TIMEOUT).await?;

        if pinged.has_running_server() {
            let mut owners = pinged.active_servers;
            owners.extend(pinged.timed_out_servers);
            return Err(DaemonError::ServiceAlreadyRunning(owners));
        }

        for stale in &pinged.stale_sockets {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => info!("[stale_socket_removed] path=[{}]", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let path = self.socket_dir.join(endpoint_file_name());
        let listener = UnixListener::bind(&path).map_err(|source| DaemonError::Bind {
            path: path.clone(),
            source,
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!("API server listening on {:?}", path);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handler),
            cancel.clone(),
            tracker.clone(),
        ));

        self.running = Some(RunningServer {
            path,
            cancel,
            tracker,
            accept_task,
        });
        Ok(())
    }

    /// Stop accepting, let in-flight requests finish and remove the endpoint.
    /// A server that is not running is left alone.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        running.tracker.close();
        running.tracker.wait().await;

        if let Err(e) = tokio::fs::remove_file(&running.path).await {
            warn!("Failed to remove socket file {:?}: {}", running.path, e);
        }
        info!("API server stopped");
    }
}

async fn accept_loop<H: RequestHandler>(
    listener: UnixListener,
    handler: Arc<H>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    trace!("Accepted connection");
                    let handler = Arc::clone(&handler);
                    tracker.spawn(async move {
                        if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                            debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    if !pause_after_accept_error(&cancel).await {
                        break;
                    }
                }
            },
        }
    }
}

/// Sleep before the next accept. False when cancelled meanwhile.
async fn pause_after_accept_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

async fn serve_connection<H: RequestHandler>(
    stream: UnixStream,
    handler: &H,
) -> std::result::Result<(), sensord_rpc::CodecError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let payload = match tokio::time::timeout(REQUEST_READ_TIMEOUT, framed.next()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => return Ok(()),
        Err(_) => {
            debug!("Client sent no request within {:?}", REQUEST_READ_TIMEOUT);
            return Ok(());
        }
    };

    let reply = if payload.as_ref() == PING {
        trace!("Answering ping");
        Bytes::from_static(PONG)
    } else {
        handler.handle(payload).await
    };

    framed.send(reply).await?;
    Ok(())
}
