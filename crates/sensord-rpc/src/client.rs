//! API client for the sensord daemon.
//!
//! Every request opens a fresh connection, sends one frame and reads one
//! frame back. The same connection discipline drives the liveness ping
//! that a starting server runs against existing endpoints.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use sensord_types::{
    Command, CommandArg, SensorCommandResponses, SensorConfigChainResponses, SensorStatuses,
};

use crate::endpoint::{search_api_sockets, socket_dir};
use crate::protocol::{
    METHOD_COMMAND, METHOD_CONFIGURE, METHOD_READING, METHOD_STATUS, Params, Request, Response,
    RpcError,
};
use crate::transport::{CodecError, FrameCodec, PING};

/// Deadline for a server to answer a liveness ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur with the API client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {code} - {message}")]
    Rpc { code: i32, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("No running sensord service found in {0}")]
    NoServer(PathBuf),
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

/// Classification of the endpoints found by a liveness ping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingResult {
    pub active_servers: Vec<PathBuf>,
    pub timed_out_servers: Vec<PathBuf>,
    pub stale_sockets: Vec<PathBuf>,
}

impl PingResult {
    /// True when some endpoint is owned by a live or hung server
    #[must_use]
    pub fn has_running_server(&self) -> bool {
        !self.active_servers.is_empty() || !self.timed_out_servers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingOutcome {
    Active,
    TimedOut,
    Stale,
    Vanished,
}

/// Ping every endpoint in `paths` and classify it.
///
/// An endpoint refusing connections is stale. One that accepts but does not
/// answer within `deadline` (including closing without answer) is timed out.
/// Endpoints removed while probing are skipped.
///
/// # Errors
///
/// Returns `ClientError::Io` for connect failures other than refusal or a
/// vanished file, e.g. permission denied.
pub async fn ping(paths: &[PathBuf], deadline: Duration) -> Result<PingResult, ClientError> {
    let mut result = PingResult::default();

    for path in paths {
        match ping_endpoint(path, deadline).await? {
            PingOutcome::Active => result.active_servers.push(path.clone()),
            PingOutcome::TimedOut => {
                warn!("Socket timed out: {:?}", path);
                result.timed_out_servers.push(path.clone());
            }
            PingOutcome::Stale => {
                warn!("Stale socket: {:?}", path);
                result.stale_sockets.push(path.clone());
            }
            PingOutcome::Vanished => debug!("Socket vanished while probing: {:?}", path),
        }
    }

    Ok(result)
}

async fn ping_endpoint(path: &Path, deadline: Duration) -> Result<PingOutcome, io::Error> {
    let stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Ok(PingOutcome::Stale),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PingOutcome::Vanished),
        Err(e) => return Err(e),
    };

    let mut framed = Framed::new(stream, FrameCodec::new());
    let exchange = async {
        if framed.send(Bytes::from_static(PING)).await.is_err() {
            return false;
        }
        matches!(framed.next().await, Some(Ok(_)))
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(true) => Ok(PingOutcome::Active),
        Ok(false) | Err(_) => Ok(PingOutcome::TimedOut),
    }
}

/// Client bound to one API endpoint
#[derive(Debug)]
pub struct ApiClient {
    path: PathBuf,
    next_id: AtomicU64,
}

impl ApiClient {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            next_id: AtomicU64::new(1),
        }
    }

    /// Find the newest endpoint in the default socket directory that accepts
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NoServer` when no endpoint accepts a connection.
    pub async fn discover() -> Result<Self, ClientError> {
        Self::discover_in(&socket_dir()).await
    }

    /// Find the newest endpoint in `dir` that accepts connections.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NoServer` when no endpoint accepts a connection,
    /// or `ClientError::Io` when `dir` cannot be listed.
    pub async fn discover_in(dir: &Path) -> Result<Self, ClientError> {
        for path in search_api_sockets(dir)?.into_iter().rev() {
            if UnixStream::connect(&path).await.is_ok() {
                return Ok(Self::new(path));
            }
        }
        Err(ClientError::NoServer(dir.to_path_buf()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one request over a fresh connection and return the raw response.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting, sending or decoding fails, the server
    /// closes without answering, or no answer arrives in time.
    pub async fn call(&self, method: &str, params: Params) -> Result<Response, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(method, params, id);
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let stream = UnixStream::connect(&self.path).await?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let exchange = async {
            framed.send(payload).await?;
            let frame = framed.next().await.ok_or(ClientError::ConnectionClosed)??;
            Ok::<_, ClientError>(frame)
        };

        let frame = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| ClientError::Timeout)??;

        Ok(serde_json::from_slice(&frame)?)
    }

    /// Send a request and deserialize its result.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Rpc` when the server answers with an error, or
    /// any error of [`ApiClient::call`].
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Params,
    ) -> Result<T, ClientError> {
        let result = self.call(method, params).await?.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    /// Issue an action or configuration command as a single exchange.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::request`].
    pub async fn send_command(
        &self,
        name: Option<&str>,
        command: Command,
        args: &[CommandArg],
    ) -> Result<SensorCommandResponses, ClientError> {
        self.request(METHOD_COMMAND, command_params(name, command, args))
            .await
    }

    /// Run a configuration chain.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::request`].
    pub async fn configure(
        &self,
        name: Option<&str>,
        command: Command,
        args: &[CommandArg],
    ) -> Result<SensorConfigChainResponses, ClientError> {
        self.request(METHOD_CONFIGURE, command_params(name, command, args))
            .await
    }

    /// # Errors
    ///
    /// See [`ApiClient::request`].
    pub async fn status(&self, name: Option<&str>) -> Result<SensorStatuses, ClientError> {
        self.request(METHOD_STATUS, name_params(name)).await
    }

    /// # Errors
    ///
    /// See [`ApiClient::request`].
    pub async fn reading(
        &self,
        name: Option<&str>,
        enabled: bool,
    ) -> Result<SensorStatuses, ClientError> {
        let mut params = name_params(name);
        params.insert("enabled".to_string(), Value::Bool(enabled));
        self.request(METHOD_READING, params).await
    }
}

fn name_params(name: Option<&str>) -> Params {
    let mut params = Params::new();
    if let Some(name) = name {
        params.insert("name".to_string(), Value::String(name.to_string()));
    }
    params
}

fn command_params(name: Option<&str>, command: Command, args: &[CommandArg]) -> Params {
    let mut params = name_params(name);
    params.insert("command".to_string(), json!(command.value()));
    if !args.is_empty() {
        params.insert("args".to_string(), json!(args));
    }
    params
}
