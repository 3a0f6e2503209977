//! Error types for the sensord daemon.

use std::path::PathBuf;
use std::time::Duration;

use sensord_rpc::ClientError;
use sensord_rpc::protocol::RpcError;

/// Errors raised by a sensor handle or its transport
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Write to the sensor did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("Sensor connection is closed")]
    Closed,

    #[error("Invalid command argument: {0:?}")]
    InvalidArgument(String),
}

/// Errors raised while locating or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file `{file}` not found in the search path: {search_path}")]
    NotFound { file: String, search_path: String },

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing configuration field: {0}")]
    MissingField(String),

    #[error("Invalid configuration entry: {0}")]
    Entry(#[from] toml::de::Error),

    #[error("Unknown sensor type: {0}")]
    UnknownSensorType(String),
}

/// Errors raised by event sinks
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Endpoint {0} is disconnected")]
    Disconnected(String),

    #[error("Endpoint {0} is closed")]
    Closed(String),

    #[error("Invalid endpoint URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Invalid MQTT client id {0:?}")]
    InvalidClientId(String),

    #[error("Broker {0} requires a topic")]
    MissingTopic(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another server owns an endpoint in the socket directory
    #[error("Service already running: {0:?}")]
    ServiceAlreadyRunning(Vec<PathBuf>),

    #[error("Unable to create socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Liveness ping failed: {0}")]
    Ping(#[from] ClientError),

    #[error("Sensor {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Failure of an API method handler.
///
/// Structured API errors reach the caller verbatim. Everything else is
/// logged and reported as a generic internal error.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error(transparent)]
    Api(#[from] RpcError),

    #[error("Sensor failure: {0}")]
    Sensor(#[from] SensorError),

    #[error("Serialization failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handler panicked: {0}")]
    Panic(String),
}

impl From<MethodError> for RpcError {
    fn from(err: MethodError) -> Self {
        match err {
            MethodError::Api(e) => e,
            MethodError::Sensor(_) | MethodError::Json(_) | MethodError::Panic(_) => {
                RpcError::internal_error()
            }
        }
    }
}
