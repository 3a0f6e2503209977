//! JSON-RPC 2.0 protocol definitions for the sensord API socket.
//!
//! This crate provides the protocol types, transport codec, endpoint
//! discovery and client helper used to talk to the daemon over Unix sockets.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON-RPC 2.0 envelopes and the fixed error-code table
//! - [`transport`]: Length-prefixed codec for message framing
//! - [`endpoint`]: Socket file naming and search
//! - [`client`]: API client and the liveness ping
//!
//! # Example
//!
//! ```no_run
//! use sensord_rpc::ApiClient;
//!
//! # async fn example() -> Result<(), sensord_rpc::ClientError> {
//! let client = ApiClient::discover().await?;
//! let statuses = client.status(None).await?;
//!
//! for status in statuses.statuses {
//!     println!("{} reading={}", status.sensor_id, status.is_reading);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod transport;

pub use client::{ApiClient, ClientError, PING_TIMEOUT, PingResult, ping};

pub use endpoint::{
    API_FILE_EXTENSION, endpoint_file_name, search_api_sockets, socket_dir, unique_timestamp_hex,
};

pub use protocol::{
    EnvelopeError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_COMMAND, METHOD_CONFIGURE, METHOD_NOT_FOUND, METHOD_READING, METHOD_STATUS,
    NO_SENSORS, NOT_CONFIG_COMMAND, PARSE_ERROR, Params, Request, Response, RpcError,
    SENSOR_NOT_FOUND, UNKNOWN_COMMAND,
};

pub use transport::{CodecError, FrameCodec, MAX_MESSAGE_SIZE, PING, PONG};
