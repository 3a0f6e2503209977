//! sensord daemon library.
//!
//! Serves the sensor API on a local socket and forwards presence changes of
//! the registered sensors to message brokers and push endpoints.
//!
//! - [`server`]: singleton socket server with the liveness ping
//! - [`api`]: request dispatcher and the `sen0395.*` methods
//! - [`registry`]: named sensor handles and their lifecycle
//! - [`forwarder`]: per-sensor presence observers
//! - [`sinks`]: event sinks, backed by [`mqtt`] brokers and [`ws`] endpoints
//! - [`driver`]: SEN0395 serial driver
//! - [`service`]: startup and shutdown of all of the above

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod mqtt;
pub mod registry;
pub mod sensor;
pub mod server;
pub mod service;
pub mod sinks;
pub mod ws;

#[cfg(test)]
mod tests;

pub use api::{ApiMethod, ApiServer};
pub use config::{ConfigSource, SensorConfig};
pub use error::{DaemonError, Result};
pub use registry::SensorRegistry;
pub use sensor::{Sensor, SensorConnector};
pub use server::{RequestHandler, SocketServer};
pub use service::{Service, ServiceOptions, run};
pub use sinks::{EventPublisher, SinkHub};
