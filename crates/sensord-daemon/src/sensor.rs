//! Sensor handle abstraction.
//!
//! The registry, the API methods and the serial driver meet at these two
//! traits. Async operations return boxed futures so the traits stay object
//! safe and sensors can be held as `Arc<dyn Sensor>`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use sensord_types::{
    Command, CommandArg, CommandResponse, ConfigChainResponse, SensorId, SensorStatus,
};

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::forwarder::PresenceHandler;

/// Capability bound to one sensor transport
pub trait Sensor: Send + Sync {
    fn sensor_id(&self) -> &SensorId;

    /// Single request/reply exchange
    fn send_command<'a>(
        &'a self,
        command: Command,
        args: &'a [CommandArg],
    ) -> BoxFuture<'a, Result<CommandResponse, SensorError>>;

    /// Pause/configure/save/resume chain
    fn configure<'a>(
        &'a self,
        command: Command,
        args: &'a [CommandArg],
    ) -> BoxFuture<'a, Result<ConfigChainResponse, SensorError>>;

    fn status(&self) -> SensorStatus;

    /// Start handing presence samples to the attached handlers.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Closed`] once the sensor is closed.
    fn start_reading(&self) -> Result<(), SensorError>;

    /// # Errors
    ///
    /// Returns [`SensorError::Closed`] once the sensor is closed.
    fn stop_reading(&self) -> Result<(), SensorError>;

    /// Drop buffered input that has not been consumed yet.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Closed`] once the sensor is closed.
    fn clear_buffer(&self) -> Result<(), SensorError>;

    /// Next presence sample, `None` when the sensor is not producing any
    fn read_presence(&self) -> BoxFuture<'_, Result<Option<bool>, SensorError>>;

    fn start_scanning(&self) -> BoxFuture<'_, Result<CommandResponse, SensorError>>;

    fn add_presence_handler(&self, handler: Arc<PresenceHandler>);

    /// Release the transport. Closing twice is a no-op.
    fn close(&self) -> BoxFuture<'_, Result<(), SensorError>>;
}

/// Opens a sensor's transport and builds its handle
pub trait SensorConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a SensorConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Sensor>, SensorError>>;
}
