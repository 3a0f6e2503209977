//! API methods and the request dispatcher.
//!
//! A request goes through a fixed pipeline: envelope parsing, method lookup,
//! parameter validation and finally the handler. Structured [`RpcError`]s
//! reach the caller verbatim; any other handler failure, panics included, is
//! logged here and reported only as a generic internal error.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sensord_rpc::protocol::{
    METHOD_COMMAND, METHOD_CONFIGURE, METHOD_READING, METHOD_STATUS, Params, Request, Response,
    RpcError,
};
use sensord_types::{
    Command, CommandArg, SensorCommandResponse, SensorCommandResponses, SensorConfigChainResponse,
    SensorConfigChainResponses, SensorStatuses,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::MethodError;
use crate::registry::SensorRegistry;
use crate::sensor::Sensor;
use crate::server::RequestHandler;

/// Serialized fallback when a response cannot be encoded
const INTERNAL_ERROR_RESPONSE: &[u8] =
    br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#;

/// The closed set of methods served on the API socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    Command,
    Configure,
    Status,
    Reading,
}

impl ApiMethod {
    pub const ALL: [ApiMethod; 4] = [
        ApiMethod::Command,
        ApiMethod::Configure,
        ApiMethod::Status,
        ApiMethod::Reading,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ApiMethod::Command => METHOD_COMMAND,
            ApiMethod::Configure => METHOD_CONFIGURE,
            ApiMethod::Status => METHOD_STATUS,
            ApiMethod::Reading => METHOD_READING,
        }
    }

    /// Cheap checks that need no sensor access.
    ///
    /// # Errors
    ///
    /// Returns `Missing field: command` when a command method lacks it.
    pub fn validate(self, params: &Params) -> Result<(), RpcError> {
        match self {
            ApiMethod::Command | ApiMethod::Configure if !params.contains_key("command") => {
                Err(RpcError::missing_field("command"))
            }
            _ => Ok(()),
        }
    }

    /// Run the method against the registry.
    ///
    /// # Errors
    ///
    /// Returns [`MethodError::Api`] for caller-correctable conditions and
    /// any other variant for unexpected sensor or encoding failures.
    pub async fn handle(
        self,
        params: &Params,
        registry: &SensorRegistry,
    ) -> Result<Value, MethodError> {
        let sensors = resolve_targets(params, registry).await?;

        match self {
            ApiMethod::Command => {
                let command = decode_command(params)?;
                let args = decode_args(params)?;

                let mut responses = Vec::with_capacity(sensors.len());
                for sensor in &sensors {
                    responses.push(SensorCommandResponse {
                        sensor_id: sensor.sensor_id().clone(),
                        command_response: sensor.send_command(command, &args).await?,
                    });
                }

                Ok(serde_json::to_value(SensorCommandResponses {
                    sensor_command_responses: responses,
                })?)
            }
            ApiMethod::Configure => {
                let command = decode_command(params)?;
                if !command.is_config() {
                    return Err(RpcError::not_config_command(command).into());
                }
                let args = decode_args(params)?;

                let mut responses = Vec::with_capacity(sensors.len());
                for sensor in &sensors {
                    responses.push(SensorConfigChainResponse {
                        sensor_id: sensor.sensor_id().clone(),
                        config_chain_response: sensor.configure(command, &args).await?,
                    });
                }

                Ok(serde_json::to_value(SensorConfigChainResponses {
                    sensor_config_chain_responses: responses,
                })?)
            }
            ApiMethod::Status => Ok(serde_json::to_value(statuses(&sensors))?),
            ApiMethod::Reading => {
                let enabled = match params.get("enabled") {
                    None => return Err(RpcError::missing_field("enabled").into()),
                    Some(value) => value
                        .as_bool()
                        .ok_or_else(|| RpcError::invalid_field("enabled"))?,
                };

                for sensor in &sensors {
                    if let Err(e) = toggle_reading(sensor.as_ref(), enabled) {
                        warn!(
                            "[reading_toggle_failed] sensor=[{}] enabled=[{}] error=[{}]",
                            sensor.sensor_id(),
                            enabled,
                            e
                        );
                    }
                }

                Ok(serde_json::to_value(statuses(&sensors))?)
            }
        }
    }
}

fn toggle_reading(sensor: &dyn Sensor, enabled: bool) -> Result<(), crate::error::SensorError> {
    if enabled {
        sensor.clear_buffer()?;
        sensor.start_reading()
    } else {
        sensor.stop_reading()
    }
}

fn statuses(sensors: &[Arc<dyn Sensor>]) -> SensorStatuses {
    SensorStatuses {
        statuses: sensors.iter().map(|sensor| sensor.status()).collect(),
    }
}

/// Sensors addressed by the `name` parameter; absent, null or empty means all.
async fn resolve_targets(
    params: &Params,
    registry: &SensorRegistry,
) -> Result<Vec<Arc<dyn Sensor>>, RpcError> {
    match params.get("name") {
        None | Some(Value::Null) => all_sensors(registry).await,
        Some(Value::String(name)) if name.is_empty() => all_sensors(registry).await,
        Some(Value::String(name)) => registry
            .get_sensor(name)
            .await
            .map(|sensor| vec![sensor])
            .ok_or_else(|| RpcError::sensor_not_found(name)),
        Some(_) => Err(RpcError::invalid_field("name")),
    }
}

async fn all_sensors(registry: &SensorRegistry) -> Result<Vec<Arc<dyn Sensor>>, RpcError> {
    let sensors = registry.get_all_sensors().await;
    if sensors.is_empty() {
        return Err(RpcError::no_sensors());
    }
    Ok(sensors)
}

fn decode_command(params: &Params) -> Result<Command, RpcError> {
    let value = params
        .get("command")
        .ok_or_else(|| RpcError::missing_field("command"))?;
    Command::from_value(value).ok_or_else(|| RpcError::unknown_command(value))
}

fn decode_args(params: &Params) -> Result<Vec<CommandArg>, RpcError> {
    match params.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| CommandArg::from_value(item).ok_or_else(|| RpcError::invalid_field("args")))
            .collect(),
        Some(_) => Err(RpcError::invalid_field("args")),
    }
}

/// Dispatches API requests to the registered methods
pub struct ApiServer {
    methods: HashMap<&'static str, ApiMethod>,
    registry: Arc<SensorRegistry>,
}

impl ApiServer {
    /// Serve every [`ApiMethod`]
    #[must_use]
    pub fn new(registry: Arc<SensorRegistry>) -> Self {
        Self::with_methods(registry, &ApiMethod::ALL)
    }

    #[must_use]
    pub fn with_methods(registry: Arc<SensorRegistry>, methods: &[ApiMethod]) -> Self {
        Self {
            methods: methods.iter().map(|m| (m.name(), *m)).collect(),
            registry,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    /// Turn one raw payload into its response
    pub async fn dispatch(&self, payload: &[u8]) -> Response {
        let request = match Request::parse(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected request envelope: {}", e);
                return e.into_response();
            }
        };

        let Request {
            method, params, id, ..
        } = request;

        let Some(api_method) = self.methods.get(method.as_str()).copied() else {
            return Response::error(id, RpcError::method_not_found(&method));
        };

        if let Err(e) = api_method.validate(&params) {
            return Response::error(id, e);
        }

        let outcome = AssertUnwindSafe(api_method.handle(&params, &self.registry))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(MethodError::Panic(panic_message(panic.as_ref()))));

        match outcome {
            Ok(result) => Response::success(id, result),
            Err(MethodError::Api(e)) => Response::error(id, e),
            Err(e) => {
                let params = Value::Object(params);
                error!(
                    "[api_handler_error] method=[{}] params=[{}] error=[{}]",
                    method, params, e
                );
                Response::error(id, e.into())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl RequestHandler for ApiServer {
    fn handle(&self, payload: Bytes) -> BoxFuture<'_, Bytes> {
        async move {
            let response = self.dispatch(&payload).await;
            match serde_json::to_vec(&response) {
                Ok(encoded) => Bytes::from(encoded),
                Err(e) => {
                    error!("Failed to encode response: {}", e);
                    Bytes::from_static(INTERNAL_ERROR_RESPONSE)
                }
            }
        }
        .boxed()
    }
}
