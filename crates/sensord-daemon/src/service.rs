//! Service lifecycle.
//!
//! Startup order: claim the API socket, connect the message brokers and the
//! push endpoints, then register the configured sensors. Shutdown runs the
//! other way around.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::api::ApiServer;
use crate::config::{ConfigSource, MqttBrokerConfig, SensorConfig, WsEndpointConfig};
use crate::driver::Sen0395Connector;
use crate::error::{ConfigError, Result, SinkError};
use crate::mqtt::MqttClient;
use crate::registry::SensorRegistry;
use crate::sensor::SensorConnector;
use crate::server::SocketServer;
use crate::sinks::{EventPublisher, SinkHub};
use crate::ws::{CONNECT_WAIT, WsClient};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub socket_dir: PathBuf,
    pub config: ConfigSource,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            socket_dir: sensord_rpc::socket_dir(),
            config: ConfigSource::default(),
        }
    }
}

pub struct Service {
    server: SocketServer<ApiServer>,
    registry: Arc<SensorRegistry>,
    sinks: Arc<SinkHub>,
    config: ConfigSource,
}

impl Service {
    #[must_use]
    pub fn new(options: ServiceOptions, connector: Arc<dyn SensorConnector>) -> Self {
        let sinks = Arc::new(SinkHub::new());
        let registry = Arc::new(SensorRegistry::new(connector, Arc::clone(&sinks)));
        let api = Arc::new(ApiServer::new(Arc::clone(&registry)));

        Self {
            server: SocketServer::new(options.socket_dir, api),
            registry,
            sinks,
            config: options.config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn sinks(&self) -> &Arc<SinkHub> {
        &self.sinks
    }

    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        self.server.socket_path()
    }

    /// # Errors
    ///
    /// Fails when the API socket cannot be claimed. Configuration problems
    /// are logged and never fail startup.
    pub async fn start(&mut self) -> Result<()> {
        self.server.start().await?;
        self.register_brokers().await;
        self.register_endpoints().await;
        self.register_sensors().await;
        info!(
            "Service started with {} sensor(s)",
            self.registry.len().await
        );
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.server.stop().await;
        let closed = self.registry.unregister_all().await;
        debug!("Closed {} sensor(s)", closed);
        self.sinks.close_all().await;
        info!("Service stopped");
    }

    async fn register_brokers(&self) {
        let entries = match self.config.load_brokers().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[invalid_mqtt_config] reason=[{}]", e);
                return;
            }
        };

        let valid: Vec<MqttBrokerConfig> = entries
            .into_iter()
            .filter_map(|(raw, entry)| match entry {
                Ok(broker) => Some(broker),
                Err(e) => {
                    warn!("[invalid_mqtt_broker] reason=[{}] config=[{}]", e, raw);
                    None
                }
            })
            .collect();

        join_all(valid.iter().map(|broker| self.register_broker(broker))).await;
    }

    async fn register_broker(&self, broker: &MqttBrokerConfig) {
        if self.sinks.broker_names().contains(&broker.name) {
            warn!(
                "[invalid_mqtt_broker] name=[{}] reason=[duplicated_broker]",
                broker.name
            );
            return;
        }

        let client = match MqttClient::spawn(broker) {
            Ok(client) => client,
            Err(e) => {
                warn!("[invalid_mqtt_broker] name=[{}] reason=[{}]", broker.name, e);
                return;
            }
        };

        if !client.wait_connected(CONNECT_WAIT).await {
            warn!(
                "[mqtt_not_connected_during_init] broker=[{}] host=[{}]",
                broker.name, broker.host
            );
        }

        match self.sinks.register_broker(&broker.name, client.clone()) {
            Ok(()) => {}
            Err(SinkError::AlreadyRegistered(name)) => {
                warn!("[invalid_mqtt_broker] name=[{}] reason=[duplicated_broker]", name);
                client.close().await;
            }
            Err(e) => {
                warn!("[invalid_mqtt_broker] name=[{}] reason=[{}]", broker.name, e);
                client.close().await;
            }
        }
    }

    async fn register_endpoints(&self) {
        let entries = match self.config.load_endpoints().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[invalid_endpoints_config] reason=[{}]", e);
                return;
            }
        };

        let valid: Vec<WsEndpointConfig> = entries
            .into_iter()
            .filter_map(|(raw, entry)| match entry {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!("[invalid_ws_endpoint] reason=[{}] config=[{}]", e, raw);
                    None
                }
            })
            .collect();

        join_all(valid.iter().map(|endpoint| self.register_endpoint(endpoint))).await;
    }

    async fn register_endpoint(&self, endpoint: &WsEndpointConfig) {
        let client = match WsClient::spawn(&endpoint.name, &endpoint.uri) {
            Ok(client) => client,
            Err(e) => {
                warn!("[invalid_ws_endpoint] name=[{}] reason=[{}]", endpoint.name, e);
                return;
            }
        };

        if !client.wait_connected(CONNECT_WAIT).await {
            warn!(
                "[websocket_not_connected_during_init] name=[{}] uri=[{}]",
                endpoint.name, endpoint.uri
            );
        }

        if let Err(e) = self.sinks.register_endpoint(&endpoint.name, client.clone()) {
            warn!("[invalid_ws_endpoint] name=[{}] reason=[{}]", endpoint.name, e);
            client.close().await;
        }
    }

    async fn register_sensors(&self) {
        let entries = match self.config.load_sensors().await {
            Ok(entries) => entries,
            Err(e @ ConfigError::NotFound { .. }) => {
                warn!("[no_sensors_config_file] reason=[{}]", e);
                return;
            }
            Err(e) => {
                warn!("[invalid_sensors_config] reason=[{}]", e);
                return;
            }
        };

        let valid: Vec<SensorConfig> = entries
            .into_iter()
            .filter_map(|(raw, entry)| match entry {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("[invalid_sensor] reason=[{}] config=[{}]", e, raw);
                    None
                }
            })
            .collect();

        join_all(valid.iter().map(|config| self.register_sensor(config))).await;
    }

    async fn register_sensor(&self, config: &SensorConfig) {
        match self.registry.register(config).await {
            Ok(()) => info!(
                "[sensor_registered] name=[{}] port=[{}]",
                config.name, config.port
            ),
            Err(e) => warn!("[invalid_sensor] name=[{}] reason=[{}]", config.name, e),
        }
    }
}

/// Run the daemon until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns startup failures, most notably
/// [`DaemonError::ServiceAlreadyRunning`](crate::DaemonError::ServiceAlreadyRunning).
pub async fn run(options: ServiceOptions) -> Result<()> {
    let mut service = Service::new(options, Arc::new(Sen0395Connector::default()));
    service.start().await?;

    wait_for_shutdown_signal().await;

    service.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for SIGINT: {}", e);
            }
            info!("Received SIGINT, shutting down");
        }
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
    }
}
