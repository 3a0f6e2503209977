//! Sensor registry.
//!
//! Owns every live sensor handle by name. The state lock is only held to
//! reserve a name, publish a handle or take a snapshot; sensor I/O always
//! happens outside of it. A name being registered is reserved, so a
//! concurrent registration of the same name is rejected as a duplicate.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SensorConfig;
use crate::error::{DaemonError, Result};
use crate::forwarder::{EventForwarder, PresenceHandler};
use crate::sensor::{Sensor, SensorConnector};
use crate::sinks::SinkHub;

#[derive(Default)]
struct RegistryState {
    live: BTreeMap<String, Arc<dyn Sensor>>,
    reserved: HashSet<String>,
}

impl RegistryState {
    fn contains(&self, name: &str) -> bool {
        self.live.contains_key(name) || self.reserved.contains(name)
    }
}

pub struct SensorRegistry {
    state: RwLock<RegistryState>,
    connector: Arc<dyn SensorConnector>,
    sinks: Arc<SinkHub>,
}

impl SensorRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn SensorConnector>, sinks: Arc<SinkHub>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            connector,
            sinks,
        }
    }

    #[must_use]
    pub fn sinks(&self) -> &Arc<SinkHub> {
        &self.sinks
    }

    /// Open, wire and publish the sensor described by `config`.
    ///
    /// Failures to start reading or scanning are logged and do not abort
    /// the registration.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::AlreadyRegistered`] for a duplicate name and
    /// [`DaemonError::Sensor`] when the transport cannot be opened.
    pub async fn register(&self, config: &SensorConfig) -> Result<()> {
        let name = config.name.clone();

        {
            let mut state = self.state.write().await;
            if state.contains(&name) {
                return Err(DaemonError::AlreadyRegistered(name));
            }
            state.reserved.insert(name.clone());
        }

        let outcome = self.connect_and_start(config).await;

        let mut state = self.state.write().await;
        state.reserved.remove(&name);
        let sensor = outcome?;
        state.live.insert(name, sensor);
        Ok(())
    }

    async fn connect_and_start(&self, config: &SensorConfig) -> Result<Arc<dyn Sensor>> {
        let sensor = self.connector.connect(config).await?;
        let sensor_id = sensor.sensor_id().clone();

        let forwarder = EventForwarder::for_config(sensor_id.clone(), config, &self.sinks);
        debug!(
            "Sensor {} forwards presence to {:?}",
            sensor_id,
            forwarder.describe()
        );
        sensor.add_presence_handler(Arc::new(PresenceHandler::new(forwarder)));

        if config.enabled {
            match sensor.start_reading() {
                Ok(()) => info!("[reading_started] sensor=[{}]", sensor_id),
                Err(e) => warn!("[reading_start_failed] sensor=[{}] error=[{}]", sensor_id, e),
            }
        }

        if config.autostart {
            autostart(sensor.as_ref()).await;
        }

        Ok(sensor)
    }

    pub async fn get_sensor(&self, name: &str) -> Option<Arc<dyn Sensor>> {
        self.state.read().await.live.get(name).cloned()
    }

    /// Snapshot of every sensor, ordered by name
    pub async fn get_all_sensors(&self) -> Vec<Arc<dyn Sensor>> {
        self.state.read().await.live.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.state.read().await.live.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.live.is_empty()
    }

    /// Close and forget every sensor; returns how many closed cleanly.
    pub async fn unregister_all(&self) -> usize {
        let sensors = std::mem::take(&mut self.state.write().await.live);
        let mut closed = 0;

        for (name, sensor) in sensors {
            match sensor.close().await {
                Ok(()) => {
                    debug!("Sensor {} closed", name);
                    closed += 1;
                }
                Err(e) => warn!("[sensor_close_failed] name=[{}] error=[{}]", name, e),
            }
        }

        closed
    }
}

/// Start scanning unless the sensor already produces presence data.
async fn autostart(sensor: &dyn Sensor) {
    let sensor_id = sensor.sensor_id();

    match sensor.read_presence().await {
        Ok(Some(_)) => {
            info!("[autostart] sensor=[{}] result=[already_scanning]", sensor_id);
            return;
        }
        Ok(None) => {}
        Err(e) => debug!("Presence check of {} failed: {}", sensor_id, e),
    }

    match sensor.start_scanning().await {
        Ok(response) if response.is_success() => {
            info!("[autostart] sensor=[{}] result=[started]", sensor_id);
        }
        Ok(response) => warn!(
            "[autostart] sensor=[{}] result=[failed] reply=[{:?}]",
            sensor_id, response.command_result
        ),
        Err(e) => warn!(
            "[autostart] sensor=[{}] result=[failed] error=[{}]",
            sensor_id, e
        ),
    }
}
