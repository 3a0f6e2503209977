//! Named event sinks.
//!
//! The hub keeps two tables: message brokers (publish to a topic) and push
//! endpoints (publish a bare message). Forwarders look sinks up by name on
//! every event, so a sink registered after a sensor still receives its
//! events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::{BoxFuture, join_all};
use sensord_types::{PresenceEvent, SensorId};
use tracing::{debug, warn};

use crate::error::SinkError;

/// Fire-and-forget message publisher
pub trait EventPublisher: Send + Sync {
    /// Queue one message. `topic` is `None` for push endpoints.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] when the message could not be queued.
    fn publish(&self, topic: Option<&str>, payload: &str) -> Result<(), SinkError>;

    /// Release the underlying connection.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[derive(Default)]
struct SinkTable {
    sinks: RwLock<HashMap<String, Arc<dyn EventPublisher>>>,
    missing: Mutex<HashSet<String>>,
}

impl SinkTable {
    fn insert(&self, name: &str, publisher: Arc<dyn EventPublisher>) -> Result<(), SinkError> {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        if sinks.contains_key(name) {
            return Err(SinkError::AlreadyRegistered(name.to_string()));
        }
        sinks.insert(name.to_string(), publisher);
        drop(sinks);

        self.missing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Arc<dyn EventPublisher>> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// True the first time `name` is reported missing since it was last seen.
    fn mark_missing(&self, name: &str) -> bool {
        self.missing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
    }

    fn mark_present(&self, name: &str) {
        let mut missing = self.missing.lock().unwrap_or_else(PoisonError::into_inner);
        if missing.remove(name) {
            debug!("[sink_available] name=[{}]", name);
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn drain(&self) -> Vec<Arc<dyn EventPublisher>> {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, sink)| sink)
            .collect()
    }
}

/// Registry of the process' event sinks
#[derive(Default)]
pub struct SinkHub {
    brokers: SinkTable,
    endpoints: SinkTable,
}

impl SinkHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`SinkError::AlreadyRegistered`] when the name is taken.
    pub fn register_broker(
        &self,
        name: &str,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<(), SinkError> {
        self.brokers.insert(name, publisher)?;
        debug!("[mqtt_broker_registered] broker=[{}]", name);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SinkError::AlreadyRegistered`] when the name is taken.
    pub fn register_endpoint(
        &self,
        name: &str,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<(), SinkError> {
        self.endpoints.insert(name, publisher)?;
        debug!("[websocket_endpoint_registered] name=[{}]", name);
        Ok(())
    }

    #[must_use]
    pub fn broker_names(&self) -> Vec<String> {
        self.brokers.names()
    }

    #[must_use]
    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.names()
    }

    /// Publish a presence change to `topic` on `broker`.
    ///
    /// An unknown broker is logged once and the event dropped.
    ///
    /// # Errors
    ///
    /// Returns the publisher's error, or a serialization error.
    pub fn forward_to_broker(
        &self,
        broker: &str,
        topic: &str,
        sensor_id: &SensorId,
        presence: bool,
    ) -> Result<(), SinkError> {
        let Some(publisher) = self.brokers.get(broker) else {
            if self.brokers.mark_missing(broker) {
                warn!("[missing_mqtt_broker] broker=[{}]", broker);
            }
            return Ok(());
        };
        self.brokers.mark_present(broker);

        publisher.publish(Some(topic), &presence_payload(sensor_id, presence)?)
    }

    /// Publish a presence change to the push endpoint `endpoint`.
    ///
    /// An unknown endpoint is logged once and the event dropped.
    ///
    /// # Errors
    ///
    /// Returns the publisher's error, or a serialization error.
    pub fn forward_to_endpoint(
        &self,
        endpoint: &str,
        sensor_id: &SensorId,
        presence: bool,
    ) -> Result<(), SinkError> {
        let Some(publisher) = self.endpoints.get(endpoint) else {
            if self.endpoints.mark_missing(endpoint) {
                warn!("[websocket_endpoint_missing] name=[{}]", endpoint);
            }
            return Ok(());
        };
        self.endpoints.mark_present(endpoint);

        publisher.publish(None, &presence_payload(sensor_id, presence)?)
    }

    /// Close and forget every registered sink.
    pub async fn close_all(&self) {
        let sinks: Vec<_> = self
            .brokers
            .drain()
            .into_iter()
            .chain(self.endpoints.drain())
            .collect();

        join_all(sinks.iter().map(|sink| sink.close())).await;
    }
}

/// JSON document published for a presence change
///
/// # Errors
///
/// Returns [`SinkError::Json`] if the event cannot be serialized.
pub fn presence_payload(sensor_id: &SensorId, presence: bool) -> Result<String, SinkError> {
    let event = PresenceEvent::presence_change(sensor_id, presence, chrono::Utc::now().to_rfc3339());
    Ok(serde_json::to_string(&event)?)
}
