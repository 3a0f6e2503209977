//! Presence event forwarding.
//!
//! Each registered sensor gets one [`PresenceHandler`] that turns raw presence
//! samples into change notifications and hands them to an [`EventForwarder`].
//! The forwarder owns one value-bound observer per configured sink entry and
//! notifies them in registration order. A failing or panicking observer is
//! logged and skipped so the remaining observers and the sensor's reading
//! task are unaffected.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use sensord_types::SensorId;
use tracing::{debug, error, warn};

use crate::config::SensorConfig;
use crate::error::SinkError;
use crate::sinks::SinkHub;

/// Side-effecting sink for presence changes
pub trait PresenceObserver: Send + Sync {
    /// Short description used in logs
    fn describe(&self) -> String;

    /// # Errors
    ///
    /// Returns the sink's failure; the forwarder logs it and moves on.
    fn notify(&self, sensor_id: &SensorId, presence: bool) -> Result<(), SinkError>;
}

/// Logs every change at debug level
#[derive(Debug, Default)]
pub struct LogObserver;

impl PresenceObserver for LogObserver {
    fn describe(&self) -> String {
        "log".to_string()
    }

    fn notify(&self, sensor_id: &SensorId, presence: bool) -> Result<(), SinkError> {
        debug!("[presence_change] sensor=[{}] presence=[{}]", sensor_id, presence);
        Ok(())
    }
}

/// Publishes to one topic of one message broker
pub struct BrokerObserver {
    broker: String,
    topic: String,
    hub: Arc<SinkHub>,
}

impl BrokerObserver {
    #[must_use]
    pub fn new(broker: String, topic: String, hub: Arc<SinkHub>) -> Self {
        Self { broker, topic, hub }
    }
}

impl PresenceObserver for BrokerObserver {
    fn describe(&self) -> String {
        format!("mqtt:{}/{}", self.broker, self.topic)
    }

    fn notify(&self, sensor_id: &SensorId, presence: bool) -> Result<(), SinkError> {
        self.hub
            .forward_to_broker(&self.broker, &self.topic, sensor_id, presence)
    }
}

/// Publishes to one push endpoint
pub struct EndpointObserver {
    endpoint: String,
    hub: Arc<SinkHub>,
}

impl EndpointObserver {
    #[must_use]
    pub fn new(endpoint: String, hub: Arc<SinkHub>) -> Self {
        Self { endpoint, hub }
    }
}

impl PresenceObserver for EndpointObserver {
    fn describe(&self) -> String {
        format!("ws:{}", self.endpoint)
    }

    fn notify(&self, sensor_id: &SensorId, presence: bool) -> Result<(), SinkError> {
        self.hub.forward_to_endpoint(&self.endpoint, sensor_id, presence)
    }
}

/// Ordered observer list of one sensor
pub struct EventForwarder {
    sensor_id: SensorId,
    observers: Vec<Box<dyn PresenceObserver>>,
}

impl EventForwarder {
    #[must_use]
    pub fn new(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            observers: Vec::new(),
        }
    }

    /// Observers for a sensor configuration: the debug log first if
    /// requested, then one per broker entry, then one per endpoint entry.
    #[must_use]
    pub fn for_config(sensor_id: SensorId, config: &SensorConfig, hub: &Arc<SinkHub>) -> Self {
        let mut forwarder = Self::new(sensor_id);

        if config.print_presence {
            forwarder.add_observer(Box::new(LogObserver));
        }

        for mqtt in &config.mqtt {
            forwarder.add_observer(Box::new(BrokerObserver::new(
                mqtt.broker.clone(),
                mqtt.topic.clone(),
                Arc::clone(hub),
            )));
        }

        for ws in &config.ws {
            forwarder.add_observer(Box::new(EndpointObserver::new(
                ws.endpoint.clone(),
                Arc::clone(hub),
            )));
        }

        forwarder
    }

    pub fn add_observer(&mut self, observer: Box<dyn PresenceObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        self.observers.iter().map(|o| o.describe()).collect()
    }

    /// Notify every observer in order; returns how many succeeded.
    pub fn forward(&self, presence: bool) -> usize {
        let mut delivered = 0;

        for observer in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.notify(&self.sensor_id, presence)
            }));

            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    "[presence_forward_failed] sensor=[{}] observer=[{}] error=[{}]",
                    self.sensor_id,
                    observer.describe(),
                    e
                ),
                Err(_) => error!(
                    "[presence_observer_panicked] sensor=[{}] observer=[{}]",
                    self.sensor_id,
                    observer.describe()
                ),
            }
        }

        delivered
    }
}

const PRESENCE_UNKNOWN: u8 = 0;
const PRESENCE_ABSENT: u8 = 1;
const PRESENCE_PRESENT: u8 = 2;

/// Turns presence samples into change notifications
pub struct PresenceHandler {
    forwarder: EventForwarder,
    last: AtomicU8,
}

impl PresenceHandler {
    #[must_use]
    pub fn new(forwarder: EventForwarder) -> Self {
        Self {
            forwarder,
            last: AtomicU8::new(PRESENCE_UNKNOWN),
        }
    }

    /// Record a sample; forwards and returns true when it differs from the
    /// previous one. The first sample always counts as a change.
    pub fn handle(&self, presence: bool) -> bool {
        let encoded = if presence {
            PRESENCE_PRESENT
        } else {
            PRESENCE_ABSENT
        };

        if self.last.swap(encoded, Ordering::AcqRel) == encoded {
            return false;
        }

        self.forwarder.forward(presence);
        true
    }
}
