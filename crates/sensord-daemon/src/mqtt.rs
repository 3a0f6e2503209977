//! MQTT broker client.
//!
//! One client per `[[broker]]` entry, identified to the broker by its
//! configured name. A background task drives the connection and reconnects
//! with the same backoff as the push endpoints. Publishes are queued to that
//! task at QoS 0 and never wait for the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttBrokerConfig;
use crate::error::SinkError;
use crate::sinks::EventPublisher;
use crate::ws::backoff;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// How long close waits for the DISCONNECT to go out
const DISCONNECT_WAIT: Duration = Duration::from_millis(500);

pub struct MqttClient {
    name: String,
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    closed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Spawn the connection task for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::InvalidClientId`] when the broker name cannot be
    /// used as an MQTT client id.
    pub fn spawn(config: &MqttBrokerConfig) -> Result<Arc<Self>, SinkError> {
        if config.name.is_empty() || config.name.starts_with(char::is_whitespace) {
            return Err(SinkError::InvalidClientId(config.name.clone()));
        }

        let mut options = MqttOptions::new(config.name.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let (connected_tx, connected) = watch::channel(false);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(event_loop(
            config.clone(),
            eventloop,
            connected_tx,
            cancel.clone(),
        ));

        Ok(Arc::new(Self {
            name: config.name.clone(),
            client,
            connected,
            closed: AtomicBool::new(false),
            cancel,
            task: Mutex::new(Some(task)),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the broker acknowledged the connection; false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        matches!(
            tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await,
            Ok(Ok(_))
        )
    }
}

impl EventPublisher for MqttClient {
    fn publish(&self, topic: Option<&str>, payload: &str) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed(self.name.clone()));
        }
        let topic = topic.ok_or_else(|| SinkError::MissingTopic(self.name.clone()))?;

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_owned())?;
        debug!(
            "[mqtt_message_published] broker=[{}] topic=[{}] message=[{}]",
            self.name, topic, payload
        );
        Ok(())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }

            if let Err(e) = self.client.try_disconnect() {
                debug!("[mqtt_disconnect_not_queued] broker=[{}] error=[{}]", self.name, e);
            }

            let task = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut task) = task
                && tokio::time::timeout(DISCONNECT_WAIT, &mut task).await.is_err()
            {
                self.cancel.cancel();
                if let Err(e) = task.await {
                    debug!("[mqtt_task_failed] broker=[{}] error=[{}]", self.name, e);
                }
            }
            self.cancel.cancel();
            debug!("[mqtt_closed] broker=[{}]", self.name);
        }
        .boxed()
    }
}

async fn event_loop(
    config: MqttBrokerConfig,
    mut eventloop: EventLoop,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                connected.send_replace(true);
                info!(
                    "[mqtt_connected] broker=[{}] host=[{}]",
                    config.name, config.host
                );
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!(
                    "[mqtt_disconnected] broker=[{}] host=[{}]",
                    config.name, config.host
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.send_replace(false) {
                    warn!(
                        "[mqtt_disconnected_unexpectedly] broker=[{}] host=[{}] error=[{}]",
                        config.name, config.host, e
                    );
                } else {
                    warn!(
                        "[mqtt_connection_failed] broker=[{}] host=[{}] attempt=[{}] error=[{}]",
                        config.name, config.host, attempt, e
                    );
                }

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff(attempt)) => {}
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }

    connected.send_replace(false);
    debug!("[mqtt_loop_exit] broker=[{}]", config.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn broker(name: &str, port: u16) -> MqttBrokerConfig {
        MqttBrokerConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Read one MQTT control packet: (first header byte, body)
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_publish_reaches_broker_and_close_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (packets_tx, mut packets) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (connect, _) = read_packet(&mut stream).await;
            assert_eq!(connect >> 4, 1);
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            loop {
                let packet = read_packet(&mut stream).await;
                let done = packet.0 >> 4 == 14;
                let _ = packets_tx.send(packet);
                if done {
                    break;
                }
            }
        });

        let client = MqttClient::spawn(&broker("home", port)).unwrap();
        assert!(client.wait_connected(Duration::from_secs(5)).await);

        client.publish(Some("presence/hall"), r#"{"presence":true}"#).unwrap();

        let wait = Duration::from_secs(5);
        let (header, body) = tokio::time::timeout(wait, packets.recv()).await.unwrap().unwrap();
        assert_eq!(header, 0x30);
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        assert_eq!(&body[2..2 + topic_len], b"presence/hall");
        assert_eq!(&body[2 + topic_len..], br#"{"presence":true}"#);

        client.close().await;
        let (header, _) = tokio::time::timeout(wait, packets.recv()).await.unwrap().unwrap();
        assert_eq!(header, 0xe0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let client = MqttClient::spawn(&broker("home", 9)).unwrap();
        assert!(!client.wait_connected(Duration::from_millis(200)).await);

        assert!(matches!(
            client.publish(None, "{}"),
            Err(SinkError::MissingTopic(name)) if name == "home"
        ));

        client.close().await;
        assert!(matches!(
            client.publish(Some("t"), "{}"),
            Err(SinkError::Closed(_))
        ));
        // Second close is a no-op
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_client_id() {
        assert!(matches!(
            MqttClient::spawn(&broker(" home", 1883)),
            Err(SinkError::InvalidClientId(_))
        ));
    }
}
