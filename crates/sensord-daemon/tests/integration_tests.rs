//! Integration tests for the sensord API socket
//!
//! Sensors are real SEN0395 drivers talking to scripted devices over
//! in-memory streams, so requests travel the whole path from socket frame to
//! serial line and back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use sensord_daemon::driver::{Sen0395, Sen0395Connector};
use sensord_daemon::error::SensorError;
use sensord_daemon::{
    ApiServer, ConfigSource, DaemonError, Sensor, SensorConfig, SensorConnector, SensorRegistry,
    Service, ServiceOptions, SinkHub, SocketServer,
};
use sensord_rpc::{
    ApiClient, ClientError, FrameCodec, INTERNAL_ERROR, METHOD_NOT_FOUND, NO_SENSORS, PARSE_ERROR,
    Params, Response,
};
use sensord_types::{Command, CommandResult, SensorId};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::UnixStream;
use tokio_serial::{SerialPort, SerialStream};
use tokio_util::codec::Framed;

const DEVICE_TIMEOUT: Duration = Duration::from_millis(300);

/// Scripted SEN0395: echoes every command and answers `Done`
fn spawn_device(device: DuplexStream) {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end_matches('\r');
            let reply = format!("leapMMW:/>{line}\r\nDone\r\n");
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

/// Connects sensors to in-memory devices keyed by sensor name
#[derive(Default)]
struct DuplexConnector {
    devices: Mutex<HashMap<String, DuplexStream>>,
}

impl DuplexConnector {
    /// Attach a responsive device to `name`
    fn plug(&self, name: &str) {
        let (ours, theirs) = tokio::io::duplex(4096);
        spawn_device(theirs);
        self.devices.lock().unwrap().insert(name.to_string(), ours);
    }

    /// Attach a device to `name` that disappears right away
    fn plug_dead(&self, name: &str) {
        let (ours, theirs) = tokio::io::duplex(4096);
        drop(theirs);
        self.devices.lock().unwrap().insert(name.to_string(), ours);
    }
}

impl SensorConnector for DuplexConnector {
    fn connect<'a>(
        &'a self,
        config: &'a SensorConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Sensor>, SensorError>> {
        async move {
            let io = self.devices.lock().unwrap().remove(&config.name).ok_or_else(|| {
                SensorError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", config.port),
                ))
            })?;
            let sensor: Arc<dyn Sensor> = Sen0395::open(
                SensorId::new(config.sensor_type, &config.name),
                config.port.clone(),
                io,
                DEVICE_TIMEOUT,
            );
            Ok(sensor)
        }
        .boxed()
    }
}

fn config(name: &str) -> SensorConfig {
    SensorConfig::sen0395(name, format!("/dev/tty{name}"))
}

async fn registry_with(connector: &Arc<DuplexConnector>, names: &[&str]) -> Arc<SensorRegistry> {
    let registry = Arc::new(SensorRegistry::new(
        connector.clone(),
        Arc::new(SinkHub::new()),
    ));
    for name in names {
        registry.register(&config(name)).await.unwrap();
    }
    registry
}

async fn start_server(dir: &Path, registry: Arc<SensorRegistry>) -> SocketServer<ApiServer> {
    let mut server = SocketServer::new(dir, Arc::new(ApiServer::new(registry)));
    server.start().await.unwrap();
    server
}

/// Send one raw frame and decode the reply
async fn raw_exchange(path: &Path, payload: &'static [u8]) -> Response {
    let stream = UnixStream::connect(path).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed.send(Bytes::from_static(payload)).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    serde_json::from_slice(&frame).unwrap()
}

#[tokio::test]
async fn test_second_server_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    let registry = registry_with(&connector, &[]).await;

    let mut first = start_server(dir.path(), Arc::clone(&registry)).await;
    let running = first.socket_path().unwrap().to_path_buf();

    let mut second = SocketServer::new(dir.path(), Arc::new(ApiServer::new(registry)));
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, DaemonError::ServiceAlreadyRunning(ref paths) if paths == &vec![running]));
    assert!(!second.is_running());

    first.stop().await;
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = TempDir::new().unwrap();
    let stale = dir.path().join("0000000000000001.api");
    drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
    assert!(stale.exists());

    let connector = Arc::new(DuplexConnector::default());
    let mut server = start_server(dir.path(), registry_with(&connector, &[]).await).await;

    assert!(!stale.exists());
    assert_ne!(server.socket_path(), Some(stale.as_path()));
    server.stop().await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_status_over_socket() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    connector.plug("s2");
    connector.plug("s1");
    let mut server = start_server(dir.path(), registry_with(&connector, &["s2", "s1"]).await).await;

    let client = ApiClient::discover_in(dir.path()).await.unwrap();
    let statuses = client.status(None).await.unwrap().statuses;

    let names: Vec<_> = statuses.iter().map(|s| s.sensor_id.sensor_name.as_str()).collect();
    assert_eq!(names, vec!["s1", "s2"]);
    assert_eq!(statuses[0].port, "/dev/ttys1");
    assert!(!statuses[0].is_reading);

    let single = client.status(Some("s2")).await.unwrap().statuses;
    assert_eq!(single.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_command_reaches_the_device() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    connector.plug("s1");
    let mut server = start_server(dir.path(), registry_with(&connector, &["s1"]).await).await;

    let client = ApiClient::discover_in(dir.path()).await.unwrap();
    let responses = client
        .send_command(Some("s1"), Command::SensorStop, &[])
        .await
        .unwrap()
        .sensor_command_responses;

    assert_eq!(responses.len(), 1);
    let response = &responses[0].command_response;
    assert_eq!(response.command_result, CommandResult::Done);
    assert_eq!(response.command_echo.as_deref(), Some("leapMMW:/>sensorStop"));

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_echoes_id() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    let mut server = start_server(dir.path(), registry_with(&connector, &[]).await).await;

    let response = raw_exchange(
        server.socket_path().unwrap(),
        br#"{"jsonrpc":"2.0","method":"sen0395.reboot","params":{},"id":"abc"}"#,
    )
    .await;

    assert_eq!(response.id, json!("abc"));
    assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_gets_parse_error() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    let mut server = start_server(dir.path(), registry_with(&connector, &[]).await).await;

    let response = raw_exchange(server.socket_path().unwrap(), b"{not json").await;

    assert_eq!(response.id, Value::Null);
    assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    server.stop().await;
}

#[tokio::test]
async fn test_fan_out_failure_yields_single_internal_error() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    connector.plug("a");
    connector.plug_dead("b");
    let mut server = start_server(dir.path(), registry_with(&connector, &["a", "b"]).await).await;

    let client = ApiClient::discover_in(dir.path()).await.unwrap();
    let err = client
        .send_command(None, Command::SensorStop, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rpc { code, .. } if code == INTERNAL_ERROR));

    // The healthy sensor still answers on its own
    client
        .send_command(Some("a"), Command::SensorStop, &[])
        .await
        .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_autostarted_sensor_reports_reading() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(DuplexConnector::default());
    connector.plug("s1");

    let registry = registry_with(&connector, &[]).await;
    let mut cfg = config("s1");
    cfg.enabled = true;
    cfg.autostart = true;
    registry.register(&cfg).await.unwrap();

    let mut server = start_server(dir.path(), registry).await;
    let client = ApiClient::discover_in(dir.path()).await.unwrap();

    let statuses = client.status(None).await.unwrap().statuses;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].is_reading);

    let statuses = client.reading(Some("s1"), false).await.unwrap().statuses;
    assert!(!statuses[0].is_reading);

    server.stop().await;
}

#[tokio::test]
async fn test_service_loads_sensors_from_config_dir() {
    let sockets = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();
    std::fs::write(
        config_dir.path().join("sensors.toml"),
        r#"
[[sensor]]
type = "sen0395"
name = "hall"
port = "/dev/ttyhall"
enabled = true

[[sensor]]
type = "sen0395"
name = "unplugged"
port = "/dev/ttyunplugged"

[[sensor]]
type = "thermometer"
name = "bogus"
port = "/dev/null"
"#,
    )
    .unwrap();

    let connector = Arc::new(DuplexConnector::default());
    connector.plug("hall");

    let mut service = Service::new(
        ServiceOptions {
            socket_dir: sockets.path().to_path_buf(),
            config: ConfigSource::with_dir(config_dir.path().to_path_buf()),
        },
        connector,
    );
    service.start().await.unwrap();

    assert_eq!(service.registry().names().await, vec!["hall"]);

    let client = ApiClient::new(service.socket_path().unwrap().to_path_buf());
    let response = client.call("sen0395.status", Params::new()).await.unwrap();
    let result = response.into_result().unwrap();
    assert_eq!(result["statuses"][0]["is_reading"], json!(true));

    service.shutdown().await;
    assert!(service.registry().is_empty().await);
    assert_eq!(std::fs::read_dir(sockets.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_service_without_config_starts_empty() {
    let sockets = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();

    let mut service = Service::new(
        ServiceOptions {
            socket_dir: sockets.path().to_path_buf(),
            config: ConfigSource::with_dir(config_dir.path().to_path_buf()),
        },
        Arc::new(DuplexConnector::default()),
    );
    service.start().await.unwrap();

    let client = ApiClient::new(service.socket_path().unwrap().to_path_buf());
    let err = client.status(None).await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc { code, .. } if code == NO_SENSORS));

    service.shutdown().await;
}

#[tokio::test]
async fn test_autostart_over_serial_port_completes() {
    let (device, port) = SerialStream::pair().unwrap();
    let port_name = port.name().unwrap();

    // Silent until spoken to, then echoes and answers like the sensor
    let heard = Arc::new(Mutex::new(Vec::new()));
    let device_heard = Arc::clone(&heard);
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end_matches('\r').to_string();
            let reply = format!("leapMMW:/>{line}\r\nDone\r\n");
            device_heard.lock().unwrap().push(line);
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let registry = SensorRegistry::new(
        Arc::new(Sen0395Connector::new(DEVICE_TIMEOUT)),
        Arc::new(SinkHub::new()),
    );
    let mut cfg = SensorConfig::sen0395("hall", port_name);
    cfg.autostart = true;

    let registered = tokio::time::timeout(Duration::from_secs(5), registry.register(&cfg)).await;
    assert!(matches!(registered, Ok(Ok(()))));
    assert!(heard.lock().unwrap().iter().any(|line| line == "sensorStart"));

    let response = registry
        .get_sensor("hall")
        .await
        .unwrap()
        .send_command(Command::SensorStop, &[])
        .await
        .unwrap();
    assert_eq!(response.command_result, CommandResult::Done);

    registry.unregister_all().await;
    drop(port);
}

#[tokio::test]
async fn test_service_registers_configured_brokers() {
    let sockets = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();
    std::fs::write(
        config_dir.path().join("mqtt.toml"),
        r#"
[[broker]]
name = "home"
host = "127.0.0.1"
port = 9

[[broker]]
name = "home"
host = "127.0.0.2"

[[broker]]
host = "nameless.local"
"#,
    )
    .unwrap();

    let mut service = Service::new(
        ServiceOptions {
            socket_dir: sockets.path().to_path_buf(),
            config: ConfigSource::with_dir(config_dir.path().to_path_buf()),
        },
        Arc::new(DuplexConnector::default()),
    );
    service.start().await.unwrap();

    // Unreachable brokers stay registered and keep reconnecting
    assert_eq!(service.sinks().broker_names(), vec!["home"]);

    service.shutdown().await;
    assert!(service.sinks().broker_names().is_empty());
}
