//! Sensor and endpoint configuration.
//!
//! Configuration lives in TOML files looked up along an XDG search path:
//!
//! 1. current working directory
//! 2. `$XDG_CONFIG_HOME/sensord` (or `~/.config/sensord`)
//! 3. each `$XDG_CONFIG_DIRS` entry joined with `sensord` (or `/etc/xdg/sensord`)
//! 4. `/etc/sensord`
//!
//! Entries are validated one by one so that a broken entry never prevents the
//! others from loading.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use sensord_types::SensorType;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::{Table, Value};
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_DIR: &str = "sensord";
pub const SENSORS_CONFIG_FILE: &str = "sensors.toml";
pub const ENDPOINTS_CONFIG_FILE: &str = "endpoints.toml";
pub const MQTT_CONFIG_FILE: &str = "mqtt.toml";

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Message broker target of a sensor's presence events
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttSinkConfig {
    pub broker: String,
    pub topic: String,
}

/// Push endpoint target of a sensor's presence events
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WsSinkConfig {
    pub endpoint: String,
}

/// One `[[sensor]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SensorConfig {
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    pub name: String,
    pub port: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub print_presence: bool,
    #[serde(default)]
    pub mqtt: Vec<MqttSinkConfig>,
    #[serde(default)]
    pub ws: Vec<WsSinkConfig>,
}

impl SensorConfig {
    #[must_use]
    pub fn sen0395(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            sensor_type: SensorType::Sen0395,
            name: name.into(),
            port: port.into(),
            enabled: false,
            autostart: false,
            print_presence: false,
            mqtt: Vec::new(),
            ws: Vec::new(),
        }
    }

    /// Validate a raw `[[sensor]]` table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownSensorType`] for a type name no driver
    /// handles, [`ConfigError::MissingField`] for an empty field, or
    /// [`ConfigError::Entry`] when the table does not have the expected shape.
    pub fn from_table(table: &Table) -> Result<Self, ConfigError> {
        if let Some(Value::String(type_name)) = table.get("type")
            && SensorType::from_name(type_name).is_none()
        {
            return Err(ConfigError::UnknownSensorType(type_name.clone()));
        }
        decode(table)
    }
}

impl Validate for SensorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_empty("name", &self.name)?;
        non_empty("port", &self.port)?;
        for sink in &self.mqtt {
            non_empty("broker", &sink.broker)?;
            non_empty("topic", &sink.topic)?;
        }
        for sink in &self.ws {
            non_empty("endpoint", &sink.endpoint)?;
        }
        Ok(())
    }
}

/// One `[[ws]]` entry of `endpoints.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WsEndpointConfig {
    pub name: String,
    pub uri: String,
}

impl WsEndpointConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `name` or `uri` is empty, or
    /// [`ConfigError::Entry`] when either is absent.
    pub fn from_table(table: &Table) -> Result<Self, ConfigError> {
        decode(table)
    }
}

impl Validate for WsEndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_empty("name", &self.name)?;
        non_empty("uri", &self.uri)
    }
}

/// One `[[broker]]` entry of `mqtt.toml`. The name doubles as the client id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MqttBrokerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

impl MqttBrokerConfig {
    /// # Errors
    ///
    /// Same as [`WsEndpointConfig::from_table`], for `name` and `host`.
    pub fn from_table(table: &Table) -> Result<Self, ConfigError> {
        decode(table)
    }
}

impl Validate for MqttBrokerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_empty("name", &self.name)?;
        non_empty("host", &self.host)
    }
}

/// Checks serde cannot express
trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

fn decode<T: DeserializeOwned + Validate>(table: &Table) -> Result<T, ConfigError> {
    let entry: T = Value::Table(table.clone()).try_into()?;
    entry.validate()?;
    Ok(entry)
}

fn non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField(field.to_string()));
    }
    Ok(())
}

/// A configuration entry that is either valid or rejected with a reason,
/// alongside its raw form for logging.
pub type Entry<T> = (Table, Result<T, ConfigError>);

#[derive(Deserialize)]
struct SensorsFile {
    #[serde(default)]
    sensor: Vec<Table>,
}

#[derive(Deserialize)]
struct EndpointsFile {
    #[serde(default)]
    ws: Vec<Table>,
}

#[derive(Deserialize)]
struct BrokersFile {
    #[serde(default)]
    broker: Vec<Table>,
}

fn entries<T>(
    tables: Vec<Table>,
    parse: impl Fn(&Table) -> Result<T, ConfigError>,
) -> Vec<Entry<T>> {
    tables
        .into_iter()
        .map(|table| {
            let entry = parse(&table);
            (table, entry)
        })
        .collect()
}

/// Parse `sensors.toml` content into validated `[[sensor]]` entries.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed TOML, including a `sensor`
/// key that is not an array of tables.
pub fn parse_sensors(path: &Path, content: &str) -> Result<Vec<Entry<SensorConfig>>, ConfigError> {
    let file: SensorsFile = parse_document(path, content)?;
    Ok(entries(file.sensor, SensorConfig::from_table))
}

/// Parse `endpoints.toml` content into validated `[[ws]]` entries.
///
/// # Errors
///
/// See [`parse_sensors`].
pub fn parse_endpoints(
    path: &Path,
    content: &str,
) -> Result<Vec<Entry<WsEndpointConfig>>, ConfigError> {
    let file: EndpointsFile = parse_document(path, content)?;
    Ok(entries(file.ws, WsEndpointConfig::from_table))
}

/// Parse `mqtt.toml` content into validated `[[broker]]` entries.
///
/// # Errors
///
/// See [`parse_sensors`].
pub fn parse_brokers(
    path: &Path,
    content: &str,
) -> Result<Vec<Entry<MqttBrokerConfig>>, ConfigError> {
    let file: BrokersFile = parse_document(path, content)?;
    Ok(entries(file.broker, MqttBrokerConfig::from_table))
}

fn parse_document<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Directories searched for configuration files, in priority order
#[must_use]
pub fn config_search_path() -> Vec<PathBuf> {
    let mut search_path = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        search_path.push(cwd);
    }

    if let Some(base) = BaseDirs::new() {
        search_path.push(base.config_dir().join(CONFIG_DIR));
    }

    match std::env::var("XDG_CONFIG_DIRS") {
        Ok(dirs) if !dirs.is_empty() => search_path.extend(
            dirs.split(':')
                .filter(|dir| !dir.is_empty())
                .map(|dir| Path::new(dir).join(CONFIG_DIR)),
        ),
        _ => search_path.push(Path::new("/etc/xdg").join(CONFIG_DIR)),
    }

    search_path.push(Path::new("/etc").join(CONFIG_DIR));
    search_path
}

/// Where configuration files are looked up
#[derive(Debug, Clone)]
pub struct ConfigSource {
    search_path: Vec<PathBuf>,
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::new(config_search_path())
    }
}

impl ConfigSource {
    #[must_use]
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    /// Look only in `dir`
    #[must_use]
    pub fn with_dir(dir: PathBuf) -> Self {
        Self::new(vec![dir])
    }

    #[must_use]
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// First existing `file` along the search path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] listing the searched directories.
    pub fn lookup(&self, file: &str) -> Result<PathBuf, ConfigError> {
        for dir in &self.search_path {
            let candidate = dir.join(file);
            if candidate.is_file() {
                debug!("Found {} at {:?}", file, candidate);
                return Ok(candidate);
            }
        }

        Err(ConfigError::NotFound {
            file: file.to_string(),
            search_path: self
                .search_path
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Load the sensor entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when there is no `sensors.toml`, or
    /// a read/parse error for the file found.
    pub async fn load_sensors(&self) -> Result<Vec<Entry<SensorConfig>>, ConfigError> {
        let path = self.lookup(SENSORS_CONFIG_FILE)?;
        let content = read(&path).await?;
        parse_sensors(&path, &content)
    }

    /// Load the push endpoint entries. A missing file means no endpoints.
    ///
    /// # Errors
    ///
    /// Returns a read/parse error for the file found.
    pub async fn load_endpoints(&self) -> Result<Vec<Entry<WsEndpointConfig>>, ConfigError> {
        match self.read_optional(ENDPOINTS_CONFIG_FILE).await? {
            Some((path, content)) => parse_endpoints(&path, &content),
            None => Ok(Vec::new()),
        }
    }

    /// Load the message broker entries. A missing file means no brokers.
    ///
    /// # Errors
    ///
    /// Returns a read/parse error for the file found.
    pub async fn load_brokers(&self) -> Result<Vec<Entry<MqttBrokerConfig>>, ConfigError> {
        match self.read_optional(MQTT_CONFIG_FILE).await? {
            Some((path, content)) => parse_brokers(&path, &content),
            None => Ok(Vec::new()),
        }
    }

    async fn read_optional(&self, file: &str) -> Result<Option<(PathBuf, String)>, ConfigError> {
        let path = match self.lookup(file) {
            Ok(path) => path,
            Err(ConfigError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let content = read(&path).await?;
        Ok(Some((path, content)))
    }
}

async fn read(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}
