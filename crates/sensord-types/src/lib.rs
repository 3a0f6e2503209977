//! Shared types for sensord components.
//!
//! This crate provides the sensor domain types used by both sensord-rpc and
//! sensord-daemon. All types are serializable for RPC transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Supported sensor hardware families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Sen0395,
}

impl SensorType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Sen0395 => "sen0395",
        }
    }

    /// Parse the configuration/wire name of a sensor type.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sen0395" => Some(SensorType::Sen0395),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a sensor instance: its family plus the caller-assigned name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId {
    pub sensor_type: SensorType,
    pub sensor_name: String,
}

impl SensorId {
    #[must_use]
    pub fn new(sensor_type: SensorType, sensor_name: impl Into<String>) -> Self {
        Self {
            sensor_type,
            sensor_name: sensor_name.into(),
        }
    }

    #[must_use]
    pub fn sen0395(sensor_name: impl Into<String>) -> Self {
        Self::new(SensorType::Sen0395, sensor_name)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor_type, self.sensor_name)
    }
}

/// SEN0395 command set.
///
/// Action commands are single request/reply exchanges. Configuration commands
/// run as a chain: pause scanning, configure, save, resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    SensorStart,
    SensorStop,
    ResetSystem,
    DetRangeCfg,
    OutputLatency,
    SetSensitivity,
    SetLedMode,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::SensorStart,
        Command::SensorStop,
        Command::ResetSystem,
        Command::DetRangeCfg,
        Command::OutputLatency,
        Command::SetSensitivity,
        Command::SetLedMode,
    ];

    /// Wire name, also the text sent to the sensor
    #[must_use]
    pub fn value(self) -> &'static str {
        match self {
            Command::SensorStart => "sensorStart",
            Command::SensorStop => "sensorStop",
            Command::ResetSystem => "resetSystem",
            Command::DetRangeCfg => "detRangeCfg",
            Command::OutputLatency => "outputLatency",
            Command::SetSensitivity => "setSensitivity",
            Command::SetLedMode => "setLedMode",
        }
    }

    #[must_use]
    pub fn is_config(self) -> bool {
        matches!(
            self,
            Command::DetRangeCfg
                | Command::OutputLatency
                | Command::SetSensitivity
                | Command::SetLedMode
        )
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.value() == name)
    }

    /// Decode a command from a request parameter. Anything other than a
    /// recognized command name yields `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(Self::from_name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

/// Positional command argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    Int(i64),
    Float(f64),
    Text(String),
}

impl CommandArg {
    /// Convert a JSON value, accepting only numbers and strings
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(CommandArg::Int)
                .or_else(|| n.as_f64().map(CommandArg::Float)),
            Value::String(s) => Some(CommandArg::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandArg::Int(v) => write!(f, "{v}"),
            CommandArg::Float(v) => write!(f, "{v}"),
            CommandArg::Text(v) => f.write_str(v),
        }
    }
}

/// Outcome of one command exchange with a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Done,
    NotApplicable,
    Error,
    Missing,
    Unknown,
}

impl CommandResult {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, CommandResult::Done | CommandResult::NotApplicable)
    }
}

/// Raw reply of a sensor to a single command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub command_echo: Option<String>,
    pub command_result: CommandResult,
    #[serde(default)]
    pub message: Option<String>,
}

impl CommandResponse {
    #[must_use]
    pub fn new(
        command_echo: Option<String>,
        command_result: CommandResult,
        message: Option<String>,
    ) -> Self {
        Self {
            command_echo,
            command_result,
            message,
        }
    }

    /// Reply that never arrived
    #[must_use]
    pub fn missing() -> Self {
        Self::new(None, CommandResult::Missing, None)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.command_result.is_success()
    }
}

/// Per-stage replies of a configuration chain.
///
/// Pause and resume are only present when the sensor had to be stopped for
/// the change. Nothing runs after a failed pause. Save only follows a
/// successful configure; resume always follows a successful pause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChainResponse {
    #[serde(default)]
    pub pause_cmd: Option<CommandResponse>,
    #[serde(default)]
    pub cfg_cmd: Option<CommandResponse>,
    #[serde(default)]
    pub save_cmd: Option<CommandResponse>,
    #[serde(default)]
    pub resume_cmd: Option<CommandResponse>,
}

impl ConfigChainResponse {
    /// Stages in execution order, skipping the ones that did not run
    pub fn stages(&self) -> impl Iterator<Item = &CommandResponse> {
        [
            &self.pause_cmd,
            &self.cfg_cmd,
            &self.save_cmd,
            &self.resume_cmd,
        ]
        .into_iter()
        .flatten()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.cfg_cmd.is_some() && self.stages().all(CommandResponse::is_success)
    }
}

/// Snapshot of a sensor's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatus {
    pub sensor_id: SensorId,
    pub port: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    pub is_reading: bool,
    pub is_scanning: bool,
}

/// Result payload of `sen0395.status` and `sen0395.reading`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorStatuses {
    pub statuses: Vec<SensorStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorCommandResponse {
    pub sensor_id: SensorId,
    pub command_response: CommandResponse,
}

/// Result payload of `sen0395.command`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorCommandResponses {
    pub sensor_command_responses: Vec<SensorCommandResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfigChainResponse {
    pub sensor_id: SensorId,
    pub config_chain_response: ConfigChainResponse,
}

/// Result payload of `sen0395.configure`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfigChainResponses {
    pub sensor_config_chain_responses: Vec<SensorConfigChainResponse>,
}

pub const PRESENCE_CHANGE_EVENT: &str = "presence_change";

/// Message published to external sinks when presence changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub sensor_id: String,
    pub event: String,
    pub event_at: String,
    pub event_data: PresenceEventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEventData {
    pub presence: bool,
}

impl PresenceEvent {
    /// `event_at` is an RFC 3339 UTC timestamp
    #[must_use]
    pub fn presence_change(sensor_id: &SensorId, presence: bool, event_at: String) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            event: PRESENCE_CHANGE_EVENT.to_string(),
            event_at,
            event_data: PresenceEventData { presence },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensor_id_display() {
        let id = SensorId::sen0395("hall");
        assert_eq!(id.to_string(), "sen0395/hall");
    }

    #[test]
    fn test_sensor_id_serialization() {
        let id = SensorId::sen0395("hall");
        let value = serde_json::to_value(&id).unwrap();
        assert_eq!(value, json!({"sensor_type": "sen0395", "sensor_name": "hall"}));
    }

    #[test]
    fn test_sensor_type_from_name() {
        assert_eq!(SensorType::from_name("sen0395"), Some(SensorType::Sen0395));
        assert_eq!(SensorType::from_name("sen0311"), None);
        assert_eq!(SensorType::from_name("SEN0395"), None);
    }

    #[test]
    fn test_command_from_value_known() {
        assert_eq!(
            Command::from_value(&json!("sensorStart")),
            Some(Command::SensorStart)
        );
        assert_eq!(
            Command::from_value(&json!("detRangeCfg")),
            Some(Command::DetRangeCfg)
        );
    }

    #[test]
    fn test_command_from_value_rejects_non_strings() {
        assert_eq!(Command::from_value(&json!(1)), None);
        assert_eq!(Command::from_value(&json!(null)), None);
        assert_eq!(Command::from_value(&json!(["sensorStart"])), None);
    }

    #[test]
    fn test_command_is_config() {
        assert!(!Command::SensorStart.is_config());
        assert!(!Command::SensorStop.is_config());
        assert!(!Command::ResetSystem.is_config());
        assert!(Command::DetRangeCfg.is_config());
        assert!(Command::OutputLatency.is_config());
        assert!(Command::SetSensitivity.is_config());
        assert!(Command::SetLedMode.is_config());
    }

    #[test]
    fn test_command_serde_uses_wire_name() {
        for cmd in Command::ALL {
            let json = serde_json::to_value(cmd).unwrap();
            assert_eq!(json, json!(cmd.value()));
        }
    }

    #[test]
    fn test_command_arg_from_value() {
        assert_eq!(CommandArg::from_value(&json!(3)), Some(CommandArg::Int(3)));
        assert_eq!(
            CommandArg::from_value(&json!(1.5)),
            Some(CommandArg::Float(1.5))
        );
        assert_eq!(
            CommandArg::from_value(&json!("0x1")),
            Some(CommandArg::Text("0x1".to_string()))
        );
        assert_eq!(CommandArg::from_value(&json!(true)), None);
        assert_eq!(CommandArg::from_value(&json!({})), None);
    }

    #[test]
    fn test_command_arg_display() {
        assert_eq!(CommandArg::Int(-1).to_string(), "-1");
        assert_eq!(CommandArg::Float(0.5).to_string(), "0.5");
        assert_eq!(CommandArg::Text("abc".into()).to_string(), "abc");
    }

    #[test]
    fn test_command_result_serialization() {
        assert_eq!(
            serde_json::to_value(CommandResult::NotApplicable).unwrap(),
            json!("not_applicable")
        );
        assert!(CommandResult::Done.is_success());
        assert!(CommandResult::NotApplicable.is_success());
        assert!(!CommandResult::Missing.is_success());
    }

    #[test]
    fn test_command_response_optional_fields_default() {
        let resp: CommandResponse =
            serde_json::from_value(json!({"command_result": "missing"})).unwrap();
        assert_eq!(resp, CommandResponse::missing());
    }

    #[test]
    fn test_config_chain_stages_in_order() {
        let done = |echo: &str| {
            CommandResponse::new(Some(echo.to_string()), CommandResult::Done, None)
        };
        let chain = ConfigChainResponse {
            pause_cmd: Some(done("sensorStop")),
            cfg_cmd: Some(done("detRangeCfg -1 0 3")),
            save_cmd: Some(done("saveCfg")),
            resume_cmd: Some(done("sensorStart")),
        };

        let echoes: Vec<_> = chain
            .stages()
            .filter_map(|s| s.command_echo.as_deref())
            .collect();
        assert_eq!(
            echoes,
            vec!["sensorStop", "detRangeCfg -1 0 3", "saveCfg", "sensorStart"]
        );
        assert!(chain.is_success());
    }

    #[test]
    fn test_config_chain_without_cfg_stage_fails() {
        let chain = ConfigChainResponse {
            pause_cmd: Some(CommandResponse::new(None, CommandResult::Error, None)),
            ..ConfigChainResponse::default()
        };
        assert_eq!(chain.stages().count(), 1);
        assert!(!chain.is_success());
    }

    #[test]
    fn test_statuses_serialization() {
        let statuses = SensorStatuses {
            statuses: vec![SensorStatus {
                sensor_id: SensorId::sen0395("s1"),
                port: "/dev/ttyAMA0".to_string(),
                timeout: Some(1.0),
                is_reading: true,
                is_scanning: false,
            }],
        };

        let json = serde_json::to_string(&statuses).unwrap();
        assert!(json.contains("\"statuses\""));
        assert!(json.contains("\"port\":\"/dev/ttyAMA0\""));
        assert!(json.contains("\"is_reading\":true"));

        let parsed: SensorStatuses = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, statuses);
    }

    #[test]
    fn test_presence_event_payload_shape() {
        let event = PresenceEvent::presence_change(
            &SensorId::sen0395("hall"),
            true,
            "2026-01-01T00:00:00+00:00".to_string(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "sensorId": "sen0395/hall",
                "event": "presence_change",
                "eventAt": "2026-01-01T00:00:00+00:00",
                "eventData": {"presence": true}
            })
        );
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn command_from_value_only_accepts_known_names(name in "[a-zA-Z]{0,16}") {
            let decoded = Command::from_value(&Value::String(name.clone()));
            let known = Command::ALL.iter().any(|cmd| cmd.value() == name);
            prop_assert_eq!(decoded.is_some(), known);
            if let Some(cmd) = decoded {
                prop_assert_eq!(cmd.value(), name.as_str());
            }
        }

        #[test]
        fn command_arg_from_integer_keeps_value(n in any::<i64>()) {
            prop_assert_eq!(CommandArg::from_value(&Value::from(n)), Some(CommandArg::Int(n)));
        }
    }
}
