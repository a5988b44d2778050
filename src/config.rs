//! Station configuration: the YAML document describing devices and
//! experiment templates (spec.md §6).
//!
//! Parsing is the only job here — validating driver-specific kwargs is left
//! to whatever driver layer ends up consuming `DeviceSettings::kwargs`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level station configuration (spec.md §6 "Config file").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub listen_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub devices: HashMap<String, DeviceSettings>,
    #[serde(default)]
    pub experiments: HashMap<String, ExperimentTemplate>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One entry under `devices:` — `{driver, address, optional channel,
/// optional driver-specific kwargs}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub driver: String,
    pub address: String,
    #[serde(default)]
    pub channel: Option<u32>,
    #[serde(flatten)]
    pub kwargs: HashMap<String, JsonValue>,
}

/// One entry under `experiments:` — parameters, observables, stop-conditions,
/// conditions, and a command list (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentTemplate {
    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,
    #[serde(default)]
    pub observables: Vec<String>,
    #[serde(default)]
    pub stopconditions: Vec<JsonValue>,
    #[serde(default)]
    pub conditions: Vec<JsonValue>,
    /// Each entry is either a 4-tuple `[device, method, args, kwargs]` or a
    /// 2-tuple `[experiment_type, kwargs]`; both are JSON arrays until a
    /// driver layer resolves them into `DeviceCall`/sub-experiment steps.
    #[serde(default)]
    pub commands: Vec<JsonValue>,
}

impl Settings {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
listen_port: 8080
devices:
  pump1:
    driver: syringe_pump
    address: 192.168.1.10
experiments:
  titration:
    parameters:
      volume_ml: 5
    observables: ["flow_rate"]
    commands:
      - [pump1, prime, [], {}]
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.listen_port, 8080);
        assert_eq!(settings.log_level, "info");
        let pump = settings.devices.get("pump1").unwrap();
        assert_eq!(pump.driver, "syringe_pump");
        assert_eq!(pump.address, "192.168.1.10");
        assert!(pump.channel.is_none());
        let titration = settings.experiments.get("titration").unwrap();
        assert_eq!(titration.observables, vec!["flow_rate".to_string()]);
    }

    #[test]
    fn carries_driver_specific_kwargs_through_flatten() {
        let yaml = r#"
listen_port: 9000
devices:
  stage1:
    driver: newport_esp301
    address: COM3
    channel: 2
    baud: 19200
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        let stage = settings.devices.get("stage1").unwrap();
        assert_eq!(stage.channel, Some(2));
        assert_eq!(stage.kwargs.get("baud").unwrap(), &serde_json::json!(19200));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let result = Settings::from_yaml_str("listen_port: [this is not a map");
        assert!(result.is_err());
    }
}
