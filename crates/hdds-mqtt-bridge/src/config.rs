// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML configuration for the bridge.

use crate::pattern::{PatternError, PatternRegistry, TopicPattern, DEFAULT_MEASUREMENT_GROUP};
use crate::pipeline::Translator;
use crate::point::PointBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker settings.
    pub mqtt: MqttConfig,

    /// InfluxDB settings.
    pub influxdb: InfluxDbConfig,

    /// Topic patterns, evaluated in order.
    pub patterns: Vec<PatternConfig>,

    /// Measurements whose scalar values are never coerced to floats.
    #[serde(default)]
    pub stringify_values_for_measurements: Vec<String>,

    /// Skip points whose fields equal the previous point of the same series.
    #[serde(default)]
    pub skip_unchanged: bool,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log at debug level.
    #[serde(default)]
    pub verbose: bool,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// InfluxDB v2 write API settings.
///
/// InfluxDB 1.8 accepts the same API with `bucket = "db/rp"` and
/// `token = "user:password"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    /// Base URL (e.g., "http://localhost:8086").
    pub url: String,

    #[serde(default)]
    pub org: String,

    pub bucket: String,

    #[serde(default)]
    pub token: String,

    /// Lines per write request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a line waits before being written (milliseconds).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

/// A topic pattern entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Pattern name; also the default subscription prefix.
    pub name: String,

    /// Regex with named capture groups; `token_pattern` is expanded.
    pub regex: String,

    /// Capture group holding the measurement name.
    #[serde(default = "default_measurement_group")]
    pub measurement_group: String,

    /// MQTT subscription filter. Defaults to `<name>/#`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<String>,
}

impl PatternConfig {
    pub fn new(name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regex: regex.into(),
            measurement_group: default_measurement_group(),
            subscribe: None,
        }
    }

    /// Subscription filter for this pattern.
    pub fn subscription(&self) -> String {
        self.subscribe
            .clone()
            .unwrap_or_else(|| format!("{}/#", self.name))
    }

    /// Compile into a [`TopicPattern`].
    pub fn compile(&self) -> Result<TopicPattern, PatternError> {
        TopicPattern::with_measurement_group(&self.name, &self.regex, &self.measurement_group)
    }
}

fn default_stats_interval() -> u64 {
    10
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hdds-mqtt-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_measurement_group() -> String {
    DEFAULT_MEASUREMENT_GROUP.to_string()
}

impl BridgeConfig {
    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Validate the configuration, including compiling every pattern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Invalid("mqtt.host is empty".into()));
        }
        if self.influxdb.url.is_empty() {
            return Err(ConfigError::Invalid("influxdb.url is empty".into()));
        }
        if self.influxdb.bucket.is_empty() {
            return Err(ConfigError::Invalid("influxdb.bucket is empty".into()));
        }
        if self.influxdb.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "influxdb.batch_size must be at least 1".into(),
            ));
        }
        if self.patterns.is_empty() {
            return Err(ConfigError::Invalid("No patterns configured".into()));
        }

        let mut names = HashSet::new();
        for pattern in &self.patterns {
            if !names.insert(pattern.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate pattern name '{}'",
                    pattern.name
                )));
            }
            pattern.compile()?;
        }

        Ok(())
    }

    /// Compile the pattern registry, in declaration order.
    pub fn build_registry(&self) -> Result<PatternRegistry, ConfigError> {
        let patterns = self
            .patterns
            .iter()
            .map(PatternConfig::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternRegistry::new(patterns))
    }

    /// Build the translator for this configuration.
    pub fn build_translator(&self) -> Result<Translator, ConfigError> {
        let builder =
            PointBuilder::new().with_stringify(self.stringify_values_for_measurements.iter().cloned());
        Ok(Translator::new(self.build_registry()?, builder))
    }

    /// Deduplicated MQTT subscription filters, in pattern order.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.patterns
            .iter()
            .map(PatternConfig::subscription)
            .filter(|s| seen.insert(s.clone()))
            .collect()
    }

    /// Example configuration used by `gen-config`.
    pub fn example() -> Self {
        Self {
            mqtt: MqttConfig {
                host: "localhost".into(),
                port: default_mqtt_port(),
                client_id: default_client_id(),
                username: None,
                password: None,
                keep_alive_secs: default_keep_alive(),
            },
            influxdb: InfluxDbConfig {
                url: "http://localhost:8086".into(),
                org: "home".into(),
                bucket: "sensors".into(),
                token: "changeme".into(),
                batch_size: default_batch_size(),
                flush_interval_ms: default_flush_interval(),
            },
            patterns: vec![
                PatternConfig::new(
                    "weather",
                    "(?P<node_name>weather)/(?P<measurement_name>token_pattern)",
                ),
                PatternConfig::new(
                    "sensors",
                    "(?P<node_name>sensors)/(?P<room>token_pattern)/(?P<measurement_name>token_pattern)/state",
                ),
            ],
            stringify_values_for_measurements: vec!["firmware".into()],
            skip_unchanged: false,
            stats_interval_secs: default_stats_interval(),
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
mqtt:
  host: "broker.local"
influxdb:
  url: "http://localhost:8086"
  bucket: "sensors"
patterns:
  - name: weather
    regex: "(?P<node_name>weather)/(?P<measurement_name>token_pattern)"
"#;

    const FULL_YAML: &str = r#"
mqtt:
  host: "broker.local"
  port: 8883
  client_id: "bridge-1"
  username: "user"
  password: "secret"
  keep_alive_secs: 60
influxdb:
  url: "http://influx.example.com:8086"
  org: "home"
  bucket: "telemetry"
  token: "test-token-placeholder"
  batch_size: 200
  flush_interval_ms: 5000
patterns:
  - name: sensors
    regex: "(?P<node_name>sensors)/(?P<room>token_pattern)/(?P<measurement_name>token_pattern)/state"
  - name: zigbee
    regex: "zigbee2mqtt/(?P<device>token_pattern)/(?P<metric>token_pattern)"
    measurement_group: metric
    subscribe: "zigbee2mqtt/+/+"
stringify_values_for_measurements:
  - firmware
skip_unchanged: true
stats_interval_secs: 0
verbose: true
"#;

    #[test]
    fn test_config_parse_minimal() {
        let config = BridgeConfig::from_yaml(MINIMAL_YAML).expect("parse minimal yaml");

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.client_id, "hdds-mqtt-bridge");
        assert!(config.mqtt.username.is_none());
        assert_eq!(config.influxdb.batch_size, 1000);
        assert_eq!(config.influxdb.flush_interval_ms, 1000);
        assert_eq!(config.patterns.len(), 1);
        assert_eq!(config.patterns[0].measurement_group, "measurement_name");
        assert!(config.stringify_values_for_measurements.is_empty());
        assert!(!config.skip_unchanged);
        assert_eq!(config.stats_interval_secs, 10);
        assert!(!config.verbose);
    }

    #[test]
    fn test_config_parse_all_fields() {
        let config = BridgeConfig::from_yaml(FULL_YAML).expect("parse full yaml");

        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("user"));
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.influxdb.org, "home");
        assert_eq!(config.influxdb.batch_size, 200);
        assert_eq!(config.patterns[1].measurement_group, "metric");
        assert_eq!(config.stringify_values_for_measurements, vec!["firmware"]);
        assert!(config.skip_unchanged);
        assert!(config.verbose);
    }

    #[test]
    fn test_subscriptions_default_and_explicit() {
        let config = BridgeConfig::from_yaml(FULL_YAML).expect("parse");
        assert_eq!(
            config.subscriptions(),
            vec!["sensors/#".to_string(), "zigbee2mqtt/+/+".to_string()]
        );
    }

    #[test]
    fn test_subscriptions_deduplicated() {
        let mut config = BridgeConfig::example();
        config.patterns.push(PatternConfig {
            subscribe: Some("weather/#".into()),
            ..PatternConfig::new("weather-alt", "(?P<node_name>weather)/x/(?P<measurement_name>y)")
        });
        assert_eq!(config.subscriptions(), vec!["weather/#", "sensors/#"]);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let yaml = MINIMAL_YAML.replace("(?P<measurement_name>token_pattern)", "uv");
        let err = BridgeConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Pattern(PatternError::MissingMeasurementGroup { .. })
        ));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = BridgeConfig::example();
        assert!(config.validate().is_ok());

        config.patterns.clear();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::example();
        let duplicate = config.patterns[0].clone();
        config.patterns.push(duplicate);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BridgeConfig::example();
        config.influxdb.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::example();
        config.mqtt.host.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_translator_applies_stringify() {
        let translator = BridgeConfig::example().build_translator().expect("build");
        assert_eq!(translator.registry().len(), 2);

        let point = translator
            .translate("weather/firmware", b"1.2")
            .expect("point");
        assert_eq!(
            point.fields["value"],
            crate::influx::FieldValue::String("1.2".into())
        );
    }

    #[test]
    fn test_example_roundtrips_through_yaml() {
        let yaml = serde_yaml::to_string(&BridgeConfig::example()).expect("serialize");
        let config = BridgeConfig::from_yaml(&yaml).expect("parse");
        assert_eq!(config.patterns.len(), 2);
        assert_eq!(config.influxdb.bucket, "sensors");
    }

    #[test]
    fn test_config_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(MINIMAL_YAML.as_bytes()).expect("write");

        let config = BridgeConfig::from_file(file.path()).expect("load");
        assert_eq!(config.patterns[0].name, "weather");

        let missing = BridgeConfig::from_file("/nonexistent/bridge.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
