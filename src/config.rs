// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration document loading and validation.
//!
//! The document is YAML and strict: unknown fields are rejected at every
//! level. Sections that are absent fall back to their defaults.
//!
//! ```yaml
//! mqtt:
//!   server: tcp://127.0.0.1:1883
//!   topic_path: v1/devices/me/+
//!   device_id_regex: "(.*/)?(?P<deviceid>.*)"
//! cache:
//!   timeout: 24h
//!   state_directory: /var/lib/mqtt2prometheus
//! metrics:
//!   - shared:
//!       type: gauge
//!     metrics:
//!       - prom_name: temperature
//!         help: DHT22 temperature reading
//! ```

mod duration;
mod pattern;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::resolver::{resolve, BlockConfig, Rule};

pub use duration::parse_duration;
pub use pattern::Pattern;

/// Named group `device_id_regex` must declare.
pub const DEVICE_ID_REGEX_GROUP: &str = "deviceid";

/// Named group `metric_name_regex` must declare.
pub const METRIC_NAME_REGEX_GROUP: &str = "metricname";

/// Only supported object-per-topic encoding.
pub const ENCODING_JSON: &str = "JSON";

/// Message bus settings. The transport itself lives outside this crate; the
/// core only relies on the identity extraction patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub server: String,
    pub topic_path: String,
    pub device_id_regex: Pattern,
    pub user: String,
    pub password: String,
    pub qos: u8,
    pub object_per_topic_config: Option<ObjectPerTopicConfig>,
    pub metric_per_topic_config: Option<MetricPerTopicConfig>,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: "tcp://127.0.0.1:1883".to_string(),
            topic_path: "v1/devices/me".to_string(),
            device_id_regex: default_device_id_regex(),
            user: String::new(),
            password: String::new(),
            qos: 0,
            object_per_topic_config: None,
            metric_per_topic_config: None,
            ca_cert: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
            client_id: String::new(),
        }
    }
}

fn default_device_id_regex() -> Pattern {
    Pattern::from_static("(.*/)?(?P<deviceid>.*)")
}

/// One JSON object per topic, each field a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectPerTopicConfig {
    pub encoding: String,
}

/// One metric per topic; the metric name is taken from the topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricPerTopicConfig {
    pub metric_name_regex: Pattern,
}

/// Presentation cache and state directory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How long an exposed value survives without a new sample
    #[serde(
        deserialize_with = "duration::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    pub timeout: Duration,
    /// Directory holding per-rule state files
    #[serde(rename = "state_directory")]
    pub state_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            state_dir: PathBuf::from("/var/lib/mqtt2prometheus"),
        }
    }
}

/// Payload parsing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonParsingConfig {
    /// Separator for nested field paths
    pub separator: String,
}

impl Default for JsonParsingConfig {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
        }
    }
}

/// The document exactly as written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default)]
    pub json_parsing: Option<JsonParsingConfig>,
    #[serde(default)]
    pub metrics: Vec<BlockConfig>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub enable_profiling_metrics: bool,
}

/// A loaded, defaulted and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub cache: CacheConfig,
    pub json_parsing: JsonParsingConfig,
    pub enable_profiling: bool,
    /// Resolved rules in configured order
    pub rules: Vec<Rule>,
    /// Some rule forces monotonicity
    pub requires_state: bool,
}

impl Config {
    /// Load a configuration file and create the state directory if a rule needs it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(&text)?;
        config.ensure_state_directory()?;

        info!(
            path = %path.display(),
            rules = config.rules.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse, default and validate a document. No filesystem side effects.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_yaml::from_str(text)?;
        Self::from_document(document)
    }

    /// Apply defaults and validation to a parsed document.
    pub fn from_document(document: ConfigDocument) -> Result<Self, ConfigError> {
        let mut mqtt = document.mqtt.unwrap_or_default();
        let mut cache = document.cache.unwrap_or_default();
        if cache.state_dir.as_os_str().is_empty() {
            cache.state_dir = CacheConfig::default().state_dir;
        }

        mqtt.device_id_regex.require_group(DEVICE_ID_REGEX_GROUP)?;

        if mqtt.object_per_topic_config.is_none() && mqtt.metric_per_topic_config.is_none() {
            mqtt.object_per_topic_config = Some(ObjectPerTopicConfig {
                encoding: ENCODING_JSON.to_string(),
            });
        }
        if let Some(per_topic) = &mqtt.metric_per_topic_config {
            per_topic
                .metric_name_regex
                .require_group(METRIC_NAME_REGEX_GROUP)?;
        }

        let resolution = resolve(&document.metrics)?;

        Ok(Self {
            mqtt,
            cache,
            json_parsing: document.json_parsing.unwrap_or_default(),
            enable_profiling: document.enable_profiling_metrics,
            rules: resolution.rules,
            requires_state: resolution.requires_state,
        })
    }

    /// Create the state directory when a rule forces monotonicity.
    pub fn ensure_state_directory(&self) -> Result<(), ConfigError> {
        if !self.requires_state {
            return Ok(());
        }
        std::fs::create_dir_all(&self.cache.state_dir).map_err(|source| {
            ConfigError::StateDirectory {
                path: self.cache.state_dir.clone(),
                source,
            }
        })
    }

    /// Whether the metric name is taken from the topic.
    pub fn is_metric_per_topic(&self) -> bool {
        self.mqtt.metric_per_topic_config.is_some()
    }
}
