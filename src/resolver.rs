// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration resolution: from layered rule fragments to flat rules.
//!
//! A document holds blocks; each block has one `shared` fragment and a list
//! of concrete `metrics` fragments. Every concrete fragment inherits unset
//! fields from its block's shared fragment, then from the global defaults.
//! "Unset" is the field's zero value, and a zero-valued parent field is
//! never inherited.
//!
//! ```text
//! concrete fragment  ──▶  shared fragment  ──▶  global defaults
//!      (wins)              (block level)        (topic filter ".*")
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Pattern;
use crate::error::ConfigError;
use crate::record::{Description, ValueKind, SENSOR_LABEL, TOPIC_LABEL};

/// Mapping from string payloads to numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StringValueMapping {
    /// Deprecated fallback for strings without a mapping entry.
    /// Superseded by the rule-level `error_value`.
    pub error_value: Option<f64>,
    /// String to value table
    pub map: BTreeMap<String, f64>,
}

/// One metric rule as written in the configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleFragment {
    pub prom_name: String,
    pub mqtt_name: String,
    pub payload_field: String,
    pub sensor_name_filter: Option<Pattern>,
    pub topic_path_filter: Option<Pattern>,
    pub help: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub omit_timestamp: bool,
    pub raw_expression: String,
    pub expression: String,
    #[serde(rename = "force_monotonicy", alias = "force_monotonicity")]
    pub force_monotonicity: bool,
    pub const_labels: BTreeMap<String, String>,
    pub dynamic_labels: BTreeMap<String, String>,
    pub string_value_mapping: Option<StringValueMapping>,
    pub mqtt_value_scale: f64,
    pub error_value: Option<f64>,
}

/// A block of rules sharing default values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockConfig {
    pub shared: RuleFragment,
    pub metrics: Vec<RuleFragment>,
}

/// Zero-value test used by fragment inheritance.
trait Unset {
    fn is_unset(&self) -> bool;
}

impl Unset for String {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl Unset for bool {
    fn is_unset(&self) -> bool {
        !*self
    }
}

impl Unset for f64 {
    fn is_unset(&self) -> bool {
        *self == 0.0
    }
}

impl<T> Unset for Option<T> {
    fn is_unset(&self) -> bool {
        self.is_none()
    }
}

impl<K, V> Unset for BTreeMap<K, V> {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

fn inherit<T: Unset + Clone>(field: &mut T, parent: &T) {
    if field.is_unset() && !parent.is_unset() {
        *field = parent.clone();
    }
}

impl RuleFragment {
    /// The global default fragment, applied after the block's shared values.
    pub fn defaults() -> Self {
        Self {
            topic_path_filter: Some(Pattern::from_static(".*")),
            ..Default::default()
        }
    }

    /// Fill every unset field from `parent`.
    pub fn inherit_from(&mut self, parent: &RuleFragment) {
        inherit(&mut self.prom_name, &parent.prom_name);
        inherit(&mut self.mqtt_name, &parent.mqtt_name);
        inherit(&mut self.payload_field, &parent.payload_field);
        inherit(&mut self.sensor_name_filter, &parent.sensor_name_filter);
        inherit(&mut self.topic_path_filter, &parent.topic_path_filter);
        inherit(&mut self.help, &parent.help);
        inherit(&mut self.value_type, &parent.value_type);
        inherit(&mut self.omit_timestamp, &parent.omit_timestamp);
        inherit(&mut self.raw_expression, &parent.raw_expression);
        inherit(&mut self.expression, &parent.expression);
        inherit(&mut self.force_monotonicity, &parent.force_monotonicity);
        inherit(&mut self.const_labels, &parent.const_labels);
        inherit(&mut self.dynamic_labels, &parent.dynamic_labels);
        inherit(&mut self.string_value_mapping, &parent.string_value_mapping);
        inherit(&mut self.mqtt_value_scale, &parent.mqtt_value_scale);
        inherit(&mut self.error_value, &parent.error_value);
    }
}

/// A fully resolved metric rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Inbound metric name the rule listens to
    pub source_name: String,
    /// Exposed metric name
    pub output_name: String,
    /// Payload field holding the value in metric-per-topic mode; empty uses
    /// the whole payload
    pub payload_field: String,
    /// Device identity selector; `None` matches every device
    pub device_filter: Option<Pattern>,
    /// Topic selector; `None` matches every topic
    pub topic_filter: Option<Pattern>,
    pub help: String,
    pub kind: ValueKind,
    pub omit_timestamp: bool,
    pub raw_expression: Option<String>,
    pub expression: Option<String>,
    pub force_monotonic: bool,
    pub constant_labels: BTreeMap<String, String>,
    /// Label name to expression source, iterated in name order
    pub dynamic_labels: BTreeMap<String, String>,
    pub string_mapping: Option<StringValueMapping>,
    /// Multiplier applied after monotonicity; `0.0` disables scaling
    pub scale: f64,
    /// Fallback substituted for any recoverable failure
    pub error_value: Option<f64>,
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

impl Rule {
    /// Validate a merged fragment and turn it into a rule.
    pub fn from_fragment(fragment: RuleFragment) -> Result<Self, ConfigError> {
        let source_name = if fragment.mqtt_name.is_empty() {
            fragment.prom_name.clone()
        } else {
            fragment.mqtt_name
        };
        let id = format!("{}/{}", source_name, fragment.prom_name);

        if !fragment.expression.is_empty() && !fragment.raw_expression.is_empty() {
            return Err(ConfigError::ConflictingExpressions { rule: id });
        }

        let builtin = [SENSOR_LABEL, TOPIC_LABEL];
        let duplicate = fragment
            .const_labels
            .keys()
            .find(|name| builtin.contains(&name.as_str()))
            .or_else(|| {
                fragment.dynamic_labels.keys().find(|name| {
                    builtin.contains(&name.as_str()) || fragment.const_labels.contains_key(*name)
                })
            });
        if let Some(label) = duplicate {
            return Err(ConfigError::DuplicateLabel {
                rule: id,
                label: label.clone(),
            });
        }

        let legacy_error = fragment
            .string_value_mapping
            .as_ref()
            .and_then(|m| m.error_value);
        if legacy_error.is_some() {
            if fragment.error_value.is_some() {
                return Err(ConfigError::ConflictingErrorValues { rule: id });
            }
            warn!(
                rule = %id,
                "string_value_mapping.error_value is deprecated: please use error_value at the metric level"
            );
        }

        Ok(Self {
            source_name,
            output_name: fragment.prom_name,
            payload_field: fragment.payload_field,
            device_filter: fragment.sensor_name_filter,
            topic_filter: fragment.topic_path_filter,
            help: fragment.help,
            kind: ValueKind::from_config(&fragment.value_type),
            omit_timestamp: fragment.omit_timestamp,
            raw_expression: non_empty(fragment.raw_expression),
            expression: non_empty(fragment.expression),
            force_monotonic: fragment.force_monotonicity,
            constant_labels: fragment.const_labels,
            dynamic_labels: fragment.dynamic_labels,
            string_mapping: fragment.string_value_mapping,
            scale: fragment.mqtt_value_scale,
            error_value: fragment.error_value,
        })
    }

    /// Rule identity used in logs and errors.
    pub fn id(&self) -> String {
        format!("{}/{}", self.source_name, self.output_name)
    }

    pub fn matches_device(&self, device: &str) -> bool {
        self.device_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(device))
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topic_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(topic))
    }

    /// Variable label names: `sensor`, `topic`, then dynamic labels by name.
    pub fn label_names(&self) -> Vec<String> {
        [SENSOR_LABEL, TOPIC_LABEL]
            .into_iter()
            .map(str::to_string)
            .chain(self.dynamic_labels.keys().cloned())
            .collect()
    }

    pub fn description(&self) -> Description {
        Description {
            name: self.output_name.clone(),
            help: self.help.clone(),
            constant_labels: self.constant_labels.clone(),
        }
    }
}

/// Result of resolving a document's metric blocks.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Rules in configured order
    pub rules: Vec<Rule>,
    /// At least one rule forces monotonicity, so a writable state directory is needed
    pub requires_state: bool,
}

/// Merge and validate every block. Any error rejects the whole document.
pub fn resolve(blocks: &[BlockConfig]) -> Result<Resolution, ConfigError> {
    let defaults = RuleFragment::defaults();
    let mut resolution = Resolution::default();

    for block in blocks {
        for fragment in &block.metrics {
            let mut merged = fragment.clone();
            merged.inherit_from(&block.shared);
            merged.inherit_from(&defaults);

            let rule = Rule::from_fragment(merged)?;
            resolution.requires_state |= rule.force_monotonic;
            resolution.rules.push(rule);
        }
    }

    Ok(resolution)
}
