// mqtt2prom Exporter - Message ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! From (topic, payload) to cached metric records.
//!
//! The device identity is the `deviceid` group of `device_id_regex` applied
//! to the topic. In object-per-topic mode, each inbound metric name is looked
//! up in the payload as a path split on the JSON separator. In
//! metric-per-topic mode the name is the `metricname` group of the topic and
//! the raw value is the rule's `payload_field` of the payload, or the whole
//! payload when the rule names no field.

use std::sync::Arc;

use mqtt2prom::config::{DEVICE_ID_REGEX_GROUP, METRIC_NAME_REGEX_GROUP};
use mqtt2prom::{Config, Error, Pattern, Rule, Transformer};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::cache::PresentationCache;
use crate::metrics::{record_invalid_message, record_message, record_transform_error};

/// How inbound metric names are found.
#[derive(Debug, Clone)]
enum Layout {
    ObjectPerTopic { separator: String },
    MetricPerTopic {
        metric_name_regex: Pattern,
        separator: String,
    },
}

/// Feeds messages through the transformer into the presentation cache.
#[derive(Debug)]
pub struct Ingestor {
    transformer: Arc<Transformer>,
    cache: Arc<PresentationCache>,
    device_id_regex: Pattern,
    layout: Layout,
}

impl Ingestor {
    pub fn new(config: &Config, transformer: Arc<Transformer>, cache: Arc<PresentationCache>) -> Self {
        let layout = match &config.mqtt.metric_per_topic_config {
            Some(per_topic) => Layout::MetricPerTopic {
                metric_name_regex: per_topic.metric_name_regex.clone(),
                separator: config.json_parsing.separator.clone(),
            },
            None => Layout::ObjectPerTopic {
                separator: config.json_parsing.separator.clone(),
            },
        };
        Self {
            transformer,
            cache,
            device_id_regex: config.mqtt.device_id_regex.clone(),
            layout,
        }
    }

    /// Handle one message. Returns the number of records cached.
    pub fn handle(&self, topic: &str, payload: &JsonValue) -> usize {
        let Some(device) = self.device_id_regex.group_value(topic, DEVICE_ID_REGEX_GROUP) else {
            warn!(topic, "Topic does not yield a device id");
            record_invalid_message();
            return 0;
        };

        let mut emitted = 0;
        for (source_name, raw) in self.extract(topic, payload) {
            let outcome = self
                .transformer
                .process_selected(&source_name, device, topic, |rule| self.select(rule, raw));
            match outcome {
                Ok(records) => {
                    emitted += records.len();
                    self.cache.store(records);
                }
                Err(Error::Transform { rule, source }) => {
                    warn!(topic, device, rule = %rule, error = %source, "Failed to transform value");
                    record_transform_error(&rule);
                }
                Err(e) => warn!(topic, device, error = %e, "Failed to transform value"),
            }
        }

        debug!(topic, device, records = emitted, "Message handled");
        record_message(emitted);
        emitted
    }

    /// Inbound (name, raw value) pairs carried by a message.
    fn extract<'p>(&self, topic: &str, payload: &'p JsonValue) -> Vec<(String, &'p JsonValue)> {
        match &self.layout {
            Layout::MetricPerTopic {
                metric_name_regex, ..
            } => metric_name_regex
                .group_value(topic, METRIC_NAME_REGEX_GROUP)
                .map(|name| vec![(name.to_string(), payload)])
                .unwrap_or_default(),
            Layout::ObjectPerTopic { separator } => self
                .transformer
                .index()
                .source_names()
                .into_iter()
                .filter_map(|name| {
                    lookup_path(payload, name, separator).map(|raw| (name.to_string(), raw))
                })
                .collect(),
        }
    }

    /// Raw value of one rule within an extracted value.
    fn select<'p>(&self, rule: &Rule, raw: &'p JsonValue) -> Option<&'p JsonValue> {
        match &self.layout {
            Layout::MetricPerTopic { separator, .. } if !rule.payload_field.is_empty() => {
                lookup_path(raw, &rule.payload_field, separator)
            }
            _ => Some(raw),
        }
    }
}

/// Walk `path` through nested objects and arrays.
fn lookup_path<'p>(payload: &'p JsonValue, path: &str, separator: &str) -> Option<&'p JsonValue> {
    if let Some(value) = payload.get(path) {
        return Some(value);
    }
    if separator.is_empty() {
        return None;
    }
    path.split(separator).try_fold(payload, |node, segment| match node {
        JsonValue::Object(fields) => fields.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
