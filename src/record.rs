// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric records handed to the exposition layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label carrying the device identity.
pub const SENSOR_LABEL: &str = "sensor";

/// Label carrying the originating topic.
pub const TOPIC_LABEL: &str = "topic";

/// Prometheus value type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Gauge,
    Counter,
    #[default]
    Untyped,
}

impl ValueKind {
    /// Interpret a configured `type`; anything unrecognised is untyped.
    pub fn from_config(value: &str) -> Self {
        match value {
            "gauge" => ValueKind::Gauge,
            "counter" => ValueKind::Counter,
            _ => ValueKind::Untyped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Gauge => "gauge",
            ValueKind::Counter => "counter",
            ValueKind::Untyped => "untyped",
        }
    }
}

/// Static identity of an exposed metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Description {
    /// Exposed metric name
    pub name: String,
    /// Help text
    pub help: String,
    /// Labels with fixed values
    pub constant_labels: BTreeMap<String, String>,
}

/// One computed metric sample.
///
/// Records are produced fresh per evaluation and owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub description: Description,
    pub value: f64,
    pub kind: ValueKind,
    /// `None` when the rule omits timestamps
    pub ingest_time: Option<DateTime<Utc>>,
    /// Variable label names, in exposition order
    pub label_names: Vec<String>,
    /// Values for every name in `label_names`
    pub labels: BTreeMap<String, String>,
}

impl MetricRecord {
    /// Label values ordered like `label_names`.
    pub fn label_values(&self) -> Vec<&str> {
        self.label_names
            .iter()
            .map(|name| self.labels.get(name).map(String::as_str).unwrap_or(""))
            .collect()
    }

    /// Exposed metric name.
    pub fn name(&self) -> &str {
        &self.description.name
    }
}
