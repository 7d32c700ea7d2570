// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric transformer: raw values in, metric records out.
//!
//! For every rule matching an inbound (source name, device, topic) the value
//! goes through a fixed pipeline:
//!
//! ```text
//! raw ─▶ type resolution ─▶ expression ─▶ monotonicity ─▶ scale ─▶ timestamp ─▶ labels
//!        (or raw expression)
//! ```
//!
//! Each value step may fail. A failure is replaced by the rule's
//! `error_value` when one is configured, except for expression compile
//! failures, which always surface. Label failures always surface.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result, TransformError};
use crate::expr::{Env, LastResult};
use crate::record::{MetricRecord, SENSOR_LABEL, TOPIC_LABEL};
use crate::resolver::Rule;
use crate::rules::RuleIndex;
use crate::state::{RuleState, StateStore};

/// State identity of a rule evaluated for one device on one topic.
pub fn state_key(topic: &str, rule: &Rule, device: &str) -> String {
    format!(
        "{}${}${}${}",
        topic, rule.source_name, device, rule.output_name
    )
}

/// State identity of a dynamic label.
pub fn label_state_key(label: &str, identity: &str) -> String {
    format!("{}@{}", label, identity)
}

/// Applies resolved rules to inbound values.
#[derive(Debug)]
pub struct Transformer {
    index: RuleIndex,
    store: StateStore,
}

impl Transformer {
    pub fn new(rules: Vec<Rule>, store: StateStore) -> Self {
        Self {
            index: RuleIndex::new(rules),
            store,
        }
    }

    /// Build from a loaded configuration.
    ///
    /// State is persisted when a rule forces monotonicity or the state
    /// directory already exists; otherwise it is kept in memory.
    pub fn from_config(config: &Config) -> Self {
        let state_dir = &config.cache.state_dir;
        let store = if config.requires_state || state_dir.is_dir() {
            StateStore::new(state_dir)
        } else {
            StateStore::in_memory()
        };
        Self::new(config.rules.clone(), store)
    }

    pub fn index(&self) -> &RuleIndex {
        &self.index
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Evaluate every rule matching `source_name`, `device` and `topic`.
    ///
    /// No matching rule yields no records. The first failing rule aborts the
    /// call with an error naming it.
    pub fn process(
        &self,
        source_name: &str,
        device: &str,
        raw: &JsonValue,
        topic: &str,
    ) -> Result<Vec<MetricRecord>> {
        self.process_selected(source_name, device, topic, |_| Some(raw))
    }

    /// Like [`process`](Self::process), with the raw value picked per rule.
    ///
    /// Rules for which `select` returns `None` are skipped.
    pub fn process_selected<'p, F>(
        &self,
        source_name: &str,
        device: &str,
        topic: &str,
        mut select: F,
    ) -> Result<Vec<MetricRecord>>
    where
        F: FnMut(&Rule) -> Option<&'p JsonValue>,
    {
        let rules = self.index.lookup(source_name, device);
        let mut records = Vec::with_capacity(rules.len());

        for rule in rules.into_iter().filter(|rule| rule.matches_topic(topic)) {
            let Some(raw) = select(rule) else {
                debug!(rule = %rule.id(), topic, "No raw value for rule");
                continue;
            };
            let record = self
                .evaluate(rule, device, raw, topic)
                .map_err(|source| Error::Transform {
                    rule: rule.id(),
                    source,
                })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Run the pipeline of a single rule.
    pub fn evaluate(
        &self,
        rule: &Rule,
        device: &str,
        raw: &JsonValue,
        topic: &str,
    ) -> std::result::Result<MetricRecord, TransformError> {
        let identity = state_key(topic, rule, device);

        let mut value = match &rule.raw_expression {
            Some(source) => recover(rule, self.eval_value(&identity, source, raw, 0.0))?,
            None => recover(rule, coerce(rule, raw))?,
        };

        if let Some(source) = &rule.expression {
            value = recover(rule, self.eval_value(&identity, source, raw, value))?;
        }

        if rule.force_monotonic {
            value = self
                .store
                .with_state(&identity, |state| enforce_monotonic(state, value));
        }

        if rule.scale != 0.0 {
            value *= rule.scale;
        }

        let ingest_time = (!rule.omit_timestamp).then(Utc::now);

        let mut labels = BTreeMap::new();
        labels.insert(SENSOR_LABEL.to_string(), device.to_string());
        labels.insert(TOPIC_LABEL.to_string(), topic.to_string());
        for (name, source) in &rule.dynamic_labels {
            let key = label_state_key(name, &identity);
            let text = self.eval_label(&key, source, raw, value)?;
            labels.insert(name.clone(), text);
        }

        debug!(
            rule = %rule.id(),
            device,
            topic,
            value,
            "Evaluated metric"
        );

        Ok(MetricRecord {
            description: rule.description(),
            value,
            kind: rule.kind,
            ingest_time,
            label_names: rule.label_names(),
            labels,
        })
    }

    /// Persist every dirty state. Returns how many were written.
    pub fn flush_all(&self) -> Result<usize> {
        Ok(self.store.flush_all()?)
    }

    fn eval_value(
        &self,
        key: &str,
        source: &str,
        raw: &JsonValue,
        value: f64,
    ) -> std::result::Result<f64, TransformError> {
        self.store
            .with_state(key, |state| -> std::result::Result<f64, TransformError> {
                let program = state.compiled(source)?;
                let now = Utc::now();
                let durable = &state.durable;
                let env = Env {
                    raw_value: raw,
                    value,
                    last_value: durable.last_expr_value,
                    last_raw_value: &durable.last_expr_raw_value,
                    last_result: LastResult::Number(durable.last_expr_result),
                    elapsed: durable.elapsed_since_eval(now),
                };
                let result = program.evaluate_number(&env)?;

                let durable = &mut state.durable;
                durable.last_expr_result = result;
                durable.last_expr_raw_value = raw.clone();
                durable.last_expr_value = value;
                durable.last_expr_timestamp = Some(now);
                state.mark_dirty();
                Ok(result)
            })
    }

    fn eval_label(
        &self,
        key: &str,
        source: &str,
        raw: &JsonValue,
        value: f64,
    ) -> std::result::Result<String, TransformError> {
        self.store
            .with_state(key, |state| -> std::result::Result<String, TransformError> {
                let program = state.compiled(source)?;
                let now = Utc::now();
                let durable = &state.durable;
                let env = Env {
                    raw_value: raw,
                    value,
                    last_value: durable.last_expr_value,
                    last_raw_value: &durable.last_expr_raw_value,
                    last_result: LastResult::Text(&durable.last_expr_result_text),
                    elapsed: durable.elapsed_since_eval(now),
                };
                let text = program.evaluate_text(&env)?;

                let durable = &mut state.durable;
                durable.last_expr_result_text = text.clone();
                durable.last_expr_raw_value = raw.clone();
                durable.last_expr_value = value;
                durable.last_expr_timestamp = Some(now);
                state.mark_dirty();
                Ok(text)
            })
    }
}

/// Substitute the rule's fallback for a recoverable failure.
fn recover(
    rule: &Rule,
    result: std::result::Result<f64, TransformError>,
) -> std::result::Result<f64, TransformError> {
    match (result, rule.error_value) {
        (Ok(value), _) => Ok(value),
        (Err(e), Some(fallback)) if !e.is_compile() => {
            debug!(rule = %rule.id(), error = %e, fallback, "Using error value");
            Ok(fallback)
        }
        (Err(e), _) => Err(e),
    }
}

/// Turn a raw scalar into a number.
fn coerce(rule: &Rule, raw: &JsonValue) -> std::result::Result<f64, TransformError> {
    match raw {
        JsonValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| TransformError::UnsupportedType {
            kind: "number",
            value: n.to_string(),
        }),
        JsonValue::String(text) => match &rule.string_mapping {
            Some(mapping) => mapping
                .map
                .get(text)
                .copied()
                .or(mapping.error_value)
                .ok_or_else(|| TransformError::UnmappedString(text.clone())),
            None => text
                .parse::<f64>()
                .map_err(|_| TransformError::UnparsableString(text.clone())),
        },
        JsonValue::Null => Err(TransformError::UnsupportedType {
            kind: "null",
            value: "null".to_string(),
        }),
        JsonValue::Array(_) => Err(TransformError::UnsupportedType {
            kind: "array",
            value: raw.to_string(),
        }),
        JsonValue::Object(_) => Err(TransformError::UnsupportedType {
            kind: "object",
            value: raw.to_string(),
        }),
    }
}

/// Keep the output from ever decreasing. A drop below the previous working
/// value is treated as a source reset.
fn enforce_monotonic(state: &mut RuleState, value: f64) -> f64 {
    let durable = &mut state.durable;
    if value < durable.last_raw_value {
        durable.offset += durable.last_raw_value;
        state.mark_urgent();
    } else if value != durable.last_raw_value {
        state.mark_dirty();
    }
    state.durable.last_raw_value = value;
    value + state.durable.offset
}
