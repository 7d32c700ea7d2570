// mqtt2prom Exporter - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Exporter self-metrics and text exposition.
//!
//! Self-metrics live in the default registry. Metrics derived from device
//! messages are not registered; they come from the presentation cache as
//! ready-made families and are encoded alongside.

use lazy_static::lazy_static;
use prometheus::proto::MetricFamily;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Ingestion
    // ============================================================

    /// Messages handed to the transformer.
    pub static ref MESSAGES_PROCESSED_TOTAL: IntCounter = register_int_counter!(
        "mqtt2prom_messages_processed_total",
        "Total messages processed by the exporter"
    ).unwrap();

    /// Messages dropped before transformation (no device id, bad payload).
    pub static ref MESSAGES_INVALID_TOTAL: IntCounter = register_int_counter!(
        "mqtt2prom_messages_invalid_total",
        "Total messages dropped before transformation"
    ).unwrap();

    /// Records produced by the transformer.
    pub static ref RECORDS_EMITTED_TOTAL: IntCounter = register_int_counter!(
        "mqtt2prom_records_emitted_total",
        "Total metric records produced by rules"
    ).unwrap();

    /// Transformation failures, labeled by rule (`source/output`).
    pub static ref TRANSFORM_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mqtt2prom_transform_errors_total",
        "Total transformation failures per rule",
        &["rule"]
    ).unwrap();

    /// Series currently exposed from the presentation cache.
    pub static ref CACHED_SERIES: IntGauge = register_int_gauge!(
        "mqtt2prom_cached_series",
        "Series currently held by the presentation cache"
    ).unwrap();

    // ============================================================
    // Replay
    // ============================================================

    /// Current replay position (message index).
    pub static ref REPLAY_POSITION: IntGauge = register_int_gauge!(
        "mqtt2prom_replay_position",
        "Current replay position (message index)"
    ).unwrap();

    /// Total messages in the replay file.
    pub static ref REPLAY_TOTAL_MESSAGES: IntGauge = register_int_gauge!(
        "mqtt2prom_replay_total_messages",
        "Total messages in the replay file"
    ).unwrap();

    /// Replay speed multiplier.
    pub static ref REPLAY_SPEED: Gauge = register_gauge!(
        "mqtt2prom_replay_speed",
        "Replay speed multiplier"
    ).unwrap();
}

/// Record the outcome of one message.
pub fn record_message(records: usize) {
    MESSAGES_PROCESSED_TOTAL.inc();
    RECORDS_EMITTED_TOTAL.inc_by(records as u64);
}

pub fn record_invalid_message() {
    MESSAGES_INVALID_TOTAL.inc();
}

pub fn record_transform_error(rule: &str) {
    TRANSFORM_ERRORS_TOTAL.with_label_values(&[rule]).inc();
}

/// Update replay position metrics.
pub fn update_replay_metrics(position: usize, total: usize, speed: f64) {
    REPLAY_POSITION.set(position as i64);
    REPLAY_TOTAL_MESSAGES.set(total as i64);
    REPLAY_SPEED.set(speed);
}

/// Encode self-metrics and `families` to Prometheus text format.
pub fn encode_metrics(families: Vec<MetricFamily>) -> prometheus::Result<String> {
    CACHED_SERIES.set(families.iter().map(|f| f.get_metric().len() as i64).sum());

    let encoder = TextEncoder::new();
    let mut metric_families = prometheus::gather();
    metric_families.extend(families);
    metric_families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_self_metrics() {
        record_message(3);
        record_transform_error("state/state");
        update_replay_metrics(2, 10, 4.0);

        let output = encode_metrics(Vec::new()).unwrap();
        assert!(output.contains("mqtt2prom_messages_processed_total"));
        assert!(output.contains("mqtt2prom_transform_errors_total{rule=\"state/state\"}"));
        assert!(output.contains("mqtt2prom_replay_speed 4"));
    }
}
