// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Integration tests for the metric pipeline
//!
//! Every test starts from a YAML document, the way the exporter does.

use std::time::Duration;

use approx::assert_relative_eq;
use mqtt2prom::{Config, ConfigError, Error, StateStore, Transformer, ValueKind};
use serde_json::json;

fn transformer(yaml: &str) -> Transformer {
    let config = Config::from_yaml(yaml).expect("valid configuration");
    Transformer::new(config.rules, StateStore::in_memory())
}

// ============================================================================
// Configuration resolution
// ============================================================================

#[test]
fn test_merge_precedence() {
    let yaml = r#"
metrics:
  - shared:
      type: counter
      help: shared help
      mqtt_value_scale: 10.0
    metrics:
      - prom_name: a
        help: own help
      - prom_name: b
        mqtt_value_scale: 0.0
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let a = &config.rules[0];
    let b = &config.rules[1];

    assert_eq!(a.help, "own help");
    assert_eq!(a.kind, ValueKind::Counter);
    assert_eq!(a.scale, 10.0);
    assert_eq!(a.topic_filter.as_ref().map(|p| p.as_str()), Some(".*"));

    // A zero value is "unset" and never overrides the parent
    assert_eq!(b.help, "shared help");
    assert_eq!(b.scale, 10.0);
}

#[test]
fn test_mutual_exclusivity_rejected() {
    let yaml = r#"
metrics:
  - shared:
      expression: "value * 2.0"
    metrics:
      - prom_name: doubled
        raw_expression: "float(raw_value)"
"#;
    let err = Config::from_yaml(yaml).unwrap_err();
    match err {
        ConfigError::ConflictingExpressions { rule } => assert_eq!(rule, "doubled/doubled"),
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Value derivation
// ============================================================================

#[test]
fn test_plain_numeric_is_noop() {
    let t = transformer("metrics:\n  - metrics:\n      - prom_name: temperature\n");

    let records = t
        .process("temperature", "dht22", &json!(21.5), "v1/devices/me/dht22")
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, 21.5);
    assert_eq!(records[0].label_values(), vec!["dht22", "v1/devices/me/dht22"]);
    assert!(t.store().is_empty());
}

#[test]
fn test_no_matching_rule() {
    let t = transformer("metrics:\n  - metrics:\n      - prom_name: temperature\n");
    let records = t.process("pressure", "dev1", &json!(1013.0), "t").unwrap();
    assert!(records.is_empty());
}

#[test]
fn test_topic_filter() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: temperature
        topic_path_filter: "^home/"
"#;
    let t = transformer(yaml);
    assert_eq!(t.process("temperature", "d", &json!(1.0), "home/d").unwrap().len(), 1);
    assert!(t.process("temperature", "d", &json!(1.0), "office/d").unwrap().is_empty());
}

#[test]
fn test_string_mapping() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: state
        string_value_mapping:
          map:
            RUNNING: 1.0
            STOPPED: 0.0
"#;
    let t = transformer(yaml);
    let records = t.process("state", "pump", &json!("RUNNING"), "t").unwrap();
    assert_eq!(records[0].value, 1.0);

    let err = t.process("state", "pump", &json!("UNKNOWN"), "t").unwrap_err();
    match err {
        Error::Transform { rule, .. } => assert_eq!(rule, "state/state"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_string_mapping_with_error_value() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: state
        error_value: -1.0
        string_value_mapping:
          map:
            RUNNING: 1.0
"#;
    let t = transformer(yaml);
    let records = t.process("state", "pump", &json!("UNKNOWN"), "t").unwrap();
    assert_eq!(records[0].value, -1.0);
}

#[test]
fn test_raw_expression() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: first_reading
        mqtt_name: readings
        raw_expression: "float(raw_value[0])"
"#;
    let t = transformer(yaml);
    let records = t
        .process("readings", "dev1", &json!([1.0, 2.0, 3.0]), "t")
        .unwrap();
    assert_eq!(records[0].value, 1.0);
    assert_eq!(records[0].name(), "first_reading");
}

#[test]
fn test_fan_out() {
    let yaml = r#"
metrics:
  - shared:
      mqtt_name: temperature
    metrics:
      - prom_name: temperature_c
      - prom_name: temperature_f
        expression: "value * 1.8 + 32.0"
      - prom_name: temperature_living
        sensor_name_filter: "^living-"
"#;
    let t = transformer(yaml);
    let records = t.process("temperature", "kitchen-1", &json!(100.0), "t").unwrap();

    let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["temperature_c", "temperature_f"]);
    assert_relative_eq!(records[1].value, 212.0);
}

#[test]
fn test_monotonic_counter() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: energy_total
        mqtt_name: energy
        type: counter
        force_monotonicy: true
"#;
    let t = transformer(yaml);

    let outputs: Vec<f64> = [10.0, 20.0, 15.0, 25.0]
        .iter()
        .map(|v| t.process("energy", "plug", &json!(v), "t").unwrap()[0].value)
        .collect();
    assert_eq!(outputs, vec![10.0, 20.0, 35.0, 45.0]);
}

#[test]
fn test_compile_error_not_masked() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: broken
        error_value: 0.0
        expression: "value +* 2"
"#;
    let t = transformer(yaml);
    let err = t.process("broken", "d", &json!(1.0), "t").unwrap_err();
    match err {
        Error::Transform { source, .. } => assert!(source.is_compile()),
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Dynamic labels
// ============================================================================

#[test]
fn test_label_elapsed_increases() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: heartbeat
        dynamic_labels:
          since_last: "float(elapsed)"
"#;
    let t = transformer(yaml);

    let first = t.process("heartbeat", "d", &json!(1.0), "t").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let second = t.process("heartbeat", "d", &json!(1.0), "t").unwrap();

    let elapsed = |records: &[mqtt2prom::MetricRecord]| -> f64 {
        records[0].labels["since_last"].parse().unwrap()
    };
    assert_eq!(elapsed(&first), 0.0);
    assert!(elapsed(&second) >= 20_000_000.0);
}

#[test]
fn test_label_last_result() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: status
        dynamic_labels:
          history: 'last_result == "" ? "first" : "seen:" + last_result'
"#;
    let t = transformer(yaml);

    let first = t.process("status", "d", &json!(1.0), "t").unwrap();
    let second = t.process("status", "d", &json!(2.0), "t").unwrap();

    assert_eq!(first[0].labels["history"], "first");
    assert_eq!(second[0].labels["history"], "seen:first");
}

#[test]
fn test_label_order() {
    let yaml = r#"
metrics:
  - metrics:
      - prom_name: reading
        dynamic_labels:
          zone: '"north"'
          kind: '"air"'
"#;
    let t = transformer(yaml);
    let records = t.process("reading", "d", &json!(1.0), "home/d").unwrap();

    assert_eq!(records[0].label_names, vec!["sensor", "topic", "kind", "zone"]);
    assert_eq!(records[0].label_values(), vec!["d", "home/d", "air", "north"]);
}
