// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Integration tests for state durability
//!
//! A "restart" is a fresh transformer over the same state directory.

use std::path::Path;

use mqtt2prom::{Config, Error, StateStore, Transformer};
use serde_json::json;
use tempfile::tempdir;

fn config_with_state(state_dir: &Path, rules: &str) -> Config {
    let yaml = format!(
        "cache:\n  state_directory: {}\nmetrics:\n  - metrics:\n{}",
        state_dir.display(),
        rules
    );
    let config = Config::from_yaml(&yaml).expect("valid configuration");
    config.ensure_state_directory().expect("state directory");
    config
}

const ENERGY: &str = "      - prom_name: energy_total\n        mqtt_name: energy\n        force_monotonicy: true\n";

#[test]
fn test_offset_survives_restart() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("state");

    {
        let config = config_with_state(&state_dir, ENERGY);
        let t = Transformer::from_config(&config);
        assert!(t.store().directory().is_some());

        for v in [10.0, 20.0, 15.0] {
            t.process("energy", "plug", &json!(v), "home/plug").unwrap();
        }
        t.flush_all().unwrap();
    }

    let config = config_with_state(&state_dir, ENERGY);
    let t = Transformer::from_config(&config);
    let records = t.process("energy", "plug", &json!(25.0), "home/plug").unwrap();
    assert_eq!(records[0].value, 45.0);

    // A reset after the restart still adds to the persisted offset
    let records = t.process("energy", "plug", &json!(5.0), "home/plug").unwrap();
    assert_eq!(records[0].value, 50.0);
}

#[test]
fn test_label_result_survives_restart() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let rules = "      - prom_name: status\n        dynamic_labels:\n          history: 'last_result == \"\" ? \"first\" : \"seen:\" + last_result'\n";

    {
        let t = Transformer::from_config(&config_with_state(&state_dir, rules));
        let records = t.process("status", "d", &json!(1.0), "t").unwrap();
        assert_eq!(records[0].labels["history"], "first");
        t.flush_all().unwrap();
    }

    let t = Transformer::from_config(&config_with_state(&state_dir, rules));
    let records = t.process("status", "d", &json!(1.0), "t").unwrap();
    assert_eq!(records[0].labels["history"], "seen:first");
}

#[test]
fn test_one_file_per_identity() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let t = Transformer::from_config(&config_with_state(&state_dir, ENERGY));

    t.process("energy", "plug-a", &json!(1.0), "home/plug-a").unwrap();
    t.process("energy", "plug-b", &json!(1.0), "home/plug-b").unwrap();
    t.flush_all().unwrap();

    let files = std::fs::read_dir(&state_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "json"))
        .count();
    assert_eq!(files, 2);
}

#[test]
fn test_corrupt_state_starts_empty() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let t = Transformer::from_config(&config_with_state(&state_dir, ENERGY));

    t.process("energy", "plug", &json!(50.0), "home/plug").unwrap();
    t.flush_all().unwrap();
    drop(t);

    for entry in std::fs::read_dir(&state_dir).unwrap() {
        std::fs::write(entry.unwrap().path(), b"garbage").unwrap();
    }

    let t = Transformer::from_config(&config_with_state(&state_dir, ENERGY));
    let records = t.process("energy", "plug", &json!(10.0), "home/plug").unwrap();
    assert_eq!(records[0].value, 10.0);
}

#[test]
fn test_flush_failure_is_reported() {
    let dir = tempdir().unwrap();
    let not_a_directory = dir.path().join("state");
    std::fs::write(&not_a_directory, b"file").unwrap();

    let yaml = "metrics:\n  - metrics:\n      - prom_name: doubled\n        expression: \"value * 2.0\"\n";
    let config = Config::from_yaml(yaml).unwrap();
    let t = Transformer::new(config.rules.clone(), StateStore::new(&not_a_directory));

    let records = t.process("doubled", "d", &json!(4.0), "t").unwrap();
    assert_eq!(records[0].value, 8.0);

    let err = t.flush_all().unwrap_err();
    assert!(matches!(err, Error::State(_)));
}
