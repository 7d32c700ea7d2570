//! # mqtt2prom - Telemetry to Prometheus metric transformation
//!
//! Turns values published by devices on a message bus into Prometheus
//! metric records, following declarative per-metric rules.
//!
//! ## Key Features
//!
//! - **Layered configuration**: shared block values and global defaults fill unset rule fields
//! - **Fan-out**: several rules may listen to the same inbound metric
//! - **Expressions**: CEL programs derive values and labels from raw payloads
//! - **Monotonic counters**: source resets are absorbed into a persistent offset
//! - **Durable state**: per-identity snapshots survive restarts
//!
//! ## Quick Start
//!
//! ```rust
//! use mqtt2prom::{Config, StateStore, Transformer};
//! use serde_json::json;
//!
//! let config = Config::from_yaml(
//!     r#"
//! metrics:
//!   - shared:
//!       type: gauge
//!     metrics:
//!       - prom_name: temperature_f
//!         mqtt_name: temperature
//!         expression: "value * 1.8 + 32.0"
//! "#,
//! )
//! .unwrap();
//!
//! let transformer = Transformer::new(config.rules, StateStore::in_memory());
//! let records = transformer
//!     .process("temperature", "dht22", &json!(20.0), "v1/devices/me/dht22")
//!     .unwrap();
//!
//! assert_eq!(records.len(), 1);
//! assert!((records[0].value - 68.0).abs() < 1e-9);
//! assert_eq!(records[0].labels["sensor"], "dht22");
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration document loading and defaults
//! - [`resolver`]: Rule fragment inheritance and validation
//! - [`rules`]: Rule lookup by inbound name and device
//! - [`expr`]: Expression environment
//! - [`state`]: Persistent per-identity state
//! - [`transform`]: The metric pipeline
//! - [`record`]: Output records

// Modules
pub mod config;
pub mod error;
pub mod expr;
pub mod record;
pub mod resolver;
pub mod rules;
pub mod state;
pub mod transform;

// Re-exports for convenient access
pub use config::{CacheConfig, Config, ConfigDocument, JsonParsingConfig, MqttConfig, Pattern};
pub use error::{ConfigError, Error, ExprError, Result, StateError, TransformError};
pub use expr::{Env, Expression, LastResult};
pub use record::{Description, MetricRecord, ValueKind, SENSOR_LABEL, TOPIC_LABEL};
pub use resolver::{resolve, BlockConfig, Resolution, Rule, RuleFragment, StringValueMapping};
pub use rules::RuleIndex;
pub use state::{DurableState, RuleState, StateStore};
pub use transform::Transformer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_basic_pipeline() {
        let config = Config::from_yaml(
            "metrics:\n  - metrics:\n      - prom_name: humidity\n        help: Relative humidity\n",
        )
        .unwrap();
        let transformer = Transformer::new(config.rules, StateStore::in_memory());

        let records = transformer
            .process("humidity", "dev1", &json!(55.0), "home/dev1")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 55.0);
        assert_eq!(records[0].description.help, "Relative humidity");
        assert_eq!(records[0].kind, ValueKind::Untyped);
    }
}
