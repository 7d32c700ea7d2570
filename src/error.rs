// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for mqtt2prom
//!
//! Configuration errors are fatal at startup. Transform errors are scoped to a
//! single message and a single rule. State errors never abort a pipeline run;
//! they are logged by the state store and surfaced only from explicit flushes.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for mqtt2prom operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mqtt2prom operations
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration document could not be loaded or resolved
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A rule failed to turn a raw value into a metric
    #[error("Metric {rule}: {source}")]
    Transform {
        /// Rule identity (`source/output`)
        rule: String,
        /// Root cause
        #[source]
        source: TransformError,
    },

    /// Persisting state failed
    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Errors raised while loading, validating or resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file unreadable
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed document or unknown field
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A regular expression did not compile
    #[error("Invalid regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    /// A regular expression lacks a named group the caller depends on
    #[error("Regex {pattern:?} does not contain required group {group:?}")]
    MissingRegexGroup { pattern: String, group: &'static str },

    /// `expression` and `raw_expression` set on the same rule
    #[error("Metric {rule}: expression and raw_expression are mutually exclusive")]
    ConflictingExpressions { rule: String },

    /// Legacy and current fallback values set on the same rule
    #[error(
        "Metric {rule}: cannot set both string_value_mapping.error_value and error_value \
         (string_value_mapping.error_value is deprecated)"
    )]
    ConflictingErrorValues { rule: String },

    /// A label name is defined twice on one rule
    #[error("Metric {rule}: label {label:?} is defined more than once")]
    DuplicateLabel { rule: String, label: String },

    /// Unparsable duration literal
    #[error("Invalid duration {literal:?}: {reason}")]
    InvalidDuration { literal: String, reason: String },

    /// State directory could not be created
    #[error("Failed to create state directory {path:?}: {source}")]
    StateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors raised by the expression environment
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// The expression source did not compile
    #[error("Failed to compile expression {expression:?}: {reason}")]
    Compile { expression: String, reason: String },

    /// The program failed at runtime
    #[error("Failed to evaluate expression {expression:?}: {reason}")]
    Evaluate { expression: String, reason: String },

    /// A value expression produced something other than a number
    #[error("Expression {expression:?} returned {found}, expected a number")]
    NotNumeric { expression: String, found: String },
}

/// Errors raised while deriving a metric value from a raw value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// String input without a mapping entry
    #[error("Got unexpected string data {0:?}")]
    UnmappedString(String),

    /// String input that is not a float
    #[error("Got string data {0:?} that does not parse as a float")]
    UnparsableString(String),

    /// Input type with no coercion rule
    #[error("Got data with unexpected type {kind} ({value})")]
    UnsupportedType { kind: &'static str, value: String },

    /// Expression compile or runtime failure
    #[error(transparent)]
    Expression(#[from] ExprError),
}

impl TransformError {
    /// Compile failures are never masked by a rule's fallback value.
    pub fn is_compile(&self) -> bool {
        matches!(self, Self::Expression(ExprError::Compile { .. }))
    }
}

/// Errors raised while reading or writing durable state
#[derive(Error, Debug)]
pub enum StateError {
    /// File I/O failed
    #[error("Failed to access state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// File content is not a valid snapshot
    #[error("Corrupt state file {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Snapshot could not be serialized
    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Transform {
            rule: "temperature/room_temp".to_string(),
            source: TransformError::UnmappedString("UNKNOWN".to_string()),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("temperature/room_temp"));
        assert!(msg.contains("UNKNOWN"));
    }

    #[test]
    fn test_error_conversion() {
        let config_err = ConfigError::ConflictingExpressions {
            rule: "a/b".to_string(),
        };
        let err: Error = config_err.into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_compile_errors_are_flagged() {
        let compile: TransformError = ExprError::Compile {
            expression: "(".to_string(),
            reason: "unexpected end".to_string(),
        }
        .into();
        assert!(compile.is_compile());

        let runtime: TransformError = ExprError::Evaluate {
            expression: "x".to_string(),
            reason: "undeclared".to_string(),
        }
        .into();
        assert!(!runtime.is_compile());
        assert!(!TransformError::UnparsableString("abc".to_string()).is_compile());
    }
}
