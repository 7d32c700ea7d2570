// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Duration literals in configuration files (`90s`, `2m`, `1h 30m`, `500ms`).
//!
//! Text goes through `humantime`; a bare integer, quoted or not, is seconds.

use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Parse a duration literal. A bare integer is taken as seconds.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text).map_err(|e| ConfigError::InvalidDuration {
        literal: text.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Literal {
    Seconds(u64),
    Text(String),
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Literal::deserialize(deserializer)? {
        Literal::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Literal::Text(text) => parse_duration(&text).map_err(D::Error::custom),
    }
}
