// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Regular expressions as configuration values.

use std::fmt;

use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A compiled regular expression that remembers its source text.
#[derive(Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { regex })
    }

    /// Compile a pattern known at build time.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regular expression.
    pub fn from_static(pattern: &'static str) -> Self {
        Self {
            regex: Regex::new(pattern).expect("static pattern must compile"),
        }
    }

    /// Source text of the pattern.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Unanchored match, like a selector.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Whether the pattern declares the named capture group.
    pub fn has_group(&self, group: &str) -> bool {
        self.regex.capture_names().flatten().any(|name| name == group)
    }

    /// Ensure a named capture group exists.
    pub fn require_group(&self, group: &'static str) -> Result<(), ConfigError> {
        if self.has_group(group) {
            Ok(())
        } else {
            Err(ConfigError::MissingRegexGroup {
                pattern: self.as_str().to_string(),
                group,
            })
        }
    }

    /// Value captured by a named group, if the text matches and the group participated.
    pub fn group_value<'t>(&self, text: &'t str, group: &str) -> Option<&'t str> {
        self.regex
            .captures(text)
            .and_then(|caps| caps.name(group))
            .map(|m| m.as_str())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(D::Error::custom)
    }
}
