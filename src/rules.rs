// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Rule lookup by inbound metric name and device.

use std::collections::HashMap;

use crate::resolver::Rule;

/// Immutable index over resolved rules.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    rules: Vec<Rule>,
    by_source: HashMap<String, Vec<usize>>,
}

impl RuleIndex {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, rule) in rules.iter().enumerate() {
            by_source
                .entry(rule.source_name.clone())
                .or_default()
                .push(position);
        }
        Self { rules, by_source }
    }

    /// Every rule listening to `source_name` whose device selector accepts
    /// `device`, in configured order.
    pub fn lookup(&self, source_name: &str, device: &str) -> Vec<&Rule> {
        self.by_source
            .get(source_name)
            .into_iter()
            .flatten()
            .map(|&position| &self.rules[position])
            .filter(|rule| rule.matches_device(device))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Distinct inbound names, sorted.
    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_source.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
