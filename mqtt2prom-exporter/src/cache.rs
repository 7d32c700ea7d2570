// mqtt2prom Exporter - Presentation cache
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Last record per series, exposed until it expires.
//!
//! A series is a metric name plus its variable label values. Each new record
//! replaces the previous one for its series. Series that have not been
//! refreshed within the timeout are dropped at the next render. A zero
//! timeout keeps series forever.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use mqtt2prom::{MetricRecord, ValueKind};
use prometheus::proto::{
    Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType, Untyped,
};

type SeriesKey = (String, Vec<String>);

#[derive(Debug)]
struct Entry {
    record: MetricRecord,
    stored: Instant,
}

/// Exposed series, keyed by name and label values.
#[derive(Debug)]
pub struct PresentationCache {
    timeout: Duration,
    entries: Mutex<HashMap<SeriesKey, Entry>>,
}

impl PresentationCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the series of each record.
    pub fn store(&self, records: Vec<MetricRecord>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            let key = (
                record.name().to_string(),
                record.label_values().into_iter().map(str::to_string).collect(),
            );
            entries.insert(key, Entry { record, stored: now });
        }
    }

    /// Number of series held, expired ones included until the next render.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired series and render the rest as metric families, one
    /// family per name, sorted by name.
    pub fn families(&self) -> Vec<MetricFamily> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.timeout.is_zero() {
            entries.retain(|_, entry| now.duration_since(entry.stored) < self.timeout);
        }

        let mut by_name: BTreeMap<&str, Vec<&MetricRecord>> = BTreeMap::new();
        for entry in entries.values() {
            by_name
                .entry(entry.record.name())
                .or_default()
                .push(&entry.record);
        }

        by_name
            .into_iter()
            .map(|(name, mut records)| {
                records.sort_by(|a, b| a.label_values().cmp(&b.label_values()));
                family(name, &records)
            })
            .collect()
    }
}

fn family(name: &str, records: &[&MetricRecord]) -> MetricFamily {
    let first = records[0];
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help_text(first));
    family.set_field_type(match first.kind {
        ValueKind::Gauge => MetricType::GAUGE,
        ValueKind::Counter => MetricType::COUNTER,
        ValueKind::Untyped => MetricType::UNTYPED,
    });
    for record in records {
        family.mut_metric().push(metric(record, first.kind));
    }
    family
}

fn help_text(record: &MetricRecord) -> String {
    if record.description.help.is_empty() {
        format!("Metric {} derived from device messages", record.name())
    } else {
        record.description.help.clone()
    }
}

fn metric(record: &MetricRecord, kind: ValueKind) -> Metric {
    let mut labels: Vec<LabelPair> = record
        .description
        .constant_labels
        .iter()
        .chain(record.labels.iter())
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();
    labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut metric = Metric::default();
    metric.set_label(labels.into());
    match kind {
        ValueKind::Gauge => {
            let mut gauge = Gauge::default();
            gauge.set_value(record.value);
            metric.set_gauge(gauge);
        }
        ValueKind::Counter => {
            let mut counter = Counter::default();
            counter.set_value(record.value);
            metric.set_counter(counter);
        }
        ValueKind::Untyped => {
            let mut untyped = Untyped::default();
            untyped.set_value(record.value);
            metric.set_untyped(untyped);
        }
    }
    if let Some(ingest_time) = record.ingest_time {
        metric.set_timestamp_ms(ingest_time.timestamp_millis());
    }
    metric
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt2prom::{Description, SENSOR_LABEL, TOPIC_LABEL};

    fn record(name: &str, device: &str, value: f64, kind: ValueKind) -> MetricRecord {
        MetricRecord {
            description: Description {
                name: name.to_string(),
                help: String::new(),
                constant_labels: BTreeMap::from([("site".to_string(), "lab".to_string())]),
            },
            value,
            kind,
            ingest_time: None,
            label_names: vec![SENSOR_LABEL.to_string(), TOPIC_LABEL.to_string()],
            labels: BTreeMap::from([
                (SENSOR_LABEL.to_string(), device.to_string()),
                (TOPIC_LABEL.to_string(), format!("home/{}", device)),
            ]),
        }
    }

    #[test]
    fn test_latest_record_wins() {
        let cache = PresentationCache::new(Duration::from_secs(60));
        cache.store(vec![record("temperature", "a", 20.0, ValueKind::Gauge)]);
        cache.store(vec![record("temperature", "a", 21.0, ValueKind::Gauge)]);
        cache.store(vec![record("temperature", "b", 19.0, ValueKind::Gauge)]);

        assert_eq!(cache.len(), 2);
        let families = cache.families();
        assert_eq!(families.len(), 1);

        let metrics = families[0].get_metric();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].get_gauge().get_value(), 21.0);
        assert_eq!(metrics[1].get_gauge().get_value(), 19.0);
        assert_eq!(metrics[0].get_label()[0].get_name(), "sensor");
        assert_eq!(metrics[0].get_label()[1].get_name(), "site");
    }

    #[test]
    fn test_family_per_name_and_kind() {
        let cache = PresentationCache::new(Duration::ZERO);
        cache.store(vec![
            record("energy_total", "a", 5.0, ValueKind::Counter),
            record("state", "a", 1.0, ValueKind::Untyped),
        ]);

        let families = cache.families();
        assert_eq!(families[0].get_name(), "energy_total");
        assert_eq!(families[0].get_field_type(), MetricType::COUNTER);
        assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 5.0);
        assert_eq!(families[1].get_field_type(), MetricType::UNTYPED);
    }

    #[test]
    fn test_expired_series_dropped() {
        let cache = PresentationCache::new(Duration::from_millis(10));
        cache.store(vec![record("temperature", "a", 20.0, ValueKind::Gauge)]);
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.families().is_empty());
        assert!(cache.is_empty());
    }
}
