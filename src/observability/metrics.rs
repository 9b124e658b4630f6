//! Counter metrics around subscribe, publish and delivery boundaries
//!
//! The engine only ever increments labelled counters through [`MetricsSink`].
//! [`CounterMetrics`] keeps them in memory and can be snapshotted for the
//! `/metrics` endpoint; a process-wide instance is available via [`metrics`].

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SUBSCRIBE_SUCCESS: &str = "mqtt_subscribe_success";
pub const SUBSCRIBE_FAILURE: &str = "mqtt_subscribe_failure";
pub const PUBLISH_SUCCESS: &str = "mqtt_publish_success";
pub const PUBLISH_FAILURE: &str = "mqtt_publish_failure";
pub const MESSAGES_RECEIVED: &str = "mqtt_messages_received";
pub const MESSAGES_DROPPED: &str = "mqtt_messages_dropped";
pub const RESUBSCRIBE_FAILURE: &str = "mqtt_resubscribe_failure";

/// Sink for labelled counters
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);
}

/// Global metrics collector instance
pub static METRICS: Lazy<CounterMetrics> = Lazy::new(CounterMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static CounterMetrics {
    &METRICS
}

/// Discards every increment
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
}

/// In-memory counters keyed by name and sorted label set
#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter; labels may be given in any order
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.counters
            .lock()
            .map(|counters| counters.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set
    pub fn total(&self, name: &str) -> u64 {
        let Ok(counters) = self.counters.lock() else {
            return 0;
        };
        counters
            .iter()
            .filter(|(key, _)| series_name(key) == name)
            .map(|(_, value)| *value)
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default();
        MetricsSnapshot {
            timestamp: current_timestamp(),
            counters,
        }
    }

    pub fn reset(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.clear();
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = series_key(name, labels);
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(key).or_insert(0) += 1;
        }
    }
}

impl MetricsSink for &'static CounterMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        (**self).increment_counter(name, labels);
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub counters: BTreeMap<String, u64>,
}

/// `name{k1="v1",k2="v2"}` with labels sorted by key
fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted
        .iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

fn series_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
