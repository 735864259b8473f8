//! Metrics sink consumed by the relay.
//!
//! Exporting is someone else's job; the relay only needs somewhere to record
//! counters, gauges and histograms with label sets. [`InMemoryMetrics`] is the
//! default sink and doubles as the snapshot source for stats endpoints.

use dashmap::DashMap;
use std::collections::BTreeMap;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: Labels<'_>, value: u64);
    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: i64);
    fn add_gauge(&self, name: &str, labels: Labels<'_>, delta: i64);
    fn observe_histogram(&self, name: &str, labels: Labels<'_>, value: f64);
}

/// Summary of a histogram's observations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, i64>,
    histograms: DashMap<String, HistogramSummary>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters.get(&series_key(name, labels)).map(|v| *v).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> i64 {
        self.gauges.get(&series_key(name, labels)).map(|v| *v).unwrap_or(0)
    }

    pub fn histogram(&self, name: &str, labels: Labels<'_>) -> HistogramSummary {
        self.histograms
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            gauges: self.gauges.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            histograms: self.histograms.iter().map(|e| (e.key().clone(), *e.value())).collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>, value: u64) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: i64) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn add_gauge(&self, name: &str, labels: Labels<'_>, delta: i64) {
        *self.gauges.entry(series_key(name, labels)).or_insert(0) += delta;
    }

    fn observe_histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut entry = self.histograms.entry(series_key(name, labels)).or_default();
        if entry.count == 0 {
            entry.min = value;
            entry.max = value;
        } else {
            entry.min = entry.min.min(value);
            entry.max = entry.max.max(value);
        }
        entry.count += 1;
        entry.sum += value;
    }
}

/// `name{a="1",b="2"}` with labels sorted so label order never splits a series.
fn series_key(name: &str, labels: Labels<'_>) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_does_not_split_series() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_counter("messages", &[("protocol", "tcp"), ("route", "echo")], 1);
        metrics.increment_counter("messages", &[("route", "echo"), ("protocol", "tcp")], 2);

        assert_eq!(metrics.counter("messages", &[("protocol", "tcp"), ("route", "echo")]), 3);
        assert_eq!(metrics.counter("messages", &[]), 0);
    }

    #[test]
    fn test_gauges_and_histograms() {
        let metrics = InMemoryMetrics::new();
        metrics.add_gauge("active_connections", &[], 2);
        metrics.add_gauge("active_connections", &[], -1);
        assert_eq!(metrics.gauge("active_connections", &[]), 1);

        metrics.observe_histogram("latency_ms", &[], 4.0);
        metrics.observe_histogram("latency_ms", &[], 2.0);
        let summary = metrics.histogram("latency_ms", &[]);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.mean(), 3.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gauges["active_connections"], 1);
    }
}
