use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

/// Running `{count, sum, min, max}` for a single histogram series, per
/// spec.md §4.10.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramStats {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }
}

/// Counters and histograms keyed by `name|k=v|k2=v2` (labels sorted by
/// key so the same logical series always collapses to the same key
/// regardless of call-site label order).
pub struct TelemetryService {
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, HistogramStats>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut sorted = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut key = name.to_string();
    for (k, v) in sorted {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

impl TelemetryService {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = series_key(name, labels);
        let mut counters = self.counters.write().await;
        *counters.entry(key).or_insert(0) += 1;
    }

    pub async fn record_duration_ms(&self, name: &str, labels: &[(&str, &str)], value_ms: f64) {
        let key = series_key(name, labels);
        let mut histograms = self.histograms.write().await;
        histograms
            .entry(key)
            .and_modify(|stats| stats.record(value_ms))
            .or_insert_with(|| HistogramStats::new(value_ms));
    }

    pub async fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.counters.read().await.get(&key).copied().unwrap_or(0)
    }

    pub async fn histogram_snapshot(
        &self,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Option<HistogramStats> {
        let key = series_key(name, labels);
        self.histograms.read().await.get(&key).cloned()
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            counters: self.counters.read().await.clone(),
            histograms: self.histograms.read().await.clone(),
        }
    }
}

impl Default for TelemetryService {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for HistogramStats {
    fn clone(&self) -> Self {
        Self {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, HistogramStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_with_same_labels_in_different_order_collapse() {
        let telemetry = TelemetryService::new();
        telemetry
            .increment_counter("flex.planner.requests", &[("status", "ok"), ("run_id", "r1")])
            .await;
        telemetry
            .increment_counter("flex.planner.requests", &[("run_id", "r1"), ("status", "ok")])
            .await;
        let value = telemetry
            .counter_value("flex.planner.requests", &[("status", "ok"), ("run_id", "r1")])
            .await;
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn histogram_tracks_min_max_and_sum() {
        let telemetry = TelemetryService::new();
        telemetry
            .record_duration_ms("flex.node.duration_ms", &[("node_id", "n1")], 10.0)
            .await;
        telemetry
            .record_duration_ms("flex.node.duration_ms", &[("node_id", "n1")], 30.0)
            .await;
        let stats = telemetry
            .histogram_snapshot("flex.node.duration_ms", &[("node_id", "n1")])
            .await
            .unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum, 40.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
    }
}
