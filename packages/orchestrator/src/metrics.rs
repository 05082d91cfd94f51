//! In-process metrics counters and histograms.
//!
//! Keys are `name` or `name{k1=v1,k2=v2}` with label pairs sorted. The same
//! serialisation feeds both the Prometheus text exposition (`langorch_*`
//! families) and the optional Pushgateway push loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Summary statistics for one histogram series.
#[derive(Debug, Clone, Default)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

fn build_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let sorted: BTreeMap<&str, &str> = labels.iter().copied().collect();
    let label_str = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{label_str}}}")
}

/// Split an internal key into (base name, Prometheus label block with
/// quoted values). Empty label block when there are no labels.
fn parse_metric_key(key: &str) -> (String, String) {
    let Some(brace) = key.find('{') else {
        return (key.to_string(), String::new());
    };
    let base = key[..brace].to_string();
    let raw = key[brace + 1..].trim_end_matches('}');
    let parts: Vec<String> = raw
        .split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some(format!("{}=\"{}\"", k.trim(), v.trim()))
        })
        .collect();
    if parts.is_empty() {
        (base, String::new())
    } else {
        (base, format!("{{{}}}", parts.join(",")))
    }
}

/// Merge a quantile pair into an existing label block.
fn append_quantile_label(label_str: &str, quantile: &str) -> String {
    let pair = format!("quantile=\"{quantile}\"");
    if label_str.is_empty() {
        format!("{{{pair}}}")
    } else {
        format!("{},{}}}", &label_str[..label_str.len() - 1], pair)
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_by(name, 1, labels);
    }

    pub fn increment_by(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = build_key(name, labels);
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(key).or_insert(0) += value;
    }

    pub fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = build_key(name, labels);
        let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms.entry(key).or_default().push(value);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = build_key(name, labels);
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(&key).copied().unwrap_or(0)
    }

    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> HistogramStats {
        let key = build_key(name, labels);
        let histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        let values = histograms.get(&key).cloned().unwrap_or_default();
        Self::stats_of(&values)
    }

    fn stats_of(values: &[f64]) -> HistogramStats {
        if values.is_empty() {
            return HistogramStats::default();
        }
        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let p50_idx = ((n as f64 * 0.50) as usize).saturating_sub(1);
        let p95_idx = ((n as f64 * 0.95) as usize).saturating_sub(1);
        HistogramStats {
            count: n,
            sum,
            min: sorted[0],
            max: sorted[n - 1],
            avg: sum / n as f64,
            p50: sorted[p50_idx],
            p95: sorted[p95_idx],
        }
    }

    pub fn reset(&self) {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.histograms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ── Domain recorders ──────────────────────────────────────

    pub fn record_run_started(&self) {
        self.increment("run_started_total", &[]);
    }

    pub fn record_run_completed(&self, duration_seconds: f64, status: &str) {
        self.increment("run_completed_total", &[("status", status)]);
        self.observe(
            "run_duration_seconds",
            duration_seconds,
            &[("status", status)],
        );
        if status == "failed" {
            self.increment("run_failures_total", &[]);
        }
    }

    pub fn record_step_execution(&self, node_id: &str, status: &str) {
        self.increment(
            "step_execution_total",
            &[("node_id", node_id), ("status", status)],
        );
    }

    pub fn record_retry_attempt(&self, node_id: &str, step_id: &str) {
        self.increment(
            "retry_attempts_total",
            &[("node_id", node_id), ("step_id", step_id)],
        );
    }

    pub fn record_step_timeout(&self, node_id: &str, step_id: &str, timeout_ms: i64) {
        self.increment(
            "step_timeout_total",
            &[("node_id", node_id), ("step_id", step_id)],
        );
        tracing::warn!(node_id, step_id, timeout_ms, "step timeout");
    }

    // ── Prometheus exposition ─────────────────────────────────

    /// Render all metrics as Prometheus text. One `# TYPE` line per family;
    /// histograms are rendered as summaries with p50/p95/max quantiles.
    pub fn to_prometheus_text(&self) -> String {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut lines: Vec<String> = Vec::new();

        let mut counter_families: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for (key, value) in &counters {
            let (base, label_str) = parse_metric_key(key);
            counter_families
                .entry(format!("langorch_{base}"))
                .or_default()
                .push((label_str, *value));
        }
        for (family, mut entries) in counter_families {
            entries.sort();
            lines.push(format!("# TYPE {family} counter"));
            for (label_str, value) in entries {
                lines.push(format!("{family}{label_str} {value}"));
            }
        }

        let mut histogram_families: BTreeMap<String, Vec<(String, HistogramStats)>> =
            BTreeMap::new();
        for (key, values) in &histograms {
            let (base, label_str) = parse_metric_key(key);
            histogram_families
                .entry(format!("langorch_{base}"))
                .or_default()
                .push((label_str, Self::stats_of(values)));
        }
        for (family, mut entries) in histogram_families {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            lines.push(format!("# TYPE {family} summary"));
            for (label_str, stats) in entries {
                lines.push(format!("{family}_count{label_str} {}", stats.count));
                lines.push(format!("{family}_sum{label_str} {:.6}", stats.sum));
                lines.push(format!("{family}_avg{label_str} {:.6}", stats.avg));
                if stats.count > 0 {
                    let q50 = append_quantile_label(&label_str, "0.5");
                    lines.push(format!("{family}{q50} {:.6}", stats.p50));
                    let q95 = append_quantile_label(&label_str, "0.95");
                    lines.push(format!("{family}{q95} {:.6}", stats.p95));
                    let q100 = append_quantile_label(&label_str, "1.0");
                    lines.push(format!("{family}{q100} {:.6}", stats.max));
                }
            }
        }

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_with_labels() {
        let metrics = MetricsCollector::new();
        metrics.record_step_execution("n1", "completed");
        metrics.record_step_execution("n1", "completed");
        metrics.record_step_execution("n1", "failed");
        assert_eq!(
            metrics.counter(
                "step_execution_total",
                &[("node_id", "n1"), ("status", "completed")]
            ),
            2
        );
        assert_eq!(
            metrics.counter(
                "step_execution_total",
                &[("node_id", "n1"), ("status", "failed")]
            ),
            1
        );
    }

    #[test]
    fn label_order_does_not_matter() {
        let metrics = MetricsCollector::new();
        metrics.increment("x_total", &[("b", "2"), ("a", "1")]);
        assert_eq!(metrics.counter("x_total", &[("a", "1"), ("b", "2")]), 1);
    }

    #[test]
    fn histogram_stats_compute_quantiles() {
        let metrics = MetricsCollector::new();
        for i in 1..=100 {
            metrics.observe("run_duration_seconds", i as f64, &[("status", "completed")]);
        }
        let stats = metrics.histogram_stats("run_duration_seconds", &[("status", "completed")]);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.p95, 95.0);
    }

    #[test]
    fn prometheus_text_has_one_type_line_per_family() {
        let metrics = MetricsCollector::new();
        metrics.record_run_completed(1.5, "completed");
        metrics.record_run_completed(2.5, "failed");
        let text = metrics.to_prometheus_text();
        let type_lines = text
            .lines()
            .filter(|l| l.starts_with("# TYPE langorch_run_completed_total"))
            .count();
        assert_eq!(type_lines, 1);
        assert!(text.contains("langorch_run_completed_total{status=\"completed\"} 1"));
        assert!(text.contains("langorch_run_duration_seconds_count{status=\"failed\"} 1"));
        assert!(text.contains("quantile=\"0.95\""));
    }

    #[test]
    fn empty_histogram_has_zero_stats() {
        let metrics = MetricsCollector::new();
        let stats = metrics.histogram_stats("missing", &[]);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.sum, 0.0);
    }
}
