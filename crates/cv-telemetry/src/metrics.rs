use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names recorded by covey components.
pub mod names {
    pub const ENVELOPES_RECEIVED: &str = "covey_envelopes_received_total";
    pub const ENVELOPES_DROPPED: &str = "covey_envelopes_dropped_total";
    pub const DEDUP_HITS: &str = "covey_dedup_hits_total";
    pub const TASKS_EXECUTED: &str = "covey_tasks_executed_total";
    pub const HEARTBEATS_SENT: &str = "covey_heartbeats_sent_total";
    pub const DELIVERIES: &str = "covey_deliveries_total";
    pub const ROSTER_SIZE: &str = "covey_roster_size";
    pub const TASK_DURATION: &str = "covey_task_duration_seconds";
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        // Per-bucket counts; export accumulates them.
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Task durations range from sub-second cache hits to multi-minute runs.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// `{key="value",key2="value2"}`, or empty when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-wide counters, gauges and histograms.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = write(&self.counters);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into `name`, creating it with duration buckets on first use.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, sorted by metric name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut entries = grouped[name].clone();
                entries.sort_by_key(|(labels, _)| labels.prometheus_str());
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, val));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name, boundary, cumulative
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.count()));
                out.push_str(&format!("{}_sum {}\n", name, h.sum()));
                out.push_str(&format!("{}_count {}\n", name, h.count()));
            }
        }

        out
    }

    /// Counters and gauges as a JSON object, for status output.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            let key = format!("{}{}", name, labels.prometheus_str());
            counters.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
        }
        let mut gauges = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }
        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative_in_export() {
        let m = MetricsCollector::new();
        m.record_histogram("latency", 0.07);
        m.record_histogram("latency", 4.0);
        let text = m.export_prometheus();
        assert!(text.contains("latency_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("latency_bucket{le=\"5\"} 2"));
        assert!(text.contains("latency_count 2"));
    }

    #[test]
    fn labels_sort_by_key() {
        let l = Labels::new(&[("z", "1"), ("a", "2")]);
        assert_eq!(l.prometheus_str(), "{a=\"2\",z=\"1\"}");
    }
}
