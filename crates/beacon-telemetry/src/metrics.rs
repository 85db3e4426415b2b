use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Monotonic counter.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can move both ways. The quantities this core gauges (sessions,
/// connections, queue depth) are integral, so no float bit tricks.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram keeping raw observations for percentile computation. Bounded by
/// the observation rate of this core (delivery latencies), not message volume.
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }
    fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        HistogramSummary {
            count: count as u64,
            sum,
            mean: sum / count as f64,
            p50: obs[count / 2],
            p95: obs[((count as f64 * 0.95) as usize).min(count - 1)],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Thread-safe metrics recorder. Purely in-memory by default; construct with
/// [`MetricsRecorder::with_snapshots`] to persist periodic snapshots to
/// SQLite for external monitoring.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
    snapshots: Option<Mutex<Connection>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            snapshots: None,
        }
    }

    pub fn with_snapshots(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metric_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_snapshots_name ON metric_snapshots(name, timestamp);",
        )?;
        let mut recorder = Self::new();
        recorder.snapshots = Some(Mutex::new(conn));
        Ok(recorder)
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(&key) {
                c.increment(n);
                return;
            }
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        {
            let gauges = self.gauges.read();
            if let Some(g) = gauges.get(&key) {
                g.set(value);
                return;
            }
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        {
            let gauges = self.gauges.read();
            if let Some(g) = gauges.get(&key) {
                g.add(delta);
                return;
            }
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .add(delta);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0, Gauge::get)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        {
            let histograms = self.histograms.read();
            if let Some(h) = histograms.get(&key) {
                h.observe(value);
                return;
            }
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Persist the current value of every metric. Returns the number of rows
    /// written; 0 when the recorder was built without a snapshot database.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.snapshots else {
            return Ok(0);
        };
        let now = Utc::now().to_rfc3339();
        let db = db.lock();
        let mut count = 0;

        for (key, counter) in self.counters.read().iter() {
            db.execute(
                "INSERT INTO metric_snapshots (timestamp, name, value, labels) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![now, key.name, counter.get() as f64, key.labels_json()],
            )?;
            count += 1;
        }
        for (key, gauge) in self.gauges.read().iter() {
            db.execute(
                "INSERT INTO metric_snapshots (timestamp, name, value, labels) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![now, key.name, gauge.get() as f64, key.labels_json()],
            )?;
            count += 1;
        }
        for (key, histogram) in self.histograms.read().iter() {
            db.execute(
                "INSERT INTO metric_snapshots (timestamp, name, value, labels) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![now, key.name, histogram.summary().mean, key.labels_json()],
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Drop persisted snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.snapshots else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        db.lock().execute(
            "DELETE FROM metric_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("beacon-test-metrics-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("metrics.db")
    }

    #[test]
    fn counters_accumulate_per_label_set() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("broker.messages.sent", &[("kind", "task")], 1);
        recorder.counter_inc("broker.messages.sent", &[("kind", "task")], 1);
        recorder.counter_inc("broker.messages.sent", &[("kind", "chat")], 1);

        assert_eq!(recorder.counter_get("broker.messages.sent", &[("kind", "task")]), 2);
        assert_eq!(recorder.counter_get("broker.messages.sent", &[("kind", "chat")]), 1);
        assert_eq!(recorder.counter_get("broker.messages.sent", &[("kind", "other")]), 0);
    }

    #[test]
    fn gauges_move_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("sessions.active", &[], 10);
        recorder.gauge_add("sessions.active", &[], 5);
        recorder.gauge_add("sessions.active", &[], -3);
        assert_eq!(recorder.gauge_get("sessions.active", &[]), 12);
    }

    #[test]
    fn histogram_summary_statistics() {
        let recorder = MetricsRecorder::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            recorder.histogram_observe("broker.delivery.latency_ms", &[], v);
        }
        let summary = recorder.histogram_summary("broker.delivery.latency_ms", &[]);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.sum, 150.0);
        assert_eq!(summary.mean, 30.0);
        assert!(summary.p50 >= 30.0);
        assert!(summary.p95 >= 50.0);
    }

    #[test]
    fn empty_histogram_summary() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.histogram_summary("missing", &[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean, 0.0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("m", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("m", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("m", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_without_db_is_noop() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("m", &[], 1);
        assert_eq!(recorder.snapshot().unwrap(), 0);
        assert_eq!(recorder.prune(0).unwrap(), 0);
    }

    #[test]
    fn snapshot_persists_and_prunes() {
        let recorder = MetricsRecorder::with_snapshots(&temp_db()).unwrap();
        recorder.counter_inc("broker.messages.sent", &[], 42);
        recorder.gauge_set("sessions.active", &[], 3);
        recorder.histogram_observe("broker.delivery.latency_ms", &[], 12.5);

        assert_eq!(recorder.snapshot().unwrap(), 3);
        assert_eq!(recorder.prune(0).unwrap(), 3);
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent", &[]), 8_000);
    }
}
