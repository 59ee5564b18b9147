// SPDX-License-Identifier: Apache-2.0

//! Owned store of named counters and gauges.
//!
//! Programs, the dispatcher and the tailer mutate entries concurrently through
//! typed handles; the export surface reads them at any time via [`MetricStore::snapshot`].
//! Each mutation is atomic for its own entry. There is no cross-entry transaction.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Total lines dispatched across all streams.
pub const LINE_COUNT: &str = "line_count";
/// Runtime faults raised by programs (errors and panics).
pub const PROGRAM_RUNTIME_ERRORS: &str = "program_runtime_errors";
/// Failed program loads (read or compile errors).
pub const PROGRAM_LOAD_ERRORS: &str = "program_load_errors";
/// Rotations or truncations handled by log streams.
pub const LOG_ROTATIONS: &str = "log_rotations";
/// Read failures on open log handles.
pub const LOG_READ_ERRORS: &str = "log_read_errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic non-decreasing integer
    Counter,
    /// Arbitrary floating point value
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric {name:?} is a {existing}, not a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
}

/// A single entry. Counters store a `u64`, gauges store the bits of an `f64`.
#[derive(Debug)]
struct Metric {
    kind: MetricKind,
    bits: AtomicU64,
}

impl Metric {
    fn new(kind: MetricKind) -> Self {
        let bits = match kind {
            MetricKind::Counter => 0,
            MetricKind::Gauge => 0f64.to_bits(),
        };
        Self {
            kind,
            bits: AtomicU64::new(bits),
        }
    }

    fn value(&self) -> MetricValue {
        let bits = self.bits.load(Ordering::Relaxed);
        match self.kind {
            MetricKind::Counter => MetricValue::Counter(bits),
            MetricKind::Gauge => MetricValue::Gauge(f64::from_bits(bits)),
        }
    }
}

/// Handle to a counter entry.
#[derive(Debug, Clone)]
pub struct Counter {
    metric: Arc<Metric>,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add `n`, saturating at `u64::MAX` so the value never goes down.
    pub fn add(&self, n: u64) {
        let _ = self
            .metric
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(n))
            });
    }

    /// Add `n` unless that would overflow. Returns the new value, or `None`
    /// with the counter left unchanged.
    pub fn checked_add(&self, n: u64) -> Option<u64> {
        self.metric
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(n))
            .ok()
            .map(|prev| prev + n)
    }

    pub fn get(&self) -> u64 {
        self.metric.bits.load(Ordering::Relaxed)
    }
}

/// Handle to a gauge entry.
#[derive(Debug, Clone)]
pub struct Gauge {
    metric: Arc<Metric>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.metric.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, delta: f64) {
        let _ = self
            .metric
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.metric.bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(v) => write!(f, "{}", v),
            MetricValue::Gauge(v) => write!(f, "{}", v),
        }
    }
}

/// Point-in-time view of one entry, as handed to the export surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub value: MetricValue,
}

#[derive(Debug, Default)]
pub struct MetricStore {
    metrics: RwLock<BTreeMap<String, Arc<Metric>>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter `name`.
    pub fn counter(&self, name: &str) -> Result<Counter, MetricError> {
        self.entry(name, MetricKind::Counter)
            .map(|metric| Counter { metric })
    }

    /// Get or create the gauge `name`.
    pub fn gauge(&self, name: &str) -> Result<Gauge, MetricError> {
        self.entry(name, MetricKind::Gauge)
            .map(|metric| Gauge { metric })
    }

    /// Current value of `name`, if it exists.
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.metrics.read().get(name).map(|m| m.value())
    }

    /// All entries sorted by name. Safe to call while entries are being mutated.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.metrics
            .read()
            .iter()
            .map(|(name, metric)| MetricSnapshot {
                name: name.clone(),
                kind: metric.kind,
                value: metric.value(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    fn entry(&self, name: &str, kind: MetricKind) -> Result<Arc<Metric>, MetricError> {
        if let Some(metric) = self.metrics.read().get(name) {
            return Self::check_kind(name, metric, kind);
        }

        let mut metrics = self.metrics.write();
        // Another writer may have created it between the two locks.
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Metric::new(kind)));
        Self::check_kind(name, metric, kind)
    }

    fn check_kind(
        name: &str,
        metric: &Arc<Metric>,
        requested: MetricKind,
    ) -> Result<Arc<Metric>, MetricError> {
        if metric.kind != requested {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                existing: metric.kind,
                requested,
            });
        }
        Ok(metric.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_get_or_create() {
        let store = MetricStore::new();
        let a = store.counter("requests").unwrap();
        let b = store.counter("requests").unwrap();

        a.inc();
        b.add(4);

        assert_eq!(a.get(), 5);
        assert_eq!(store.get("requests"), Some(MetricValue::Counter(5)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_counter_never_wraps() {
        let store = MetricStore::new();
        let c = store.counter("big").unwrap();
        c.add(u64::MAX - 1);

        assert_eq!(c.checked_add(2), None);
        assert_eq!(c.get(), u64::MAX - 1);

        c.add(10);
        assert_eq!(c.get(), u64::MAX);
        assert_eq!(c.checked_add(0), Some(u64::MAX));
    }

    #[test]
    fn test_gauge_set_and_add() {
        let store = MetricStore::new();
        let g = store.gauge("temperature").unwrap();

        g.set(20.5);
        g.add(-0.5);

        assert_eq!(g.get(), 20.0);
        assert_eq!(store.get("temperature"), Some(MetricValue::Gauge(20.0)));
    }

    #[test]
    fn test_kind_mismatch_leaves_entry_untouched() {
        let store = MetricStore::new();
        store.counter("bytes").unwrap().add(10);

        let err = store.gauge("bytes").unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                name: "bytes".to_string(),
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
            }
        );
        assert_eq!(store.get("bytes"), Some(MetricValue::Counter(10)));
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let store = MetricStore::new();
        store.gauge("zeta").unwrap().set(1.5);
        store.counter("alpha").unwrap().inc();

        let snapshot = store.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(snapshot[0].kind, MetricKind::Counter);
        assert_eq!(snapshot[1].value, MetricValue::Gauge(1.5));
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let store = MetricStore::new();
        store.counter(LINE_COUNT).unwrap().add(3);

        let json = serde_json::to_string(&store.snapshot()).unwrap();
        assert_eq!(json, r#"[{"name":"line_count","kind":"counter","value":3}]"#);
    }

    #[test]
    fn test_concurrent_mutation_is_atomic() {
        let store = Arc::new(MetricStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let counter = store.counter("hits").unwrap();
                let gauge = store.gauge("level").unwrap();
                for _ in 0..1000 {
                    counter.inc();
                    gauge.add(1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get("hits"), Some(MetricValue::Counter(8000)));
        assert_eq!(store.get("level"), Some(MetricValue::Gauge(8000.0)));
    }
}
