//! Metrics primitives and the persistence metrics capability.
//!
//! No process-wide singleton: components that report metrics take an
//! `Arc<PersistenceMetrics>` and bump atomic counters. Histograms are
//! coarse (mutex-guarded sample vectors) and intended for low-frequency
//! events like checkpoint durations, not hot paths.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add `delta` to the counter.
    #[inline]
    pub fn increment(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Set the gauge.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Add `delta` (may be negative via `sub`).
    #[inline]
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Summary statistics of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HistogramStats {
    /// Number of recorded samples.
    pub count: u64,
    /// Sum of all samples.
    pub sum: u64,
    /// Smallest sample (0 when empty).
    pub min: u64,
    /// Largest sample (0 when empty).
    pub max: u64,
    /// Arithmetic mean (0.0 when empty).
    pub mean: f64,
    /// 50th percentile.
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

/// Distribution of recorded values.
///
/// Stores raw samples; `stats()` sorts a copy. Meant for events that fire
/// at checkpoint cadence.
#[derive(Debug, Default)]
pub struct Histogram {
    values: Mutex<Vec<u64>>,
}

impl Histogram {
    /// Record one sample.
    pub fn record(&self, value: u64) {
        self.values.lock().push(value);
    }

    /// Compute summary statistics over everything recorded so far.
    pub fn stats(&self) -> HistogramStats {
        let mut values = self.values.lock().clone();
        if values.is_empty() {
            return HistogramStats::default();
        }
        values.sort_unstable();
        let count = values.len() as u64;
        let sum: u64 = values.iter().sum();
        let pct = |p: f64| -> u64 {
            let idx = ((values.len() as f64 - 1.0) * p).round() as usize;
            values[idx]
        };
        HistogramStats {
            count,
            sum,
            min: values[0],
            max: values[values.len() - 1],
            mean: sum as f64 / count as f64,
            p50: pct(0.50),
            p95: pct(0.95),
            p99: pct(0.99),
        }
    }

    /// Drop all recorded samples.
    pub fn reset(&self) {
        self.values.lock().clear();
    }
}

/// Counters and histograms the persistence core reports.
///
/// Passed by `Arc` to the object table, the coordinator, and the runtime.
#[derive(Debug, Default)]
pub struct PersistenceMetrics {
    /// Handles allocated.
    pub allocations: Counter,
    /// Nodes retired.
    pub retires: Counter,
    /// Entries reclaimed back to FREE.
    pub reclaims: Counter,
    /// Bytes of segment space reclaimed.
    pub bytes_reclaimed: Counter,
    /// Misuse detected and turned into a no-op (release builds).
    pub invalid_state_ops: Counter,
    /// Checkpoints successfully written.
    pub checkpoints_written: Counter,
    /// Log rotations completed.
    pub rotations: Counter,
    /// Delta logs deleted by GC.
    pub pruned_logs: Counter,
    /// Superblock publishes performed by a group-commit leader.
    pub group_commits: Counter,
    /// Bytes appended to the delta log.
    pub wal_bytes_appended: Counter,
    /// Errors reported from the coordinator loop.
    pub coordinator_errors: Counter,
    /// Live entries at the last checkpoint.
    pub last_checkpoint_entries: Gauge,
    /// Checkpoint wall time in milliseconds.
    pub checkpoint_ms: Histogram,
}
