use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::{CallOutcome, Result};
use crate::registry::RegistryTotals;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyPercentiles {
    pub fn from_sorted(sorted: &[f64]) -> Self {
        Self {
            p50: percentile(sorted, 0.50),
            p95: percentile(sorted, 0.95),
            p99: percentile(sorted, 0.99),
        }
    }
}

/// Point-in-time view served by `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub active_calls: usize,
    pub queue_length: usize,
    pub dispatch_latency_percentiles: LatencyPercentiles,
    pub success_count: u64,
    pub failure_count: u64,
    pub latency_samples: usize,
    pub duplicate_events: u64,
    pub malformed_events: u64,
    pub ignored_events: u64,
    pub requeued_jobs: u64,
    pub workers: usize,
    pub healthy_workers: usize,
    pub degraded_workers: usize,
    pub unreachable_workers: usize,
    pub total_capacity: u64,
}

/// Live gauges read from the registry, room table and queue at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct Gauges {
    pub active_calls: usize,
    pub queue_length: usize,
    pub workers: RegistryTotals,
}

/// Dispatch latency samples and outcome counters.
///
/// Counters are plain atomics; the sample buffer sits behind a mutex that is
/// held only to push or to copy out. Sorting happens on the copy.
pub struct StatsAggregator {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
    success: AtomicU64,
    failure: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
    requeued: AtomicU64,
}

impl StatsAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    /// Records one dispatch outcome. Latency is sampled only when present.
    pub fn record(&self, latency_ms: Option<f64>, outcome: CallOutcome) -> Result<()> {
        if let Some(latency) = latency_ms.filter(|value| value.is_finite()) {
            let mut samples = self.samples.lock()?;
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(latency.max(0.0));
        }
        match outcome {
            CallOutcome::Success => self.success.fetch_add(1, Ordering::Relaxed),
            CallOutcome::Failure | CallOutcome::Timeout => {
                self.failure.fetch_add(1, Ordering::Relaxed)
            }
        };
        Ok(())
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn percentiles(&self) -> Result<LatencyPercentiles> {
        let mut sorted: Vec<f64> = self.samples.lock()?.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        Ok(LatencyPercentiles::from_sorted(&sorted))
    }

    pub fn snapshot(&self, gauges: Gauges) -> Result<StatsSnapshot> {
        let mut sorted: Vec<f64> = self.samples.lock()?.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        Ok(StatsSnapshot {
            active_calls: gauges.active_calls,
            queue_length: gauges.queue_length,
            dispatch_latency_percentiles: LatencyPercentiles::from_sorted(&sorted),
            success_count: self.success.load(Ordering::Relaxed),
            failure_count: self.failure.load(Ordering::Relaxed),
            latency_samples: sorted.len(),
            duplicate_events: self.duplicates.load(Ordering::Relaxed),
            malformed_events: self.malformed.load(Ordering::Relaxed),
            ignored_events: self.ignored.load(Ordering::Relaxed),
            requeued_jobs: self.requeued.load(Ordering::Relaxed),
            workers: gauges.workers.workers,
            healthy_workers: gauges.workers.healthy,
            degraded_workers: gauges.workers.degraded,
            unreachable_workers: gauges.workers.unreachable,
            total_capacity: gauges.workers.total_capacity,
        })
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Nearest-rank percentile over an ascending slice; 0.0 when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
