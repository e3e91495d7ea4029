use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::HeartbeatPolicy;
use crate::core::{DispatchError, Result, Worker, WorkerHealth};

/// Authoritative view of worker capacity and health.
///
/// All load mutations go through [`reserve`](Self::reserve) and
/// [`release`](Self::release), each of which holds the write lock for the
/// full check-and-update, so `current_load <= max_capacity` holds under any
/// interleaving of callers.
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<String, Worker>>,
    policy: HeartbeatPolicy,
}

/// Health transition produced by a staleness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub worker_id: String,
    pub from: WorkerHealth,
    pub to: WorkerHealth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryTotals {
    pub workers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unreachable: usize,
    pub total_capacity: u64,
    pub total_load: u64,
}

impl WorkerRegistry {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    /// Adds a worker or updates an existing one.
    ///
    /// Re-registration keeps the in-flight load; it fails only when the new
    /// capacity would leave that load above the limit.
    pub fn register(
        &self,
        worker_id: &str,
        max_capacity: u32,
        endpoint: Option<String>,
    ) -> Result<Worker> {
        if worker_id.trim().is_empty() {
            return Err(DispatchError::InvalidConfig(
                "worker_id must not be empty".to_string(),
            ));
        }
        if max_capacity == 0 {
            return Err(DispatchError::InvalidConfig(format!(
                "worker '{}' must have capacity >= 1",
                worker_id
            )));
        }

        let mut workers = self.workers.write()?;
        let now = Utc::now();
        let worker = match workers.get_mut(worker_id) {
            Some(existing) => {
                if existing.current_load > max_capacity {
                    return Err(DispatchError::DuplicateWorker(worker_id.to_string()));
                }
                existing.max_capacity = max_capacity;
                existing.endpoint = endpoint;
                existing.last_heartbeat_at = now;
                existing.health = WorkerHealth::Healthy;
                existing.clone()
            }
            None => {
                let worker = Worker::new(worker_id, max_capacity).with_endpoint(endpoint);
                workers.insert(worker_id.to_string(), worker.clone());
                worker
            }
        };

        info!(worker_id, max_capacity, "worker registered");
        Ok(worker)
    }

    pub fn heartbeat(&self, worker_id: &str) -> Result<WorkerHealth> {
        self.heartbeat_at(worker_id, Utc::now())
    }

    pub fn heartbeat_at(&self, worker_id: &str, now: DateTime<Utc>) -> Result<WorkerHealth> {
        let mut workers = self.workers.write()?;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;

        if worker.health != WorkerHealth::Healthy {
            info!(worker_id, from = %worker.health, "worker recovered");
        }
        worker.last_heartbeat_at = now;
        worker.health = WorkerHealth::Healthy;
        Ok(worker.health)
    }

    /// Recomputes health from heartbeat age and returns every transition made.
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<Vec<HealthTransition>> {
        let degraded_after = chrono::Duration::from_std(self.policy.degraded_after())
            .map_err(|err| DispatchError::InvalidConfig(err.to_string()))?;
        let unreachable_after = chrono::Duration::from_std(self.policy.unreachable_after())
            .map_err(|err| DispatchError::InvalidConfig(err.to_string()))?;

        let mut workers = self.workers.write()?;
        let mut transitions = Vec::new();
        for worker in workers.values_mut() {
            let age = now.signed_duration_since(worker.last_heartbeat_at);
            let next = if age > unreachable_after {
                WorkerHealth::Unreachable
            } else if age > degraded_after {
                WorkerHealth::Degraded
            } else {
                WorkerHealth::Healthy
            };

            if next != worker.health {
                if next == WorkerHealth::Unreachable {
                    warn!(
                        worker_id = %worker.worker_id,
                        age_ms = age.num_milliseconds(),
                        "heartbeat stale, worker unreachable"
                    );
                }
                transitions.push(HealthTransition {
                    worker_id: worker.worker_id.clone(),
                    from: worker.health,
                    to: next,
                });
                worker.health = next;
            }
        }
        Ok(transitions)
    }

    /// Atomically takes one unit of capacity on `worker_id`.
    pub fn reserve(&self, worker_id: &str) -> Result<u32> {
        let mut workers = self.workers.write()?;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;

        if worker.health == WorkerHealth::Unreachable {
            return Err(DispatchError::WorkerUnavailable(worker_id.to_string()));
        }
        if !worker.has_capacity() {
            return Err(DispatchError::CapacityExceeded(format!(
                "worker '{}' at {}/{}",
                worker_id, worker.current_load, worker.max_capacity
            )));
        }

        worker.current_load += 1;
        Ok(worker.current_load)
    }

    /// Atomically returns one unit of capacity on `worker_id`.
    pub fn release(&self, worker_id: &str) -> Result<u32> {
        let mut workers = self.workers.write()?;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;

        if worker.current_load == 0 {
            warn!(worker_id, "release without a matching reservation");
        }
        worker.current_load = worker.current_load.saturating_sub(1);
        Ok(worker.current_load)
    }

    /// Least-loaded HEALTHY worker with spare capacity; ties go to the lowest id.
    pub fn select_best_worker(&self) -> Result<Option<String>> {
        let workers = self.workers.read()?;
        let best = workers
            .values()
            .filter(|worker| worker.is_assignable())
            .min_by(|a, b| compare_load(a, b).then_with(|| a.worker_id.cmp(&b.worker_id)));
        Ok(best.map(|worker| worker.worker_id.clone()))
    }

    pub fn get(&self, worker_id: &str) -> Result<Option<Worker>> {
        Ok(self.workers.read()?.get(worker_id).cloned())
    }

    pub fn endpoint(&self, worker_id: &str) -> Result<Option<String>> {
        let workers = self.workers.read()?;
        let worker = workers
            .get(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;
        Ok(worker.endpoint.clone())
    }

    /// Point-in-time copy of every worker, ordered by id.
    pub fn snapshot(&self) -> Result<Vec<Worker>> {
        Ok(self.workers.read()?.values().cloned().collect())
    }

    pub fn totals(&self) -> Result<RegistryTotals> {
        let workers = self.workers.read()?;
        let mut totals = RegistryTotals {
            workers: workers.len(),
            ..RegistryTotals::default()
        };
        for worker in workers.values() {
            match worker.health {
                WorkerHealth::Healthy => totals.healthy += 1,
                WorkerHealth::Degraded => totals.degraded += 1,
                WorkerHealth::Unreachable => totals.unreachable += 1,
            }
            totals.total_capacity += worker.max_capacity as u64;
            totals.total_load += worker.current_load as u64;
        }
        Ok(totals)
    }
}

/// Compares `a.load / a.max` with `b.load / b.max` without floating point.
fn compare_load(a: &Worker, b: &Worker) -> Ordering {
    let left = a.current_load as u64 * b.max_capacity as u64;
    let right = b.current_load as u64 * a.max_capacity as u64;
    left.cmp(&right)
}
