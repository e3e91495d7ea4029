use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::core::{DispatchError, DispatchJob, Result, WorkerHealth};
use crate::queue::DispatchQueue;
use crate::registry::{HealthTransition, WorkerRegistry};
use crate::rooms::RoomTable;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub transitions: Vec<HealthTransition>,
    pub reassigned_rooms: Vec<String>,
    pub pruned_rooms: usize,
}

/// Periodic liveness check over the worker registry.
///
/// Rooms held by an UNREACHABLE worker go back to QUEUED with a fresh job,
/// and that worker's reservations are released. Every sweep rechecks all
/// unreachable workers, so an assignment that raced the health change is
/// picked up on the next pass.
pub struct HeartbeatMonitor {
    registry: Arc<WorkerRegistry>,
    rooms: Arc<RoomTable>,
    queue: Arc<dyn DispatchQueue>,
    room_retention: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        rooms: Arc<RoomTable>,
        queue: Arc<dyn DispatchQueue>,
        room_retention: Duration,
    ) -> Self {
        Self {
            registry,
            rooms,
            queue,
            room_retention,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let transitions = self.registry.sweep_stale_at(now)?;
        for transition in &transitions {
            if transition.to == WorkerHealth::Unreachable {
                let stale = DispatchError::HealthCheckStale(transition.worker_id.clone());
                warn!(worker_id = %transition.worker_id, error = %stale, "reassigning rooms");
            } else {
                info!(
                    worker_id = %transition.worker_id,
                    from = %transition.from,
                    to = %transition.to,
                    "worker health changed"
                );
            }
        }

        let mut reassigned_rooms = Vec::new();
        let unreachable = self
            .registry
            .snapshot()?
            .into_iter()
            .filter(|worker| worker.health == WorkerHealth::Unreachable);
        for worker in unreachable {
            for room in self.rooms.rooms_assigned_to(&worker.worker_id)? {
                let Some(held_by) = self.rooms.requeue_for_reassignment(&room.room_id)? else {
                    continue;
                };
                self.registry.release(&held_by)?;
                self.queue
                    .enqueue(DispatchJob::new(&room.room_id, &room.participant_identity))
                    .await?;
                info!(room_id = %room.room_id, from_worker = %held_by, "room requeued for reassignment");
                reassigned_rooms.push(room.room_id);
            }
        }

        let retention = chrono::Duration::from_std(self.room_retention)
            .map_err(|err| DispatchError::InvalidConfig(err.to_string()))?;
        let pruned_rooms = self.rooms.prune_terminal(now - retention)?;
        if pruned_rooms > 0 {
            debug!(pruned_rooms, "pruned terminal rooms");
        }

        Ok(SweepReport {
            transitions,
            reassigned_rooms,
            pruned_rooms,
        })
    }

    /// Runs [`sweep`](Self::sweep) every `period` until stopped.
    pub fn spawn(self: Arc<Self>, period: Duration) -> MonitorHandle {
        let period = period.max(Duration::from_millis(10));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(period) => {
                        if let Err(err) = self.sweep().await {
                            error!(error = %err, "heartbeat sweep failed");
                        }
                    }
                }
            }
        });

        MonitorHandle {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Background heartbeat sweeper.
pub struct MonitorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signals the sweeper to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DispatchError::QueueError(format!("heartbeat join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
