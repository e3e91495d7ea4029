//! Dispatch engine: drains the queue and binds each room to one worker.
//!
//! Per job: precheck room state, pick the least-loaded worker, reserve
//! capacity, compare-and-set the room to DISPATCHED, then notify the worker.
//! The lease is acknowledged only once the job reaches an outcome. No
//! capacity means a requeue behind backoff; a failed notification undoes the
//! reservation and retries until the attempt ceiling marks the room FAILED.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::core::{CallOutcome, DispatchError, DispatchJob, Result};
use crate::queue::{DispatchQueue, QueueLease};
use crate::registry::WorkerRegistry;
use crate::rooms::RoomTable;
use crate::schedule::Backoff;
use crate::stats::StatsAggregator;

/// Consumer poll window; bounds how long shutdown waits on an idle consumer.
const CONSUMER_POLL: Duration = Duration::from_millis(250);

/// Body of an assignment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub room_id: String,
    pub participant_identity: String,
    pub worker_id: String,
}

/// Delivers assignments to workers.
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    /// `endpoint` is the worker's registered URL, if any.
    async fn notify(&self, endpoint: Option<&str>, assignment: &Assignment) -> Result<()>;
}

/// POSTs the assignment as JSON. Workers without an endpoint accept in-process.
pub struct HttpWorkerNotifier {
    client: reqwest::Client,
}

impl HttpWorkerNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DispatchError::InvalidConfig(format!("http client: {}", err)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerNotifier for HttpWorkerNotifier {
    async fn notify(&self, endpoint: Option<&str>, assignment: &Assignment) -> Result<()> {
        let Some(url) = endpoint else {
            return Ok(());
        };
        let response = self
            .client
            .post(url)
            .json(assignment)
            .send()
            .await
            .map_err(|err| {
                DispatchError::WorkerUnavailable(format!("{}: {}", assignment.worker_id, err))
            })?;
        if !response.status().is_success() {
            return Err(DispatchError::WorkerUnavailable(format!(
                "{}: notification returned {}",
                assignment.worker_id,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Accepts every assignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl WorkerNotifier for NoopNotifier {
    async fn notify(&self, _endpoint: Option<&str>, _assignment: &Assignment) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched {
        room_id: String,
        worker_id: String,
        latency_ms: f64,
    },
    /// No worker had spare capacity.
    Requeued { room_id: String, delay: Duration },
    /// Notification failed; another attempt is scheduled.
    Retried {
        room_id: String,
        attempts: u32,
        delay: Duration,
    },
    Failed { room_id: String, attempts: u32 },
    /// The room was no longer QUEUED when its job was delivered.
    Stale { room_id: String },
}

pub struct DispatchEngine {
    registry: Arc<WorkerRegistry>,
    rooms: Arc<RoomTable>,
    queue: Arc<dyn DispatchQueue>,
    stats: Arc<StatsAggregator>,
    notifier: Arc<dyn WorkerNotifier>,
    backoff: Backoff,
    max_attempts: u32,
    notify_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        rooms: Arc<RoomTable>,
        queue: Arc<dyn DispatchQueue>,
        stats: Arc<StatsAggregator>,
        notifier: Arc<dyn WorkerNotifier>,
        retry: &RetryPolicy,
    ) -> Self {
        Self {
            registry,
            rooms,
            queue,
            stats,
            notifier,
            backoff: Backoff::from(retry),
            max_attempts: retry.max_attempts.max(1),
            notify_timeout: Duration::from_secs(2),
        }
    }

    pub fn notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Takes one job from the queue and drives it to an outcome.
    ///
    /// Returns `None` when nothing became available within `wait`.
    pub async fn dispatch_next(&self, wait: Duration) -> Result<Option<DispatchOutcome>> {
        let Some(lease) = self.queue.dequeue(wait).await? else {
            return Ok(None);
        };
        self.process(lease).await.map(Some)
    }

    async fn process(&self, lease: QueueLease) -> Result<DispatchOutcome> {
        let QueueLease {
            lease_id,
            job,
            delivery,
        } = lease;
        let room_id = job.room_id.clone();

        if self.rooms.restore(&room_id, &job.participant_identity)? {
            info!(room_id = %room_id, "room restored from queued job");
        }
        if !self.rooms.is_dispatchable(&room_id)? {
            self.queue.ack(lease_id).await?;
            debug!(room_id = %room_id, delivery, "stale job dropped");
            return Ok(DispatchOutcome::Stale { room_id });
        }

        let Some(worker_id) = self.registry.select_best_worker()? else {
            return self.requeue(lease_id, job).await;
        };

        if let Err(err) = self.registry.reserve(&worker_id) {
            // Lost a race for the last slot, or the worker went away.
            if err.is_transient() || matches!(err, DispatchError::WorkerNotFound(_)) {
                debug!(room_id = %room_id, worker_id = %worker_id, error = %err, "reservation failed, requeueing");
                return self.requeue(lease_id, job).await;
            }
            return Err(err);
        }

        let Some(generation) = self.rooms.assign(&room_id, &worker_id)? else {
            self.registry.release(&worker_id)?;
            self.queue.ack(lease_id).await?;
            debug!(room_id = %room_id, "room changed state before assignment");
            return Ok(DispatchOutcome::Stale { room_id });
        };

        let assignment = Assignment {
            room_id: room_id.clone(),
            participant_identity: job.participant_identity.clone(),
            worker_id: worker_id.clone(),
        };
        // The monitor may have reassigned the room while the notification was
        // in flight; results are applied only to the assignment they belong to.
        match self.notify(&assignment).await {
            Ok(()) => {
                let Some(first) =
                    self.rooms.confirm_assignment(&room_id, &worker_id, generation)?
                else {
                    self.queue.ack(lease_id).await?;
                    warn!(room_id = %room_id, worker_id = %worker_id, "assignment superseded during notification");
                    return Ok(DispatchOutcome::Stale { room_id });
                };
                let latency_ms = job.latency_ms(Utc::now());
                self.queue.ack(lease_id).await?;
                if first {
                    self.stats.record(Some(latency_ms), CallOutcome::Success)?;
                    info!(room_id = %room_id, worker_id = %worker_id, latency_ms, "room dispatched");
                } else {
                    info!(room_id = %room_id, worker_id = %worker_id, "room reassigned");
                }
                Ok(DispatchOutcome::Dispatched {
                    room_id,
                    worker_id,
                    latency_ms,
                })
            }
            Err(err) => {
                warn!(room_id = %room_id, worker_id = %worker_id, error = %err, "worker notification failed");
                self.handle_failed_attempt(lease_id, job, &worker_id, generation)
                    .await
            }
        }
    }

    async fn notify(&self, assignment: &Assignment) -> Result<()> {
        let endpoint = self.registry.endpoint(&assignment.worker_id)?;
        let delivery = self.notifier.notify(endpoint.as_deref(), assignment);
        match tokio::time::timeout(self.notify_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::WorkerUnavailable(format!(
                "{}: notification timed out after {:?}",
                assignment.worker_id, self.notify_timeout
            ))),
        }
    }

    async fn requeue(&self, lease_id: u64, mut job: DispatchJob) -> Result<DispatchOutcome> {
        let delay = self.backoff.delay(job.backoff_exponent());
        job.requeues = job.requeues.saturating_add(1);
        let room_id = job.room_id.clone();
        self.queue.retry(lease_id, job, delay).await?;
        self.stats.record_requeue();
        debug!(room_id = %room_id, delay_ms = delay.as_millis() as u64, "no capacity, job requeued");
        Ok(DispatchOutcome::Requeued { room_id, delay })
    }

    async fn handle_failed_attempt(
        &self,
        lease_id: u64,
        mut job: DispatchJob,
        worker_id: &str,
        generation: u64,
    ) -> Result<DispatchOutcome> {
        let room_id = job.room_id.clone();
        let delay = self.backoff.delay(job.backoff_exponent());
        let Some(attempts) = self
            .rooms
            .retry_after_failure(&room_id, worker_id, generation)?
        else {
            // Whoever moved the room on also owns its reservation.
            self.queue.ack(lease_id).await?;
            debug!(room_id = %room_id, worker_id, "failed notification for a superseded assignment");
            return Ok(DispatchOutcome::Stale { room_id });
        };
        self.registry.release(worker_id)?;

        if attempts >= self.max_attempts {
            self.rooms.fail(&room_id)?;
            self.queue.ack(lease_id).await?;
            self.stats.record(None, CallOutcome::Failure)?;
            let exhausted = DispatchError::DispatchAttemptsExhausted {
                room_id: room_id.clone(),
                attempts,
            };
            error!(room_id = %room_id, error = %exhausted, "room failed");
            return Ok(DispatchOutcome::Failed { room_id, attempts });
        }

        job.attempts = attempts;
        self.queue.retry(lease_id, job, delay).await?;
        Ok(DispatchOutcome::Retried {
            room_id,
            attempts,
            delay,
        })
    }

    /// Starts `consumers` competing queue consumers.
    pub fn spawn_consumers(self: &Arc<Self>, consumers: usize) -> ConsumerPool {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = (0..consumers.max(1))
            .map(|index| {
                let engine = Arc::clone(self);
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move {
                    debug!(consumer = index, "dispatch consumer started");
                    // Stop is checked between jobs so a job is never abandoned
                    // while it holds a reservation.
                    while !*stop_rx.borrow() {
                        if let Err(err) = engine.dispatch_next(CONSUMER_POLL).await {
                            error!(consumer = index, error = %err, "dispatch failed");
                            tokio::time::sleep(CONSUMER_POLL).await;
                        }
                    }
                    debug!(consumer = index, "dispatch consumer stopped");
                })
            })
            .collect();

        ConsumerPool {
            stop_tx: Some(stop_tx),
            handles,
        }
    }
}

/// Handle to running dispatch consumers.
pub struct ConsumerPool {
    stop_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every consumer to stop and waits for them to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        let handles = std::mem::take(&mut self.handles);
        for joined in join_all(handles).await {
            joined.map_err(|err| DispatchError::QueueError(format!("consumer join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatPolicy;
    use crate::core::RoomState;
    use crate::heartbeat::HeartbeatMonitor;
    use crate::queue::MemoryQueue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Fails the first `failures` notifications.
    struct FlakyNotifier {
        failures: AtomicU32,
    }

    #[async_trait]
    impl WorkerNotifier for FlakyNotifier {
        async fn notify(&self, _endpoint: Option<&str>, assignment: &Assignment) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DispatchError::WorkerUnavailable(assignment.worker_id.clone()));
            }
            Ok(())
        }
    }

    /// Holds the first notification open until released, then answers it
    /// with `first_result`. Later notifications succeed at once.
    struct GatedNotifier {
        calls: AtomicU32,
        entered: Notify,
        release: Notify,
        first_fails: bool,
    }

    impl GatedNotifier {
        fn new(first_fails: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                entered: Notify::new(),
                release: Notify::new(),
                first_fails,
            }
        }
    }

    #[async_trait]
    impl WorkerNotifier for GatedNotifier {
        async fn notify(&self, _endpoint: Option<&str>, assignment: &Assignment) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(());
            }
            self.entered.notify_one();
            self.release.notified().await;
            if self.first_fails {
                return Err(DispatchError::WorkerUnavailable(assignment.worker_id.clone()));
            }
            Ok(())
        }
    }

    struct Fixture {
        engine: DispatchEngine,
        registry: Arc<WorkerRegistry>,
        rooms: Arc<RoomTable>,
        queue: Arc<MemoryQueue>,
        stats: Arc<StatsAggregator>,
    }

    fn fixture(notifier: Arc<dyn WorkerNotifier>, max_attempts: u32) -> Fixture {
        let registry = Arc::new(WorkerRegistry::new(HeartbeatPolicy::default()));
        let rooms = Arc::new(RoomTable::new());
        let queue = Arc::new(MemoryQueue::default());
        let stats = Arc::new(StatsAggregator::default());
        let retry = RetryPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        };
        let engine = DispatchEngine::new(
            registry.clone(),
            rooms.clone(),
            queue.clone(),
            stats.clone(),
            notifier,
            &retry,
        );
        Fixture {
            engine,
            registry,
            rooms,
            queue,
            stats,
        }
    }

    async fn admit(fx: &Fixture, room: &str) {
        fx.rooms.admit(room, "caller").unwrap();
        fx.queue.enqueue(DispatchJob::new(room, "caller")).await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_to_least_loaded_worker() {
        let fx = fixture(Arc::new(NoopNotifier), 3);
        fx.registry.register("w-a", 2, None).unwrap();
        fx.registry.register("w-b", 4, None).unwrap();
        fx.registry.reserve("w-a").unwrap();
        admit(&fx, "r1").await;

        let outcome = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Dispatched { ref worker_id, .. } if worker_id == "w-b"
        ));
        assert_eq!(fx.rooms.get("r1").unwrap().unwrap().state, RoomState::Dispatched);
        assert!(fx.queue.is_empty().await.unwrap());
        assert_eq!(fx.registry.get("w-b").unwrap().unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn no_capacity_requeues_without_counting_attempts() {
        let fx = fixture(Arc::new(NoopNotifier), 1);
        admit(&fx, "r1").await;

        let outcome = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Requeued { .. }));

        let room = fx.rooms.get("r1").unwrap().unwrap();
        assert_eq!(room.state, RoomState::Queued);
        assert_eq!(room.dispatch_attempts, 0);
        assert_eq!(fx.queue.len().await.unwrap(), 1);

        fx.registry.register("w1", 1, None).unwrap();
        let outcome = fx
            .engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    }

    #[tokio::test]
    async fn notification_failure_releases_and_retries() {
        let fx = fixture(
            Arc::new(FlakyNotifier {
                failures: AtomicU32::new(1),
            }),
            3,
        );
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;

        let outcome = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retried { attempts: 1, .. }));
        assert_eq!(fx.registry.get("w1").unwrap().unwrap().current_load, 0);
        assert_eq!(fx.rooms.get("r1").unwrap().unwrap().state, RoomState::Queued);

        let outcome = fx
            .engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        assert_eq!(fx.registry.get("w1").unwrap().unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_room() {
        let fx = fixture(
            Arc::new(FlakyNotifier {
                failures: AtomicU32::new(u32::MAX),
            }),
            2,
        );
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;

        let first = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(first, DispatchOutcome::Retried { .. }));
        let second = fx
            .engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Failed {
                room_id: "r1".into(),
                attempts: 2
            }
        );

        assert_eq!(fx.rooms.get("r1").unwrap().unwrap().state, RoomState::Failed);
        assert!(fx.queue.is_empty().await.unwrap());
        assert_eq!(fx.registry.get("w1").unwrap().unwrap().current_load, 0);
        let snapshot = fx.stats.snapshot(Default::default()).unwrap();
        assert_eq!(snapshot.failure_count, 1);
    }

    #[tokio::test]
    async fn redelivered_job_for_assigned_room_is_stale() {
        let fx = fixture(Arc::new(NoopNotifier), 3);
        fx.registry.register("w1", 2, None).unwrap();
        admit(&fx, "r1").await;
        fx.queue.enqueue(DispatchJob::new("r1", "caller")).await.unwrap();

        let first = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(first, DispatchOutcome::Dispatched { .. }));
        let second = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second, DispatchOutcome::Stale { room_id: "r1".into() });
        assert_eq!(fx.registry.get("w1").unwrap().unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn slow_notifier_times_out() {
        struct Hanging;

        #[async_trait]
        impl WorkerNotifier for Hanging {
            async fn notify(&self, _: Option<&str>, _: &Assignment) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let mut fx = fixture(Arc::new(Hanging), 5);
        fx.engine = fx.engine.notify_timeout(Duration::from_millis(20));
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;

        let outcome = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retried { attempts: 1, .. }));
    }

    fn monitor(fx: &Fixture) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            fx.registry.clone(),
            fx.rooms.clone(),
            fx.queue.clone(),
            Duration::from_secs(3_600),
        )
    }

    fn long_after_now() -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(60)
    }

    #[tokio::test]
    async fn late_failure_leaves_newer_assignment_alone() {
        let gate = Arc::new(GatedNotifier::new(true));
        let fx = fixture(gate.clone(), 3);
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;
        let monitor = monitor(&fx);
        let Fixture {
            engine,
            registry,
            rooms,
            queue,
            ..
        } = fx;
        let engine = Arc::new(engine);

        let held = tokio::spawn({
            let engine = engine.clone();
            async move { engine.dispatch_next(Duration::ZERO).await }
        });
        gate.entered.notified().await;

        // w1 misses its heartbeats mid-notification, then comes back.
        let report = monitor.sweep_at(long_after_now()).await.unwrap();
        assert_eq!(report.reassigned_rooms, vec!["r1".to_string()]);
        registry.heartbeat("w1").unwrap();
        let again = engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(again, DispatchOutcome::Dispatched { .. }));

        gate.release.notify_one();
        let late = held.await.unwrap().unwrap().unwrap();
        assert_eq!(late, DispatchOutcome::Stale { room_id: "r1".into() });

        let room = rooms.get("r1").unwrap().unwrap();
        assert_eq!(room.state, RoomState::Dispatched);
        assert_eq!(room.assigned_worker_id.as_deref(), Some("w1"));
        assert_eq!(room.dispatch_attempts, 0);
        assert_eq!(registry.get("w1").unwrap().unwrap().current_load, 1);
        assert!(queue.is_empty().await.unwrap());

        // w1 is full, so nothing else lands on it.
        rooms.admit("r2", "caller").unwrap();
        queue.enqueue(DispatchJob::new("r2", "caller")).await.unwrap();
        let overflow = engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(overflow, DispatchOutcome::Requeued { .. }));
    }

    #[tokio::test]
    async fn late_success_does_not_claim_a_reassigned_room() {
        let gate = Arc::new(GatedNotifier::new(false));
        let fx = fixture(gate.clone(), 3);
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;
        let monitor = monitor(&fx);
        let Fixture {
            engine,
            registry,
            rooms,
            stats,
            ..
        } = fx;
        let engine = Arc::new(engine);

        let held = tokio::spawn({
            let engine = engine.clone();
            async move { engine.dispatch_next(Duration::ZERO).await }
        });
        gate.entered.notified().await;
        monitor.sweep_at(long_after_now()).await.unwrap();

        gate.release.notify_one();
        let late = held.await.unwrap().unwrap().unwrap();
        assert_eq!(late, DispatchOutcome::Stale { room_id: "r1".into() });
        assert_eq!(rooms.get("r1").unwrap().unwrap().state, RoomState::Queued);
        assert_eq!(registry.get("w1").unwrap().unwrap().current_load, 0);
        assert_eq!(stats.snapshot(Default::default()).unwrap().success_count, 0);

        registry.register("w2", 1, None).unwrap();
        let outcome = engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Dispatched { ref worker_id, .. } if worker_id == "w2"
        ));
        assert_eq!(stats.snapshot(Default::default()).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn reassignment_does_not_count_a_second_success() {
        let fx = fixture(Arc::new(NoopNotifier), 3);
        fx.registry.register("w1", 1, None).unwrap();
        admit(&fx, "r1").await;

        let first = fx.engine.dispatch_next(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(first, DispatchOutcome::Dispatched { .. }));

        monitor(&fx).sweep_at(long_after_now()).await.unwrap();
        fx.registry.register("w2", 1, None).unwrap();
        let second = fx
            .engine
            .dispatch_next(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            second,
            DispatchOutcome::Dispatched { ref worker_id, .. } if worker_id == "w2"
        ));

        let snapshot = fx.stats.snapshot(Default::default()).unwrap();
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.latency_samples, 1);
    }

    #[tokio::test]
    async fn consumer_pool_drains_queue_and_stops() {
        let fx = fixture(Arc::new(NoopNotifier), 3);
        fx.registry.register("w1", 50, None).unwrap();
        for i in 0..20 {
            admit(&fx, &format!("r{i}")).await;
        }

        let queue = fx.queue.clone();
        let rooms = fx.rooms.clone();
        let engine = Arc::new(fx.engine);
        let pool = engine.spawn_consumers(4);
        assert_eq!(pool.len(), 4);

        for _ in 0..100 {
            if queue.is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.stop().await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        assert_eq!(rooms.counts().unwrap().dispatched, 20);
    }
}
