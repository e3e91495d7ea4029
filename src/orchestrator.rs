use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::core::{CallRoom, DispatchError, LifecycleEvent, Result, Worker, WorkerHealth};
use crate::dispatch::{ConsumerPool, DispatchEngine, HttpWorkerNotifier, WorkerNotifier};
use crate::heartbeat::{HeartbeatMonitor, MonitorHandle};
use crate::ingest::{EventIngester, IngestOutcome};
use crate::queue::{DispatchQueue, JournalQueue, MemoryQueue};
use crate::registry::WorkerRegistry;
use crate::rooms::RoomTable;
use crate::stats::{Gauges, StatsAggregator, StatsSnapshot};

#[derive(Default)]
struct Background {
    consumers: Option<ConsumerPool>,
    monitor: Option<MonitorHandle>,
}

/// The dispatch service: registry, rooms, queue, engine and stats wired together.
///
/// Cloning is cheap; every clone shares the same state.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<WorkerRegistry>,
    rooms: Arc<RoomTable>,
    queue: Arc<dyn DispatchQueue>,
    stats: Arc<StatsAggregator>,
    ingester: Arc<EventIngester>,
    engine: Arc<DispatchEngine>,
    monitor: Arc<HeartbeatMonitor>,
    background: Arc<AsyncMutex<Background>>,
}

impl Orchestrator {
    /// Builds the service with the queue backend the config selects and
    /// workers notified over HTTP.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let notifier = Arc::new(HttpWorkerNotifier::new(config.notify_timeout)?);
        Self::with_notifier(config, notifier).await
    }

    pub async fn with_notifier(
        config: OrchestratorConfig,
        notifier: Arc<dyn WorkerNotifier>,
    ) -> Result<Self> {
        config.validate().map_err(DispatchError::InvalidConfig)?;

        let queue: Arc<dyn DispatchQueue> = match &config.queue_journal {
            Some(path) => Arc::new(JournalQueue::open(path, config.visibility_timeout).await?),
            None => Arc::new(MemoryQueue::new(config.visibility_timeout)),
        };

        let registry = Arc::new(WorkerRegistry::new(config.heartbeat.clone()));
        for worker in &config.static_workers {
            registry.register(&worker.worker_id, worker.max_capacity, worker.endpoint.clone())?;
        }

        let rooms = Arc::new(RoomTable::new());
        let stats = Arc::new(StatsAggregator::new(config.latency_sample_capacity));
        let ingester = Arc::new(
            EventIngester::new(rooms.clone(), queue.clone(), stats.clone())
                .sip_only(config.sip_only),
        );
        let engine = Arc::new(
            DispatchEngine::new(
                registry.clone(),
                rooms.clone(),
                queue.clone(),
                stats.clone(),
                notifier,
                &config.retry,
            )
            .notify_timeout(config.notify_timeout),
        );
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            rooms.clone(),
            queue.clone(),
            config.room_retention,
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            rooms,
            queue,
            stats,
            ingester,
            engine,
            monitor,
            background: Arc::new(AsyncMutex::new(Background::default())),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Starts dispatch consumers and the heartbeat sweeper. Idempotent.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.consumers.is_none() {
            background.consumers = Some(self.engine.spawn_consumers(self.config.dispatch_consumers));
        }
        if background.monitor.is_none() {
            let period = self.config.heartbeat.interval / 2;
            background.monitor = Some(Arc::clone(&self.monitor).spawn(period));
        }
        info!(
            consumers = self.config.dispatch_consumers,
            "orchestrator background tasks running"
        );
    }

    /// Stops background tasks, letting in-progress jobs finish.
    pub async fn shutdown(&self) -> Result<()> {
        let (consumers, monitor) = {
            let mut background = self.background.lock().await;
            (background.consumers.take(), background.monitor.take())
        };

        let (consumers, monitor) = tokio::join!(
            async move {
                match consumers {
                    Some(pool) => pool.stop().await,
                    None => Ok(()),
                }
            },
            async move {
                match monitor {
                    Some(handle) => handle.stop().await,
                    None => Ok(()),
                }
            }
        );
        consumers?;
        monitor?;
        info!("orchestrator stopped");
        Ok(())
    }

    pub async fn ingest(&self, event: LifecycleEvent) -> Result<IngestOutcome> {
        self.ingester.ingest(event).await
    }

    pub async fn ingest_webhook(&self, body: &[u8]) -> Result<IngestOutcome> {
        self.ingester.ingest_webhook(body).await
    }

    /// Out-of-band dispatch; goes through the same ingestion path as webhooks.
    pub async fn manual_dispatch(
        &self,
        room_id: &str,
        participant_identity: &str,
    ) -> Result<IngestOutcome> {
        self.ingest(LifecycleEvent::joined(room_id, participant_identity))
            .await
    }

    pub fn register_worker(
        &self,
        worker_id: &str,
        max_capacity: u32,
        endpoint: Option<String>,
    ) -> Result<Worker> {
        self.registry.register(worker_id, max_capacity, endpoint)
    }

    pub fn heartbeat(&self, worker_id: &str) -> Result<WorkerHealth> {
        self.registry.heartbeat(worker_id)
    }

    pub fn workers(&self) -> Result<Vec<Worker>> {
        self.registry.snapshot()
    }

    pub fn room(&self, room_id: &str) -> Result<CallRoom> {
        self.rooms
            .get(room_id)?
            .ok_or_else(|| DispatchError::RoomNotFound(room_id.to_string()))
    }

    /// Worker acknowledgement: DISPATCHED → ACTIVE.
    pub fn acknowledge(&self, room_id: &str) -> Result<CallRoom> {
        self.rooms.acknowledge(room_id)
    }

    /// Worker completion: the room ends and its reservation is released.
    pub fn complete(&self, room_id: &str) -> Result<CallRoom> {
        let (room, worker) = self.rooms.complete(room_id)?;
        if let Some(worker_id) = worker {
            match self.registry.release(&worker_id) {
                Ok(_) => {}
                Err(DispatchError::WorkerNotFound(_)) => {
                    warn!(room_id, worker_id = %worker_id, "completed room on unknown worker");
                }
                Err(err) => return Err(err),
            }
        }
        info!(room_id, "room completed");
        Ok(room)
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let gauges = Gauges {
            active_calls: self.rooms.counts()?.active_calls(),
            queue_length: self.queue.len().await?,
            workers: self.registry.totals()?,
        };
        self.stats.snapshot(gauges)
    }

    /// Runs the dispatcher until `wait` passes with an empty queue.
    ///
    /// For callers that drive dispatch without background consumers.
    pub async fn drain(&self, wait: Duration) -> Result<usize> {
        let mut processed = 0;
        while self.engine.dispatch_next(wait).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }
}
