// ============================================================================
// callrelay Library
// ============================================================================

pub mod config;
pub mod core;
pub mod dispatch;
pub mod heartbeat;
pub mod ingest;
pub mod load_test;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod rooms;
pub mod schedule;
pub mod stats;
pub mod web;

// Re-export main types for convenience
pub use config::OrchestratorConfig;
pub use core::{
    CallOutcome, CallRoom, DispatchError, DispatchJob, EventType, LifecycleEvent, Result,
    RoomState, Worker, WorkerHealth,
};
pub use orchestrator::Orchestrator;
pub use stats::StatsSnapshot;
pub use web::build_router;

// Re-export the dispatch pipeline
pub use dispatch::{
    Assignment, DispatchEngine, DispatchOutcome, HttpWorkerNotifier, NoopNotifier,
    WorkerNotifier,
};
pub use ingest::{EventIngester, IngestOutcome};
pub use queue::{DispatchQueue, JournalQueue, MemoryQueue, QueueLease};
pub use registry::WorkerRegistry;

// Re-export the load harness
pub use load_test::{
    CallRecord, DispatchTarget, HttpTarget, LoadHarness, LoadTestConfig, LoadTestReport,
    LocalTarget,
};
