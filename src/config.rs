use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::{DispatchError, Result};

/// Journal location used unless the in-memory queue is chosen explicitly.
pub const DEFAULT_QUEUE_JOURNAL: &str = "data/dispatch.journal";

/// Retry behavior for requeued and failed dispatch jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed notification attempts before a room is marked FAILED.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

/// Liveness thresholds, expressed in missed heartbeat windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub degraded_after_missed: u32,
    pub unreachable_after_missed: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            degraded_after_missed: 1,
            unreachable_after_missed: 3,
        }
    }
}

impl HeartbeatPolicy {
    pub fn degraded_after(&self) -> Duration {
        self.interval * self.degraded_after_missed
    }

    pub fn unreachable_after(&self) -> Duration {
        self.interval * self.unreachable_after_missed
    }
}

/// A worker registered at startup from `ORCH_WORKERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticWorker {
    pub worker_id: String,
    pub max_capacity: u32,
    pub endpoint: Option<String>,
}

impl FromStr for StaticWorker {
    type Err = String;

    /// Format: `id:capacity` or `id:capacity@http://host:port/assign`
    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let (entry, endpoint) = match raw.split_once('@') {
            Some((entry, url)) => (entry, Some(url.trim().to_string())),
            None => (raw, None),
        };
        let (worker_id, capacity) = entry
            .split_once(':')
            .ok_or_else(|| format!("worker '{}' must be id:capacity", raw))?;
        let worker_id = worker_id.trim();
        if worker_id.is_empty() {
            return Err("worker id cannot be empty".to_string());
        }
        let max_capacity = capacity
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid capacity for worker '{}'", worker_id))?;
        Ok(Self {
            worker_id: worker_id.to_string(),
            max_capacity,
            endpoint: endpoint.filter(|url| !url.is_empty()),
        })
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// HTTP bind host
    pub host: String,

    /// HTTP bind port
    pub port: u16,

    /// Number of competing queue consumers
    pub dispatch_consumers: usize,

    pub retry: RetryPolicy,

    pub heartbeat: HeartbeatPolicy,

    /// Lease duration before an unacknowledged job is redelivered
    pub visibility_timeout: Duration,

    /// Durable queue journal; `None` selects the in-process queue, which
    /// loses pending jobs on a crash
    pub queue_journal: Option<PathBuf>,

    /// Worker notification timeout
    pub notify_timeout: Duration,

    /// Retained dispatch latency samples
    pub latency_sample_capacity: usize,

    /// How long terminal rooms stay queryable
    pub room_retention: Duration,

    /// Only dispatch for joins whose participant kind is SIP (when a kind is present)
    pub sip_only: bool,

    pub static_workers: Vec<StaticWorker>,
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dispatch_consumers: 4,
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
            visibility_timeout: Duration::from_secs(30),
            queue_journal: Some(PathBuf::from(DEFAULT_QUEUE_JOURNAL)),
            notify_timeout: Duration::from_secs(2),
            latency_sample_capacity: 10_000,
            room_retention: Duration::from_secs(3_600),
            sip_only: false,
            static_workers: Vec::new(),
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn dispatch_consumers(mut self, consumers: usize) -> Self {
        self.dispatch_consumers = consumers;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry.initial_backoff_ms = initial.as_millis() as u64;
        self.retry.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.interval = interval;
        self
    }

    pub fn unreachable_after_missed(mut self, windows: u32) -> Self {
        self.heartbeat.unreachable_after_missed = windows;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn queue_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_journal = Some(path.into());
        self
    }

    /// Non-durable queue, for tests and throwaway runs.
    pub fn in_memory_queue(mut self) -> Self {
        self.queue_journal = None;
        self
    }

    pub fn notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn latency_sample_capacity(mut self, capacity: usize) -> Self {
        self.latency_sample_capacity = capacity;
        self
    }

    pub fn sip_only(mut self, sip_only: bool) -> Self {
        self.sip_only = sip_only;
        self
    }

    pub fn static_worker(mut self, worker_id: &str, max_capacity: u32) -> Self {
        self.static_workers.push(StaticWorker {
            worker_id: worker_id.to_string(),
            max_capacity,
            endpoint: None,
        });
        self
    }

    /// Load configuration from `ORCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::new();

        let static_workers = match env::var("ORCH_WORKERS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|entry| entry.trim().parse::<StaticWorker>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(DispatchError::InvalidConfig)?,
            _ => Vec::new(),
        };

        let config = Self {
            host: env::var("ORCH_HTTP_HOST").unwrap_or(defaults.host),
            port: env_parse("ORCH_HTTP_PORT", defaults.port)?,
            dispatch_consumers: env_parse("ORCH_DISPATCH_CONSUMERS", defaults.dispatch_consumers)?,
            retry: RetryPolicy {
                max_attempts: env_parse("ORCH_MAX_DISPATCH_ATTEMPTS", defaults.retry.max_attempts)?,
                initial_backoff_ms: env_parse(
                    "ORCH_BACKOFF_INITIAL_MS",
                    defaults.retry.initial_backoff_ms,
                )?,
                max_backoff_ms: env_parse("ORCH_BACKOFF_MAX_MS", defaults.retry.max_backoff_ms)?,
            },
            heartbeat: HeartbeatPolicy {
                interval: Duration::from_millis(env_parse(
                    "ORCH_HEARTBEAT_INTERVAL_MS",
                    defaults.heartbeat.interval.as_millis() as u64,
                )?),
                degraded_after_missed: env_parse(
                    "ORCH_DEGRADED_AFTER_MISSED",
                    defaults.heartbeat.degraded_after_missed,
                )?,
                unreachable_after_missed: env_parse(
                    "ORCH_UNREACHABLE_AFTER_MISSED",
                    defaults.heartbeat.unreachable_after_missed,
                )?,
            },
            visibility_timeout: Duration::from_millis(env_parse(
                "ORCH_QUEUE_VISIBILITY_TIMEOUT_MS",
                defaults.visibility_timeout.as_millis() as u64,
            )?),
            queue_journal: queue_journal_from_env(defaults.queue_journal)?,
            notify_timeout: Duration::from_millis(env_parse(
                "ORCH_NOTIFY_TIMEOUT_MS",
                defaults.notify_timeout.as_millis() as u64,
            )?),
            latency_sample_capacity: env_parse(
                "ORCH_LATENCY_SAMPLE_CAPACITY",
                defaults.latency_sample_capacity,
            )?,
            room_retention: defaults.room_retention,
            sip_only: env_parse("ORCH_SIP_ONLY", defaults.sip_only)?,
            static_workers,
        };

        config.validate().map_err(DispatchError::InvalidConfig)?;
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.dispatch_consumers == 0 {
            return Err("dispatch_consumers must be > 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err("initial backoff cannot exceed max backoff".to_string());
        }

        if self.heartbeat.interval.is_zero() {
            return Err("heartbeat interval must be > 0".to_string());
        }

        if self.heartbeat.unreachable_after_missed <= self.heartbeat.degraded_after_missed {
            return Err(
                "unreachable_after_missed must exceed degraded_after_missed".to_string(),
            );
        }

        // A notification must resolve before its worker can be declared
        // unreachable and its rooms handed to someone else.
        if self.notify_timeout >= self.heartbeat.unreachable_after() {
            return Err(format!(
                "notify_timeout ({:?}) must be shorter than the unreachable threshold ({:?})",
                self.notify_timeout,
                self.heartbeat.unreachable_after()
            ));
        }

        if self.latency_sample_capacity == 0 {
            return Err("latency_sample_capacity must be > 0".to_string());
        }

        if let Some(worker) = self.static_workers.iter().find(|w| w.max_capacity == 0) {
            return Err(format!("worker '{}' must have capacity >= 1", worker.worker_id));
        }

        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `ORCH_QUEUE_BACKEND=memory` opts out of the journal; `ORCH_QUEUE_JOURNAL`
/// moves it.
fn queue_journal_from_env(default: Option<PathBuf>) -> Result<Option<PathBuf>> {
    let backend = env::var("ORCH_QUEUE_BACKEND").unwrap_or_default();
    match backend.trim().to_ascii_lowercase().as_str() {
        "memory" => return Ok(None),
        "" | "journal" => {}
        other => {
            return Err(DispatchError::InvalidConfig(format!(
                "ORCH_QUEUE_BACKEND must be 'journal' or 'memory', got '{}'",
                other
            )));
        }
    }
    Ok(env::var("ORCH_QUEUE_JOURNAL")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .or(default))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| DispatchError::InvalidConfig(format!("{} has an invalid value", key))),
        _ => Ok(default),
    }
}
