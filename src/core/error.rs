use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Worker '{0}' is already registered with in-flight load above the requested capacity")]
    DuplicateWorker(String),

    #[error("Worker '{0}' not found")]
    WorkerNotFound(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Heartbeat stale for worker '{0}'")]
    HealthCheckStale(String),

    #[error("Dispatch attempts exhausted for room '{room_id}' after {attempts} attempts")]
    DispatchAttemptsExhausted { room_id: String, attempts: u32 },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Room '{0}' not found")]
    RoomNotFound(String),

    #[error("Room '{room_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        room_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Dispatch target error: {0}")]
    TargetError(String),
}

impl DispatchError {
    /// Transient conditions are retried locally and never surfaced to the event source.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded(_) | Self::WorkerUnavailable(_) | Self::HealthCheckStale(_)
        )
    }

    /// Stable machine-readable code used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateWorker(_) => "duplicate_worker",
            Self::WorkerNotFound(_) => "worker_not_found",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::WorkerUnavailable(_) => "worker_unavailable",
            Self::HealthCheckStale(_) => "health_check_stale",
            Self::DispatchAttemptsExhausted { .. } => "dispatch_attempts_exhausted",
            Self::MalformedEvent(_) => "malformed_event",
            Self::RoomNotFound(_) => "room_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidConfig(_) => "invalid_config",
            Self::QueueError(_) => "queue_error",
            Self::LockError(_) => "lock_error",
            Self::IoError(_) => "io_error",
            Self::TargetError(_) => "target_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl<T> From<std::sync::PoisonError<T>> for DispatchError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
