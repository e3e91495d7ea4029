use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Pending,
    Queued,
    Dispatched,
    Active,
    Completed,
    Failed,
}

impl RoomState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Rooms that hold a worker reservation.
    pub fn is_assigned(self) -> bool {
        matches!(self, Self::Dispatched | Self::Active)
    }

    pub fn can_transition_to(self, next: RoomState) -> bool {
        use RoomState::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Dispatched) => true,
            (Dispatched, Queued) | (Active, Queued) => true,
            (Dispatched, Active) => true,
            (Dispatched, Completed) | (Active, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Dispatched => "DISPATCHED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call session, keyed by the externally assigned `room_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRoom {
    pub room_id: String,
    pub participant_identity: String,
    pub state: RoomState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispatch_attempts: u32,
    pub assigned_worker_id: Option<String>,
    /// Bumped on every assignment. A notification result only applies to
    /// the assignment it was sent for.
    #[serde(default)]
    pub assignment: u64,
    /// Set once the first assignment of this session was delivered.
    #[serde(default)]
    pub dispatch_confirmed: bool,
}

impl CallRoom {
    pub fn new(room_id: impl Into<String>, participant_identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            room_id: room_id.into(),
            participant_identity: participant_identity.into(),
            state: RoomState::Pending,
            created_at: now,
            updated_at: now,
            dispatch_attempts: 0,
            assigned_worker_id: None,
            assignment: 0,
            dispatch_confirmed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unreachable => "UNREACHABLE",
        };
        f.write_str(label)
    }
}

/// A session-processing capacity unit as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub max_capacity: u32,
    pub current_load: u32,
    pub health: WorkerHealth,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Notification URL; `None` means the worker accepts assignments in-process.
    pub endpoint: Option<String>,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, max_capacity: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_capacity,
            current_load: 0,
            health: WorkerHealth::Healthy,
            last_heartbeat_at: Utc::now(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_capacity
    }

    pub fn is_assignable(&self) -> bool {
        self.health == WorkerHealth::Healthy && self.has_capacity()
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load as f64 / self.max_capacity.max(1) as f64
    }
}

/// A unit of queued dispatch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub room_id: String,
    pub participant_identity: String,
    pub enqueued_at: DateTime<Utc>,
    /// Failed notification attempts; bounded by the attempt ceiling.
    pub attempts: u32,
    /// Requeues caused by missing capacity; unbounded.
    #[serde(default)]
    pub requeues: u32,
}

impl DispatchJob {
    pub fn new(room_id: impl Into<String>, participant_identity: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_identity: participant_identity.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
            requeues: 0,
        }
    }

    pub fn backoff_exponent(&self) -> u32 {
        self.attempts.saturating_add(self.requeues)
    }

    pub fn latency_ms(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now.signed_duration_since(self.enqueued_at);
        elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or_else(|| elapsed.num_milliseconds() as f64)
            .max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ParticipantJoined,
    ParticipantLeft,
    RoomStarted,
    RoomFinished,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ParticipantJoined => "participant_joined",
            Self::ParticipantLeft => "participant_left",
            Self::RoomStarted => "room_started",
            Self::RoomFinished => "room_finished",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for EventType {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "participant_joined" => Self::ParticipantJoined,
            "participant_left" => Self::ParticipantLeft,
            "room_started" => Self::RoomStarted,
            "room_finished" => Self::RoomFinished,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// A normalized call-lifecycle event from the telephony bridge or the manual surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub room_id: String,
    pub participant_identity: String,
    pub event_type: EventType,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participant_kind: Option<String>,
}

impl LifecycleEvent {
    pub fn joined(room_id: impl Into<String>, participant_identity: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_identity: participant_identity.into(),
            event_type: EventType::ParticipantJoined,
            timestamp: Some(Utc::now()),
            participant_kind: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}
