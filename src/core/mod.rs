pub mod error;
pub mod types;

pub use error::{DispatchError, Result};
pub use types::{
    CallOutcome, CallRoom, DispatchJob, EventType, LifecycleEvent, RoomState, Worker, WorkerHealth,
};
