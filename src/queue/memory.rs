use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DispatchQueue, QueueLease, QueueState, wait_for_lease};
use crate::core::{DispatchJob, Result};

/// In-process queue. Lease semantics match [`super::JournalQueue`], but the
/// contents do not survive a restart.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::new(visibility_timeout)),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn enqueue(&self, job: DispatchJob) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            let seq = state.allocate_seq();
            state.insert(seq, job, None);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn enqueue_after(&self, job: DispatchJob, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            let seq = state.allocate_seq();
            state.insert(seq, job, Some(Instant::now() + delay));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueLease>> {
        wait_for_lease(&self.state, &self.notify, wait).await
    }

    async fn ack(&self, lease_id: u64) -> Result<()> {
        self.state.lock()?.ack(lease_id);
        Ok(())
    }

    async fn retry(&self, lease_id: u64, job: DispatchJob, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            state.ack(lease_id);
            let seq = state.allocate_seq();
            state.insert(seq, job, Some(Instant::now() + delay));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.len())
    }
}
