//! Dispatch queue: a FIFO of [`DispatchJob`]s with competing-consumer leases.
//!
//! `dequeue` hands a job to exactly one consumer as a [`QueueLease`]. The job
//! stays owned by the queue until the lease is acknowledged; a lease that is
//! not acknowledged within the visibility timeout is delivered again
//! (at-least-once). `retry` acknowledges a lease and re-enqueues the job
//! behind a delay, which is how backoff is expressed.

pub mod journal;
pub mod memory;

pub use journal::JournalQueue;
pub use memory::MemoryQueue;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{DispatchJob, Result};

/// A job delivered to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLease {
    pub lease_id: u64,
    pub job: DispatchJob,
    /// 1 on first delivery, higher after visibility-timeout redelivery.
    pub delivery: u32,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, job: DispatchJob) -> Result<()>;

    async fn enqueue_after(&self, job: DispatchJob, delay: Duration) -> Result<()>;

    /// Waits up to `wait` for a job to become available.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueLease>>;

    async fn ack(&self, lease_id: u64) -> Result<()>;

    /// Acknowledges `lease_id` and makes `job` visible again after `delay`.
    async fn retry(&self, lease_id: u64, job: DispatchJob, delay: Duration) -> Result<()>;

    /// Unacknowledged jobs: ready, delayed and leased.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) seq: u64,
    pub(crate) job: DispatchJob,
    pub(crate) deliveries: u32,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    entry: Entry,
}

#[derive(Debug)]
struct Leased {
    deadline: Instant,
    entry: Entry,
}

/// Where a live entry currently sits; used for journal compaction.
#[derive(Debug, Clone)]
pub(crate) struct LiveEntry {
    pub(crate) seq: u64,
    pub(crate) job: DispatchJob,
    pub(crate) delay: Option<Duration>,
}

/// Lease bookkeeping shared by every queue backend.
#[derive(Debug)]
pub(crate) struct QueueState {
    ready: VecDeque<Entry>,
    delayed: Vec<Delayed>,
    leased: HashMap<u64, Leased>,
    visibility_timeout: Duration,
    next_seq: u64,
}

impl QueueState {
    pub(crate) fn new(visibility_timeout: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            leased: HashMap::new(),
            visibility_timeout,
            next_seq: 1,
        }
    }

    pub(crate) fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn observe_seq(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq + 1);
    }

    pub(crate) fn insert(&mut self, seq: u64, job: DispatchJob, due: Option<Instant>) {
        let entry = Entry {
            seq,
            job,
            deliveries: 0,
        };
        match due {
            Some(due) if due > Instant::now() => self.delayed.push(Delayed { due, entry }),
            _ => self.ready.push_back(entry),
        }
    }

    fn promote(&mut self, now: Instant) {
        if self.delayed.iter().any(|delayed| delayed.due <= now) {
            let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
                .into_iter()
                .partition(|delayed| delayed.due <= now);
            self.delayed = pending;
            due.sort_by(|a, b| a.due.cmp(&b.due).then(a.entry.seq.cmp(&b.entry.seq)));
            self.ready.extend(due.into_iter().map(|delayed| delayed.entry));
        }

        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, leased)| leased.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        if !expired.is_empty() {
            let mut reclaimed: Vec<Entry> = expired
                .into_iter()
                .filter_map(|seq| self.leased.remove(&seq))
                .map(|leased| leased.entry)
                .collect();
            // Redelivered jobs go ahead of newer work, oldest first.
            reclaimed.sort_by(|a, b| b.seq.cmp(&a.seq));
            for entry in reclaimed {
                self.ready.push_front(entry);
            }
        }
    }

    pub(crate) fn pop(&mut self, now: Instant) -> Option<QueueLease> {
        self.promote(now);
        let mut entry = self.ready.pop_front()?;
        entry.deliveries += 1;
        let lease = QueueLease {
            lease_id: entry.seq,
            job: entry.job.clone(),
            delivery: entry.deliveries,
        };
        self.leased.insert(
            entry.seq,
            Leased {
                deadline: now + self.visibility_timeout,
                entry,
            },
        );
        Some(lease)
    }

    /// Removes the job wherever it sits. Returns false for unknown ids.
    pub(crate) fn ack(&mut self, seq: u64) -> bool {
        if self.leased.remove(&seq).is_some() {
            return true;
        }
        if let Some(pos) = self.ready.iter().position(|entry| entry.seq == seq) {
            self.ready.remove(pos);
            return true;
        }
        if let Some(pos) = self.delayed.iter().position(|d| d.entry.seq == seq) {
            self.delayed.remove(pos);
            return true;
        }
        false
    }

    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|delayed| delayed.due);
        let leased = self.leased.values().map(|leased| leased.deadline);
        delayed.chain(leased).min()
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.leased.len()
    }

    pub(crate) fn live_entries(&self, now: Instant) -> Vec<LiveEntry> {
        let ready = self.ready.iter().map(|entry| (entry, None));
        let leased = self.leased.values().map(|leased| (&leased.entry, None));
        let delayed = self
            .delayed
            .iter()
            .map(|delayed| (&delayed.entry, Some(delayed.due.saturating_duration_since(now))));

        let mut live: Vec<LiveEntry> = ready
            .chain(leased)
            .chain(delayed)
            .map(|(entry, delay)| LiveEntry {
                seq: entry.seq,
                job: entry.job.clone(),
                delay,
            })
            .collect();
        live.sort_by_key(|entry| entry.seq);
        live
    }
}

/// Blocks until a lease can be taken from `state` or `wait` elapses.
pub(crate) async fn wait_for_lease(
    state: &Mutex<QueueState>,
    notify: &Notify,
    wait: Duration,
) -> Result<Option<QueueLease>> {
    let deadline = Instant::now() + wait;
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next_wakeup = {
            let mut state = state.lock()?;
            if let Some(lease) = state.pop(Instant::now()) {
                return Ok(Some(lease));
            }
            state.next_wakeup()
        };

        if Instant::now() >= deadline {
            return Ok(None);
        }
        let until = next_wakeup.map_or(deadline, |wakeup| wakeup.min(deadline));
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(until) => {}
        }
    }
}
