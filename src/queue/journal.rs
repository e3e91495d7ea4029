use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{Level, event, warn};

use super::{DispatchQueue, QueueLease, QueueState, wait_for_lease};
use crate::core::{DispatchError, DispatchJob, Result};

/// Rewrite the journal after this many acknowledgements.
const DEFAULT_COMPACT_EVERY_ACKS: usize = 1_024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueue {
        seq: u64,
        job: DispatchJob,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_before: Option<DateTime<Utc>>,
    },
    Ack {
        seq: u64,
    },
}

/// Durable queue backed by an append-only JSON-lines journal.
///
/// Every enqueue and acknowledgement is appended and synced before it takes
/// effect in memory. Opening the journal replays it: any job without an
/// `ack` record, including one that was leased when the process died, is
/// pending again.
pub struct JournalQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
    /// Also serializes journal writes with the in-memory update they describe.
    file: AsyncMutex<File>,
    acks_since_compaction: AtomicUsize,
    compact_every_acks: usize,
}

impl JournalQueue {
    pub async fn open(path: impl AsRef<Path>, visibility_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut state = QueueState::new(visibility_timeout);
        let replayed = replay(&path).await?;
        let now = Utc::now();
        let pending = replayed.len();
        for (seq, (job, not_before)) in replayed {
            state.observe_seq(seq);
            let due = not_before
                .and_then(|at| at.signed_duration_since(now).to_std().ok())
                .map(|delay| Instant::now() + delay);
            state.insert(seq, job, due);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        event!(Level::INFO, path = %path.display(), pending, "dispatch journal opened");

        Ok(Self {
            path,
            state: Mutex::new(state),
            notify: Notify::new(),
            file: AsyncMutex::new(file),
            acks_since_compaction: AtomicUsize::new(0),
            compact_every_acks: DEFAULT_COMPACT_EVERY_ACKS,
        })
    }

    pub fn with_compaction_every(mut self, acks: usize) -> Self {
        self.compact_every_acks = acks.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(file: &mut File, records: &[JournalRecord]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|err| DispatchError::QueueError(format!("encode journal record: {}", err)))?;
            buf.push(b'\n');
        }
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn push(&self, job: DispatchJob, delay: Option<Duration>) -> Result<()> {
        let mut file = self.file.lock().await;
        let seq = self.state.lock()?.allocate_seq();
        let not_before = match delay {
            Some(delay) => Some(Utc::now() + to_chrono(delay)?),
            None => None,
        };
        Self::append(
            &mut file,
            &[JournalRecord::Enqueue {
                seq,
                job: job.clone(),
                not_before,
            }],
        )
        .await?;
        self.state
            .lock()?
            .insert(seq, job, delay.map(|delay| Instant::now() + delay));
        drop(file);

        self.notify.notify_one();
        Ok(())
    }

    async fn note_ack(&self) -> Result<()> {
        let acks = self.acks_since_compaction.fetch_add(1, Ordering::SeqCst) + 1;
        if acks >= self.compact_every_acks {
            self.compact().await?;
        }
        Ok(())
    }

    /// Rewrites the journal to hold only live jobs.
    pub async fn compact(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        let live = self.state.lock()?.live_entries(Instant::now());
        let now = Utc::now();

        let mut records = Vec::with_capacity(live.len());
        for entry in live {
            let not_before = match entry.delay {
                Some(delay) => Some(now + to_chrono(delay)?),
                None => None,
            };
            records.push(JournalRecord::Enqueue {
                seq: entry.seq,
                job: entry.job,
                not_before,
            });
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        for record in &records {
            serde_json::to_writer(&mut tmp, record)
                .map_err(|err| DispatchError::QueueError(format!("encode journal record: {}", err)))?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| DispatchError::IoError(err.to_string()))?;

        *file = OpenOptions::new().append(true).open(&self.path).await?;
        self.acks_since_compaction.store(0, Ordering::SeqCst);
        event!(Level::DEBUG, live = records.len(), "dispatch journal compacted");
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for JournalQueue {
    async fn enqueue(&self, job: DispatchJob) -> Result<()> {
        self.push(job, None).await
    }

    async fn enqueue_after(&self, job: DispatchJob, delay: Duration) -> Result<()> {
        self.push(job, Some(delay)).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueLease>> {
        wait_for_lease(&self.state, &self.notify, wait).await
    }

    async fn ack(&self, lease_id: u64) -> Result<()> {
        {
            let mut file = self.file.lock().await;
            Self::append(&mut file, &[JournalRecord::Ack { seq: lease_id }]).await?;
            self.state.lock()?.ack(lease_id);
        }
        self.note_ack().await
    }

    async fn retry(&self, lease_id: u64, job: DispatchJob, delay: Duration) -> Result<()> {
        {
            let mut file = self.file.lock().await;
            let seq = self.state.lock()?.allocate_seq();
            let not_before = Utc::now() + to_chrono(delay)?;
            Self::append(
                &mut file,
                &[
                    JournalRecord::Ack { seq: lease_id },
                    JournalRecord::Enqueue {
                        seq,
                        job: job.clone(),
                        not_before: Some(not_before),
                    },
                ],
            )
            .await?;

            let mut state = self.state.lock()?;
            state.ack(lease_id);
            state.insert(seq, job, Some(Instant::now() + delay));
        }
        self.notify.notify_one();
        self.note_ack().await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.len())
    }
}

async fn replay(path: &Path) -> Result<BTreeMap<u64, (DispatchJob, Option<DateTime<Utc>>)>> {
    let mut live = BTreeMap::new();
    if !tokio::fs::try_exists(path).await? {
        return Ok(live);
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(&line) {
            Ok(JournalRecord::Enqueue {
                seq,
                job,
                not_before,
            }) => {
                live.insert(seq, (job, not_before));
            }
            Ok(JournalRecord::Ack { seq }) => {
                live.remove(&seq);
            }
            Err(err) => {
                // A torn final write after a crash is expected; skip it.
                warn!(line = line_no, error = %err, "skipping unreadable journal record");
            }
        }
    }
    Ok(live)
}

fn to_chrono(delay: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(delay).map_err(|err| DispatchError::QueueError(err.to_string()))
}
