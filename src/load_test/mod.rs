//! Load harness
//!
//! Releases synthetic calls on a linear ramp, at most `max_concurrent` in
//! flight, drives each one through the target's manual-dispatch path and
//! polls the room until it is acknowledged, fails or times out. New calls
//! stop at the end of the sustain window; in-flight calls get a grace
//! period, after which anything still pending is finalized as TIMEOUT.

pub mod report;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::core::{CallOutcome, DispatchError, Result, RoomState};
use crate::orchestrator::Orchestrator;
use crate::schedule::RampSchedule;
use crate::stats::StatsSnapshot;

pub use report::LoadTestReport;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestConfig {
    pub target_calls: u64,
    pub ramp_up: Duration,
    /// New calls are released only within this window.
    pub sustain: Duration,
    pub max_concurrent: usize,
    pub call_timeout: Duration,
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub latency_threshold_ms: f64,
    pub success_threshold_percent: f64,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            target_calls: 100,
            ramp_up: Duration::from_secs(30),
            sustain: Duration::from_secs(5 * 60),
            max_concurrent: 100,
            call_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            progress_interval: Duration::from_secs(10),
            latency_threshold_ms: 600.0,
            success_threshold_percent: 95.0,
        }
    }
}

impl LoadTestConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target_calls == 0 {
            return Err("target_calls must be > 0".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be > 0".to_string());
        }
        if self.sustain.is_zero() {
            return Err("sustain window must be > 0".to_string());
        }
        if self.call_timeout.is_zero() {
            return Err("call_timeout must be > 0".to_string());
        }
        if !(0.0..=100.0).contains(&self.success_threshold_percent) {
            return Err("success threshold must be within 0..=100".to_string());
        }
        if self.latency_threshold_ms <= 0.0 {
            return Err("latency threshold must be > 0".to_string());
        }
        Ok(())
    }
}

/// One synthetic call as observed by the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub dispatch_sent_at: Option<DateTime<Utc>>,
    pub outcome: CallOutcome,
    /// Time from dispatch request to observed acknowledgement.
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

/// A finished run, ordered by `scheduled_at`.
#[derive(Debug, Clone)]
pub struct LoadTestRun {
    pub config: LoadTestConfig,
    pub records: Vec<CallRecord>,
    pub duration: Duration,
}

/// What the harness drives. The HTTP implementation is used against a
/// deployed service; the local one drives an in-process [`Orchestrator`].
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    async fn health(&self) -> Result<()>;

    async fn dispatch(&self, room_id: &str, participant_identity: &str) -> Result<()>;

    /// `None` while the target does not know the room.
    async fn room_state(&self, room_id: &str) -> Result<Option<RoomState>>;

    async fn stats(&self) -> Result<StatsSnapshot>;
}

pub struct HttpTarget {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTarget {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| DispatchError::InvalidConfig(format!("http client: {}", err)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> DispatchError {
    DispatchError::TargetError(format!("transport: {}", err))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DispatchError::TargetError(format!(
        "HTTP {}: {}",
        status.as_u16(),
        body.chars().take(200).collect::<String>()
    )))
}

#[derive(Deserialize)]
struct RoomView {
    state: RoomState,
}

#[async_trait]
impl DispatchTarget for HttpTarget {
    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(transport)?;
        ensure_success(response).await.map(|_| ())
    }

    async fn dispatch(&self, room_id: &str, participant_identity: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/manual/dispatch"))
            .query(&[("room", room_id), ("participant_identity", participant_identity)])
            .send()
            .await
            .map_err(transport)?;
        ensure_success(response).await.map(|_| ())
    }

    async fn room_state(&self, room_id: &str) -> Result<Option<RoomState>> {
        let response = self
            .client
            .get(self.url(&format!("/rooms/{}", room_id)))
            .send()
            .await
            .map_err(transport)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let room: RoomView = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(Some(room.state))
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        let response = self
            .client
            .get(self.url("/stats"))
            .send()
            .await
            .map_err(transport)?;
        ensure_success(response).await?.json().await.map_err(transport)
    }
}

/// Drives an in-process orchestrator; its consumers must be running.
pub struct LocalTarget {
    orchestrator: Orchestrator,
}

impl LocalTarget {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl DispatchTarget for LocalTarget {
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn dispatch(&self, room_id: &str, participant_identity: &str) -> Result<()> {
        self.orchestrator
            .manual_dispatch(room_id, participant_identity)
            .await
            .map(|_| ())
    }

    async fn room_state(&self, room_id: &str) -> Result<Option<RoomState>> {
        match self.orchestrator.room(room_id) {
            Ok(room) => Ok(Some(room.state)),
            Err(DispatchError::RoomNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        self.orchestrator.stats().await
    }
}

#[derive(Debug, Clone)]
struct PendingCall {
    scheduled_at: DateTime<Utc>,
    dispatch_sent_at: Option<DateTime<Utc>>,
}

type PendingCalls = Arc<Mutex<HashMap<String, PendingCall>>>;

pub struct LoadHarness {
    config: LoadTestConfig,
    target: Arc<dyn DispatchTarget>,
}

impl LoadHarness {
    pub fn new(config: LoadTestConfig, target: Arc<dyn DispatchTarget>) -> Result<Self> {
        config.validate().map_err(DispatchError::InvalidConfig)?;
        Ok(Self { config, target })
    }

    pub async fn run(&self) -> Result<LoadTestRun> {
        self.target
            .health()
            .await
            .map_err(|err| DispatchError::TargetError(format!("target is not healthy: {}", err)))?;

        let config = &self.config;
        let schedule = RampSchedule::new(config.target_calls, config.ramp_up);
        let started = Instant::now();
        let stop_at = started + config.sustain;
        let hard_deadline = stop_at + config.grace_period;

        info!(
            target_calls = config.target_calls,
            ramp_up_s = config.ramp_up.as_secs_f64(),
            sustain_s = config.sustain.as_secs_f64(),
            max_concurrent = config.max_concurrent,
            "load test started"
        );

        let gate = Arc::new(Semaphore::new(config.max_concurrent));
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let finished = Arc::new(AtomicU64::new(0));
        let progress = self.spawn_progress(schedule, started, pending.clone(), finished.clone());

        let mut calls = JoinSet::new();
        let mut issued = 0u64;
        while issued < schedule.target() {
            let now = Instant::now();
            if now >= stop_at {
                break;
            }
            let release_at = started + schedule.release_time(issued + 1);
            if release_at > now {
                sleep_until(release_at.min(stop_at)).await;
                continue;
            }

            // The gate suspends the scheduler, never a running call.
            let permit = tokio::select! {
                permit = gate.clone().acquire_owned() => permit
                    .map_err(|err| DispatchError::QueueError(format!("concurrency gate: {}", err)))?,
                _ = sleep_until(stop_at) => break,
            };

            issued += 1;
            let call_id = call_id();
            let scheduled_at = Utc::now();
            pending.lock()?.insert(
                call_id.clone(),
                PendingCall {
                    scheduled_at,
                    dispatch_sent_at: None,
                },
            );

            let target = Arc::clone(&self.target);
            let pending = Arc::clone(&pending);
            let finished = Arc::clone(&finished);
            let timing = CallTiming::from(config);
            calls.spawn(async move {
                let record = run_call(target.as_ref(), &pending, call_id, scheduled_at, timing).await;
                finished.fetch_add(1, Ordering::Relaxed);
                drop(permit);
                record
            });
        }
        info!(issued, "call release finished");

        let mut records = Vec::with_capacity(issued as usize);
        let mut cancelled = false;
        loop {
            tokio::select! {
                joined = calls.join_next() => match joined {
                    Some(Ok(record)) => records.push(record),
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => warn!(error = %err, "call task failed"),
                    None => break,
                },
                _ = sleep_until(hard_deadline), if !cancelled => {
                    warn!(in_flight = calls.len(), "grace period over, cancelling in-flight calls");
                    calls.abort_all();
                    cancelled = true;
                }
            }
        }
        progress.abort();

        let leftovers: Vec<(String, PendingCall)> = pending.lock()?.drain().collect();
        for (call_id, call) in leftovers {
            records.push(CallRecord {
                call_id,
                scheduled_at: call.scheduled_at,
                dispatch_sent_at: call.dispatch_sent_at,
                outcome: CallOutcome::Timeout,
                latency_ms: None,
                error: Some("timeout: force-finalized after grace period".to_string()),
            });
        }
        records.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));

        let duration = started.elapsed();
        info!(
            calls = records.len(),
            duration_s = duration.as_secs_f64(),
            "load test finished"
        );
        Ok(LoadTestRun {
            config: config.clone(),
            records,
            duration,
        })
    }

    fn spawn_progress(
        &self,
        schedule: RampSchedule,
        started: Instant,
        pending: PendingCalls,
        finished: Arc<AtomicU64>,
    ) -> tokio::task::JoinHandle<()> {
        let target = Arc::clone(&self.target);
        let interval = self.config.progress_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let in_flight = pending.lock().map(|calls| calls.len()).unwrap_or_default();
                let expected = schedule.cumulative_at(started.elapsed());
                match target.stats().await {
                    Ok(stats) => info!(
                        expected,
                        finished = finished.load(Ordering::Relaxed),
                        in_flight,
                        active_calls = stats.active_calls,
                        queue_length = stats.queue_length,
                        "load test progress"
                    ),
                    Err(err) => warn!(
                        expected,
                        finished = finished.load(Ordering::Relaxed),
                        in_flight,
                        error = %err,
                        "load test progress (stats unavailable)"
                    ),
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CallTiming {
    call_timeout: Duration,
    poll_interval: Duration,
}

impl From<&LoadTestConfig> for CallTiming {
    fn from(config: &LoadTestConfig) -> Self {
        Self {
            call_timeout: config.call_timeout,
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
        }
    }
}

/// `load-test-{unix_ms}-{6 chars}`
fn call_id() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("load-test-{}-{}", Utc::now().timestamp_millis(), suffix)
}

async fn run_call(
    target: &dyn DispatchTarget,
    pending: &Mutex<HashMap<String, PendingCall>>,
    call_id: String,
    scheduled_at: DateTime<Utc>,
    timing: CallTiming,
) -> CallRecord {
    let room_id = format!("call-{}", call_id);
    let identity = format!("caller-{}", call_id);

    let dispatch_sent_at = Utc::now();
    if let Ok(mut calls) = pending.lock()
        && let Some(call) = calls.get_mut(&call_id)
    {
        call.dispatch_sent_at = Some(dispatch_sent_at);
    }
    let sent = Instant::now();
    let deadline = sent + timing.call_timeout;

    let (outcome, latency_ms, error) = match target.dispatch(&room_id, &identity).await {
        Err(err) => (CallOutcome::Failure, None, Some(call_error(err))),
        Ok(()) => {
            let mut last_error = None;
            loop {
                match target.room_state(&room_id).await {
                    Ok(Some(RoomState::Dispatched | RoomState::Active | RoomState::Completed)) => {
                        let latency = sent.elapsed().as_secs_f64() * 1000.0;
                        break (CallOutcome::Success, Some(latency), None);
                    }
                    Ok(Some(RoomState::Failed)) => {
                        break (
                            CallOutcome::Failure,
                            None,
                            Some("dispatch failed: room FAILED".to_string()),
                        );
                    }
                    Ok(_) => {}
                    Err(err) => last_error = Some(call_error(err)),
                }

                let now = Instant::now();
                if now >= deadline {
                    let mut message = format!(
                        "timeout: no acknowledgement within {}ms",
                        timing.call_timeout.as_millis()
                    );
                    if let Some(err) = last_error {
                        message.push_str(&format!(" (last poll error: {})", err));
                    }
                    break (CallOutcome::Timeout, None, Some(message));
                }
                sleep_until((now + timing.poll_interval).min(deadline)).await;
            }
        }
    };

    if let Ok(mut calls) = pending.lock() {
        calls.remove(&call_id);
    }
    debug!(call_id = %call_id, ?outcome, "call finished");

    CallRecord {
        call_id,
        scheduled_at,
        dispatch_sent_at: Some(dispatch_sent_at),
        outcome,
        latency_ms,
        error,
    }
}

/// Target errors already carry their own prefix (`HTTP 503: ...`).
fn call_error(err: DispatchError) -> String {
    match err {
        DispatchError::TargetError(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Acknowledges every room after `ack_after` polls; rejects ids listed in `reject`.
    struct ScriptedTarget {
        ack_after: usize,
        polls: Mutex<HashMap<String, usize>>,
        dispatched: AtomicUsize,
        reject_every: usize,
    }

    impl ScriptedTarget {
        fn new(ack_after: usize, reject_every: usize) -> Self {
            Self {
                ack_after,
                polls: Mutex::new(HashMap::new()),
                dispatched: AtomicUsize::new(0),
                reject_every,
            }
        }
    }

    #[async_trait]
    impl DispatchTarget for ScriptedTarget {
        async fn health(&self) -> Result<()> {
            Ok(())
        }

        async fn dispatch(&self, _room_id: &str, _identity: &str) -> Result<()> {
            let n = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_every > 0 && n % self.reject_every == 0 {
                return Err(DispatchError::TargetError("HTTP 503: saturated".into()));
            }
            Ok(())
        }

        async fn room_state(&self, room_id: &str) -> Result<Option<RoomState>> {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(room_id.to_string()).or_default();
            *count += 1;
            if *count > self.ack_after {
                Ok(Some(RoomState::Dispatched))
            } else {
                Ok(Some(RoomState::Queued))
            }
        }

        async fn stats(&self) -> Result<StatsSnapshot> {
            Ok(StatsSnapshot::default())
        }
    }

    fn quick_config(calls: u64) -> LoadTestConfig {
        LoadTestConfig {
            target_calls: calls,
            ramp_up: Duration::from_millis(200),
            sustain: Duration::from_secs(2),
            max_concurrent: 8,
            call_timeout: Duration::from_millis(500),
            grace_period: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            progress_interval: Duration::from_secs(10),
            ..LoadTestConfig::default()
        }
    }

    #[test]
    fn call_ids_follow_the_naming_scheme() {
        let id = call_id();
        assert!(id.starts_with("load-test-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let target: Arc<dyn DispatchTarget> = Arc::new(ScriptedTarget::new(0, 0));
        let config = LoadTestConfig {
            target_calls: 0,
            ..LoadTestConfig::default()
        };
        assert!(LoadHarness::new(config, target.clone()).is_err());
        let config = LoadTestConfig {
            max_concurrent: 0,
            ..LoadTestConfig::default()
        };
        assert!(LoadHarness::new(config, target).is_err());
    }

    #[tokio::test]
    async fn every_scheduled_call_gets_one_record() {
        let target = Arc::new(ScriptedTarget::new(2, 10));
        let harness = LoadHarness::new(quick_config(30), target.clone()).unwrap();
        let run = harness.run().await.unwrap();

        assert_eq!(run.records.len(), 30);
        let failures = run
            .records
            .iter()
            .filter(|record| record.outcome == CallOutcome::Failure)
            .count();
        assert_eq!(failures, 3);
        assert!(run.records.iter().any(|record| {
            record.error.as_deref() == Some("HTTP 503: saturated")
        }));
        assert!(run.records.iter().all(|record| match record.outcome {
            CallOutcome::Success => record.latency_ms.is_some(),
            _ => record.error.is_some(),
        }));
        assert!(
            run.records
                .windows(2)
                .all(|pair| pair[0].scheduled_at <= pair[1].scheduled_at)
        );
    }

    #[tokio::test]
    async fn in_flight_calls_never_exceed_the_cap() {
        /// Tracks calls between dispatch and the acknowledging poll.
        #[derive(Default)]
        struct Counting {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl DispatchTarget for Counting {
            async fn health(&self) -> Result<()> {
                Ok(())
            }
            async fn dispatch(&self, _: &str, _: &str) -> Result<()> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(15)).await;
                Ok(())
            }
            async fn room_state(&self, _: &str) -> Result<Option<RoomState>> {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(RoomState::Dispatched))
            }
            async fn stats(&self) -> Result<StatsSnapshot> {
                Ok(StatsSnapshot::default())
            }
        }

        let target = Arc::new(Counting::default());
        let config = LoadTestConfig {
            ramp_up: Duration::ZERO,
            max_concurrent: 4,
            ..quick_config(40)
        };
        let run = LoadHarness::new(config, target.clone())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(run.records.len(), 40);
        assert!(
            run.records
                .iter()
                .all(|record| record.outcome == CallOutcome::Success)
        );
        assert_eq!(target.peak.load(Ordering::SeqCst), 4);
        assert_eq!(target.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn calls_are_released_along_the_ramp() {
        let ramp_up = Duration::from_millis(500);
        let config = LoadTestConfig {
            ramp_up,
            max_concurrent: 10,
            ..quick_config(10)
        };
        let schedule = RampSchedule::new(config.target_calls, ramp_up);
        let run = LoadHarness::new(config, Arc::new(ScriptedTarget::new(0, 0)))
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(run.records.len(), 10);
        let first = run.records[0].scheduled_at;
        let slack = chrono::Duration::milliseconds(5);
        for (index, record) in run.records.iter().enumerate() {
            let expected = schedule.release_time(index as u64 + 1) - schedule.release_time(1);
            let expected = chrono::Duration::from_std(expected).unwrap();
            assert!(
                record.scheduled_at - first + slack >= expected,
                "call {index} released {:?} after the first, expected at least {:?}",
                record.scheduled_at - first,
                expected
            );
        }
        let span = run.records[9].scheduled_at - first;
        assert!(span >= chrono::Duration::milliseconds(440), "span {span:?}");
    }

    #[tokio::test]
    async fn unacknowledged_calls_time_out() {
        let target = Arc::new(ScriptedTarget::new(usize::MAX, 0));
        let mut config = quick_config(4);
        config.call_timeout = Duration::from_millis(50);
        let run = LoadHarness::new(config, target).unwrap().run().await.unwrap();

        assert_eq!(run.records.len(), 4);
        assert!(
            run.records
                .iter()
                .all(|record| record.outcome == CallOutcome::Timeout)
        );
    }

    #[tokio::test]
    async fn grace_period_force_finalizes_stuck_calls() {
        struct Stuck;

        #[async_trait]
        impl DispatchTarget for Stuck {
            async fn health(&self) -> Result<()> {
                Ok(())
            }
            async fn dispatch(&self, _: &str, _: &str) -> Result<()> {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            async fn room_state(&self, _: &str) -> Result<Option<RoomState>> {
                Ok(None)
            }
            async fn stats(&self) -> Result<StatsSnapshot> {
                Ok(StatsSnapshot::default())
            }
        }

        let config = LoadTestConfig {
            target_calls: 3,
            ramp_up: Duration::ZERO,
            sustain: Duration::from_millis(100),
            grace_period: Duration::from_millis(100),
            max_concurrent: 3,
            ..LoadTestConfig::default()
        };
        let started = std::time::Instant::now();
        let run = LoadHarness::new(config, Arc::new(Stuck)).unwrap().run().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(run.records.len(), 3);
        assert!(run.records.iter().all(|record| {
            record.outcome == CallOutcome::Timeout && record.dispatch_sent_at.is_some()
        }));
    }

    #[tokio::test]
    async fn unhealthy_target_aborts_the_run() {
        struct Down;

        #[async_trait]
        impl DispatchTarget for Down {
            async fn health(&self) -> Result<()> {
                Err(DispatchError::TargetError("connection refused".into()))
            }
            async fn dispatch(&self, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
            async fn room_state(&self, _: &str) -> Result<Option<RoomState>> {
                Ok(None)
            }
            async fn stats(&self) -> Result<StatsSnapshot> {
                Ok(StatsSnapshot::default())
            }
        }

        let harness = LoadHarness::new(quick_config(5), Arc::new(Down)).unwrap();
        let err = harness.run().await.unwrap_err();
        assert_eq!(err.code(), "target_error");
    }
}
