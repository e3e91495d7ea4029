use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::{DispatchError, DispatchJob, EventType, LifecycleEvent, Result, RoomState};
use crate::queue::DispatchQueue;
use crate::rooms::{Admission, RoomTable};
use crate::stats::StatsAggregator;

/// What ingestion did with one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Enqueued { room_id: String },
    DuplicateIgnored { room_id: String, state: RoomState },
    Ignored { reason: String },
}

/// Turns lifecycle events into at most one dispatch job per live room.
pub struct EventIngester {
    rooms: Arc<RoomTable>,
    queue: Arc<dyn DispatchQueue>,
    stats: Arc<StatsAggregator>,
    sip_only: bool,
}

impl EventIngester {
    pub fn new(
        rooms: Arc<RoomTable>,
        queue: Arc<dyn DispatchQueue>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            rooms,
            queue,
            stats,
            sip_only: false,
        }
    }

    pub fn sip_only(mut self, sip_only: bool) -> Self {
        self.sip_only = sip_only;
        self
    }

    pub async fn ingest(&self, event: LifecycleEvent) -> Result<IngestOutcome> {
        let room_id = event.room_id.trim();
        let identity = event.participant_identity.trim();
        if room_id.is_empty() || identity.is_empty() {
            self.stats.record_malformed();
            return Err(DispatchError::MalformedEvent(
                "room_id and participant_identity are required".to_string(),
            ));
        }

        if event.event_type != EventType::ParticipantJoined {
            self.stats.record_ignored();
            debug!(room_id, event_type = event.event_type.as_str(), "event ignored");
            return Ok(IngestOutcome::Ignored {
                reason: format!("event '{}' does not start a dispatch", event.event_type.as_str()),
            });
        }

        if self.sip_only
            && let Some(kind) = event.participant_kind.as_deref()
            && !kind.eq_ignore_ascii_case("sip")
        {
            self.stats.record_ignored();
            return Ok(IngestOutcome::Ignored {
                reason: format!("participant kind '{}' is not SIP", kind),
            });
        }

        match self.rooms.admit(room_id, identity)? {
            Admission::Duplicate(state) => {
                self.stats.record_duplicate();
                debug!(room_id, %state, "duplicate join ignored");
                Ok(IngestOutcome::DuplicateIgnored {
                    room_id: room_id.to_string(),
                    state,
                })
            }
            Admission::Created(room) => {
                let job = DispatchJob::new(&room.room_id, &room.participant_identity);
                if let Err(err) = self.queue.enqueue(job).await {
                    warn!(room_id, error = %err, "enqueue failed, marking room failed");
                    if let Err(fail_err) = self.rooms.fail(room_id) {
                        warn!(room_id, error = %fail_err, "could not mark room failed");
                    }
                    return Err(err);
                }
                info!(room_id, participant_identity = identity, "dispatch job enqueued");
                Ok(IngestOutcome::Enqueued {
                    room_id: room_id.to_string(),
                })
            }
        }
    }

    /// Accepts a raw webhook body in either the provider or the flat shape.
    pub async fn ingest_webhook(&self, body: &[u8]) -> Result<IngestOutcome> {
        let event = serde_json::from_slice::<Value>(body)
            .map_err(|err| DispatchError::MalformedEvent(format!("invalid JSON: {}", err)))
            .and_then(|payload| normalize_webhook(&payload));
        match event {
            Ok(event) => self.ingest(event).await,
            Err(err) => {
                self.stats.record_malformed();
                Err(err)
            }
        }
    }
}

/// Normalizes a webhook payload into a [`LifecycleEvent`].
///
/// Provider shape: `{"event", "room": {"name"}, "participant": {"identity", "kind"}, "createdAt"}`.
/// Flat shape: `{"room_id", "participant_identity", "event_type", "timestamp"}`.
pub fn normalize_webhook(payload: &Value) -> Result<LifecycleEvent> {
    let object = payload
        .as_object()
        .ok_or_else(|| DispatchError::MalformedEvent("payload must be a JSON object".to_string()))?;

    let (event_type, room_id, identity, kind, timestamp) = if object.contains_key("event") {
        (
            str_at(payload, &["event"]),
            str_at(payload, &["room", "name"]),
            str_at(payload, &["participant", "identity"]),
            str_at(payload, &["participant", "kind"]),
            payload.get("createdAt"),
        )
    } else {
        (
            str_at(payload, &["event_type"]),
            str_at(payload, &["room_id"]),
            str_at(payload, &["participant_identity"]),
            str_at(payload, &["participant_kind"]),
            payload.get("timestamp"),
        )
    };

    let event_type =
        event_type.ok_or_else(|| DispatchError::MalformedEvent("missing event type".to_string()))?;
    let room_id = room_id
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| DispatchError::MalformedEvent("missing room id".to_string()))?;
    let identity = identity.unwrap_or_default();

    Ok(LifecycleEvent {
        room_id: room_id.to_string(),
        participant_identity: identity.to_string(),
        event_type: EventType::from(event_type),
        timestamp: timestamp.and_then(parse_timestamp),
        participant_kind: kind.map(str::to_string),
    })
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_str)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
            .or_else(|| raw.parse::<i64>().ok().and_then(|secs| Utc.timestamp_opt(secs, 0).single())),
        _ => None,
    }
}
