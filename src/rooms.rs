use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{CallRoom, DispatchError, Result, RoomState};

/// Result of admitting a join for a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new session was created and is now QUEUED.
    Created(CallRoom),
    /// A non-terminal session already exists for the room.
    Duplicate(RoomState),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomCounts {
    pub pending: usize,
    pub queued: usize,
    pub dispatched: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RoomCounts {
    /// Rooms currently holding a worker reservation.
    pub fn active_calls(&self) -> usize {
        self.dispatched + self.active
    }
}

/// Call-room state keyed by `room_id`.
///
/// Every transition is a check-and-set under one write lock, which is what
/// keeps a room from being admitted twice or assigned to two workers.
#[derive(Default)]
pub struct RoomTable {
    rooms: RwLock<HashMap<String, CallRoom>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a QUEUED session unless a non-terminal one already exists.
    pub fn admit(&self, room_id: &str, participant_identity: &str) -> Result<Admission> {
        let mut rooms = self.rooms.write()?;
        if let Some(existing) = rooms.get(room_id)
            && !existing.state.is_terminal()
        {
            return Ok(Admission::Duplicate(existing.state));
        }

        let mut room = CallRoom::new(room_id, participant_identity);
        transition(&mut room, RoomState::Queued)?;
        rooms.insert(room_id.to_string(), room.clone());
        Ok(Admission::Created(room))
    }

    /// Recreates a QUEUED room for a job whose room is unknown, which is the
    /// case for jobs replayed from a journal after a restart.
    pub fn restore(&self, room_id: &str, participant_identity: &str) -> Result<bool> {
        let mut rooms = self.rooms.write()?;
        if rooms.contains_key(room_id) {
            return Ok(false);
        }
        let mut room = CallRoom::new(room_id, participant_identity);
        transition(&mut room, RoomState::Queued)?;
        rooms.insert(room_id.to_string(), room);
        Ok(true)
    }

    pub fn get(&self, room_id: &str) -> Result<Option<CallRoom>> {
        Ok(self.rooms.read()?.get(room_id).cloned())
    }

    pub fn is_dispatchable(&self, room_id: &str) -> Result<bool> {
        Ok(self
            .rooms
            .read()?
            .get(room_id)
            .is_some_and(|room| room.state == RoomState::Queued))
    }

    /// QUEUED → DISPATCHED, bound to `worker_id`. Returns the assignment
    /// generation, or `None` if the room was not QUEUED at the time of the call.
    pub fn assign(&self, room_id: &str, worker_id: &str) -> Result<Option<u64>> {
        let mut rooms = self.rooms.write()?;
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(None);
        };
        if room.state != RoomState::Queued {
            return Ok(None);
        }
        transition(room, RoomState::Dispatched)?;
        room.assigned_worker_id = Some(worker_id.to_string());
        room.assignment += 1;
        Ok(Some(room.assignment))
    }

    /// Marks a delivered assignment. Returns `None` when the room no longer
    /// belongs to that assignment, otherwise whether this was the first
    /// delivery for the session.
    pub fn confirm_assignment(
        &self,
        room_id: &str,
        worker_id: &str,
        assignment: u64,
    ) -> Result<Option<bool>> {
        let mut rooms = self.rooms.write()?;
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(None);
        };
        if !room.state.is_assigned() || !holds(room, worker_id, assignment) {
            return Ok(None);
        }
        let first = !room.dispatch_confirmed;
        room.dispatch_confirmed = true;
        Ok(Some(first))
    }

    /// Undoes an assignment after a failed notification and counts the
    /// attempt. Returns `None`, changing nothing, when the room is no longer
    /// DISPATCHED under that assignment.
    pub fn retry_after_failure(
        &self,
        room_id: &str,
        worker_id: &str,
        assignment: u64,
    ) -> Result<Option<u32>> {
        let mut rooms = self.rooms.write()?;
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(None);
        };
        if room.state != RoomState::Dispatched || !holds(room, worker_id, assignment) {
            return Ok(None);
        }
        transition(room, RoomState::Queued)?;
        room.assigned_worker_id = None;
        room.dispatch_attempts += 1;
        Ok(Some(room.dispatch_attempts))
    }

    /// Records a failed attempt on a room that stays QUEUED.
    pub fn record_attempt(&self, room_id: &str) -> Result<u32> {
        let mut rooms = self.rooms.write()?;
        let room = lookup(&mut rooms, room_id)?;
        room.dispatch_attempts += 1;
        Ok(room.dispatch_attempts)
    }

    /// Moves an assigned room back to QUEUED and returns the worker it held.
    pub fn requeue_for_reassignment(&self, room_id: &str) -> Result<Option<String>> {
        let mut rooms = self.rooms.write()?;
        let room = lookup(&mut rooms, room_id)?;
        if !room.state.is_assigned() {
            return Ok(None);
        }
        transition(room, RoomState::Queued)?;
        Ok(room.assigned_worker_id.take())
    }

    /// DISPATCHED → ACTIVE on the worker's acknowledgement.
    pub fn acknowledge(&self, room_id: &str) -> Result<CallRoom> {
        let mut rooms = self.rooms.write()?;
        let room = lookup(&mut rooms, room_id)?;
        if room.state == RoomState::Active {
            return Ok(room.clone());
        }
        transition(room, RoomState::Active)?;
        Ok(room.clone())
    }

    /// Ends an assigned session. Returns the room and the worker whose
    /// reservation must be released.
    pub fn complete(&self, room_id: &str) -> Result<(CallRoom, Option<String>)> {
        let mut rooms = self.rooms.write()?;
        let room = lookup(&mut rooms, room_id)?;
        transition(room, RoomState::Completed)?;
        let worker = room.assigned_worker_id.clone();
        Ok((room.clone(), worker))
    }

    /// Marks a room FAILED. Returns the worker it held, if any.
    pub fn fail(&self, room_id: &str) -> Result<Option<String>> {
        let mut rooms = self.rooms.write()?;
        let room = lookup(&mut rooms, room_id)?;
        let held = if room.state.is_assigned() {
            room.assigned_worker_id.clone()
        } else {
            None
        };
        transition(room, RoomState::Failed)?;
        Ok(held)
    }

    pub fn rooms_assigned_to(&self, worker_id: &str) -> Result<Vec<CallRoom>> {
        let rooms = self.rooms.read()?;
        let mut assigned: Vec<CallRoom> = rooms
            .values()
            .filter(|room| {
                room.state.is_assigned() && room.assigned_worker_id.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect();
        assigned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(assigned)
    }

    pub fn counts(&self) -> Result<RoomCounts> {
        let rooms = self.rooms.read()?;
        let mut counts = RoomCounts::default();
        for room in rooms.values() {
            match room.state {
                RoomState::Pending => counts.pending += 1,
                RoomState::Queued => counts.queued += 1,
                RoomState::Dispatched => counts.dispatched += 1,
                RoomState::Active => counts.active += 1,
                RoomState::Completed => counts.completed += 1,
                RoomState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Drops terminal rooms last updated before `cutoff`.
    pub fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut rooms = self.rooms.write()?;
        let before = rooms.len();
        rooms.retain(|_, room| !(room.state.is_terminal() && room.updated_at < cutoff));
        Ok(before - rooms.len())
    }
}

fn holds(room: &CallRoom, worker_id: &str, assignment: u64) -> bool {
    room.assignment == assignment && room.assigned_worker_id.as_deref() == Some(worker_id)
}

fn lookup<'a>(rooms: &'a mut HashMap<String, CallRoom>, room_id: &str) -> Result<&'a mut CallRoom> {
    rooms
        .get_mut(room_id)
        .ok_or_else(|| DispatchError::RoomNotFound(room_id.to_string()))
}

fn transition(room: &mut CallRoom, next: RoomState) -> Result<()> {
    if !room.state.can_transition_to(next) {
        return Err(DispatchError::InvalidTransition {
            room_id: room.room_id.clone(),
            from: room.state.to_string(),
            to: next.to_string(),
        });
    }
    room.state = next;
    room.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_admission_is_detected_until_terminal() {
        let table = RoomTable::new();
        assert!(matches!(
            table.admit("r1", "caller").unwrap(),
            Admission::Created(room) if room.state == RoomState::Queued
        ));
        assert_eq!(
            table.admit("r1", "caller").unwrap(),
            Admission::Duplicate(RoomState::Queued)
        );

        table.assign("r1", "w1").unwrap();
        assert_eq!(
            table.admit("r1", "caller").unwrap(),
            Admission::Duplicate(RoomState::Dispatched)
        );

        table.complete("r1").unwrap();
        let readmitted = table.admit("r1", "caller").unwrap();
        assert!(matches!(readmitted, Admission::Created(room) if room.dispatch_attempts == 0));
    }

    #[test]
    fn assign_is_compare_and_set() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();

        assert_eq!(table.assign("r1", "w1").unwrap(), Some(1));
        assert_eq!(table.assign("r1", "w2").unwrap(), None);
        assert_eq!(table.assign("missing", "w1").unwrap(), None);

        let room = table.get("r1").unwrap().unwrap();
        assert_eq!(room.assigned_worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn failed_notification_requeues_and_counts() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();
        let assignment = table.assign("r1", "w1").unwrap().unwrap();

        assert_eq!(table.retry_after_failure("r1", "w1", assignment).unwrap(), Some(1));
        let room = table.get("r1").unwrap().unwrap();
        assert_eq!(room.state, RoomState::Queued);
        assert!(room.assigned_worker_id.is_none());
    }

    #[test]
    fn outdated_assignment_cannot_touch_the_room() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();
        let first = table.assign("r1", "w1").unwrap().unwrap();

        // Reassigned while the first notification was still in flight.
        table.requeue_for_reassignment("r1").unwrap();
        let second = table.assign("r1", "w1").unwrap().unwrap();
        assert_eq!(second, first + 1);

        assert_eq!(table.retry_after_failure("r1", "w1", first).unwrap(), None);
        assert_eq!(table.confirm_assignment("r1", "w1", first).unwrap(), None);
        let room = table.get("r1").unwrap().unwrap();
        assert_eq!(room.state, RoomState::Dispatched);
        assert_eq!(room.assigned_worker_id.as_deref(), Some("w1"));
        assert_eq!(room.dispatch_attempts, 0);

        assert_eq!(table.confirm_assignment("r1", "w1", second).unwrap(), Some(true));
        assert_eq!(table.confirm_assignment("r1", "w2", second).unwrap(), None);
    }

    #[test]
    fn only_the_first_delivery_of_a_session_is_new() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();
        let first = table.assign("r1", "w1").unwrap().unwrap();
        assert_eq!(table.confirm_assignment("r1", "w1", first).unwrap(), Some(true));

        table.requeue_for_reassignment("r1").unwrap();
        let second = table.assign("r1", "w2").unwrap().unwrap();
        assert_eq!(table.confirm_assignment("r1", "w2", second).unwrap(), Some(false));
    }

    #[test]
    fn terminal_rooms_reject_transitions() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();
        table.fail("r1").unwrap();

        assert!(matches!(
            table.acknowledge("r1"),
            Err(DispatchError::InvalidTransition { .. })
        ));
        assert!(matches!(
            table.fail("r1"),
            Err(DispatchError::InvalidTransition { .. })
        ));
        assert_eq!(table.assign("r1", "w1").unwrap(), None);
    }

    #[test]
    fn reassignment_returns_previous_worker() {
        let table = RoomTable::new();
        table.admit("r1", "caller").unwrap();
        table.assign("r1", "w1").unwrap();
        table.acknowledge("r1").unwrap();

        assert_eq!(table.rooms_assigned_to("w1").unwrap().len(), 1);
        assert_eq!(
            table.requeue_for_reassignment("r1").unwrap().as_deref(),
            Some("w1")
        );
        assert!(table.rooms_assigned_to("w1").unwrap().is_empty());
        assert!(table.is_dispatchable("r1").unwrap());
    }

    #[test]
    fn restore_only_fills_unknown_rooms() {
        let table = RoomTable::new();
        assert!(table.restore("r1", "caller").unwrap());
        assert!(!table.restore("r1", "caller").unwrap());
        assert!(table.is_dispatchable("r1").unwrap());

        table.assign("r1", "w1").unwrap();
        assert!(!table.restore("r1", "caller").unwrap());
        assert_eq!(table.get("r1").unwrap().unwrap().state, RoomState::Dispatched);
    }

    #[test]
    fn counts_and_prune() {
        let table = RoomTable::new();
        for id in ["a", "b", "c"] {
            table.admit(id, "caller").unwrap();
        }
        table.assign("a", "w1").unwrap();
        table.assign("b", "w1").unwrap();
        table.acknowledge("b").unwrap();
        table.fail("c").unwrap();

        let counts = table.counts().unwrap();
        assert_eq!(counts.active_calls(), 2);
        assert_eq!(counts.failed, 1);

        let pruned = table
            .prune_terminal(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(table.get("c").unwrap().is_none());
    }
}
