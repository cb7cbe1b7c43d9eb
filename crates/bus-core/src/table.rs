//! The connection table: every multiplexed session and its monotone state
//! machine. Lookups are linear scans — the table is expected to stay small
//! per node under backpressure — with periodic compaction to reclaim
//! tombstoned (CLOSED) slots.

use bus_timing::Nanos;

use crate::{
    arena::SlotId,
    envelope::{MsgFlags, MsgOp},
    uuid::Uuid,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    HalfOpen = 0,
    Open = 1,
    HalfClosed = 2,
    Closed = 3,
}

impl SessionState {
    fn bump(self) -> Self {
        match self {
            Self::HalfOpen => Self::Open,
            Self::Open => Self::HalfClosed,
            Self::HalfClosed => Self::Closed,
            Self::Closed => Self::Closed,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub uuid: Uuid,
    pub north: Option<SlotId>,
    pub south: Option<SlotId>,
    pub state: SessionState,
    pub timestamps: [Nanos; 4],
    tombstoned: bool,
}

impl Session {
    pub fn new(uuid: Uuid, north: Option<SlotId>, south: Option<SlotId>, now: Nanos) -> Self {
        let mut timestamps = [Nanos::default(); 4];
        timestamps[SessionState::HalfOpen as usize] = now;
        Self { uuid, north, south, state: SessionState::HalfOpen, timestamps, tombstoned: false }
    }

    /// Applies one state transition per the table in §4.7: ABORT+STOP jumps
    /// straight to CLOSED from any state; otherwise the state only ever
    /// advances by one step per STOP, and any other op moves HALF_OPEN to
    /// OPEN.
    pub fn apply(&mut self, op: MsgOp, flags: MsgFlags, now: Nanos) {
        let next = if flags.contains(MsgFlags::ABORT) && op == MsgOp::Stop {
            SessionState::Closed
        } else if self.state == SessionState::HalfOpen {
            SessionState::Open
        } else if op == MsgOp::Stop {
            self.state.bump()
        } else {
            return;
        };
        bus_utils::safe_assert!(next >= self.state, "session state regressed: {:?} -> {:?}", self.state, next);
        if next > self.state {
            self.state = next;
            self.timestamps[next as usize] = now;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

const SMALL_THRESHOLD: usize = 32;
const LARGE_THRESHOLD: usize = 1024;
const SLACK_NUM: usize = 1;
const SLACK_DEN: usize = 8;

#[derive(Default)]
pub struct ConnectionTable {
    sessions: Vec<Session>,
    live_count: usize,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) -> usize {
        self.live_count += 1;
        self.sessions.push(session);
        self.sessions.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&Session> {
        self.sessions.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Session> {
        self.sessions.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| !s.tombstoned)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut().filter(|s| !s.tombstoned)
    }

    /// Live sessions paired with their real (stable) index into the table,
    /// for callers that need to come back with `get`/`get_mut`/`tombstone`.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &Session)> {
        self.sessions.iter().enumerate().filter(|(_, s)| !s.tombstoned)
    }

    pub fn find_by_north(&self, north: SlotId) -> impl Iterator<Item = &Session> {
        self.iter().filter(move |s| s.north == Some(north))
    }

    pub fn find_by_north_mut(&mut self, north: SlotId) -> impl Iterator<Item = &mut Session> {
        self.iter_mut().filter(move |s| s.north == Some(north))
    }

    pub fn find_by_south(&self, south: SlotId) -> impl Iterator<Item = &Session> {
        self.iter().filter(move |s| s.south == Some(south))
    }

    pub fn find_by_uuid_and_south(&self, uuid: &Uuid, south: SlotId) -> Option<&Session> {
        self.iter().find(|s| s.south == Some(south) && s.uuid.same_node(uuid))
    }

    pub fn find_by_uuid_and_south_mut(&mut self, uuid: &Uuid, south: SlotId) -> Option<&mut Session> {
        self.iter_mut().find(|s| s.south == Some(south) && s.uuid.same_node(uuid))
    }

    /// Removes a CLOSED session's slot in place without shifting other
    /// indices, so stray duplicate frames can still find it (as CLOSED) once
    /// more before the next compaction.
    pub fn tombstone(&mut self, idx: usize) {
        if let Some(session) = self.sessions.get_mut(idx) {
            if !session.tombstoned {
                session.tombstoned = true;
                self.live_count -= 1;
            }
        }
    }

    /// Rebuilds the backing vec once churn exceeds slack, dropping
    /// tombstoned sessions and reclaiming memory.
    pub fn maybe_compact(&mut self) {
        let threshold = if self.sessions.len() >= LARGE_THRESHOLD { LARGE_THRESHOLD } else { SMALL_THRESHOLD };
        let dead = self.sessions.len() - self.live_count;
        if self.sessions.len() < threshold || dead * SLACK_DEN < threshold * SLACK_NUM {
            return;
        }
        self.sessions.retain(|s| !s.tombstoned);
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(i: u32) -> SlotId {
        SlotId { index: i, generation: 0 }
    }

    #[test]
    fn state_advances_monotonically() {
        let mut s = Session::new(Uuid::new_v4(), Some(slot(1)), Some(slot(2)), Nanos(0));
        assert_eq!(s.state, SessionState::HalfOpen);
        s.apply(MsgOp::Data, MsgFlags::empty(), Nanos(1));
        assert_eq!(s.state, SessionState::Open);
        s.apply(MsgOp::Stop, MsgFlags::empty(), Nanos(2));
        assert_eq!(s.state, SessionState::HalfClosed);
        s.apply(MsgOp::Stop, MsgFlags::empty(), Nanos(3));
        assert_eq!(s.state, SessionState::Closed);
    }

    #[test]
    fn abort_forces_closed_from_any_state() {
        let mut s = Session::new(Uuid::new_v4(), None, None, Nanos(0));
        s.apply(MsgOp::Stop, MsgFlags::ABORT, Nanos(1));
        assert_eq!(s.state, SessionState::Closed);

        let mut s2 = Session::new(Uuid::new_v4(), None, None, Nanos(0));
        s2.apply(MsgOp::Data, MsgFlags::empty(), Nanos(1));
        s2.apply(MsgOp::Stop, MsgFlags::ABORT, Nanos(2));
        assert_eq!(s2.state, SessionState::Closed);
        // idempotent
        s2.apply(MsgOp::Stop, MsgFlags::ABORT, Nanos(3));
        assert_eq!(s2.state, SessionState::Closed);
    }

    #[test]
    fn find_by_uuid_and_south_matches_node_bytes_only() {
        let mut table = ConnectionTable::new();
        let uuid = Uuid::new_v4();
        let south = slot(5);
        table.insert(Session::new(uuid, Some(slot(1)), Some(south), Nanos(0)));
        let bumped = uuid.bump_clock_seq();
        assert!(table.find_by_uuid_and_south(&bumped, south).is_some());
    }

    #[test]
    fn tombstone_drops_from_iteration_but_keeps_index() {
        let mut table = ConnectionTable::new();
        let idx = table.insert(Session::new(Uuid::new_v4(), None, None, Nanos(0)));
        assert_eq!(table.live_count(), 1);
        table.tombstone(idx);
        assert_eq!(table.live_count(), 0);
        assert!(table.iter().next().is_none());
        assert!(table.get(idx).is_some());
    }

    #[test]
    fn compaction_reclaims_tombstones_past_threshold() {
        let mut table = ConnectionTable::new();
        for _ in 0..40 {
            let idx = table.insert(Session::new(Uuid::new_v4(), None, None, Nanos(0)));
            table.tombstone(idx);
        }
        table.maybe_compact();
        assert_eq!(table.sessions.len(), 0);
    }
}
