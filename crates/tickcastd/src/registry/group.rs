//! A single cohort: sessions sharing (FeedType, GroupKey, Interval).

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tickcast_core::{FeedType, GroupKey, Interval, SessionId, SessionRef};

use crate::timer::TimerHandle;

/// Sessions of one cohort plus the recurring timer that feeds them.
pub struct GroupState {
    feed: FeedType,
    key: GroupKey,
    interval: Interval,
    sessions: DashMap<SessionId, SessionRef>,
    timer: Mutex<Option<TimerHandle>>,
    /// Structural mutex of the owning feed.
    structure: Arc<Mutex<()>>,
}

impl GroupState {
    pub(crate) fn new(
        feed: FeedType,
        key: GroupKey,
        interval: Interval,
        structure: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            feed,
            key,
            interval,
            sessions: DashMap::new(),
            timer: Mutex::new(None),
            structure,
        }
    }

    pub fn feed(&self) -> &FeedType {
        &self.feed
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Locks structural changes for the owning feed.
    pub fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock()
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Adds a session. Returns false if it was already a member.
    pub(crate) fn add_session(&self, session: SessionRef) -> bool {
        self.sessions
            .insert(session.id().clone(), session)
            .is_none()
    }

    pub fn remove_session(&self, id: &SessionId) -> Option<SessionRef> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Point-in-time copy of the member handles.
    pub fn sessions_snapshot(&self) -> Vec<SessionRef> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Member ids, sorted for stable status output.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Members whose transport is still open.
    pub fn open_count(&self) -> usize {
        self.sessions_snapshot()
            .iter()
            .filter(|session| session.is_open())
            .count()
    }

    // ------------------------------------------------------------------
    // Timer slot
    // ------------------------------------------------------------------

    pub fn has_timer(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer.lock().clone()
    }

    /// Stores a timer, returning the previous one (if any).
    pub fn set_timer(&self, handle: TimerHandle) -> Option<TimerHandle> {
        self.timer.lock().replace(handle)
    }

    pub fn take_timer(&self) -> Option<TimerHandle> {
        self.timer.lock().take()
    }
}

impl fmt::Debug for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupState")
            .field("feed", &self.feed)
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("sessions", &self.sessions.len())
            .field("timer", &self.has_timer())
            .finish()
    }
}
