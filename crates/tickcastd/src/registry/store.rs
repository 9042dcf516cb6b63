//! Per-feed cohort storage and the top-level registry.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use tickcast_core::{FeedType, GroupKey, Interval, SessionId, SessionRef};
use tickcast_protocol::SessionCounts;

use super::group::GroupState;

// ============================================================================
// Feed Groups
// ============================================================================

/// All scheduler state for one feed.
pub struct FeedGroups {
    feed: FeedType,

    /// Serializes cohort creation, timer attachment, retirement and reaping.
    structure: Arc<Mutex<()>>,

    /// GroupKey → Interval → cohort
    groups: DashMap<GroupKey, DashMap<Interval, Arc<GroupState>>>,

    /// Every session of the feed, active or passive
    global: DashMap<SessionId, SessionRef>,

    /// Which cohort each passive session belongs to
    memberships: DashMap<SessionId, Arc<GroupState>>,
}

impl FeedGroups {
    pub fn new(feed: FeedType) -> Self {
        Self {
            feed,
            structure: Arc::new(Mutex::new(())),
            groups: DashMap::new(),
            global: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn feed(&self) -> &FeedType {
        &self.feed
    }

    /// Locks structural changes for this feed.
    pub fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock()
    }

    // ------------------------------------------------------------------
    // Cohorts
    // ------------------------------------------------------------------

    /// Returns the cohort for `(key, interval)`, creating an empty one if absent.
    ///
    /// The cohort may be reaped again before anything joins it; [`join`]
    /// re-attaches it in that case.
    ///
    /// [`join`]: FeedGroups::join
    pub fn get_or_create_group(&self, key: GroupKey, interval: Interval) -> Arc<GroupState> {
        let structure = self.structure.lock();
        self.get_or_create_locked(&structure, key, interval)
    }

    pub(crate) fn get_or_create_locked(
        &self,
        _structure: &MutexGuard<'_, ()>,
        key: GroupKey,
        interval: Interval,
    ) -> Arc<GroupState> {
        let by_interval = self.groups.entry(key.clone()).or_default();
        let group = by_interval
            .entry(interval)
            .or_insert_with(|| {
                debug!(feed = %self.feed, group_key = %key, interval = %interval, "Created cohort");
                Arc::new(GroupState::new(
                    self.feed.clone(),
                    key.clone(),
                    interval,
                    Arc::clone(&self.structure),
                ))
            })
            .value()
            .clone();
        group
    }

    /// Returns the listed cohort for `group`'s slot, putting `group` back
    /// if a reap removed it in the meantime.
    fn attach_locked(
        &self,
        _structure: &MutexGuard<'_, ()>,
        group: &Arc<GroupState>,
    ) -> Arc<GroupState> {
        let by_interval = self.groups.entry(group.key().clone()).or_default();
        let listed = by_interval
            .entry(group.interval())
            .or_insert_with(|| {
                debug!(
                    feed = %self.feed,
                    group_key = %group.key(),
                    interval = %group.interval(),
                    "Re-attached reaped cohort"
                );
                Arc::clone(group)
            })
            .value()
            .clone();
        listed
    }

    pub fn group(&self, key: &GroupKey, interval: Interval) -> Option<Arc<GroupState>> {
        let by_interval = self.groups.get(key)?;
        let group = by_interval.get(&interval).map(|g| Arc::clone(g.value()));
        group
    }

    /// Snapshot of every cohort of this feed.
    pub fn all_groups(&self) -> Vec<Arc<GroupState>> {
        let mut groups = Vec::new();
        for by_interval in self.groups.iter() {
            for group in by_interval.value().iter() {
                groups.push(Arc::clone(group.value()));
            }
        }
        groups
    }

    pub fn group_count(&self) -> usize {
        let mut count = 0;
        for by_interval in self.groups.iter() {
            count += by_interval.value().len();
        }
        count
    }

    /// Removes the cohort if it has no sessions and cancels its timer. Drops
    /// the GroupKey level too once its last interval is gone.
    pub fn remove_if_empty(&self, key: &GroupKey, interval: Interval) -> bool {
        let structure = self.structure.lock();
        self.remove_if_empty_locked(&structure, key, interval)
    }

    fn remove_if_empty_locked(
        &self,
        _structure: &MutexGuard<'_, ()>,
        key: &GroupKey,
        interval: Interval,
    ) -> bool {
        let removed = match self.groups.get(key) {
            Some(by_interval) => by_interval.remove_if(&interval, |_, group| group.is_empty()),
            None => None,
        };
        let Some((_, group)) = removed else {
            return false;
        };
        self.groups.remove_if(key, |_, by_interval| by_interval.is_empty());
        if let Some(timer) = group.take_timer() {
            timer.cancel(false);
        }
        true
    }

    /// Cancels the timer of every empty cohort (letting an in-flight tick
    /// finish) and removes the cohort. Returns the number reaped.
    pub fn reap_empty_groups(&self) -> usize {
        let structure = self.structure.lock();

        let mut reaped = 0;
        for group in self.all_groups() {
            if !group.is_empty() {
                continue;
            }
            if self.remove_if_empty_locked(&structure, group.key(), group.interval()) {
                reaped += 1;
                debug!(
                    feed = %self.feed,
                    group_key = %group.key(),
                    interval = %group.interval(),
                    "Reaped empty cohort"
                );
            }
        }
        reaped
    }

    // ------------------------------------------------------------------
    // Global set
    // ------------------------------------------------------------------

    pub fn add_global(&self, session: SessionRef) -> bool {
        self.global.insert(session.id().clone(), session).is_none()
    }

    pub fn remove_global(&self, id: &SessionId) -> Option<SessionRef> {
        self.global.remove(id).map(|(_, session)| session)
    }

    pub fn contains_global(&self, id: &SessionId) -> bool {
        self.global.contains_key(id)
    }

    pub fn global_len(&self) -> usize {
        self.global.len()
    }

    // ------------------------------------------------------------------
    // Memberships
    // ------------------------------------------------------------------

    /// Puts `session` into `group`, moving it out of any previous cohort.
    ///
    /// Returns the cohort the session actually joined: the one listed for
    /// `group`'s key and interval, so a joined session is never left in a
    /// cohort that sweeps and status cannot see.
    pub fn join(&self, session: SessionRef, group: &Arc<GroupState>) -> Arc<GroupState> {
        let structure = self.structure.lock();
        self.join_locked(&structure, session, group)
    }

    pub(crate) fn join_locked(
        &self,
        structure: &MutexGuard<'_, ()>,
        session: SessionRef,
        group: &Arc<GroupState>,
    ) -> Arc<GroupState> {
        let group = self.attach_locked(structure, group);
        let id = session.id().clone();
        group.add_session(session);

        let previous = self.memberships.insert(id.clone(), Arc::clone(&group));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &group) {
                previous.remove_session(&id);
                debug!(
                    feed = %self.feed,
                    session_id = %id,
                    from = %previous.key(),
                    to = %group.key(),
                    "Session moved between cohorts"
                );
            }
        }
        group
    }

    /// Removes the session from its cohort, if it has one.
    pub fn leave(&self, id: &SessionId) -> Option<Arc<GroupState>> {
        let (_, group) = self.memberships.remove(id)?;
        group.remove_session(id);
        Some(group)
    }

    /// Drops the membership record only if it still points at `group`.
    pub fn forget_membership(&self, id: &SessionId, group: &Arc<GroupState>) {
        self.memberships
            .remove_if(id, |_, member_of| Arc::ptr_eq(member_of, group));
    }

    pub fn membership(&self, id: &SessionId) -> Option<Arc<GroupState>> {
        self.memberships.get(id).map(|g| Arc::clone(g.value()))
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Open sessions across all cohorts.
    pub fn passive_open_count(&self) -> usize {
        self.all_groups().iter().map(|group| group.open_count()).sum()
    }

    pub fn counts(&self) -> SessionCounts {
        SessionCounts::from_total(self.global_len(), self.passive_open_count())
    }
}

// ============================================================================
// Group Registry
// ============================================================================

/// Top-level registry shared by every feed service.
#[derive(Default)]
pub struct GroupRegistry {
    feeds: DashMap<FeedType, Arc<FeedGroups>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `feed`, creating it on first use.
    pub fn feed(&self, feed: &FeedType) -> Arc<FeedGroups> {
        if let Some(existing) = self.feeds.get(feed) {
            return Arc::clone(existing.value());
        }
        let groups = self
            .feeds
            .entry(feed.clone())
            .or_insert_with(|| Arc::new(FeedGroups::new(feed.clone())))
            .value()
            .clone();
        groups
    }

    pub fn existing_feed(&self, feed: &FeedType) -> Option<Arc<FeedGroups>> {
        self.feeds.get(feed).map(|f| Arc::clone(f.value()))
    }

    /// Every feed seen so far, ordered by name.
    pub fn feeds(&self) -> Vec<Arc<FeedGroups>> {
        let mut feeds: Vec<Arc<FeedGroups>> =
            self.feeds.iter().map(|f| Arc::clone(f.value())).collect();
        feeds.sort_by(|a, b| a.feed().cmp(b.feed()));
        feeds
    }

    pub fn get_or_create_group(
        &self,
        feed: &FeedType,
        key: GroupKey,
        interval: Interval,
    ) -> Arc<GroupState> {
        self.feed(feed).get_or_create_group(key, interval)
    }

    pub fn all_groups(&self, feed: &FeedType) -> Vec<Arc<GroupState>> {
        self.existing_feed(feed)
            .map(|groups| groups.all_groups())
            .unwrap_or_default()
    }

    pub fn remove_if_empty(&self, feed: &FeedType, key: &GroupKey, interval: Interval) -> bool {
        match self.existing_feed(feed) {
            Some(groups) => groups.remove_if_empty(key, interval),
            None => false,
        }
    }

    /// Reaps empty cohorts of every feed. Returns the total reaped.
    pub fn reap_all(&self) -> usize {
        self.feeds()
            .iter()
            .map(|groups| groups.reap_empty_groups())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;

    fn feed() -> FeedType {
        FeedType::new("quotes")
    }

    #[test]
    fn test_get_or_create_returns_same_group() {
        let registry = GroupRegistry::new();
        let a = registry.get_or_create_group(&feed(), GroupKey::new("zone=A"), Interval::from_secs(5));
        let b = registry.get_or_create_group(&feed(), GroupKey::new("zone=A"), Interval::from_secs(5));
        let c = registry.get_or_create_group(&feed(), GroupKey::new("zone=A"), Interval::from_secs(10));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.all_groups(&feed()).len(), 2);
        assert!(a.is_empty());
    }

    #[test]
    fn test_feeds_are_isolated() {
        let registry = GroupRegistry::new();
        let other = FeedType::new("alarms");
        registry.get_or_create_group(&feed(), GroupKey::new("k"), Interval::from_secs(1));
        registry.get_or_create_group(&other, GroupKey::new("k"), Interval::from_secs(1));

        assert_eq!(registry.all_groups(&feed()).len(), 1);
        assert_eq!(registry.all_groups(&other).len(), 1);
        assert_eq!(registry.feeds().len(), 2);
        assert!(registry.all_groups(&FeedType::new("missing")).is_empty());
    }

    #[test]
    fn test_remove_if_empty_keeps_populated_groups() {
        let registry = GroupRegistry::new();
        let groups = registry.feed(&feed());
        let key = GroupKey::new("zone=A");
        let group = groups.get_or_create_group(key.clone(), Interval::from_secs(5));
        groups.join(MockSession::shared("s1"), &group);

        assert!(!registry.remove_if_empty(&feed(), &key, Interval::from_secs(5)));
        groups.leave(&SessionId::new("s1"));
        assert!(registry.remove_if_empty(&feed(), &key, Interval::from_secs(5)));
        assert!(groups.group(&key, Interval::from_secs(5)).is_none());
        assert_eq!(groups.group_count(), 0);
    }

    #[test]
    fn test_join_moves_between_groups() {
        let groups = FeedGroups::new(feed());
        let a = groups.get_or_create_group(GroupKey::new("a"), Interval::from_secs(1));
        let b = groups.get_or_create_group(GroupKey::new("b"), Interval::from_secs(1));
        let session = MockSession::shared("s1");

        groups.join(session.clone(), &a);
        groups.join(session, &b);

        assert!(a.is_empty());
        assert_eq!(b.len(), 1);
        let member_of = groups.membership(&SessionId::new("s1")).unwrap();
        assert!(Arc::ptr_eq(&member_of, &b));
    }

    #[test]
    fn test_forget_membership_only_matching_group() {
        let groups = FeedGroups::new(feed());
        let a = groups.get_or_create_group(GroupKey::new("a"), Interval::from_secs(1));
        let b = groups.get_or_create_group(GroupKey::new("b"), Interval::from_secs(1));
        let id = SessionId::new("s1");
        groups.join(MockSession::shared("s1"), &b);

        groups.forget_membership(&id, &a);
        assert!(groups.membership(&id).is_some());
        groups.forget_membership(&id, &b);
        assert!(groups.membership(&id).is_none());
    }

    #[test]
    fn test_passive_count_ignores_closed_sessions() {
        let groups = FeedGroups::new(feed());
        let group = groups.get_or_create_group(GroupKey::new("a"), Interval::from_secs(1));
        let open = MockSession::new("open");
        let closed = MockSession::new("closed");
        closed.set_open(false);

        for session in [open.clone(), closed.clone()] {
            groups.add_global(session.clone());
            groups.join(session, &group);
        }
        groups.add_global(MockSession::shared("active"));

        let counts = groups.counts();
        assert_eq!(counts.total_sessions, 3);
        assert_eq!(counts.passive_sessions, 1);
        assert_eq!(counts.active_sessions, 2);
    }

    #[test]
    fn test_join_reattaches_cohort_reaped_after_creation() {
        let groups = FeedGroups::new(feed());
        let key = GroupKey::new("zone=A");
        let created = groups.get_or_create_group(key.clone(), Interval::from_secs(1));
        assert_eq!(groups.reap_empty_groups(), 1);

        let joined = groups.join(MockSession::shared("s1"), &created);

        let listed = groups.group(&key, Interval::from_secs(1)).unwrap();
        assert!(Arc::ptr_eq(&joined, &listed));
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_concurrent_create_and_reap_never_orphans_members() {
        let registry = Arc::new(GroupRegistry::new());
        let groups = registry.feed(&feed());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reaper = {
            let groups = Arc::clone(&groups);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    groups.reap_empty_groups();
                }
            })
        };

        let mut orphaned = 0;
        for i in 0..20_000 {
            let key = GroupKey::new(format!("zone={}", i % 8));
            let id = format!("s{i}");
            let group = registry.get_or_create_group(&feed(), key.clone(), Interval::from_secs(1));
            let joined = groups.join(MockSession::shared(&id), &group);

            let listed = groups.group(&key, Interval::from_secs(1));
            if !listed.is_some_and(|listed| Arc::ptr_eq(&listed, &joined)) {
                orphaned += 1;
            }
            groups.leave(&SessionId::new(id));
        }

        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        reaper.join().unwrap();
        assert_eq!(orphaned, 0);
    }

    #[test]
    fn test_reap_empty_groups() {
        let groups = FeedGroups::new(feed());
        let empty = groups.get_or_create_group(GroupKey::new("empty"), Interval::from_secs(1));
        let full = groups.get_or_create_group(GroupKey::new("full"), Interval::from_secs(1));
        groups.join(MockSession::shared("s1"), &full);

        assert_eq!(groups.reap_empty_groups(), 1);
        assert!(groups.group(empty.key(), empty.interval()).is_none());
        assert!(groups.group(full.key(), full.interval()).is_some());
        assert_eq!(groups.reap_empty_groups(), 0);
    }
}
