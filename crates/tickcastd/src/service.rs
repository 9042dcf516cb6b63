//! Per-feed connection lifecycle.
//!
//! ```text
//! connect(session, interval, params)
//!        │
//!        ├── None ───────► error text, close, Err(MissingInterval)
//!        ├── Some(0) ────► global set only (active mode)
//!        └── Some(n) ────► global set
//!                          ┌─ structural lock ──────────────────┐
//!                          │ get-or-create cohort (key, n)      │
//!                          │ join cohort                        │
//!                          │ no timer? schedule Broadcaster     │
//!                          └────────────────────────────────────┘
//!                          reap sweep (per config)
//! ```
//!
//! Disconnect is lock-free: it removes the session from the global set and
//! its cohort, then interrupts any task parked in the session's properties.
//! An emptied cohort's timer retires on its next tick or is reaped.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use tickcast_core::{
    send_if_open, ConnectParams, FeedType, GroupKey, Interval, Session, SessionRef,
};
use tickcast_protocol::SessionCounts;

use crate::broadcaster::Broadcaster;
use crate::config::{ReapScope, SchedulerConfig};
use crate::registry::{FeedGroups, GroupRegistry, GroupState};
use crate::source::{render_message, SharedSource};
use crate::timer::{TimerCoordinator, TimerHandle};

/// How a connect was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Pulls on demand; tracked only in the feed's global set
    Active,
    /// Receives pushes from the cohort's timer
    Passive { key: GroupKey, interval: Interval },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("interval is required for passive connections to feed {feed}")]
    MissingInterval { feed: FeedType },
}

/// Interval broadcasting for one feed.
pub struct IntervalBroadcastService {
    feed: FeedType,
    source: SharedSource,
    registry: Arc<GroupRegistry>,
    groups: Arc<FeedGroups>,
    timers: TimerCoordinator,
    config: SchedulerConfig,
}

impl IntervalBroadcastService {
    pub fn new(
        feed: FeedType,
        source: SharedSource,
        registry: Arc<GroupRegistry>,
        timers: TimerCoordinator,
        config: SchedulerConfig,
    ) -> Self {
        let groups = registry.feed(&feed);
        Self {
            feed,
            source,
            registry,
            groups,
            timers,
            config,
        }
    }

    pub fn feed(&self) -> &FeedType {
        &self.feed
    }

    pub fn groups(&self) -> &Arc<FeedGroups> {
        &self.groups
    }

    pub fn counts(&self) -> SessionCounts {
        self.groups.counts()
    }

    /// GroupKey this feed derives from `params`.
    pub fn group_key_for(&self, params: &ConnectParams) -> GroupKey {
        params.group_key(&self.feed, self.config.sort_group_key_params)
    }

    // ========================================================================
    // Connect / Disconnect
    // ========================================================================

    /// Admits a session.
    ///
    /// A missing interval rejects the session: it receives the error text
    /// and is closed, and nothing is recorded for it.
    pub fn connect(
        &self,
        session: SessionRef,
        interval: Option<Interval>,
        params: &ConnectParams,
    ) -> Result<ConnectMode, ConnectError> {
        let Some(interval) = interval else {
            let err = ConnectError::MissingInterval {
                feed: self.feed.clone(),
            };
            if let Err(e) = send_if_open(session.as_ref(), &err.to_string()) {
                debug!(session_id = %session.id(), error = %e, "Could not deliver rejection");
            }
            session.close();
            warn!(feed = %self.feed, session_id = %session.id(), "Rejected connect without interval");
            return Err(err);
        };

        if interval.is_active() {
            self.groups.leave(session.id());
            self.groups.add_global(Arc::clone(&session));
            self.log_counts("Active session connected", &session);
            return Ok(ConnectMode::Active);
        }

        let key = self.group_key_for(params);
        self.groups.add_global(Arc::clone(&session));
        {
            let structure = self.groups.lock_structure();
            let group = self.groups.get_or_create_locked(&structure, key.clone(), interval);
            let group = self.groups.join_locked(&structure, Arc::clone(&session), &group);
            if !group.has_timer() {
                let handle = self.start_timer(&group);
                group.set_timer(handle);
            }
        }
        info!(
            feed = %self.feed,
            session_id = %session.id(),
            group_key = %key,
            interval = %interval,
            "Passive session joined cohort"
        );
        self.log_counts("Passive session connected", &session);

        if self.config.reap.on_connect {
            self.sweep();
        }

        Ok(ConnectMode::Passive { key, interval })
    }

    /// Forgets a session and interrupts its parked tasks.
    ///
    /// Returns whether the session was known to this feed.
    pub fn disconnect(&self, session: &dyn Session) -> bool {
        let id = session.id();
        let was_global = self.groups.remove_global(id).is_some();
        let was_member = self.groups.leave(id).is_some();
        let cancelled = session.properties().cancel_all(true);

        let counts = self.groups.counts();
        info!(
            feed = %self.feed,
            session_id = %id,
            cancelled_tasks = cancelled,
            open = counts.total_sessions,
            active = counts.active_sessions,
            passive = counts.passive_sessions,
            "Session disconnected"
        );
        was_global || was_member
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Removes this feed's empty cohorts. Returns the number reaped.
    pub fn reap_empty_groups(&self) -> usize {
        let reaped = self.groups.reap_empty_groups();
        if reaped > 0 {
            debug!(feed = %self.feed, reaped, "Reaped empty cohorts");
        }
        reaped
    }

    /// Computes one message on demand.
    pub fn pull(&self) -> String {
        render_message(self.source.as_ref())
    }

    /// Starts the legacy per-session sender for `session`.
    pub fn schedule_session_feed(&self, session: SessionRef, interval: Interval) -> TimerHandle {
        self.timers
            .schedule_session_task(session, interval.period(), Arc::clone(&self.source))
    }

    fn sweep(&self) -> usize {
        match self.config.reap.scope {
            ReapScope::Feed => self.reap_empty_groups(),
            ReapScope::AllFeeds => self.registry.reap_all(),
        }
    }

    fn start_timer(&self, group: &Arc<GroupState>) -> TimerHandle {
        let broadcaster = Broadcaster::new(
            Arc::clone(group),
            Arc::clone(&self.groups),
            Arc::clone(&self.source),
        );
        debug!(
            feed = %self.feed,
            group_key = %group.key(),
            interval = %group.interval(),
            "Starting cohort timer"
        );
        self.timers.schedule(group.interval().period(), move || {
            broadcaster.tick();
        })
    }

    fn log_counts(&self, message: &str, session: &SessionRef) {
        let counts = self.groups.counts();
        info!(
            feed = %self.feed,
            session_id = %session.id(),
            open = counts.total_sessions,
            active = counts.active_sessions,
            passive = counts.passive_sessions,
            "{message}"
        );
    }
}
