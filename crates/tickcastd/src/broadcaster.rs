//! Per-tick fan-out for one cohort.
//!
//! A [`Broadcaster`] is bound to exactly one [`GroupState`] when its timer
//! is scheduled. Each tick computes the message once and pushes it to every
//! session that was a member when the tick started.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tickcast_core::{Session, SessionId};

use crate::registry::{FeedGroups, GroupState};
use crate::source::{render_message, SharedSource};

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions that accepted the message
    pub delivered: usize,
    /// Sessions whose send failed
    pub failed: usize,
    /// Closed sessions removed after the fan-out
    pub pruned: usize,
    /// The cohort was empty and the timer retired itself
    pub retired: bool,
}

/// Recurring tick body for one cohort.
pub struct Broadcaster {
    group: Arc<GroupState>,
    feed: Arc<FeedGroups>,
    source: SharedSource,
}

impl Broadcaster {
    pub fn new(group: Arc<GroupState>, feed: Arc<FeedGroups>, source: SharedSource) -> Self {
        Self {
            group,
            feed,
            source,
        }
    }

    pub fn group(&self) -> &Arc<GroupState> {
        &self.group
    }

    /// Runs one tick.
    pub fn tick(&self) -> TickReport {
        if self.group.is_empty() && self.retire() {
            return TickReport {
                retired: true,
                ..TickReport::default()
            };
        }

        let message = render_message(self.source.as_ref());

        let mut report = TickReport::default();
        let mut closed: Vec<SessionId> = Vec::new();

        for session in self.group.sessions_snapshot() {
            if !session.is_open() {
                closed.push(session.id().clone());
                continue;
            }
            match session.send(&message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        feed = %self.group.feed(),
                        session_id = %session.id(),
                        error = %e,
                        "Broadcast send failed"
                    );
                    if let Err(second) = session.send(&e.to_string()) {
                        debug!(
                            session_id = %session.id(),
                            error = %second,
                            "Diagnostic send failed too"
                        );
                    }
                }
            }
        }

        report.pruned = self.prune(&closed);

        debug!(
            feed = %self.group.feed(),
            group_key = %self.group.key(),
            interval = %self.group.interval(),
            delivered = report.delivered,
            failed = report.failed,
            pruned = report.pruned,
            "Tick complete"
        );
        report
    }

    /// Cancels this cohort's timer if the cohort is still empty under the
    /// structural lock. A connect racing with retirement either lands before
    /// the check (no retirement) or finds no timer and starts a new one.
    fn retire(&self) -> bool {
        let _structure = self.feed.lock_structure();
        if !self.group.is_empty() {
            return false;
        }
        if let Some(timer) = self.group.take_timer() {
            timer.cancel(false);
        }
        info!(
            feed = %self.group.feed(),
            group_key = %self.group.key(),
            interval = %self.group.interval(),
            "Cohort empty, timer retired"
        );
        true
    }

    /// Removes closed sessions in one batch after the fan-out.
    fn prune(&self, closed: &[SessionId]) -> usize {
        let mut pruned = 0;
        for id in closed {
            if self.group.remove_session(id).is_some() {
                self.feed.forget_membership(id, &self.group);
                pruned += 1;
            }
        }
        pruned
    }
}
