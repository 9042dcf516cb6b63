//! Status snapshot structure for monitoring endpoints.
//!
//! Field names are camelCase on the wire (`totalSessions`, `timerAttached`, ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tickcast_core::{FeedType, GroupKey, Interval, SessionId};

/// Session totals for one feed or for the whole daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub passive_sessions: usize,
}

impl SessionCounts {
    /// Builds counts from a total and the number of open passive sessions.
    ///
    /// Everything that is not an open cohort member counts as active.
    pub fn from_total(total: usize, passive: usize) -> Self {
        Self {
            total_sessions: total,
            active_sessions: total.saturating_sub(passive),
            passive_sessions: passive,
        }
    }

    pub fn accumulate(&mut self, other: &SessionCounts) {
        self.total_sessions += other.total_sessions;
        self.active_sessions += other.active_sessions;
        self.passive_sessions += other.passive_sessions;
    }
}

/// One cohort in the detail view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetail {
    pub session_ids: Vec<SessionId>,
    pub timer_attached: bool,
}

/// Overview plus GroupKey → Interval → cohort detail for one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStatus {
    pub overview: SessionCounts,
    pub detail: BTreeMap<GroupKey, BTreeMap<Interval, GroupDetail>>,
}

impl FeedStatus {
    /// Number of cohorts across all group keys.
    pub fn group_count(&self) -> usize {
        self.detail.values().map(BTreeMap::len).sum()
    }

    pub fn group(&self, key: &GroupKey, interval: Interval) -> Option<&GroupDetail> {
        self.detail.get(key).and_then(|by_interval| by_interval.get(&interval))
    }
}

/// Global summary and per-feed detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub overview: SessionCounts,
    pub feeds: BTreeMap<FeedType, FeedStatus>,
}

impl StatusSnapshot {
    pub fn feed(&self, feed: &FeedType) -> Option<&FeedStatus> {
        self.feeds.get(feed)
    }

    /// Adds a feed and folds its counts into the global overview.
    pub fn insert_feed(&mut self, feed: FeedType, status: FeedStatus) {
        self.overview.accumulate(&status.overview);
        self.feeds.insert(feed, status);
    }
}
