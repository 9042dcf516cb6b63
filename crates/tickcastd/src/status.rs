//! Registry snapshots for monitoring.
//!
//! Snapshots are assembled by walking the concurrent maps without any
//! registry-wide lock, so counts taken under churn are approximate but
//! each cohort's detail is internally consistent.

use std::collections::BTreeMap;
use std::sync::Arc;

use tickcast_core::FeedType;
use tickcast_protocol::{FeedStatus, GroupDetail, StatusSnapshot};

use crate::registry::{FeedGroups, GroupRegistry};

/// Builds [`StatusSnapshot`]s from a registry.
#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<GroupRegistry>,
}

impl StatusReporter {
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self { registry }
    }

    /// Counts and cohort detail for every feed.
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        for groups in self.registry.feeds() {
            snapshot.insert_feed(groups.feed().clone(), feed_status(&groups));
        }
        snapshot
    }

    /// Status of a single feed, if it has been seen.
    pub fn feed_status(&self, feed: &FeedType) -> Option<FeedStatus> {
        self.registry
            .existing_feed(feed)
            .map(|groups| feed_status(&groups))
    }
}

fn feed_status(groups: &FeedGroups) -> FeedStatus {
    let mut detail: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();
    for group in groups.all_groups() {
        detail.entry(group.key().clone()).or_default().insert(
            group.interval(),
            GroupDetail {
                session_ids: group.session_ids(),
                timer_attached: group.has_timer(),
            },
        );
    }
    FeedStatus {
        overview: groups.counts(),
        detail,
    }
}
