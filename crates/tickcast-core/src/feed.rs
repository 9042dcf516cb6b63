//! Feed, cohort key and interval value objects.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

// ============================================================================
// Feed Type
// ============================================================================

/// Identity of one push feed.
///
/// Each feed is an isolated scheduler namespace: cohorts, global session
/// accounting and structural locking are all scoped by `FeedType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedType(String);

impl FeedType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FeedType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FeedType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Group Key
// ============================================================================

/// Cohort identifier derived from a connection's request parameters.
///
/// See [`ConnectParams::group_key`](crate::ConnectParams::group_key) for
/// the derivation rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Interval
// ============================================================================

/// Refresh interval in whole seconds.
///
/// `0` is the active-mode sentinel: the connection is counted globally but
/// never joins a cohort and never gets a recurring timer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Interval(u32);

impl Interval {
    /// The active-mode sentinel.
    pub const ACTIVE: Interval = Interval(0);

    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> u32 {
        self.0
    }

    /// True for the active-mode sentinel.
    #[must_use]
    pub const fn is_active(self) -> bool {
        self.0 == 0
    }

    /// Tick period for a passive cohort.
    pub fn period(self) -> Duration {
        Duration::from_secs(u64::from(self.0))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl FromStr for Interval {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|e| DomainError::InvalidFieldValue {
                field: "interval".to_string(),
                value: s.to_string(),
                expected: format!("non-negative integer seconds ({e})"),
            })
    }
}
