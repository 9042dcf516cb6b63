//! Protocol message types for daemon communication.

use serde::{Deserialize, Serialize};
use tickcast_core::{FeedType, GroupKey, Interval, SessionId};

use crate::status::StatusSnapshot;

/// Messages sent by clients to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a feed. Must be the first message of a push connection.
    Subscribe {
        /// Feed to join
        feed: FeedType,
        /// Refresh interval in seconds; `0` selects active mode
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<Interval>,
        /// Raw query string used to derive the cohort key
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },

    /// Ask for one freshly computed message (active mode)
    Pull,

    /// Reply to a daemon-initiated request
    Reply {
        /// Reply payload
        text: String,
    },

    /// Request a status snapshot
    Status,

    /// Leave the feed and close the connection
    Unsubscribe,
}

impl ClientMessage {
    /// Creates a subscribe message.
    pub fn subscribe(feed: impl Into<FeedType>, interval: Option<u32>, query: Option<&str>) -> Self {
        Self::Subscribe {
            feed: feed.into(),
            interval: interval.map(Interval::from_secs),
            query: query.map(str::to_string),
        }
    }

    /// Creates a reply message.
    pub fn reply(text: &str) -> Self {
        Self::Reply {
            text: text.to_string(),
        }
    }
}

/// How a subscribed session receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Client pulls on demand; no recurring timer
    Active,
    /// Client is pushed one message per cohort tick
    Passive,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Subscription accepted
    Subscribed {
        /// Session identifier assigned by the daemon
        session_id: SessionId,
        /// Active or passive delivery
        mode: SubscriptionMode,
        /// Cohort the session joined (passive only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_key: Option<GroupKey>,
    },

    /// One pushed text frame
    Push {
        /// Message text (or diagnostic text on failure)
        text: String,
    },

    /// Status snapshot response
    Status {
        /// Snapshot of every feed
        snapshot: StatusSnapshot,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
    },
}

impl DaemonMessage {
    /// Creates a subscribed response.
    pub fn subscribed(session_id: SessionId, mode: SubscriptionMode, group_key: Option<GroupKey>) -> Self {
        Self::Subscribed {
            session_id,
            mode,
            group_key,
        }
    }

    /// Creates a push frame.
    pub fn push(text: &str) -> Self {
        Self::Push {
            text: text.to_string(),
        }
    }

    /// Creates a status response.
    pub fn status(snapshot: StatusSnapshot) -> Self {
        Self::Status { snapshot }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}
