//! tickcast Protocol - Wire types for daemon communication
//!
//! This crate provides the newline-delimited JSON messages exchanged
//! between push clients and the daemon, and the status snapshot structure
//! consumed by monitoring endpoints.

pub mod message;
pub mod status;

pub use message::{ClientMessage, DaemonMessage, SubscriptionMode};
pub use status::{FeedStatus, GroupDetail, SessionCounts, StatusSnapshot};
