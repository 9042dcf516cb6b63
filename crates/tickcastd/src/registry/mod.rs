//! Cohort registry.
//!
//! Nested concurrent storage of push cohorts, keyed
//! FeedType → GroupKey → Interval → [`GroupState`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ GroupRegistry  (DashMap<FeedType, Arc<FeedGroups>>)           │
//! │                                                               │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │ FeedGroups                                              │  │
//! │  │   structural mutex   ── serializes insert/reap/retire   │  │
//! │  │   global set         ── every session of the feed       │  │
//! │  │   memberships        ── SessionId → cohort              │  │
//! │  │   groups             ── GroupKey → Interval → cohort    │  │
//! │  └───────────────────────────┬─────────────────────────────┘  │
//! │                              ▼                                │
//! │              GroupState { sessions, timer }                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Membership removal (disconnect, prune) is lock-free. Anything that can
//! create a cohort, attach a timer to it, or remove it holds the feed's
//! structural mutex.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` in this module. DashMap guards
//! are never held across calls back into the same map.

mod group;
mod store;

pub use group::GroupState;
pub use store::{FeedGroups, GroupRegistry};
