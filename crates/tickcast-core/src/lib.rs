//! tickcast Core - Shared types for interval push sessions
//!
//! This crate provides the domain types shared between the scheduler
//! daemon (tickcastd) and the wire protocol.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod feed;
pub mod params;
pub mod session;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use feed::{FeedType, GroupKey, Interval};
pub use params::{ConnectParams, TOKEN_PARAM};
pub use session::{
    send_if_open, SendError, Session, SessionId, SessionProperties, SessionRef, TaskHandle,
    LEGACY_TASK_KEY,
};
