//! tickcast daemon - interval broadcast scheduler and push server
//!
//! This crate provides:
//! - `registry` - cohort registry (feed → group key → interval → sessions)
//! - `timer` - bounded pool of recurring timers
//! - `service` - per-feed connect/disconnect lifecycle
//! - `broadcaster` - per-tick fan-out for one cohort
//! - `status` - monitoring snapshots
//! - `scheduler` - facade owning every feed's service
//! - `server` - Unix socket server for push clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        tickcastd                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐      ┌──────────────────────────────┐  │
//! │  │  DaemonServer   │─────▶│          Scheduler           │  │
//! │  │  (Unix socket)  │      │ services / registry / timers │  │
//! │  └────────┬────────┘      └──────────────┬───────────────┘  │
//! │           │ sessions                     │ one timer per     │
//! │           ▼                              ▼ cohort            │
//! │  ┌─────────────────┐      ┌──────────────────────────────┐  │
//! │  │  SocketSession  │◀─────│         Broadcaster          │  │
//! │  │  (per client)   │ push │  (message computed once)     │  │
//! │  └─────────────────┘      └──────────────────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Panics inside message sources are caught and broadcast as text

pub mod broadcaster;
pub mod config;
pub mod feeds;
pub mod registry;
pub mod reply;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod source;
pub mod status;
pub mod timer;

#[cfg(test)]
mod testing;

pub use broadcaster::{Broadcaster, TickReport};
pub use config::{DaemonConfig, ReapScope, SchedulerConfig};
pub use scheduler::Scheduler;
pub use service::{ConnectError, ConnectMode, IntervalBroadcastService};
pub use source::{MessageSource, SharedSource};
pub use timer::{TimerCoordinator, TimerHandle};
