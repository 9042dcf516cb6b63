//! Push session abstraction.
//!
//! A [`Session`] is an opaque handle to one live duplex connection. The
//! scheduler never sees the transport itself: it only asks whether the
//! session is open, pushes text into it, and parks auxiliary task handles
//! in its property bag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Property-bag key under which the per-session recurring sender is stored.
pub const LEGACY_TASK_KEY: &str = "task";

// ============================================================================
// Session Identifier
// ============================================================================

/// Unique identifier for a push session.
///
/// Assigned by the transport when the connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Session Trait
// ============================================================================

/// Errors raised by a transport when pushing text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The session was already closed.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The underlying transport rejected the write.
    #[error("transport error: {0}")]
    Transport(String),
}

/// One live push connection.
///
/// Implementations must be cheap to query and safe to call from any
/// thread: ticks, connects and disconnects all touch sessions concurrently.
/// `send` is fire-and-forget; transports that need to block should queue.
pub trait Session: Send + Sync {
    /// Stable identifier for the lifetime of the connection.
    fn id(&self) -> &SessionId;

    /// Whether the connection can still accept messages.
    fn is_open(&self) -> bool;

    /// Pushes one text frame to the peer.
    fn send(&self, text: &str) -> Result<(), SendError>;

    /// Closes the connection. Idempotent.
    fn close(&self);

    /// Mutable property bag for auxiliary per-session task handles.
    fn properties(&self) -> &SessionProperties;
}

/// Shared session handle as stored in the registry.
pub type SessionRef = Arc<dyn Session>;

/// Sends only when the session is still open.
///
/// A closed session is silently skipped, mirroring how transports drop
/// frames for connections that went away between check and send.
pub fn send_if_open(session: &dyn Session, text: &str) -> Result<(), SendError> {
    if session.is_open() {
        session.send(text)
    } else {
        debug!(session_id = %session.id(), "Skipping send to closed session");
        Ok(())
    }
}

// ============================================================================
// Property Bag
// ============================================================================

/// Cancellable handle to a background task tied to a session.
pub trait TaskHandle: Send + Sync {
    /// Cancels the task. With `interrupt`, an in-flight run may be abandoned.
    fn cancel(&self, interrupt: bool);

    /// Whether cancellation has been requested.
    fn is_cancelled(&self) -> bool;
}

/// Named task handles attached to one session.
#[derive(Default)]
pub struct SessionProperties {
    tasks: Mutex<HashMap<String, Arc<dyn TaskHandle>>>,
}

impl SessionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a handle, returning the one it replaced.
    pub fn insert_task(
        &self,
        name: impl Into<String>,
        handle: Arc<dyn TaskHandle>,
    ) -> Option<Arc<dyn TaskHandle>> {
        self.tasks.lock().insert(name.into(), handle)
    }

    pub fn task(&self, name: &str) -> Option<Arc<dyn TaskHandle>> {
        self.tasks.lock().get(name).cloned()
    }

    pub fn take_task(&self, name: &str) -> Option<Arc<dyn TaskHandle>> {
        self.tasks.lock().remove(name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancels and drops every stored handle. Returns how many were live.
    pub fn cancel_all(&self, interrupt: bool) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        let mut cancelled = 0;
        for (name, handle) in drained {
            if !handle.is_cancelled() {
                handle.cancel(interrupt);
                cancelled += 1;
                debug!(task = %name, interrupt, "Cancelled session task");
            }
        }
        cancelled
    }
}

impl fmt::Debug for SessionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        f.debug_struct("SessionProperties")
            .field("tasks", &names)
            .finish()
    }
}
