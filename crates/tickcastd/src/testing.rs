//! Test doubles shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tickcast_core::{SendError, Session, SessionId, SessionProperties, SessionRef};

/// In-memory session recording every frame it is sent.
pub(crate) struct MockSession {
    id: SessionId,
    open: AtomicBool,
    fail_next: AtomicUsize,
    received: Mutex<Vec<String>>,
    properties: SessionProperties,
}

impl MockSession {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(id),
            open: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            properties: SessionProperties::new(),
        })
    }

    pub(crate) fn shared(id: &str) -> SessionRef {
        Self::new(id)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Makes the next `n` sends fail with a transport error.
    pub(crate) fn fail_next_sends(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

impl Session for MockSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SendError::Transport("socket reset".to_string()));
        }
        self.received.lock().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.set_open(false);
    }

    fn properties(&self) -> &SessionProperties {
        &self.properties
    }
}

/// Polls `condition` until it holds or `max` elapses.
pub(crate) async fn wait_until(max: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + max;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
