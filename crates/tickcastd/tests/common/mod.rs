//! Shared helpers for tickcastd integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tickcast_core::{SendError, Session, SessionId, SessionProperties};
use tickcastd::SharedSource;

/// In-memory session recording every frame it receives.
pub struct RecordingSession {
    id: SessionId,
    open: AtomicBool,
    received: Mutex<Vec<String>>,
    properties: SessionProperties,
}

impl RecordingSession {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(id),
            open: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
            properties: SessionProperties::new(),
        })
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl Session for RecordingSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed(self.id.clone()));
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

/// A source that always yields `text`.
pub fn fixed(text: &'static str) -> SharedSource {
    Arc::new(move || -> anyhow::Result<String> { Ok(text.to_string()) })
}

/// Polls `condition` until it holds or `max` elapses.
pub async fn wait_until(max: Duration, condition: impl Fn() -> bool) -> bool {
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
