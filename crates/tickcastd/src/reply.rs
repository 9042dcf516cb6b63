//! Waiting for a client reply.
//!
//! A [`ReplySlot`] holds at most one reply. The transport stores incoming
//! replies with [`ReplySlot::fulfill`]; a handler awaiting input calls
//! [`ReplySlot::wait`], which wakes on the store instead of polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use tickcast_core::{SendError, Session};

/// Single-reply mailbox shared between a transport and its handler.
#[derive(Clone)]
pub struct ReplySlot {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for ReplySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplySlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Stores a reply, replacing any unread one.
    pub fn fulfill(&self, text: impl Into<String>) {
        let text = text.into();
        self.tx.send_replace(Some(text));
    }

    /// Removes and returns the stored reply.
    pub fn take(&self) -> Option<String> {
        self.tx.send_replace(None)
    }

    pub fn peek(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Waits up to `max` for a non-empty reply and takes it.
    pub async fn wait(&self, max: Duration) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let ready = |reply: &Option<String>| reply.as_deref().is_some_and(|text| !text.is_empty());

        // The borrow guard returned by `wait_for` must be gone before `take`.
        let outcome = tokio::time::timeout(max, rx.wait_for(ready))
            .await
            .map(|seen| seen.is_ok());
        match outcome {
            Ok(true) => self.take().filter(|text| !text.is_empty()),
            Ok(false) => None,
            Err(_) => {
                debug!(waited_ms = max.as_millis() as u64, "Reply wait timed out");
                None
            }
        }
    }
}

/// Sends `prompt` to `session` and waits for its reply.
///
/// Any unread reply is discarded first. A closed session fails immediately.
pub async fn request_reply(
    session: &dyn Session,
    slot: &ReplySlot,
    prompt: &str,
    max: Duration,
) -> Result<Option<String>, SendError> {
    slot.take();
    if !session.is_open() {
        return Err(SendError::Closed(session.id().clone()));
    }
    session.send(prompt)?;
    Ok(slot.wait(max).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::testing::MockSession;

    #[tokio::test]
    async fn test_wait_returns_stored_reply() {
        let slot = ReplySlot::new();
        let writer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.fulfill("yes");
        });

        assert_eq!(slot.wait(Duration::from_secs(2)).await, Some("yes".to_string()));
        assert!(slot.peek().is_none());
    }

    #[tokio::test]
    async fn test_wait_sees_reply_stored_before_wait() {
        let slot = ReplySlot::new();
        slot.fulfill("early");
        assert_eq!(slot.wait(Duration::from_millis(50)).await, Some("early".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reply_does_not_satisfy_wait() {
        let slot = ReplySlot::new();
        slot.fulfill("");
        assert_eq!(slot.wait(Duration::from_secs(180)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let slot = ReplySlot::new();
        let max = SchedulerConfig::default().reply_timeout();
        let started = tokio::time::Instant::now();
        assert_eq!(slot.wait(max).await, None);
        assert!(started.elapsed() >= max);
    }

    #[tokio::test]
    async fn test_request_reply_sends_prompt() {
        let session = MockSession::new("s1");
        let slot = ReplySlot::new();
        slot.fulfill("stale");
        let writer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.fulfill("42");
        });

        let reply = request_reply(session.as_ref(), &slot, "value?", Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply, Some("42".to_string()));
        assert_eq!(session.received(), vec!["value?".to_string()]);
    }

    #[tokio::test]
    async fn test_request_reply_to_closed_session_fails() {
        let session = MockSession::new("s1");
        session.set_open(false);
        let result =
            request_reply(session.as_ref(), &ReplySlot::new(), "value?", Duration::from_millis(10))
                .await;
        assert!(matches!(result, Err(SendError::Closed(_))));
    }
}
