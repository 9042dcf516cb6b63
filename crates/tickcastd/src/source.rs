//! Message sources: the per-feed callback that produces tick payloads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

/// Produces the text pushed to a cohort on each tick.
///
/// Invoked once per tick regardless of cohort size. May fail; the failure
/// text is broadcast in place of the message.
pub trait MessageSource: Send + Sync {
    fn generate(&self) -> anyhow::Result<String>;
}

impl<F> MessageSource for F
where
    F: Fn() -> anyhow::Result<String> + Send + Sync,
{
    fn generate(&self) -> anyhow::Result<String> {
        self()
    }
}

/// Shared handle to a message source.
pub type SharedSource = Arc<dyn MessageSource>;

/// Runs the source once, substituting the failure text on error or panic.
pub fn render_message(source: &dyn MessageSource) -> String {
    match panic::catch_unwind(AssertUnwindSafe(|| source.generate())) {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            warn!(error = %e, "Message source failed, broadcasting error text");
            e.to_string()
        }
        Err(payload) => {
            let text = panic_text(payload.as_ref());
            warn!(panic = %text, "Message source panicked, broadcasting panic text");
            text
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "message source panicked".to_string()
    }
}
