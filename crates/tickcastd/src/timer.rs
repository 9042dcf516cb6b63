//! Shared pool of recurring timers.
//!
//! Every cohort gets one recurring task. Tasks are lightweight tokio timers;
//! each run borrows a slot from a bounded semaphore and executes on the
//! blocking pool, so thousands of low-frequency schedules never need one OS
//! thread each and a slow message source cannot stall the runtime.
//!
//! # Failure isolation
//!
//! A run that panics is caught and logged. The schedule keeps going: a
//! single bad tick never deregisters a cohort's timer.
//!
//! # Cancellation
//!
//! - Non-interrupting: no further runs are started; an in-flight run
//!   completes normally.
//! - Interrupting: additionally aborts the timer task at its next await
//!   point. A blocking run already in progress still finishes on its worker.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tickcast_core::{Session, SessionRef, TaskHandle, LEGACY_TASK_KEY};

use crate::source::{render_message, SharedSource};

/// Default number of concurrent run slots.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Shortest period accepted; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Errors raised when building a coordinator.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

// ============================================================================
// Timer Handle
// ============================================================================

/// Handle to one recurring schedule. Cheap to clone.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    token: CancellationToken,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the schedule. See the module docs for `interrupt` semantics.
    pub fn cancel(&self, interrupt: bool) {
        self.token.cancel();
        if interrupt {
            self.abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the underlying timer task has exited.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl TaskHandle for TimerHandle {
    fn cancel(&self, interrupt: bool) {
        TimerHandle::cancel(self, interrupt);
    }

    fn is_cancelled(&self) -> bool {
        TimerHandle::is_cancelled(self)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Timer Coordinator
// ============================================================================

/// Schedules recurring tasks on a bounded shared pool.
#[derive(Clone)]
pub struct TimerCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    slots: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl TimerCoordinator {
    /// Creates a coordinator bound to the current tokio runtime.
    ///
    /// A capacity of `0` falls back to [`DEFAULT_POOL_CAPACITY`].
    pub fn new(capacity: usize) -> Result<Self, TimerError> {
        let runtime = Handle::try_current().map_err(|e| TimerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime, capacity))
    }

    /// Creates a coordinator that spawns onto `runtime`.
    ///
    /// Scheduling then works from any thread, inside a runtime or not.
    pub fn with_runtime(runtime: Handle, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_POOL_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: Arc::new(Inner {
                runtime,
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                next_id: AtomicU64::new(1),
                active: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots not currently executing a run.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Recurring schedules that have not exited yet.
    pub fn active_timers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Runs `task` now and then every `period` until cancelled.
    ///
    /// Runs of one schedule never overlap. A late run delays the following
    /// ones instead of bursting to catch up.
    pub fn schedule<F>(&self, period: Duration, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let period = period.max(MIN_PERIOD);

        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let join = self.inner.runtime.spawn(run_recurring(
            id,
            period,
            Arc::new(task),
            token.clone(),
            Arc::clone(&self.inner.slots),
            ActiveGuard(Arc::clone(&self.inner.active)),
        ));

        debug!(timer_id = id, period_ms = period.as_millis() as u64, "Scheduled recurring task");

        TimerHandle {
            id,
            token,
            abort: join.abort_handle(),
        }
    }

    /// Cancels a schedule.
    pub fn cancel(&self, handle: &TimerHandle, interrupting: bool) {
        handle.cancel(interrupting);
        debug!(timer_id = handle.id(), interrupting, "Cancelled recurring task");
    }

    /// Starts a sender dedicated to one session.
    ///
    /// Each run pushes a fresh message to `session`; once the session is
    /// found closed the task cancels itself without interrupting. The handle
    /// is parked in the session's property bag under [`LEGACY_TASK_KEY`] so
    /// a disconnect can cancel it; any handle it replaces is cancelled.
    pub fn schedule_session_task(
        &self,
        session: SessionRef,
        period: Duration,
        source: SharedSource,
    ) -> TimerHandle {
        let target = Arc::clone(&session);
        let handle = self.schedule(period, move || {
            if !target.is_open() {
                if let Some(own) = target.properties().task(LEGACY_TASK_KEY) {
                    own.cancel(false);
                }
                return;
            }
            let message = render_message(source.as_ref());
            if let Err(e) = target.send(&message) {
                warn!(session_id = %target.id(), error = %e, "Session task send failed");
                if let Err(second) = target.send(&e.to_string()) {
                    debug!(session_id = %target.id(), error = %second, "Diagnostic send failed too");
                }
            }
        });

        if let Some(replaced) = session
            .properties()
            .insert_task(LEGACY_TASK_KEY, Arc::new(handle.clone()))
        {
            replaced.cancel(false);
        }
        handle
    }
}

/// Decrements the live-timer count when the timer task ends, however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_recurring<F>(
    id: u64,
    period: Duration,
    task: Arc<F>,
    token: CancellationToken,
    slots: Arc<Semaphore>,
    _active: ActiveGuard,
) where
    F: Fn() + Send + Sync + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(timer_id = id, "Timer pool closed");
                    break;
                }
            },
        };

        let body = Arc::clone(&task);
        let run = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            body();
        });

        if let Err(e) = run.await {
            if e.is_panic() {
                error!(timer_id = id, "Recurring task panicked; schedule continues");
            } else {
                debug!(timer_id = id, "Recurring run cancelled by runtime shutdown");
                break;
            }
        }
    }

    debug!(timer_id = id, "Recurring task stopped");
}
