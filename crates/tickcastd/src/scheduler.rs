//! Scheduler facade: one registry, one timer pool, one service per feed.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Unknown feeds are reported as `None`, never a panic
//! - The sweeper exits on cancellation

use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tickcast_core::FeedType;
use tickcast_protocol::StatusSnapshot;

use crate::config::SchedulerConfig;
use crate::registry::GroupRegistry;
use crate::service::IntervalBroadcastService;
use crate::source::SharedSource;
use crate::status::StatusReporter;
use crate::timer::{TimerCoordinator, TimerError};

/// Owner of every feed's broadcast service.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<GroupRegistry>,
    timers: TimerCoordinator,
    services: DashMap<FeedType, Arc<IntervalBroadcastService>>,
}

impl Scheduler {
    /// Builds a scheduler on the current tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, TimerError> {
        let runtime = Handle::try_current().map_err(|e| TimerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime, config))
    }

    pub fn with_runtime(runtime: Handle, config: SchedulerConfig) -> Self {
        let timers = TimerCoordinator::with_runtime(runtime, config.pool_capacity);
        Self {
            config,
            registry: Arc::new(GroupRegistry::new()),
            timers,
            services: DashMap::new(),
        }
    }

    /// Registers `feed`, replacing the source of an existing registration.
    ///
    /// Sessions already admitted stay in the registry; cohorts started
    /// before the replacement keep ticking with the source they started with.
    pub fn register_feed(
        &self,
        feed: impl Into<FeedType>,
        source: SharedSource,
    ) -> Arc<IntervalBroadcastService> {
        let feed = feed.into();
        let service = Arc::new(IntervalBroadcastService::new(
            feed.clone(),
            source,
            Arc::clone(&self.registry),
            self.timers.clone(),
            self.config.clone(),
        ));
        if self.services.insert(feed.clone(), Arc::clone(&service)).is_some() {
            info!(feed = %feed, "Feed source replaced");
        } else {
            info!(feed = %feed, "Feed registered");
        }
        service
    }

    pub fn service(&self, feed: &FeedType) -> Option<Arc<IntervalBroadcastService>> {
        self.services.get(feed).map(|s| Arc::clone(s.value()))
    }

    /// Registered feed names, sorted.
    pub fn feeds(&self) -> Vec<FeedType> {
        let mut feeds: Vec<FeedType> = self.services.iter().map(|s| s.key().clone()).collect();
        feeds.sort();
        feeds
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn timers(&self) -> &TimerCoordinator {
        &self.timers
    }

    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(Arc::clone(&self.registry))
    }

    pub fn status(&self) -> StatusSnapshot {
        self.reporter().snapshot()
    }

    /// Reaps empty cohorts of every feed.
    pub fn reap_all(&self) -> usize {
        self.registry.reap_all()
    }

    /// Starts the periodic sweep if one is configured.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.reap.sweep_interval()?;
        let registry = Arc::clone(&self.registry);

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = registry.reap_all();
                        if reaped > 0 {
                            debug!(reaped, "Periodic sweep reaped empty cohorts");
                        }
                    }
                }
            }
        }))
    }
}
