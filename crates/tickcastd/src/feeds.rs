//! Built-in feeds registered by the daemon.
//!
//! - `clock`: current UTC time, RFC 3339.
//! - `sine`: a simulated process variable following a sine curve.

use std::f64::consts::PI;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::config::SineConfig;
use crate::source::{MessageSource, SharedSource};

pub const CLOCK_FEED: &str = "clock";
pub const SINE_FEED: &str = "sine";

/// Current UTC time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockSource;

impl MessageSource for ClockSource {
    fn generate(&self) -> anyhow::Result<String> {
        Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

/// Sine-shaped process variable.
///
/// `y = A·sin(2π/T·(t − n·60)) + C` where `A` is half the range, `C` its
/// midpoint, `T` the period and `n` the phase index. Values are clamped to
/// `[min, max]` and rounded to two decimals.
#[derive(Debug, Clone)]
pub struct SineSource {
    config: SineConfig,
}

#[derive(Serialize)]
struct SineSample {
    value: f64,
    timestamp: String,
}

impl SineSource {
    pub fn new(config: SineConfig) -> Self {
        Self { config }
    }

    /// Curve value at `t` seconds since the epoch.
    pub fn value_at(&self, t: i64) -> f64 {
        let SineConfig {
            period_secs,
            min,
            max,
            phase_index,
        } = self.config;
        let center = (min + max) / 2.0;
        let amplitude = (max - min) / 2.0;
        let omega = 2.0 * PI / period_secs;
        let shifted = (t - phase_index * 60) as f64;

        let y = amplitude * (omega * shifted).sin() + center;
        let clamped = y.clamp(center - amplitude, center + amplitude);
        (clamped * 100.0).round() / 100.0
    }
}

impl MessageSource for SineSource {
    fn generate(&self) -> anyhow::Result<String> {
        let now = Utc::now();
        let sample = SineSample {
            value: self.value_at(now.timestamp()),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        Ok(serde_json::to_string(&sample)?)
    }
}

/// The built-in feeds as `(name, source)` pairs.
pub fn builtin_sources(sine: &SineConfig) -> Vec<(&'static str, SharedSource)> {
    vec![
        (CLOCK_FEED, Arc::new(ClockSource) as SharedSource),
        (SINE_FEED, Arc::new(SineSource::new(sine.clone()))),
    ]
}
