//! Metrics side channel
//!
//! Measurements are fire-and-forget: a sink must never block or fail the
//! compile request that reports them.

use std::sync::{Mutex, PoisonError};

/// Time spent looking up a cache hit
pub const CACHE_RETRIEVAL_TIME: &str = "/jax/compilation_cache/cache_retrieval_time_sec";

/// Recorded compile time minus lookup time for a cache hit
pub const COMPILE_TIME_SAVED: &str = "/jax/compilation_cache/original_compile_time_saved_sec";

/// Receiver of duration events
pub trait MetricsSink: Send + Sync {
    fn record_event_duration_secs(&self, name: &str, seconds: f64);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_event_duration_secs(&self, _name: &str, _seconds: f64) {}
}

/// Forwards events to the `log` facade at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record_event_duration_secs(&self, name: &str, seconds: f64) {
        log::debug!("metric {} = {:.6}s", name, seconds);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<(String, f64)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in order
    pub fn events(&self) -> Vec<(String, f64)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Values recorded under `name`
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_event_duration_secs(&self, name: &str, seconds: f64) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), seconds));
    }
}
