// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metrics manager with lock-free counters and timers.
//!
//! Metric values are plain atomics so pipeline hot paths never block; only
//! registration and snapshotting take the registry lock. Reporting transport
//! is out of scope — an external reporter consumes [`MetricsManager::snapshot`].

use fdk_error::{ErrKind, FdkError, FdkResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Metric name for total messages received by the trigger.
pub const MESSAGES_RECEIVED_NAME: &str = "MessagesReceived";
/// Metric name for messages that failed to decode.
pub const INVALID_MESSAGES_RECEIVED_NAME: &str = "InvalidMessagesReceived";
/// Placeholder replaced by the pipeline id in per-pipeline metric names.
pub const PIPELINE_ID_TXT: &str = "{PipelineId}";
/// Per-pipeline counter of messages handed to the pipeline.
pub const PIPELINE_MESSAGES_PROCESSED_NAME: &str = "PipelineMessagesProcessed-{PipelineId}";
/// Per-pipeline timer over whole pipeline invocations.
pub const PIPELINE_MESSAGE_PROCESSING_TIME_NAME: &str = "PipelineMessageProcessingTime-{PipelineId}";
/// Per-pipeline counter of failed pipeline invocations.
pub const PIPELINE_PROCESSING_ERRORS_NAME: &str = "PipelineProcessingErrors-{PipelineId}";
/// Counter of stored objects waiting for retry.
pub const STORE_FORWARD_QUEUE_SIZE_NAME: &str = "StoreForwardQueueSize";

/// Expand a per-pipeline metric name template with a concrete pipeline id.
#[must_use]
pub fn pipeline_metric_name(template: &str, pipeline_id: &str) -> String {
    template.replacen(PIPELINE_ID_TXT, pipeline_id, 1)
}

// ---------------------------------------------------------------------------
// Counter / Timer
// ---------------------------------------------------------------------------

/// A shareable, lock-free signed counter.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    /// Create a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter.
    pub fn inc(&self, n: i64) {
        self.value.fetch_add(n, Relaxed);
    }

    /// Subtract `n` from the counter.
    pub fn dec(&self, n: i64) {
        self.value.fetch_sub(n, Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.value.load(Relaxed)
    }

    /// Reset to zero.
    pub fn clear(&self) {
        self.value.store(0, Relaxed);
    }
}

/// A shareable, lock-free duration accumulator.
#[derive(Clone, Debug, Default)]
pub struct Timer {
    count: Arc<AtomicU64>,
    total_micros: Arc<AtomicU64>,
}

impl Timer {
    /// Create a timer with no recorded observations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    pub fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Relaxed);
    }

    /// Start timing a scope; recording happens when the guard drops.
    #[must_use]
    pub fn time(&self) -> TimerGuard {
        TimerGuard {
            timer: self.clone(),
            start: Instant::now(),
        }
    }

    /// Number of recorded observations.
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.count.load(Relaxed)
    }

    /// Mean observation duration, or zero when nothing was recorded.
    #[must_use]
    pub fn mean(&self) -> Duration {
        let count = self.count.load(Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Relaxed) / count)
    }
}

/// Records the elapsed time into its [`Timer`] on drop.
pub struct TimerGuard {
    timer: Timer,
    start: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// A registrable metric instrument.
#[derive(Clone, Debug)]
pub enum Metric {
    /// A signed counter.
    Counter(Counter),
    /// A duration accumulator.
    Timer(Timer),
}

// ---------------------------------------------------------------------------
// MetricsManager
// ---------------------------------------------------------------------------

/// Point-in-time value of one registered metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    /// Counter value.
    Count(i64),
    /// Timer observation count and mean duration in microseconds.
    Time {
        /// Number of observations recorded.
        observations: u64,
        /// Mean observation duration in microseconds.
        mean_micros: u64,
    },
}

struct Registered {
    metric: Metric,
    #[allow(dead_code)] // carried for the external reporter
    tags: Option<HashMap<String, String>>,
}

/// Registry of named metric instruments.
///
/// Registration is idempotent-checked: a second registration under the same
/// name fails with [`ErrKind::DuplicateName`] rather than replacing the
/// instrument behind an active handle.
#[derive(Default)]
pub struct MetricsManager {
    entries: Mutex<HashMap<String, Registered>>,
}

impl MetricsManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `metric` under `name`, with optional reporter tags.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::DuplicateName`] when the name is already taken.
    pub fn register(
        &self,
        name: &str,
        metric: Metric,
        tags: Option<HashMap<String, String>>,
    ) -> FdkResult<()> {
        let mut entries = self.entries.lock().expect("metrics registry poisoned");
        if entries.contains_key(name) {
            return Err(FdkError::new(
                ErrKind::DuplicateName,
                format!("metric '{name}' is already registered"),
            ));
        }
        entries.insert(name.to_string(), Registered { metric, tags });
        Ok(())
    }

    /// Remove the metric registered under `name`, if any.
    pub fn unregister(&self, name: &str) {
        self.entries
            .lock()
            .expect("metrics registry poisoned")
            .remove(name);
    }

    /// Whether a metric is registered under `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.entries
            .lock()
            .expect("metrics registry poisoned")
            .contains_key(name)
    }

    /// Deterministically ordered snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        let entries = self.entries.lock().expect("metrics registry poisoned");
        entries
            .iter()
            .map(|(name, reg)| {
                let value = match &reg.metric {
                    Metric::Counter(c) => MetricValue::Count(c.count()),
                    Metric::Timer(t) => MetricValue::Time {
                        observations: t.observations(),
                        mean_micros: t.mean().as_micros() as u64,
                    },
                };
                (name.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_inc_dec() {
        let c = Counter::new();
        c.inc(3);
        c.dec(1);
        assert_eq!(c.count(), 2);
        c.clear();
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn counter_clones_share_state() {
        let a = Counter::new();
        let b = a.clone();
        a.inc(5);
        assert_eq!(b.count(), 5);
    }

    #[test]
    fn timer_records_observations() {
        let t = Timer::new();
        t.record(Duration::from_millis(10));
        t.record(Duration::from_millis(20));
        assert_eq!(t.observations(), 2);
        assert_eq!(t.mean(), Duration::from_millis(15));
    }

    #[test]
    fn timer_guard_records_on_drop() {
        let t = Timer::new();
        {
            let _guard = t.time();
        }
        assert_eq!(t.observations(), 1);
    }

    #[test]
    fn empty_timer_mean_is_zero() {
        assert_eq!(Timer::new().mean(), Duration::ZERO);
    }

    #[test]
    fn register_then_duplicate_fails() {
        let mgr = MetricsManager::new();
        mgr.register("m", Metric::Counter(Counter::new()), None)
            .unwrap();
        let err = mgr
            .register("m", Metric::Counter(Counter::new()), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrKind::DuplicateName);
    }

    #[test]
    fn unregister_frees_the_name() {
        let mgr = MetricsManager::new();
        mgr.register("m", Metric::Counter(Counter::new()), None)
            .unwrap();
        mgr.unregister("m");
        assert!(!mgr.is_registered("m"));
        mgr.register("m", Metric::Counter(Counter::new()), None)
            .unwrap();
    }

    #[test]
    fn snapshot_reflects_live_values() {
        let mgr = MetricsManager::new();
        let c = Counter::new();
        mgr.register("hits", Metric::Counter(c.clone()), None)
            .unwrap();
        c.inc(7);
        assert_eq!(
            mgr.snapshot().get("hits"),
            Some(&MetricValue::Count(7))
        );
    }

    #[test]
    fn pipeline_metric_name_expands_template() {
        assert_eq!(
            pipeline_metric_name(PIPELINE_MESSAGES_PROCESSED_NAME, "export"),
            "PipelineMessagesProcessed-export"
        );
    }
}
