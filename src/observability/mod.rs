//! Delivery metrics and timing.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Dispatch metrics collector.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Logical sends that succeeded on some account.
    pub sends_succeeded: AtomicU64,
    /// Logical sends that failed on every account.
    pub sends_failed: AtomicU64,
    /// Single-account delivery attempts.
    pub account_attempts: AtomicU64,
    /// Single-account delivery failures.
    pub account_failures: AtomicU64,
    /// Moves from one account to the next.
    pub failovers: AtomicU64,
    /// Queue items delivered by the worker.
    pub queue_processed: AtomicU64,
    /// Queue items dropped after a failed delivery.
    pub queue_failed: AtomicU64,
}

impl DispatchMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful logical send.
    pub fn record_send_success(&self) {
        self.sends_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed logical send.
    pub fn record_send_failure(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one account attempt; every attempt after the first is a failover.
    pub fn record_account_attempt(&self, attempt: usize) {
        self.account_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.failovers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one failed account attempt.
    pub fn record_account_failure(&self) {
        self.account_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of one queued delivery.
    pub fn record_queue_item(&self, success: bool) {
        if success {
            self.queue_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queue_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_succeeded: self.sends_succeeded.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            account_attempts: self.account_attempts.load(Ordering::Relaxed),
            account_failures: self.account_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            queue_processed: self.queue_processed.load(Ordering::Relaxed),
            queue_failed: self.queue_failed.load(Ordering::Relaxed),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        self.sends_succeeded.store(0, Ordering::Relaxed);
        self.sends_failed.store(0, Ordering::Relaxed);
        self.account_attempts.store(0, Ordering::Relaxed);
        self.account_failures.store(0, Ordering::Relaxed);
        self.failovers.store(0, Ordering::Relaxed);
        self.queue_processed.store(0, Ordering::Relaxed);
        self.queue_failed.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Logical sends that succeeded.
    pub sends_succeeded: u64,
    /// Logical sends that failed.
    pub sends_failed: u64,
    /// Account attempts.
    pub account_attempts: u64,
    /// Account failures.
    pub account_failures: u64,
    /// Failovers.
    pub failovers: u64,
    /// Queue items delivered.
    pub queue_processed: u64,
    /// Queue items dropped.
    pub queue_failed: u64,
}

impl MetricsSnapshot {
    /// Returns the logical send success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.sends_succeeded + self.sends_failed;
        if total == 0 {
            1.0
        } else {
            self.sends_succeeded as f64 / total as f64
        }
    }

    /// Formats the snapshot as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::debug!(timer = self.name, elapsed_ms = elapsed.as_millis() as u64, "Timer stopped");
        elapsed
    }
}
