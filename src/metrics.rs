// Loop metrics module
//
// Lightweight counters describing how the event loop interleaves with the
// native main loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-loop counters
///
/// Uses atomic operations so a snapshot can be taken from any thread while
/// the loop keeps running on its own.
#[derive(Debug)]
pub struct LoopMetrics {
    /// Native iterations the loop drove itself (nested runs)
    pub native_iterations: AtomicU64,

    /// Scheduler callbacks run, task steps included
    pub callbacks_run: AtomicU64,

    /// Callbacks that panicked and were routed to the exception handler
    pub callback_panics: AtomicU64,

    /// Callbacks slower than the configured threshold (debug mode only)
    pub slow_callbacks: AtomicU64,

    /// Native sources registered by the bridge
    pub mirrors_added: AtomicU64,

    /// Native sources removed by the bridge or by their own Break
    pub mirrors_removed: AtomicU64,

    /// Native callbacks ignored because their mirror was replaced or detached
    pub stale_mirror_fires: AtomicU64,

    /// Total time spent inside scheduler callbacks in microseconds
    pub callback_time_us: AtomicU64,

    start_time: Instant,
}

/// Plain copy of [`LoopMetrics`] at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub native_iterations: u64,
    pub callbacks_run: u64,
    pub callback_panics: u64,
    pub slow_callbacks: u64,
    pub mirrors_added: u64,
    pub mirrors_removed: u64,
    pub stale_mirror_fires: u64,
}

impl MetricsSnapshot {
    /// Mirrors registered and not yet removed
    pub fn live_mirrors(&self) -> u64 {
        self.mirrors_added.saturating_sub(self.mirrors_removed)
    }
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self {
            native_iterations: AtomicU64::new(0),
            callbacks_run: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            slow_callbacks: AtomicU64::new(0),
            mirrors_added: AtomicU64::new(0),
            mirrors_removed: AtomicU64::new(0),
            stale_mirror_fires: AtomicU64::new(0),
            callback_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_native_iteration(&self) {
        self.native_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one callback run and how long it took
    pub fn record_callback(&self, elapsed: Duration) {
        self.callbacks_run.fetch_add(1, Ordering::Relaxed);
        self.callback_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_callback(&self) {
        self.slow_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_added(&self) {
        self.mirrors_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_removed(&self) {
        self.mirrors_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_fire(&self) {
        self.stale_mirror_fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average callback duration in microseconds
    pub fn avg_callback_time_us(&self) -> f64 {
        let total = self.callback_time_us.load(Ordering::Relaxed);
        let count = self.callbacks_run.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            native_iterations: self.native_iterations.load(Ordering::Relaxed),
            callbacks_run: self.callbacks_run.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            slow_callbacks: self.slow_callbacks.load(Ordering::Relaxed),
            mirrors_added: self.mirrors_added.load(Ordering::Relaxed),
            mirrors_removed: self.mirrors_removed.load(Ordering::Relaxed),
            stale_mirror_fires: self.stale_mirror_fires.load(Ordering::Relaxed),
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        tracing::info!("=== Event Loop Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Callbacks: {} run (avg {:.1}us), {} panicked, {} slow",
            snapshot.callbacks_run,
            self.avg_callback_time_us(),
            snapshot.callback_panics,
            snapshot.slow_callbacks
        );
        tracing::info!(
            "Mirrors: {} added, {} removed, {} stale fires",
            snapshot.mirrors_added,
            snapshot.mirrors_removed,
            snapshot.stale_mirror_fires
        );
        tracing::info!("Nested native iterations: {}", snapshot.native_iterations);
    }
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}
