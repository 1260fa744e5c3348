//! Migration tuning.

use crate::capture::CaptureKind;
use std::time::Duration;

/// Copy and change-log apply settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows copied per batch.
    pub batch_size: usize,
    /// Pause between copy batches.
    pub batch_delay: Duration,
    /// Change-log entries applied per batch.
    pub apply_count: usize,
    /// Backlog below which the shadow counts as converged.
    pub switch_threshold: u64,
    /// Consecutive converged polls required before cutover.
    pub converge_polls: u32,
    /// Wait between polls when the log is nearly empty.
    pub poll_interval: Duration,
    /// Give up syncing after this long.
    pub deadline: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay: Duration::from_millis(10),
            apply_count: 1000,
            switch_threshold: 20,
            converge_polls: 3,
            poll_interval: Duration::from_millis(100),
            deadline: Duration::from_secs(600),
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_apply_count(mut self, apply_count: usize) -> Self {
        self.apply_count = apply_count.max(1);
        self
    }

    /// Threshold of at least 1, so an empty backlog always converges.
    pub fn with_switch_threshold(mut self, threshold: u64) -> Self {
        self.switch_threshold = threshold.max(1);
        self
    }

    pub fn with_converge_polls(mut self, polls: u32) -> Self {
        self.converge_polls = polls.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Cutover settings.
#[derive(Debug, Clone)]
pub struct CutoverConfig {
    /// Total time allowed for acquiring the exclusive lock.
    pub lock_timeout: Duration,
    /// Drain attempts under the lock before giving up.
    pub drain_retries: u32,
    /// How long to wait for a capture to persist in-flight writes.
    pub flush_timeout: Duration,
    /// Refresh statistics of the new table after cleanup.
    pub analyze: bool,
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            drain_retries: 3,
            flush_timeout: Duration::from_secs(5),
            analyze: true,
        }
    }
}

impl CutoverConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_drain_retries(mut self, retries: u32) -> Self {
        self.drain_retries = retries.max(1);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }

    /// Wait of the `attempt`-th lock try (1-based): grows by 100ms per attempt
    /// up to one second.
    pub fn attempt_wait(attempt: u32) -> Duration {
        Duration::from_millis(u64::from(attempt.max(1)).saturating_mul(100).min(1000))
    }
}

/// Configuration of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub sync: SyncConfig,
    pub cutover: CutoverConfig,
    /// Bounded wait for the exclusive lock during shadow setup and in-place
    /// alters.
    pub setup_lock_timeout: Duration,
    /// Capture used by new migrations.
    pub capture: CaptureKind,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            cutover: CutoverConfig::default(),
            setup_lock_timeout: Duration::from_secs(60),
            capture: CaptureKind::Trigger,
        }
    }
}

impl MigrationConfig {
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_cutover(mut self, cutover: CutoverConfig) -> Self {
        self.cutover = cutover;
        self
    }

    /// Use one bounded lock wait for setup and cutover.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.setup_lock_timeout = timeout;
        self.cutover.lock_timeout = timeout;
        self
    }

    pub fn with_capture(mut self, capture: CaptureKind) -> Self {
        self.capture = capture;
        self
    }
}
