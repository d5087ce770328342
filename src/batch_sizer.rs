//! Adaptive batch sizing from memory pressure and recent error signal.
//!
//! One knob, one read API: `get_batch_size()`. Each finished batch reports
//! `BatchMetrics` and the sizer reacts:
//!   - resident memory above the threshold -> halve (floor 1)
//!   - errors above 20% of the batch      -> shrink one step
//!   - 5 consecutive clean batches        -> grow one step, capped
//!
//! No oscillation dampening beyond the consecutive-successes rule.

use serde::Serialize;
use std::collections::VecDeque;
use sysinfo::{ProcessesToUpdate, System};

/// Size delta applied by a single shrink/grow adjustment.
const STEP: usize = 5;
/// Clean batches required before growing.
const GROW_AFTER_CLEAN: usize = 5;
/// Rolling metrics window retained for stats.
const WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    pub batch_size: usize,
    pub elapsed_ms: u64,
    pub error_count: usize,
}

/// Resident set size of the current process in MB, or 0 when the platform
/// refuses to answer (treated as "no pressure").
pub fn resident_memory_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else { return 0 };
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory() / (1024 * 1024)).unwrap_or(0)
}

pub struct BatchSizer {
    current: usize,
    max_size: usize,
    memory_threshold_mb: u64,
    window: VecDeque<BatchMetrics>,
    clean_streak: usize,
}

impl BatchSizer {
    pub fn new(initial_size: usize, max_size: usize, memory_threshold_mb: u64) -> Self {
        let max_size = max_size.max(1);
        Self {
            current: initial_size.clamp(1, max_size),
            max_size,
            memory_threshold_mb,
            window: VecDeque::with_capacity(WINDOW),
            clean_streak: 0,
        }
    }

    /// The single read API.
    pub fn get_batch_size(&self) -> usize {
        self.current
    }

    pub fn record_batch(&mut self, metrics: BatchMetrics) {
        self.record_batch_with_memory(metrics, resident_memory_mb());
    }

    /// Policy core, separated from the live memory probe for testability.
    pub fn record_batch_with_memory(&mut self, metrics: BatchMetrics, rss_mb: u64) {
        let error_ratio = if metrics.batch_size > 0 {
            metrics.error_count as f64 / metrics.batch_size as f64
        } else {
            0.0
        };
        let clean = metrics.error_count == 0;

        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(metrics);

        if rss_mb > self.memory_threshold_mb {
            self.current = (self.current / 2).max(1);
            self.clean_streak = 0;
            crate::debug_log!(
                "[cortexgraph] memory pressure ({rss_mb}MB), batch size halved to {}",
                self.current
            );
            return;
        }

        if error_ratio > 0.20 {
            self.current = self.current.saturating_sub(STEP).max(1);
            self.clean_streak = 0;
            crate::debug_log!(
                "[cortexgraph] error ratio {error_ratio:.2}, batch size shrunk to {}",
                self.current
            );
            return;
        }

        if clean {
            self.clean_streak += 1;
            if self.clean_streak >= GROW_AFTER_CLEAN {
                self.clean_streak = 0;
                self.current = (self.current + STEP).min(self.max_size);
            }
        } else {
            self.clean_streak = 0;
        }
    }

    pub fn recent_metrics(&self) -> impl Iterator<Item = &BatchMetrics> {
        self.window.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(size: usize, errors: usize) -> BatchMetrics {
        BatchMetrics { batch_size: size, elapsed_ms: 100, error_count: errors }
    }

    #[test]
    fn memory_pressure_halves_with_floor_one() {
        let mut sizer = BatchSizer::new(25, 100, 1_000);
        sizer.record_batch_with_memory(metrics(25, 0), 2_000);
        assert_eq!(sizer.get_batch_size(), 12);

        for _ in 0..10 {
            sizer.record_batch_with_memory(metrics(12, 0), 2_000);
        }
        assert_eq!(sizer.get_batch_size(), 1);
    }

    #[test]
    fn error_heavy_batch_shrinks_one_step() {
        let mut sizer = BatchSizer::new(25, 100, 10_000);
        // 6 errors out of 25 = 24% > 20%
        sizer.record_batch_with_memory(metrics(25, 6), 100);
        assert_eq!(sizer.get_batch_size(), 20);
    }

    #[test]
    fn errors_at_or_below_twenty_percent_do_not_shrink() {
        let mut sizer = BatchSizer::new(25, 100, 10_000);
        sizer.record_batch_with_memory(metrics(25, 5), 100); // exactly 20%
        assert_eq!(sizer.get_batch_size(), 25);
    }

    #[test]
    fn five_clean_batches_grow_up_to_cap() {
        let mut sizer = BatchSizer::new(95, 100, 10_000);
        for _ in 0..5 {
            sizer.record_batch_with_memory(metrics(95, 0), 100);
        }
        assert_eq!(sizer.get_batch_size(), 100);

        // Further growth is capped.
        for _ in 0..5 {
            sizer.record_batch_with_memory(metrics(100, 0), 100);
        }
        assert_eq!(sizer.get_batch_size(), 100);
    }

    #[test]
    fn an_error_resets_the_clean_streak() {
        let mut sizer = BatchSizer::new(25, 100, 10_000);
        for _ in 0..4 {
            sizer.record_batch_with_memory(metrics(25, 0), 100);
        }
        // One error (4% — no shrink) resets the streak.
        sizer.record_batch_with_memory(metrics(25, 1), 100);
        sizer.record_batch_with_memory(metrics(25, 0), 100);
        assert_eq!(sizer.get_batch_size(), 25);
    }
}
