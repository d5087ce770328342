//! Pipeline phase/ETA state. Pure bookkeeping — rendering is the caller's
//! problem; an optional callback receives a snapshot after every change.

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingPhase {
    Discovery,
    Filtering,
    Batching,
    Processing,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub phase: IndexingPhase,
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub files_filtered: usize,
    pub batches_total: usize,
    pub batches_done: usize,
    pub entities_created: usize,
    pub relations_created: usize,
    pub chunks_created: usize,
    pub files_per_second: f64,
    /// None until enough work has finished to extrapolate.
    pub eta_seconds: Option<f64>,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send>;

pub struct PipelineProgress {
    started: Option<Instant>,
    snapshot: ProgressSnapshot,
    callback: Option<ProgressCallback>,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineProgress {
    pub fn new() -> Self {
        Self {
            started: None,
            snapshot: ProgressSnapshot {
                phase: IndexingPhase::Discovery,
                files_total: 0,
                files_done: 0,
                files_failed: 0,
                files_filtered: 0,
                batches_total: 0,
                batches_done: 0,
                entities_created: 0,
                relations_created: 0,
                chunks_created: 0,
                files_per_second: 0.0,
                eta_seconds: None,
            },
            callback: None,
        }
    }

    pub fn set_phase(&mut self, phase: IndexingPhase) {
        self.snapshot.phase = phase;
        self.emit();
    }

    pub fn update_discovery(&mut self, files_found: usize, files_filtered: usize) {
        self.snapshot.files_total = files_found;
        self.snapshot.files_filtered = files_filtered;
        self.emit();
    }

    pub fn start(&mut self, total_files: usize, total_batches: usize, callback: Option<ProgressCallback>) {
        self.started = Some(Instant::now());
        self.snapshot.phase = IndexingPhase::Processing;
        self.snapshot.files_total = total_files;
        self.snapshot.batches_total = total_batches;
        self.callback = callback;
        self.emit();
    }

    pub fn complete_batch(
        &mut self,
        files_processed: usize,
        files_failed: usize,
        entities: usize,
        relations: usize,
        chunks: usize,
    ) {
        self.snapshot.files_done += files_processed;
        self.snapshot.files_failed += files_failed;
        self.snapshot.batches_done += 1;
        self.snapshot.entities_created += entities;
        self.snapshot.relations_created += relations;
        self.snapshot.chunks_created += chunks;
        self.recompute_eta();
        self.emit();
    }

    fn recompute_eta(&mut self) {
        let Some(started) = self.started else { return };
        let done = self.snapshot.files_done + self.snapshot.files_failed;
        if done == 0 {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64().max(0.001);
        let rate = done as f64 / elapsed;
        self.snapshot.files_per_second = rate;
        let remaining = self.snapshot.files_total.saturating_sub(done);
        self.snapshot.eta_seconds = Some(remaining as f64 / rate.max(0.001));
    }

    pub fn finish(&mut self, _success: bool) -> ProgressSnapshot {
        self.snapshot.phase = IndexingPhase::Done;
        self.snapshot.eta_seconds = Some(0.0);
        self.emit();
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    fn emit(&self) {
        if let Some(cb) = &self.callback {
            cb(&self.snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn batch_completion_accumulates_counters() {
        let mut progress = PipelineProgress::new();
        progress.start(10, 2, None);
        progress.complete_batch(5, 0, 12, 7, 3);
        progress.complete_batch(4, 1, 8, 2, 1);

        let snap = progress.snapshot();
        assert_eq!(snap.files_done, 9);
        assert_eq!(snap.files_failed, 1);
        assert_eq!(snap.batches_done, 2);
        assert_eq!(snap.entities_created, 20);
        assert_eq!(snap.relations_created, 9);
        assert_eq!(snap.chunks_created, 4);
        assert_eq!(snap.eta_seconds, Some(0.0), "all files accounted for");
    }

    #[test]
    fn callback_fires_on_every_change() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let mut progress = PipelineProgress::new();
        progress.start(2, 1, Some(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        })));
        progress.complete_batch(2, 0, 1, 0, 0);
        progress.finish(true);

        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn eta_appears_once_work_is_done() {
        let mut progress = PipelineProgress::new();
        progress.start(100, 4, None);
        assert!(progress.snapshot().eta_seconds.is_none());
        progress.complete_batch(25, 0, 0, 0, 0);
        assert!(progress.snapshot().eta_seconds.is_some());
        assert!(progress.snapshot().files_per_second > 0.0);
    }
}
