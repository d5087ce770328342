//! Parallel file parsing with a per-file time budget and memory-adaptive
//! worker count.
//!
//! Workers never share mutable state: each owns its own `ParserRegistry`,
//! pulls paths from a shared queue, and returns the `ParserResult` by value
//! over a channel. A file whose result does not arrive within the budget is
//! recorded as failed and the pool moves on — the stuck worker finishes (or
//! not) in the background and its late result is discarded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::batch_sizer::resident_memory_mb;
use crate::parsers::{ParserRegistry, ParserResult};

/// Tick between timeout scans while waiting for worker results.
const COLLECT_TICK: Duration = Duration::from_millis(200);

pub struct FileWorkerPool {
    max_workers: usize,
    current_workers: usize,
    memory_limit_mb: u64,
    per_file_timeout: Duration,
}

impl FileWorkerPool {
    /// `configured_workers` of 0 means auto (CPU count − 1).
    pub fn new(configured_workers: usize, memory_limit_mb: u64, per_file_timeout: Duration) -> Self {
        let cpus = num_cpus::get();
        let auto = cpus.saturating_sub(1).max(1);
        let max_workers = if configured_workers == 0 {
            auto
        } else {
            configured_workers.min(cpus).max(1)
        };
        crate::debug_log!("[cortexgraph] worker pool sized to {max_workers} workers");
        Self {
            max_workers,
            current_workers: max_workers,
            memory_limit_mb,
            per_file_timeout,
        }
    }

    pub fn current_workers(&self) -> usize {
        self.current_workers
    }

    /// Halve the worker count while resident memory sits above the limit.
    fn adapt_to_memory(&mut self) {
        let rss = resident_memory_mb();
        if self.memory_limit_mb > 0 && rss > self.memory_limit_mb {
            self.current_workers = (self.current_workers / 2).max(1);
            eprintln!(
                "[cortexgraph] high memory usage ({rss}MB), reducing to {} workers",
                self.current_workers
            );
        } else if self.current_workers < self.max_workers && rss <= self.memory_limit_mb / 2 {
            // Pressure long gone: climb back one worker at a time.
            self.current_workers += 1;
        }
    }

    /// Parse `files`, returning one result per file (failures included).
    pub fn parse_files(&mut self, files: &[PathBuf]) -> Vec<ParserResult> {
        if files.is_empty() {
            return vec![];
        }
        self.adapt_to_memory();
        let workers = self.current_workers.min(files.len()).max(1);

        let jobs: Arc<Mutex<VecDeque<PathBuf>>> =
            Arc::new(Mutex::new(files.iter().cloned().collect()));
        let in_flight: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<ParserResult>();

        for _ in 0..workers {
            let jobs = jobs.clone();
            let in_flight = in_flight.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let registry = ParserRegistry::new();
                loop {
                    let job = jobs.lock().ok().and_then(|mut q| q.pop_front());
                    let Some(path) = job else { break };

                    if let Ok(mut map) = in_flight.lock() {
                        map.insert(path.clone(), Instant::now());
                    }
                    let result = registry.parse_file(&path);
                    if let Ok(mut map) = in_flight.lock() {
                        map.remove(&path);
                    }
                    if tx.send(result).is_err() {
                        break; // collector gone (late result after timeout sweep)
                    }
                }
            });
        }
        drop(tx);

        let mut results: Vec<ParserResult> = Vec::with_capacity(files.len());
        let mut timed_out: HashSet<PathBuf> = HashSet::new();

        while results.len() < files.len() {
            match rx.recv_timeout(COLLECT_TICK) {
                Ok(result) => {
                    if timed_out.contains(&result.file_path) {
                        crate::debug_log!(
                            "[cortexgraph] discarding late result for {}",
                            result.file_path.display()
                        );
                        continue;
                    }
                    results.push(result);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Sweep for files that blew their budget.
                    let expired: Vec<PathBuf> = in_flight
                        .lock()
                        .map(|map| {
                            map.iter()
                                .filter(|(path, started)| {
                                    started.elapsed() > self.per_file_timeout
                                        && !timed_out.contains(*path)
                                })
                                .map(|(path, _)| path.clone())
                                .collect()
                        })
                        .unwrap_or_default();

                    for path in expired {
                        timed_out.insert(path.clone());
                        results.push(ParserResult::failure(
                            &path,
                            format!("parse timed out after {}s", self.per_file_timeout.as_secs()),
                        ));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FileWorkerPool {
        FileWorkerPool::new(2, 0, Duration::from_secs(30))
    }

    fn write(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn parses_every_file_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..12)
            .map(|i| write(tmp.path(), &format!("m{i}.py"), &format!("def f{i}():\n    return {i}\n")))
            .collect();

        let mut pool = pool();
        let results = pool.parse_files(&files);
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.success));

        let mut seen: Vec<String> =
            results.iter().map(|r| r.file_path.display().to_string()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 12, "no duplicates, no drops");
    }

    #[test]
    fn failures_travel_with_successes() {
        let tmp = tempfile::tempdir().unwrap();
        let good = write(tmp.path(), "good.py", "def ok():\n    return 1\n");
        let bad = write(tmp.path(), "bad.py", "def (:\n");

        let mut pool = pool();
        let results = pool.parse_files(&[good.clone(), bad.clone()]);
        assert_eq!(results.len(), 2);

        let ok = results.iter().find(|r| r.file_path == good).unwrap();
        assert!(ok.success);
        let err = results.iter().find(|r| r.file_path == bad).unwrap();
        assert!(!err.success);
    }

    #[test]
    fn empty_input_yields_no_threads_and_no_results() {
        let mut pool = pool();
        assert!(pool.parse_files(&[]).is_empty());
    }

    #[test]
    fn worker_count_is_at_least_one_and_respects_cpu_bound() {
        let pool = FileWorkerPool::new(0, 0, Duration::from_secs(30));
        assert!(pool.current_workers() >= 1);
        assert!(pool.current_workers() <= num_cpus::get());

        let explicit = FileWorkerPool::new(4, 0, Duration::from_secs(30));
        assert!(explicit.current_workers() <= 4);
    }
}
