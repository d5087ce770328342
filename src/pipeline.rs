//! Bulk indexing orchestrator: discovery → filtering → batching → parse →
//! store, with checkpoint/resume and adaptive batch sizing.
//!
//! A single orchestrator thread drives the run. Parsing fans out to the
//! worker pool for large batches; embedding and store calls happen inline.
//! A stop request is honoured at the next inter-batch boundary after the
//! checkpoint has been flushed.

use anyhow::{Context, Result};
use glob::Pattern;
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch_sizer::{BatchMetrics, BatchSizer};
use crate::checkpoint::IndexingCheckpoint;
use crate::config::IndexerConfig;
use crate::embeddings::{Embedder, UsageStats};
use crate::entities::{Entity, EntityChunk, Relation};
use crate::fallback::parse_with_fallback;
use crate::file_cache::{FileCacheStats, FileStateCache};
use crate::parallel::FileWorkerPool;
use crate::parsers::{ParserRegistry, ParserResult};
use crate::processor::UnifiedContentProcessor;
use crate::progress::{IndexingPhase, PipelineProgress, ProgressCallback};
use crate::vector_store::VectorStore;

// ---------------------------------------------------------------------------
// Ignore resolver
// ---------------------------------------------------------------------------

/// External collaborator deciding which relative paths stay out of the
/// index, applied after include patterns.
pub trait IgnoreResolver: Send + Sync {
    fn should_ignore(&self, rel_path: &Path) -> bool;
}

/// Default resolver: skips paths containing any configured directory name.
pub struct DirNameIgnore {
    names: Vec<String>,
}

impl DirNameIgnore {
    pub fn new(names: &[String]) -> Self {
        Self { names: names.to_vec() }
    }
}

impl IgnoreResolver for DirNameIgnore {
    fn should_ignore(&self, rel_path: &Path) -> bool {
        rel_path.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            self.names.iter().any(|n| n == name.as_ref())
        })
    }
}

/// Walker overrides for common high-noise artifacts. For directories both
/// the entry and its descendants need patterns, otherwise walkers may still
/// descend into the directory.
fn junk_overrides(project_root: &Path) -> Result<Override> {
    let mut ob = OverrideBuilder::new(project_root);

    // Lockfiles
    ob.add("**/*.lock")?;
    ob.add("**/package-lock.json")?;
    ob.add("**/pnpm-lock.yaml")?;
    ob.add("**/yarn.lock")?;
    ob.add("**/Cargo.lock")?;

    // Sourcemaps + images/icons
    ob.add("**/*.map")?;
    ob.add("**/*.svg")?;
    ob.add("**/*.png")?;
    ob.add("**/*.ico")?;
    ob.add("**/*.jpg")?;
    ob.add("**/*.jpeg")?;
    ob.add("**/*.gif")?;

    // Common build outputs / heavy dirs
    for d in [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "coverage",
        ".next",
        ".nuxt",
        ".venv",
        "venv",
        "__pycache__",
        ".index_cache",
        "out",
    ] {
        ob.add(&format!("**/{d}"))?;
        ob.add(&format!("**/{d}/**"))?;
    }

    Ok(ob.build()?)
}

// ---------------------------------------------------------------------------
// File categorisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessingTier {
    /// Generated / type-definition files: quick wins, parsed first.
    Light,
    Standard,
    /// Oversized hand-written files that deserve the full parse budget.
    Deep,
}

/// Size above which a hand-written file is treated as deep.
const DEEP_FILE_BYTES: u64 = 64 * 1024;

pub fn categorize_file(path: &Path) -> ProcessingTier {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
    if name.ends_with(".d.ts") || name.ends_with(".min.js") || name.ends_with(".generated.ts") {
        return ProcessingTier::Light;
    }
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size > DEEP_FILE_BYTES {
        ProcessingTier::Deep
    } else {
        ProcessingTier::Standard
    }
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub entities_created: usize,
    pub relations_created: usize,
    pub implementation_chunks: usize,
    pub batch_count: usize,
    pub total_time_seconds: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub cache_stats: Option<FileCacheStats>,
    #[serde(skip)]
    pub embedding_stats: Option<UsageStats>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct IndexingPipeline {
    config: IndexerConfig,
    project_root: PathBuf,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    ignore_resolver: Box<dyn IgnoreResolver>,
    registry: ParserRegistry,
    processor: UnifiedContentProcessor,
    pool: FileWorkerPool,
    batch_sizer: BatchSizer,
    checkpoint: IndexingCheckpoint,
    progress: PipelineProgress,
    stop_requested: Arc<AtomicBool>,
}

impl IndexingPipeline {
    pub fn new(
        config: IndexerConfig,
        project_root: &Path,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        ignore_resolver: Option<Box<dyn IgnoreResolver>>,
    ) -> Result<Self> {
        let project_root = project_root
            .canonicalize()
            .with_context(|| format!("unreadable project root: {}", project_root.display()))?;

        let cache_root = config.cache_root(&project_root);
        let ignore_resolver = ignore_resolver
            .unwrap_or_else(|| Box::new(DirNameIgnore::new(&config.discovery.exclude_dir_names)));

        Ok(Self {
            processor: UnifiedContentProcessor::new(
                store.clone(),
                embedder.clone(),
                Duration::from_secs(config.pipeline.orphan_sweep_interval_secs),
            ),
            pool: FileWorkerPool::new(
                config.parallel.max_workers,
                config.parallel.memory_limit_mb,
                Duration::from_secs(config.parallel.per_file_timeout_secs),
            ),
            batch_sizer: BatchSizer::new(
                config.pipeline.initial_batch_size,
                config.pipeline.max_batch_size,
                config.pipeline.memory_threshold_mb,
            ),
            checkpoint: IndexingCheckpoint::new(&cache_root, config.pipeline.enable_resume),
            progress: PipelineProgress::new(),
            registry: ParserRegistry::new(),
            ignore_resolver,
            stop_requested: Arc::new(AtomicBool::new(false)),
            config,
            project_root,
            store,
            embedder,
        })
    }

    /// Flag checked at every inter-batch boundary; the checkpoint is flushed
    /// before the run winds down.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    // ── Discovery ────────────────────────────────────────────────────────

    fn include_patterns(&self) -> Vec<Pattern> {
        self.config
            .discovery
            .include_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect()
    }

    fn discover_files(&self) -> Result<Vec<PathBuf>> {
        let overrides = junk_overrides(&self.project_root)?;
        let includes = self.include_patterns();
        let max_bytes = self.config.effective_max_file_bytes();

        let walker = WalkBuilder::new(&self.project_root)
            .standard_filters(true) // .gitignore, .ignore, hidden, etc.
            .overrides(overrides)
            .build();

        let mut files: Vec<PathBuf> = Vec::new();
        for item in walker {
            let Ok(dent) = item else { continue };
            if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let abs_path = dent.into_path();

            let Ok(rel_path) = abs_path.strip_prefix(&self.project_root) else { continue };
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");

            // Include patterns first, then the ignore resolver.
            if includes.is_empty() {
                if !self.registry.supports(&abs_path) {
                    continue;
                }
            } else if !includes.iter().any(|p| p.matches(&rel_str)) {
                continue;
            }
            if self.ignore_resolver.should_ignore(rel_path) {
                continue;
            }

            // Oversized files are silently skipped, not an error.
            let Ok(meta) = std::fs::metadata(&abs_path) else { continue };
            if meta.len() > max_bytes {
                continue;
            }

            files.push(abs_path);
        }

        files.sort();
        Ok(files)
    }

    // ── Batching ─────────────────────────────────────────────────────────

    /// Light files first so quick wins happen before slow ones.
    fn create_batches(&self, files: &[PathBuf]) -> Vec<Vec<PathBuf>> {
        let batch_size = self.batch_sizer.get_batch_size().max(1);

        let mut tiered: Vec<(ProcessingTier, PathBuf)> =
            files.iter().map(|f| (categorize_file(f), f.clone())).collect();
        tiered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        tiered
            .chunks(batch_size)
            .map(|chunk| chunk.iter().map(|(_, p)| p.clone()).collect())
            .collect()
    }

    // ── Main entry points ────────────────────────────────────────────────

    pub fn run(
        &mut self,
        collection: &str,
        files: Option<Vec<PathBuf>>,
        incremental: bool,
        progress_callback: Option<ProgressCallback>,
    ) -> PipelineResult {
        let started = Instant::now();
        let mut result = PipelineResult::default();
        let cache_root = self.config.cache_root(&self.project_root);

        // Phase 1: discovery.
        self.progress.set_phase(IndexingPhase::Discovery);
        let all_files = match files {
            Some(list) => list.into_iter().filter(|f| f.exists()).collect::<Vec<_>>(),
            None => match self.discover_files() {
                Ok(list) => list,
                Err(e) => {
                    // Fatal: raised before any work starts.
                    result.errors.push(format!("discovery failed: {e}"));
                    result.total_time_seconds = started.elapsed().as_secs_f64();
                    return result;
                }
            },
        };

        if all_files.is_empty() {
            result.success = true;
            result.warnings.push("No files found to index".to_string());
            result.total_time_seconds = started.elapsed().as_secs_f64();
            return result;
        }

        // Phase 2: filter unchanged files through the state cache.
        self.progress.set_phase(IndexingPhase::Filtering);
        let mut file_cache = FileStateCache::open(&cache_root, collection);
        let changed_files = if incremental {
            let changed = file_cache.get_changed_files(&all_files);
            result.files_skipped = all_files.len() - changed.len();
            self.progress.update_discovery(all_files.len(), result.files_skipped);
            changed
        } else {
            all_files.clone()
        };

        if changed_files.is_empty() {
            result.success = true;
            result.warnings.push("All files unchanged, nothing to index".to_string());
            result.cache_stats = Some(file_cache.stats());
            result.embedding_stats = Some(self.embedder.usage_stats());
            result.total_time_seconds = started.elapsed().as_secs_f64();
            return result;
        }

        // Phase 3: batching.
        self.progress.set_phase(IndexingPhase::Batching);
        let batches = self.create_batches(&changed_files);
        result.batch_count = batches.len();

        self.progress.start(changed_files.len(), batches.len(), progress_callback);
        self.checkpoint.create(collection, &changed_files);

        let checkpoint_every_batches = (self.config.pipeline.checkpoint_interval
            / self.batch_sizer.get_batch_size().max(1))
        .max(1);

        // Phase 4: batch loop.
        let mut all_processed: Vec<PathBuf> = Vec::new();
        let mut interrupted = false;

        for (batch_index, batch) in batches.iter().enumerate() {
            if self.stop_requested.load(Ordering::SeqCst) {
                if let Err(e) = self.checkpoint.save() {
                    result.warnings.push(format!("checkpoint flush on stop failed: {e}"));
                }
                result.warnings.push(format!(
                    "stop requested - run halted after batch {batch_index} with checkpoint saved"
                ));
                interrupted = true;
                break;
            }

            let batch_started = Instant::now();
            let outcome = self.process_batch(collection, batch, &mut result);

            self.checkpoint.update_batch(
                &outcome.processed,
                &outcome.failed,
                batch_index,
                outcome.entities,
                outcome.relations,
                outcome.chunks,
            );
            if (batch_index + 1) % checkpoint_every_batches == 0 {
                if let Err(e) = self.checkpoint.save() {
                    result.warnings.push(format!("checkpoint save failed: {e}"));
                }
            }

            self.batch_sizer.record_batch(BatchMetrics {
                batch_size: batch.len(),
                elapsed_ms: batch_started.elapsed().as_millis() as u64,
                error_count: outcome.failed.len(),
            });

            self.progress.complete_batch(
                outcome.processed.len(),
                outcome.failed.len(),
                outcome.entities,
                outcome.relations,
                outcome.chunks,
            );

            result.files_processed += outcome.processed.len();
            result.files_failed += outcome.failed.len();
            result.entities_created += outcome.entities;
            result.relations_created += outcome.relations;
            result.implementation_chunks += outcome.chunks;
            all_processed.extend(outcome.processed);

            crate::debug_log!(
                "[cortexgraph] batch {}/{}: {} ok, {} failed, {}ms",
                batch_index + 1,
                batches.len(),
                result.files_processed,
                result.files_failed,
                batch_started.elapsed().as_millis()
            );
        }

        // Phase 5: finalisation. A file's chunks are visible in the store
        // before its entry lands in the state cache.
        self.progress.set_phase(IndexingPhase::Finalizing);
        if !all_processed.is_empty() {
            if let Err(e) = file_cache.update_batch(&all_processed) {
                result.warnings.push(format!("file-state cache refresh failed: {e}"));
            }
        }

        if interrupted {
            result.success = result.files_processed > 0;
        } else {
            self.checkpoint.clear(collection);
            result.success = result.files_processed > 0;
        }

        self.progress.finish(result.success);
        result.cache_stats = Some(file_cache.stats());
        result.embedding_stats = Some(self.embedder.usage_stats());
        result.total_time_seconds = started.elapsed().as_secs_f64();
        result
    }

    /// Resume an interrupted run from its checkpoint. The replay processes
    /// only pending files; the final store state matches an uninterrupted
    /// run over the same inputs.
    pub fn resume(
        &mut self,
        collection: &str,
        progress_callback: Option<ProgressCallback>,
    ) -> PipelineResult {
        if self.checkpoint.load(collection).is_none() {
            let mut result = PipelineResult::default();
            result.errors.push("No valid checkpoint found to resume from".to_string());
            return result;
        }

        let pending = self.checkpoint.pending_files();
        let already_processed = self
            .checkpoint
            .state()
            .map(|s| s.processed_files.len())
            .unwrap_or(0);

        if pending.is_empty() {
            self.checkpoint.clear(collection);
            let mut result = PipelineResult { success: true, ..Default::default() };
            result.files_processed = already_processed;
            result.warnings.push("Resume: all files already processed".to_string());
            return result;
        }

        crate::debug_log!(
            "[cortexgraph] resuming: {} processed, {} pending",
            already_processed,
            pending.len()
        );

        // The checkpoint is the source of truth; skip the unchanged filter.
        let mut result = self.run(collection, Some(pending), false, progress_callback);
        // Files finished before the interruption still need their state-cache
        // entries refreshed so the next incremental run skips them.
        result.files_processed += already_processed;
        result
    }

    // ── Batch processing ─────────────────────────────────────────────────

    fn process_batch(
        &mut self,
        collection: &str,
        batch: &[PathBuf],
        result: &mut PipelineResult,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        // Parse: worker pool for big batches, inline for small ones.
        let parse_results: Vec<ParserResult> =
            if batch.len() >= self.config.pipeline.min_parallel_batch {
                self.pool.parse_files(batch)
            } else {
                batch.iter().map(|p| self.registry.parse_file(p)).collect()
            };

        let mut entities: Vec<Entity> = Vec::new();
        let mut relations: Vec<Relation> = Vec::new();
        let mut implementation_chunks: Vec<EntityChunk> = Vec::new();

        for parse_result in parse_results {
            let final_result = if parse_result.success {
                parse_result
            } else {
                let reason = parse_result.errors.first().cloned().unwrap_or_default();
                // Timeouts and unreadable files stay failures; everything
                // else gets the regex safety net.
                if reason.starts_with("parse timed out") || reason.contains("failed to read") {
                    outcome.failed.push(parse_result.file_path.clone());
                    result.errors.push(format!(
                        "{}: {reason}",
                        parse_result.file_path.display()
                    ));
                    continue;
                }
                let fallback = parse_with_fallback(&parse_result.file_path, &reason);
                if !fallback.success {
                    outcome.failed.push(fallback.file_path.clone());
                    result
                        .errors
                        .push(fallback.errors.first().cloned().unwrap_or(reason));
                    continue;
                }
                fallback
            };

            result.warnings.extend(final_result.warnings.iter().cloned());
            outcome.entities += final_result.entities.len();
            outcome.relations += final_result.relations.len();
            outcome.chunks += final_result.implementation_chunks.len();
            entities.extend(final_result.entities);
            relations.extend(final_result.relations);
            implementation_chunks.extend(final_result.implementation_chunks);
            outcome.processed.push(final_result.file_path);
        }

        // Store. A batch with zero surviving records makes no store call.
        if !entities.is_empty() || !relations.is_empty() || !implementation_chunks.is_empty() {
            let changed_entity_ids: HashSet<String> =
                entities.iter().map(|e| e.composite_id()).collect();

            let processing = self.processor.process_all_content(
                collection,
                &entities,
                &relations,
                &implementation_chunks,
                &changed_entity_ids,
            );
            result.warnings.extend(processing.warnings.iter().cloned());

            if !processing.success {
                // The whole batch fails; its files stay out of the state
                // cache and wait in failed_files for a future resume.
                result.errors.push(format!(
                    "storage failed: {}",
                    processing.error_message.unwrap_or_else(|| "unknown error".into())
                ));
                outcome.failed.extend(outcome.processed.drain(..));
                outcome.entities = 0;
                outcome.relations = 0;
                outcome.chunks = 0;
            }
        }

        outcome
    }
}

#[derive(Default)]
struct BatchOutcome {
    processed: Vec<PathBuf>,
    failed: Vec<PathBuf>,
    entities: usize,
    relations: usize,
    chunks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizer_tiers_by_name_then_size() {
        let tmp = tempfile::tempdir().unwrap();
        let dts = tmp.path().join("types.d.ts");
        std::fs::write(&dts, "export type A = number;\n").unwrap();
        assert_eq!(categorize_file(&dts), ProcessingTier::Light);

        let small = tmp.path().join("small.py");
        std::fs::write(&small, "x = 1\n").unwrap();
        assert_eq!(categorize_file(&small), ProcessingTier::Standard);

        let big = tmp.path().join("big.py");
        std::fs::write(&big, "#".repeat(70 * 1024)).unwrap();
        assert_eq!(categorize_file(&big), ProcessingTier::Deep);
    }

    #[test]
    fn dir_name_ignore_matches_components() {
        let resolver = DirNameIgnore::new(&["generated".to_string()]);
        assert!(resolver.should_ignore(Path::new("src/generated/api.py")));
        assert!(!resolver.should_ignore(Path::new("src/gen/api.py")));
    }
}
