//! End-to-end indexing scenarios against a real temp tree, the flat-file
//! vector store, and the two-tier embedding cache. The embedding "API" is a
//! deterministic stub that counts how often each text reaches it, so cache
//! monotonicity is observable.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cortexgraph::config::IndexerConfig;
use cortexgraph::embedding_cache::EmbeddingCache;
use cortexgraph::embeddings::{CachingEmbedder, Embedder, EmbeddingResult, ItemKind};
use cortexgraph::pipeline::{IndexingPipeline, PipelineResult};
use cortexgraph::vector_store::{JsonFileStore, PointFilter, VectorStore};

// ---------------------------------------------------------------------------
// Deterministic counting embedder
// ---------------------------------------------------------------------------

struct CountingEmbedder {
    per_text: Mutex<HashMap<String, u64>>,
    total_calls: AtomicU64,
}

impl CountingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self { per_text: Mutex::new(HashMap::new()), total_calls: AtomicU64::new(0) })
    }

    fn calls_for(&self, text: &str) -> u64 {
        self.per_text.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }
}

impl Embedder for CountingEmbedder {
    fn embed_batch(&self, texts: &[String], _kind: ItemKind) -> Vec<EmbeddingResult> {
        let mut per_text = self.per_text.lock().unwrap();
        texts
            .iter()
            .map(|t| {
                *per_text.entry(t.clone()).or_insert(0) += 1;
                self.total_calls.fetch_add(1, Ordering::SeqCst);
                let byte_sum: u32 = t.bytes().map(u32::from).sum();
                EmbeddingResult::ok(
                    t.clone(),
                    vec![byte_sum as f32, t.len() as f32, 1.0, 0.5],
                    "counting-stub",
                    1,
                    0.0,
                )
            })
            .collect()
    }

    fn dimension(&self) -> u32 {
        4
    }

    fn max_input_tokens(&self) -> u32 {
        8_192
    }

    fn model_name(&self) -> &str {
        "counting-stub"
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    project: PathBuf,
    store: Arc<JsonFileStore>,
    upstream: Arc<CountingEmbedder>,
    config: IndexerConfig,
}

impl Harness {
    fn new(project: &Path) -> Self {
        let config = IndexerConfig::default();
        let store_dir = config.cache_root(project).join("vector_store");
        Self {
            project: project.to_path_buf(),
            store: Arc::new(JsonFileStore::open(&store_dir).unwrap()),
            upstream: CountingEmbedder::new(),
            config,
        }
    }

    fn pipeline(&self) -> IndexingPipeline {
        let cache_root = self.config.cache_root(&self.project);
        let cache = Arc::new(EmbeddingCache::open(&cache_root, "counting-stub", 10_000, 500));
        let embedder = Arc::new(CachingEmbedder::new(self.upstream.clone(), cache));
        IndexingPipeline::new(
            self.config.clone(),
            &self.project,
            self.store.clone(),
            embedder,
            None,
        )
        .unwrap()
    }

    fn run(&self, collection: &str) -> PipelineResult {
        self.pipeline().run(collection, None, true, None)
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.project.join(name), content).unwrap();
    }

    fn metadata_names(&self, collection: &str) -> HashSet<String> {
        self.store
            .scroll(collection, &PointFilter::default().chunk_type("metadata"))
            .unwrap()
            .into_iter()
            .map(|r| r.payload.entity_name().to_string())
            .collect()
    }

    fn implementation_names(&self, collection: &str) -> Vec<String> {
        self.store
            .scroll(collection, &PointFilter::default().chunk_type("implementation"))
            .unwrap()
            .into_iter()
            .map(|r| r.payload.entity_name().to_string())
            .collect()
    }

    /// Set of (point id, content_hash) pairs — the store-equality signature.
    fn store_signature(&self, collection: &str) -> HashSet<(u64, String)> {
        self.store
            .scroll(collection, &PointFilter::default())
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.payload.content_hash().to_string()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// S1 — cold index
// ---------------------------------------------------------------------------

#[test]
fn s1_cold_index_builds_the_full_graph() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("a.py", "def foo(): return 1\n");
    h.write("b.py", "import a\ndef bar(): return 2\n");

    let result = h.run("t1");
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.files_processed, 2);
    assert_eq!(result.files_skipped, 0);

    let names = h.metadata_names("t1");
    assert!(names.contains("foo"));
    assert!(names.contains("bar"));
    assert!(names.iter().any(|n| n.ends_with("a.py")));
    assert!(names.iter().any(|n| n.ends_with("b.py")));

    let mut impls = h.implementation_names("t1");
    impls.sort();
    assert_eq!(impls, vec!["bar".to_string(), "foo".to_string()]);

    // Relations: b.py imports a (import_type=module) and the contains edges.
    let relations = h
        .store
        .scroll("t1", &PointFilter::default().chunk_type("relation"))
        .unwrap();
    let import = relations
        .iter()
        .find(|r| r.payload.relation_type().map(|t| t.as_str()) == Some("imports"))
        .expect("imports relation stored");
    assert!(import.payload.entity_name().ends_with("b.py"));
    assert_eq!(import.payload.relation_target(), Some("a"));
    assert_eq!(
        import.payload.metadata().get("import_type").and_then(|v| v.as_str()),
        Some("module")
    );

    assert!(relations
        .iter()
        .any(|r| r.payload.relation_type().map(|t| t.as_str()) == Some("contains")
            && r.payload.relation_target() == Some("foo")));
    assert!(relations
        .iter()
        .any(|r| r.payload.relation_type().map(|t| t.as_str()) == Some("contains")
            && r.payload.relation_target() == Some("bar")));
}

// ---------------------------------------------------------------------------
// S2 — no-op re-index
// ---------------------------------------------------------------------------

#[test]
fn s2_unchanged_tree_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("a.py", "def foo(): return 1\n");
    h.write("b.py", "import a\ndef bar(): return 2\n");

    let first = h.run("t1");
    assert!(first.success);
    let calls_after_first = h.upstream.total();
    let signature_after_first = h.store_signature("t1");

    let second = h.run("t1");
    assert!(second.success);
    assert_eq!(second.files_processed, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(h.upstream.total(), calls_after_first, "zero embedding API calls");
    assert_eq!(h.store_signature("t1"), signature_after_first, "zero upserts, zero deletes");
}

// ---------------------------------------------------------------------------
// S3 — entity rename
// ---------------------------------------------------------------------------

#[test]
fn s3_rename_replaces_chunks_and_keeps_neighbours() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("a.py", "def foo(): return 1\n");
    h.write("b.py", "import a\ndef bar(): return 2\n");
    assert!(h.run("t1").success);

    h.write("a.py", "def foo_renamed(): return 1\n");
    let result = h.run("t1");
    assert!(result.success);
    assert_eq!(result.files_processed, 1, "only a.py re-indexed");

    let names = h.metadata_names("t1");
    assert!(names.contains("foo_renamed"));
    assert!(!names.contains("foo"), "old entity chunks deleted");
    assert!(names.contains("bar"), "b.py untouched");

    let impls = h.implementation_names("t1");
    assert!(impls.contains(&"foo_renamed".to_string()));
    assert!(!impls.contains(&"foo".to_string()));

    // The cross-file imports relation survives the rename.
    let relations = h
        .store
        .scroll("t1", &PointFilter::default().chunk_type("relation"))
        .unwrap();
    assert!(relations
        .iter()
        .any(|r| r.payload.relation_type().map(|t| t.as_str()) == Some("imports")
            && r.payload.relation_target() == Some("a")));
    // And nothing references the dead name anymore.
    assert!(relations.iter().all(|r| r.payload.relation_target() != Some("foo")));
}

// ---------------------------------------------------------------------------
// S4 — content-hash hit across files
// ---------------------------------------------------------------------------

#[test]
fn s4_identical_body_embeds_once_but_stores_twice() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("a.py", "def foo(): return 1\n");
    assert!(h.run("t1").success);

    h.write("c.py", "def foo(): return 1\n");
    let result = h.run("t1");
    assert!(result.success);

    // Both implementation chunks exist under distinct IDs with one shared
    // content hash.
    let impls = h
        .store
        .scroll("t1", &PointFilter::default().chunk_type("implementation"))
        .unwrap();
    assert_eq!(impls.len(), 2);
    let ids: HashSet<u64> = impls.iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 2);
    let hashes: HashSet<&str> = impls.iter().map(|r| r.payload.content_hash()).collect();
    assert_eq!(hashes.len(), 1);

    // The body text hit the embedding API exactly once; the second copy was
    // served from the embedding cache.
    assert_eq!(h.upstream.calls_for("def foo(): return 1\n"), 1);
}

// ---------------------------------------------------------------------------
// S5 — parser crash falls back
// ---------------------------------------------------------------------------

#[test]
fn s5_broken_file_is_indexed_via_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("d.py", "def (:\n");

    let result = h.run("t1");
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.files_processed, 1);
    assert!(!result.warnings.is_empty(), "fallback leaves a visible warning");

    let names = h.metadata_names("t1");
    assert!(names.iter().any(|n| n.ends_with("d.py")), "file entity stored despite syntax errors");
    assert!(h.implementation_names("t1").is_empty(), "fallback never emits implementations");
}

// ---------------------------------------------------------------------------
// S6 — interrupted run + resume
// ---------------------------------------------------------------------------

#[test]
fn s6_interrupt_then_resume_matches_uninterrupted_run() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    for i in 0..10 {
        h.write(&format!("m{i}.py"), &format!("def handler_{i}(x):\n    return x + {i}\n"));
    }

    // Small batches so the stop lands mid-run.
    let mut config = IndexerConfig::default();
    config.pipeline.initial_batch_size = 2;

    let cache_root = config.cache_root(&h.project);
    let make_pipeline = || {
        let cache = Arc::new(EmbeddingCache::open(&cache_root, "counting-stub", 10_000, 500));
        let embedder = Arc::new(CachingEmbedder::new(h.upstream.clone(), cache));
        IndexingPipeline::new(config.clone(), &h.project, h.store.clone(), embedder, None).unwrap()
    };

    // Interrupt after the second completed batch.
    let mut pipeline = make_pipeline();
    let stop = pipeline.stop_handle();
    let batches_done = Arc::new(AtomicU64::new(0));
    let cb_batches = batches_done.clone();
    let cb_stop = stop.clone();
    let interrupted = pipeline.run(
        "t6",
        None,
        true,
        Some(Box::new(move |snap| {
            if snap.batches_done as u64 > cb_batches.load(Ordering::SeqCst) {
                cb_batches.store(snap.batches_done as u64, Ordering::SeqCst);
                if snap.batches_done >= 2 {
                    cb_stop.store(true, Ordering::SeqCst);
                }
            }
        })),
    );
    assert!(interrupted.files_processed < 10, "run stopped before completing");
    assert!(interrupted.warnings.iter().any(|w| w.contains("stop requested")));

    // Resume processes only the remainder.
    let mut pipeline = make_pipeline();
    let resumed = pipeline.resume("t6", None);
    assert!(resumed.success, "{:?}", resumed.errors);
    assert_eq!(resumed.files_processed, 10, "resume accounts for all files");

    // Control: the same tree indexed in one uninterrupted go into a second
    // collection must produce an identical (id, content_hash) signature.
    let control = h.pipeline().run("ctrl", None, false, None);
    assert!(control.success);
    assert_eq!(
        h.store_signature("t6"),
        h.store_signature("ctrl"),
        "resumed store state must match an uninterrupted run"
    );

    // And the tree is now fully cached: a fresh incremental run is a no-op.
    let noop = h.run("t6");
    assert_eq!(noop.files_processed, 0);
    assert_eq!(noop.files_skipped, 10);
}

// ---------------------------------------------------------------------------
// Boundary — empty file
// ---------------------------------------------------------------------------

#[test]
fn empty_file_gets_a_file_entity_and_no_relations() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(tmp.path());
    h.write("empty.py", "");

    let result = h.run("t1");
    assert!(result.success);
    assert_eq!(result.files_processed, 1);

    let names = h.metadata_names("t1");
    assert_eq!(names.len(), 1);
    assert!(names.iter().next().unwrap().ends_with("empty.py"));
    assert_eq!(
        h.store.count("t1", &PointFilter::default().chunk_type("relation")).unwrap(),
        0
    );
}
