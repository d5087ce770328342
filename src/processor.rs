//! Unified content processor: makes the collection reflect a parse batch
//! exactly, reusing as much prior work as possible.
//!
//! Phases, in order:
//!   A. enrichment        — metadata chunks with `has_implementation` flags
//!   B. deletion planning — deleted entities + entity-level replacement
//!   C. deduplication     — skip chunks already stored (same ID, same hash)
//!   D. embedding         — dense for all, BM25 sparse for metadata/relations
//!   E. transactional apply — delete, upsert, orphan cleanup, in that order
//!
//! Failure semantics: a failed delete aborts the apply (nothing upserted);
//! a failed upsert leaves the deletion standing (the next run rebuilds the
//! gap); a failed orphan cleanup is only a warning.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bm25::Bm25Embedder;
use crate::embeddings::{Embedder, ItemKind};
use crate::entities::{Entity, EntityChunk, EntityType, Relation, RelationChunk};
use crate::hashing::{content_hash, point_id};
use crate::vector_store::{ensure_collection, PointFilter, VectorPoint, VectorStore};

#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub items_processed: usize,
    pub embeddings_saved: usize,
    pub embeddings_skipped: usize,
    pub points_upserted: usize,
    pub points_deleted: usize,
    pub orphans_removed: usize,
    pub warnings: Vec<String>,
}

impl ProcessingResult {
    fn failure(message: impl Into<String>) -> Self {
        Self { success: false, error_message: Some(message.into()), ..Default::default() }
    }
}

pub struct UnifiedContentProcessor {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    bm25: Mutex<Bm25Embedder>,
    /// Per-collection stamp of the last global hash-orphan sweep.
    last_global_sweep: Mutex<HashMap<String, Instant>>,
    sweep_interval: Duration,
}

impl UnifiedContentProcessor {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            bm25: Mutex::new(Bm25Embedder::new()),
            last_global_sweep: Mutex::new(HashMap::new()),
            sweep_interval,
        }
    }

    /// Single entry point: apply one parse batch to `collection`.
    ///
    /// `changed_entity_ids` holds `"<file_path>::<entity_name>"` composites
    /// the caller knows to have changed; entities in it get entity-level
    /// replacement instead of content-hash deduplication.
    pub fn process_all_content(
        &self,
        collection: &str,
        entities: &[Entity],
        relations: &[Relation],
        implementation_chunks: &[EntityChunk],
        changed_entity_ids: &HashSet<String>,
    ) -> ProcessingResult {
        let mut result = ProcessingResult { success: true, ..Default::default() };
        result.items_processed = entities.len() + relations.len() + implementation_chunks.len();

        if entities.is_empty() && relations.is_empty() && implementation_chunks.is_empty() {
            return result;
        }

        if let Err(e) = ensure_collection(self.store.as_ref(), collection, self.embedder.dimension())
        {
            return ProcessingResult::failure(format!("collection bootstrap failed: {e}"));
        }

        // Files owning any record in this batch.
        let mut files_being_processed: HashSet<String> = HashSet::new();
        for e in entities {
            if let Some(p) = &e.file_path {
                files_being_processed.insert(p.display().to_string());
            }
        }
        for r in relations {
            if let Some(p) = &r.file_path {
                files_being_processed.insert(p.display().to_string());
            }
        }
        for c in implementation_chunks {
            if let Some(p) = c.file_path() {
                files_being_processed.insert(p);
            }
        }

        // ── Phase A: enrichment ──────────────────────────────────────────
        let implementation_names: HashSet<&str> =
            implementation_chunks.iter().map(|c| c.entity_name.as_str()).collect();

        let mut metadata_chunks: Vec<EntityChunk> = Vec::with_capacity(entities.len());
        for entity in entities {
            // A `calc` variable must never claim the body of a `calc` function.
            let has_implementation = !matches!(
                entity.entity_type,
                EntityType::Variable | EntityType::Import | EntityType::Constant
            ) && implementation_names.contains(entity.name.as_str());

            match EntityChunk::metadata_for(entity, has_implementation) {
                Ok(chunk) => metadata_chunks.push(chunk),
                Err(e) => result.warnings.push(format!("metadata chunk for {}: {e}", entity.name)),
            }
        }

        // ── Phase B: deletion planning ───────────────────────────────────
        let mut to_delete: Vec<u64> = Vec::new();
        let mut deleted_entity_ids: HashSet<String> = HashSet::new();
        let mut replaced_entity_ids: HashSet<String> = HashSet::new();
        let mut changed = changed_entity_ids.clone();

        let mut current_names_by_file: HashMap<String, HashSet<String>> = HashMap::new();
        for chunk in &metadata_chunks {
            if let Some(file) = chunk.file_path() {
                current_names_by_file.entry(file).or_default().insert(chunk.entity_name.clone());
            }
        }

        // One store lookup per file, reused by both deletion steps.
        let mut existing_by_file: HashMap<String, HashMap<String, Vec<crate::vector_store::ExistingChunk>>> =
            HashMap::new();
        for file in &files_being_processed {
            match self.store.find_entities_for_file_by_type(
                collection,
                file,
                &["metadata", "implementation"],
            ) {
                Ok(found) => {
                    existing_by_file.insert(file.clone(), found);
                }
                Err(e) => {
                    return ProcessingResult::failure(format!(
                        "failed to inspect stored entities for {file}: {e}"
                    ));
                }
            }
        }

        // B.1 — entities that vanished from the new parse are deleted outright.
        for (file, existing) in &existing_by_file {
            let current = current_names_by_file.get(file);
            for chunks in existing.values() {
                for existing_chunk in chunks {
                    let present = current
                        .map(|names| names.contains(&existing_chunk.entity_name))
                        .unwrap_or(false);
                    if !present {
                        to_delete.push(existing_chunk.id);
                        deleted_entity_ids
                            .insert(format!("{file}::{}", existing_chunk.entity_name));
                    }
                }
            }
        }

        // B.2 — entity-level replacement for changed entities that have a
        // fresh chunk: drop the stored metadata AND implementation records
        // for that exact name, and exempt the fresh chunk from dedup.
        for chunk in &metadata_chunks {
            let composite = chunk.composite_id();
            let Some(file) = chunk.file_path() else { continue };
            if !changed.contains(&composite)
                || deleted_entity_ids.contains(&composite)
                || replaced_entity_ids.contains(&composite)
            {
                continue;
            }
            if let Some(existing) = existing_by_file.get(&file) {
                for chunks in existing.values() {
                    for existing_chunk in chunks {
                        if existing_chunk.entity_name == chunk.entity_name {
                            to_delete.push(existing_chunk.id);
                        }
                    }
                }
            }
            replaced_entity_ids.insert(composite);
        }

        // ── Phase C: deduplication ───────────────────────────────────────
        let (metadata_to_embed, metadata_skipped) =
            self.dedup_chunks(collection, metadata_chunks, &replaced_entity_ids, &mut result);
        let (impl_to_embed, impl_skipped) = self.dedup_chunks(
            collection,
            implementation_chunks.to_vec(),
            &replaced_entity_ids,
            &mut result,
        );
        result.embeddings_skipped += metadata_skipped + impl_skipped;

        // Everything that survives dedup counts as changed for the relation
        // smart filter.
        for chunk in &metadata_to_embed {
            if chunk.file_path().is_some() {
                changed.insert(chunk.composite_id());
            }
        }

        // Relations: smart filter, replacement, ID-level dedup.
        let relation_chunks = match self.plan_relations(
            relations,
            &changed,
            &files_being_processed,
            &mut to_delete,
            &mut result,
        ) {
            Ok(chunks) => chunks,
            Err(e) => return ProcessingResult::failure(e.to_string()),
        };

        // ── Phase D: embedding ───────────────────────────────────────────
        let mut points: Vec<VectorPoint> = Vec::new();
        self.embed_entity_chunks(&metadata_to_embed, ItemKind::Metadata, &mut points, &mut result);
        self.embed_entity_chunks(&impl_to_embed, ItemKind::Implementation, &mut points, &mut result);
        self.embed_relation_chunks(&relation_chunks, &mut points, &mut result);

        // Deterministic-ID collision is a programmer bug: fail loudly before
        // touching the store.
        let mut ids_seen: HashMap<u64, String> = HashMap::new();
        for point in &points {
            let key = format!("{}::{}", point.payload.chunk_type(), point.payload.entity_name());
            if let Some(prev) = ids_seen.insert(point.id, key.clone()) {
                if prev != key {
                    return ProcessingResult::failure(format!(
                        "point ID collision: {} vs {} both map to {}",
                        prev, key, point.id
                    ));
                }
            }
        }

        // ── Phase E: transactional apply ─────────────────────────────────
        if !to_delete.is_empty() {
            to_delete.sort_unstable();
            to_delete.dedup();
            if let Err(e) = self.store.delete_points(collection, &to_delete) {
                return ProcessingResult::failure(format!("failed to delete existing points: {e}"));
            }
            result.points_deleted = to_delete.len();
        }

        if !points.is_empty() {
            result.points_upserted = points.len();
            result.embeddings_saved = points.len();
            if let Err(e) = self.store.upsert_points(collection, points) {
                // Deletion stands; the next run observes the gap and rebuilds.
                return ProcessingResult::failure(format!("failed to upsert points: {e}"));
            }
        }

        if result.points_deleted > 0 || result.points_upserted > 0 {
            match self.cleanup_orphans(collection, &files_being_processed) {
                Ok(removed) => result.orphans_removed = removed,
                Err(e) => {
                    // Orphans are self-healing on the next run.
                    result.warnings.push(format!("orphan cleanup failed after storage: {e}"));
                }
            }
        }

        result
    }

    /// Split chunks into (to-embed, skipped-count). A chunk is skipped only
    /// when the store already holds this exact record: same content hash
    /// under the same deterministic ID. Same-hash records under *other* IDs
    /// are allowed — that duplication is the cache signal, not a conflict.
    fn dedup_chunks(
        &self,
        collection: &str,
        chunks: Vec<EntityChunk>,
        replaced_entity_ids: &HashSet<String>,
        result: &mut ProcessingResult,
    ) -> (Vec<EntityChunk>, usize) {
        let mut to_embed: Vec<EntityChunk> = Vec::new();
        let mut skipped = 0usize;

        for chunk in chunks {
            // Freshly replaced entities must not be deduplicated against the
            // stale records queued for deletion.
            if replaced_entity_ids.contains(&chunk.composite_id()) {
                to_embed.push(chunk);
                continue;
            }

            let hash = content_hash(&chunk.content);
            match self.store.scroll(collection, &PointFilter::default().content_hash(&hash)) {
                Ok(records) => {
                    let own_id = point_id(&chunk.id);
                    if records.iter().any(|r| r.id == own_id) {
                        skipped += 1;
                    } else {
                        to_embed.push(chunk);
                    }
                }
                Err(e) => {
                    result.warnings.push(format!(
                        "dedup lookup failed for {}: {e}; embedding anyway",
                        chunk.entity_name
                    ));
                    to_embed.push(chunk);
                }
            }
        }

        (to_embed, skipped)
    }

    /// §Relation smart filter: only relations touching a changed entity are
    /// re-embedded; old versions owned by files being processed are deleted;
    /// duplicates collapse on the deterministic chunk ID.
    fn plan_relations(
        &self,
        relations: &[Relation],
        changed: &HashSet<String>,
        files_being_processed: &HashSet<String>,
        to_delete: &mut Vec<u64>,
        result: &mut ProcessingResult,
    ) -> Result<Vec<RelationChunk>> {
        let touches = |endpoint: &str| {
            changed.contains(endpoint)
                || changed.iter().any(|id| id.ends_with(&format!("::{endpoint}")))
        };

        let selected: Vec<&Relation> = if changed.is_empty() {
            relations.iter().collect()
        } else {
            let mut kept: Vec<&Relation> = Vec::new();
            let mut untouched = 0usize;
            for relation in relations {
                if touches(&relation.from_entity) || touches(&relation.to_entity) {
                    kept.push(relation);
                } else {
                    untouched += 1;
                }
            }
            result.embeddings_skipped += untouched;
            kept
        };

        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut chunks: Vec<RelationChunk> = Vec::new();

        for relation in selected {
            let chunk = RelationChunk::from_relation(relation)?;

            // Replacement: re-embedded relations owned by a file in this
            // batch overwrite their previous version.
            let owned_by_batch = relation
                .file_path
                .as_ref()
                .map(|p| files_being_processed.contains(&p.display().to_string()))
                .unwrap_or(false);
            if owned_by_batch {
                to_delete.push(point_id(&chunk.id));
            }

            if seen_ids.insert(chunk.id.clone()) {
                chunks.push(chunk);
            }
        }

        Ok(chunks)
    }

    fn embed_entity_chunks(
        &self,
        chunks: &[EntityChunk],
        kind: ItemKind,
        points: &mut Vec<VectorPoint>,
        result: &mut ProcessingResult,
    ) {
        if chunks.is_empty() {
            return;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let dense = self.embedder.embed_batch(&texts, kind);

        // Sparse vectors for metadata only; implementation bodies are
        // dense-only by design.
        let sparse: Vec<Option<crate::bm25::SparseVector>> = if kind == ItemKind::Metadata {
            let bm25_texts: Vec<String> = chunks.iter().map(|c| c.bm25_text().to_string()).collect();
            match self.bm25.lock() {
                Ok(mut bm25) => bm25.embed_batch(&bm25_texts).into_iter().map(Some).collect(),
                Err(_) => vec![None; chunks.len()],
            }
        } else {
            vec![None; chunks.len()]
        };

        for ((chunk, embedding), sparse_vec) in chunks.iter().zip(dense).zip(sparse) {
            if !embedding.success() {
                result.warnings.push(format!(
                    "embedding failed for {} ({}): {}",
                    chunk.entity_name,
                    chunk.chunk_type.as_str(),
                    embedding.error.unwrap_or_else(|| "unknown error".into())
                ));
                continue;
            }
            points.push(VectorPoint {
                id: point_id(&chunk.id),
                dense: embedding.embedding,
                sparse: sparse_vec.filter(|s| !s.is_empty()),
                payload: chunk.to_payload(),
            });
        }

    }

    fn embed_relation_chunks(
        &self,
        chunks: &[RelationChunk],
        points: &mut Vec<VectorPoint>,
        result: &mut ProcessingResult,
    ) {
        if chunks.is_empty() {
            return;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text()).collect();
        let dense = self.embedder.embed_batch(&texts, ItemKind::Relation);

        let sparse: Vec<Option<crate::bm25::SparseVector>> = {
            let bm25_texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            match self.bm25.lock() {
                Ok(mut bm25) => bm25.embed_batch(&bm25_texts).into_iter().map(Some).collect(),
                Err(_) => vec![None; chunks.len()],
            }
        };

        for ((chunk, embedding), sparse_vec) in chunks.iter().zip(dense).zip(sparse) {
            if !embedding.success() {
                result.warnings.push(format!(
                    "relation embedding failed: {} -> {}: {}",
                    chunk.from_entity,
                    chunk.to_entity,
                    embedding.error.unwrap_or_else(|| "unknown error".into())
                ));
                continue;
            }
            points.push(VectorPoint {
                id: point_id(&chunk.id),
                dense: embedding.embedding,
                sparse: sparse_vec.filter(|s| !s.is_empty()),
                payload: chunk.to_payload(),
            });
        }
    }

    // ── Orphan cleanup ───────────────────────────────────────────────────

    /// Phantom sweep (every apply) + timer-gated global sweep.
    fn cleanup_orphans(&self, collection: &str, touched_files: &HashSet<String>) -> Result<usize> {
        let mut removed = self.phantom_relation_sweep(collection, touched_files)?;

        let due = {
            let stamps = self
                .last_global_sweep
                .lock()
                .map_err(|_| anyhow::anyhow!("sweep stamp mutex poisoned"))?;
            stamps
                .get(collection)
                .map(|t| t.elapsed() >= self.sweep_interval)
                .unwrap_or(true)
        };

        if due {
            removed += self.global_hash_orphan_sweep(collection)?;
            if let Ok(mut stamps) = self.last_global_sweep.lock() {
                stamps.insert(collection.to_string(), Instant::now());
            }
        } else {
            crate::debug_log!("[cortexgraph] global orphan sweep skipped - interval not elapsed");
        }

        Ok(removed)
    }

    /// All entity names with a metadata chunk, from one batched scroll —
    /// never per-relation lookups.
    fn existing_entity_names(&self, collection: &str) -> Result<HashSet<String>> {
        let records =
            self.store.scroll(collection, &PointFilter::default().chunk_type("metadata"))?;
        Ok(records.into_iter().map(|r| r.payload.entity_name().to_string()).collect())
    }

    /// Mandatory after every incremental update: file-scoped relations whose
    /// endpoint no longer has a metadata chunk anywhere are phantoms.
    fn phantom_relation_sweep(
        &self,
        collection: &str,
        touched_files: &HashSet<String>,
    ) -> Result<usize> {
        if touched_files.is_empty() {
            return Ok(0);
        }

        let existing = self.existing_entity_names(collection)?;
        let mut orphaned: Vec<u64> = Vec::new();

        for file in touched_files {
            let records = self.store.scroll(
                collection,
                &PointFilter::default().chunk_type("relation").file_path(file),
            )?;
            for record in records {
                let from = record.payload.entity_name();
                let to = record.payload.relation_target().unwrap_or_default();
                if !existing.contains(from) || !existing.contains(to) {
                    orphaned.push(record.id);
                }
            }
        }

        if !orphaned.is_empty() {
            self.store.delete_points(collection, &orphaned)?;
            crate::debug_log!(
                "[cortexgraph] phantom sweep removed {} relations",
                orphaned.len()
            );
        }
        Ok(orphaned.len())
    }

    /// Stream every relation and verify both endpoints against the
    /// existing-name set built once.
    fn global_hash_orphan_sweep(&self, collection: &str) -> Result<usize> {
        let existing = self.existing_entity_names(collection)?;
        let records =
            self.store.scroll(collection, &PointFilter::default().chunk_type("relation"))?;

        let mut orphaned: Vec<u64> = Vec::new();
        for record in records {
            let from = record.payload.entity_name();
            let to = record.payload.relation_target().unwrap_or_default();
            if !existing.contains(from) || !existing.contains(to) {
                orphaned.push(record.id);
            }
        }

        if !orphaned.is_empty() {
            self.store.delete_points(collection, &orphaned)?;
            crate::debug_log!(
                "[cortexgraph] global sweep removed {} orphaned relations",
                orphaned.len()
            );
        }
        Ok(orphaned.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingResult;
    use crate::entities::RelationType;
    use crate::vector_store::JsonFileStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic embedder: vector derived from text bytes, call counter
    /// for cache-monotonicity assertions.
    struct StubEmbedder {
        calls: AtomicU64,
    }

    impl StubEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicU64::new(0) })
        }
    }

    impl Embedder for StubEmbedder {
        fn embed_batch(&self, texts: &[String], _kind: ItemKind) -> Vec<EmbeddingResult> {
            self.calls.fetch_add(texts.len() as u64, Ordering::SeqCst);
            texts
                .iter()
                .map(|t| {
                    let byte_sum: u32 = t.bytes().map(u32::from).sum();
                    EmbeddingResult::ok(
                        t.clone(),
                        vec![byte_sum as f32, t.len() as f32, 1.0, 0.0],
                        "stub",
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
            "stub"
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<JsonFileStore>, Arc<StubEmbedder>, UnifiedContentProcessor) {
        let store = Arc::new(JsonFileStore::open(dir).unwrap());
        let embedder = StubEmbedder::new();
        let processor = UnifiedContentProcessor::new(
            store.clone(),
            embedder.clone(),
            Duration::from_secs(0), // global sweep always due in tests
        );
        (store, embedder, processor)
    }

    fn function_entity(file: &str, name: &str) -> Entity {
        Entity::new(
            name,
            EntityType::Function,
            vec![format!("Function: {name}"), format!("Defined in: {file}")],
        )
        .unwrap()
        .with_file_path(file)
        .with_lines(1, Some(2))
    }

    fn file_entity(file: &str) -> Entity {
        Entity::new(file, EntityType::File, vec![format!("File: {file}")])
            .unwrap()
            .with_file_path(file)
            .with_lines(1, None)
    }

    fn impl_chunk(file: &str, name: &str, body: &str) -> EntityChunk {
        EntityChunk::implementation_for(
            std::path::Path::new(file),
            EntityType::Function,
            name,
            body,
            1,
            2,
        )
        .unwrap()
    }

    fn changed_for(entities: &[Entity]) -> HashSet<String> {
        entities.iter().map(|e| e.composite_id()).collect()
    }

    #[test]
    fn cold_index_stores_metadata_implementation_and_relations() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _, processor) = setup(tmp.path());

        let entities = vec![file_entity("a.py"), function_entity("a.py", "foo")];
        let relations =
            vec![Relation::contains("a.py", "foo").unwrap().with_file_path("a.py")];
        let chunks = vec![impl_chunk("a.py", "foo", "def foo(): return 1\n")];

        let result = processor.process_all_content(
            "t1",
            &entities,
            &relations,
            &chunks,
            &changed_for(&entities),
        );
        assert!(result.success, "{:?}", result.error_message);

        let metadata = store.scroll("t1", &PointFilter::default().chunk_type("metadata")).unwrap();
        assert_eq!(metadata.len(), 2);
        let impls =
            store.scroll("t1", &PointFilter::default().chunk_type("implementation")).unwrap();
        assert_eq!(impls.len(), 1);
        let rels = store.scroll("t1", &PointFilter::default().chunk_type("relation")).unwrap();
        assert_eq!(rels.len(), 1);
    }

    #[test]
    fn reapplying_identical_batch_skips_all_embeddings() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, embedder, processor) = setup(tmp.path());

        let entities = vec![file_entity("a.py"), function_entity("a.py", "foo")];
        let chunks = vec![impl_chunk("a.py", "foo", "def foo(): return 1\n")];

        // First apply with everything marked changed (cold index).
        processor.process_all_content("t1", &entities, &[], &chunks, &changed_for(&entities));
        let first_calls = embedder.calls.load(Ordering::SeqCst);

        // Second apply with nothing marked changed: content-hash dedup must
        // skip every chunk.
        let result = processor.process_all_content("t1", &entities, &[], &chunks, &HashSet::new());
        assert!(result.success);
        assert_eq!(result.embeddings_saved, 0);
        assert_eq!(result.embeddings_skipped, 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), first_calls);
    }

    #[test]
    fn rename_deletes_old_entity_chunks_and_phantom_relations() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _, processor) = setup(tmp.path());

        let v1 = vec![file_entity("a.py"), function_entity("a.py", "foo")];
        let v1_chunks = vec![impl_chunk("a.py", "foo", "def foo(): return 1\n")];
        let v1_rels = vec![Relation::contains("a.py", "foo").unwrap().with_file_path("a.py")];
        processor.process_all_content("t1", &v1, &v1_rels, &v1_chunks, &changed_for(&v1));

        // Re-index the file with the function renamed.
        let v2 = vec![file_entity("a.py"), function_entity("a.py", "foo_renamed")];
        let v2_chunks = vec![impl_chunk("a.py", "foo_renamed", "def foo_renamed(): return 1\n")];
        let v2_rels =
            vec![Relation::contains("a.py", "foo_renamed").unwrap().with_file_path("a.py")];
        let result =
            processor.process_all_content("t1", &v2, &v2_rels, &v2_chunks, &changed_for(&v2));
        assert!(result.success);

        let names: HashSet<String> = store
            .scroll("t1", &PointFilter::default().chunk_type("metadata"))
            .unwrap()
            .into_iter()
            .map(|r| r.payload.entity_name().to_string())
            .collect();
        assert!(names.contains("foo_renamed"));
        assert!(!names.contains("foo"), "renamed-away entity must be deleted");

        let impls =
            store.scroll("t1", &PointFilter::default().chunk_type("implementation")).unwrap();
        assert_eq!(impls.len(), 1);
        assert_eq!(impls[0].payload.entity_name(), "foo_renamed");

        // The old "a.py contains foo" relation is a phantom now.
        let rels = store.scroll("t1", &PointFilter::default().chunk_type("relation")).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].payload.relation_target(), Some("foo_renamed"));
    }

    #[test]
    fn same_body_in_two_files_keeps_both_chunks_with_shared_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _, processor) = setup(tmp.path());

        let a = vec![file_entity("a.py"), function_entity("a.py", "foo")];
        let a_chunks = vec![impl_chunk("a.py", "foo", "def foo(): return 1\n")];
        processor.process_all_content("t1", &a, &[], &a_chunks, &changed_for(&a));

        let c = vec![file_entity("c.py"), function_entity("c.py", "foo")];
        let c_chunks = vec![impl_chunk("c.py", "foo", "def foo(): return 1\n")];
        let result = processor.process_all_content("t1", &c, &[], &c_chunks, &changed_for(&c));
        assert!(result.success);

        let impls =
            store.scroll("t1", &PointFilter::default().chunk_type("implementation")).unwrap();
        assert_eq!(impls.len(), 2, "distinct IDs, both stored");
        let hashes: HashSet<&str> = impls.iter().map(|r| r.payload.content_hash()).collect();
        assert_eq!(hashes.len(), 1, "same body, same content_hash — the dedup signal");
    }

    #[test]
    fn untouched_relations_are_not_reembedded() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, embedder, processor) = setup(tmp.path());

        let entities = vec![file_entity("a.py"), function_entity("a.py", "foo")];
        let relations = vec![
            Relation::contains("a.py", "foo").unwrap().with_file_path("a.py"),
            // Relation between entities outside the changed set.
            Relation::new("x", "y", RelationType::Uses).unwrap(),
        ];

        let before = embedder.calls.load(Ordering::SeqCst);
        let result = processor.process_all_content(
            "t1",
            &entities,
            &relations,
            &[],
            &changed_for(&entities),
        );
        assert!(result.success);
        // 2 metadata + 1 touching relation embedded; x->y skipped.
        assert_eq!(embedder.calls.load(Ordering::SeqCst) - before, 3);
        assert!(result.embeddings_skipped >= 1);
    }

    #[test]
    fn empty_batch_is_a_successful_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _, processor) = setup(tmp.path());

        let result = processor.process_all_content("t1", &[], &[], &[], &HashSet::new());
        assert!(result.success);
        assert!(!store.collection_exists("t1").unwrap(), "no store call for an empty batch");
    }
}
