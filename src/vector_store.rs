//! Vector store contract and the bundled flat-file JSON backend.
//!
//! The trait mirrors exactly the operations the content processor needs;
//! any backend that linearises per-collection writes can slot in. The
//! bundled `JsonFileStore` keeps one JSON file per collection:
//!
//!   <root>/<collection>.json
//!   {
//!     "meta":   { dense_dim, with_sparse, distance, payload_indices, ... },
//!     "points": { "<u64 id>": { "dense": [...], "sparse": {...}?, "payload": {...} } }
//!   }
//!
//! Named vectors: dense "dense" (cosine) and sparse "bm25". A corrupt
//! collection file is treated as empty and rebuilt on the next run.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::bm25::SparseVector;
use crate::entities::ChunkPayload;

/// Payload keys every collection is provisioned with an index for.
pub const DEFAULT_PAYLOAD_INDICES: &[&str] = &[
    "entity_name",
    "entity_type",
    "chunk_type",
    "metadata.file_path",
    "content_hash",
    "relation_type",
];

pub const DENSE_VECTOR_NAME: &str = "dense";
pub const SPARSE_VECTOR_NAME: &str = "bm25";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: u64,
    pub dense: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<SparseVector>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: u64,
    pub payload: ChunkPayload,
}

/// Chunk identity returned by per-file lookups during deletion planning.
#[derive(Debug, Clone)]
pub struct ExistingChunk {
    pub id: u64,
    pub entity_name: String,
}

/// Typed filter over payload fields — the exhaustive replacement for
/// stringly-keyed filter conditions.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub chunk_type: Option<String>,
    pub entity_name: Option<String>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub relation_type: Option<String>,
}

impl PointFilter {
    pub fn chunk_type(mut self, chunk_type: &str) -> Self {
        self.chunk_type = Some(chunk_type.to_string());
        self
    }

    pub fn entity_name(mut self, entity_name: &str) -> Self {
        self.entity_name = Some(entity_name.to_string());
        self
    }

    pub fn file_path(mut self, file_path: &str) -> Self {
        self.file_path = Some(file_path.to_string());
        self
    }

    pub fn content_hash(mut self, content_hash: &str) -> Self {
        self.content_hash = Some(content_hash.to_string());
        self
    }

    pub fn relation_type(mut self, relation_type: &str) -> Self {
        self.relation_type = Some(relation_type.to_string());
        self
    }

    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(ct) = &self.chunk_type {
            if payload.chunk_type() != ct {
                return false;
            }
        }
        if let Some(name) = &self.entity_name {
            if payload.entity_name() != name {
                return false;
            }
        }
        if let Some(path) = &self.file_path {
            if payload.file_path() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(hash) = &self.content_hash {
            if payload.content_hash() != hash {
                return false;
            }
        }
        if let Some(rt) = &self.relation_type {
            if payload.relation_type().map(|t| t.to_string()).as_deref() != Some(rt.as_str()) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

pub trait VectorStore: Send + Sync {
    fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Provision a collection with the dense+sparse schema. Idempotent:
    /// repeated calls with a matching schema are no-ops; a mismatching
    /// dense dimension is an error.
    fn create_collection(
        &self,
        name: &str,
        dense_dim: u32,
        with_sparse: bool,
        payload_indices: &[&str],
    ) -> Result<()>;

    fn upsert_points(&self, name: &str, points: Vec<VectorPoint>) -> Result<()>;

    fn delete_points(&self, name: &str, ids: &[u64]) -> Result<()>;

    fn scroll(&self, name: &str, filter: &PointFilter) -> Result<Vec<StoredRecord>>;

    fn count(&self, name: &str, filter: &PointFilter) -> Result<u64>;

    /// Single filtered count — the dedup primitive.
    fn check_content_exists(&self, name: &str, content_hash: &str) -> Result<bool> {
        Ok(self.count(name, &PointFilter::default().content_hash(content_hash))? > 0)
    }

    /// Chunks stored for `file_path`, grouped by chunk type.
    fn find_entities_for_file_by_type(
        &self,
        name: &str,
        file_path: &str,
        chunk_types: &[&str],
    ) -> Result<HashMap<String, Vec<ExistingChunk>>> {
        let mut out: HashMap<String, Vec<ExistingChunk>> = HashMap::new();
        for chunk_type in chunk_types {
            let records = self.scroll(
                name,
                &PointFilter::default().file_path(file_path).chunk_type(chunk_type),
            )?;
            out.insert(
                chunk_type.to_string(),
                records
                    .into_iter()
                    .map(|r| ExistingChunk { id: r.id, entity_name: r.payload.entity_name().to_string() })
                    .collect(),
            );
        }
        Ok(out)
    }
}

/// Bootstrap used by the content processor on first write: create the
/// collection with the standard schema when missing; verify it otherwise.
pub fn ensure_collection(store: &dyn VectorStore, name: &str, dense_dim: u32) -> Result<()> {
    store.create_collection(name, dense_dim, true, DEFAULT_PAYLOAD_INDICES)
}

// ---------------------------------------------------------------------------
// Flat-file JSON backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    dense_dim: u32,
    with_sparse: bool,
    distance: String,
    dense_name: String,
    sparse_name: String,
    payload_indices: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    dense: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sparse: Option<SparseVector>,
    payload: ChunkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionFile {
    meta: CollectionMeta,
    /// Keyed by the decimal form of the u64 point ID (JSON keys are strings).
    points: BTreeMap<String, StoredPoint>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

pub struct JsonFileStore {
    root: PathBuf,
    /// One mutex linearises all collection writes — the backend guarantee
    /// the processor's delete-then-upsert ordering relies on.
    collections: Mutex<HashMap<String, CollectionFile>>,
}

impl JsonFileStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create vector store dir {}", root.display()))?;
        Ok(Self { root: root.to_path_buf(), collections: Mutex::new(HashMap::new()) })
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn load_locked(
        &self,
        collections: &mut HashMap<String, CollectionFile>,
        name: &str,
    ) -> Option<()> {
        if collections.contains_key(name) {
            return Some(());
        }
        let text = std::fs::read_to_string(self.collection_path(name)).ok()?;
        match serde_json::from_str::<CollectionFile>(&text) {
            Ok(file) => {
                collections.insert(name.to_string(), file);
                Some(())
            }
            Err(_e) => {
                crate::debug_log!(
                    "[cortexgraph] collection '{}' corrupt ({}), treating as missing",
                    name,
                    _e
                );
                None
            }
        }
    }

    fn persist(&self, name: &str, file: &CollectionFile) -> Result<()> {
        let path = self.collection_path(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(file)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CollectionFile>>> {
        self.collections
            .lock()
            .map_err(|_| anyhow::anyhow!("vector store mutex poisoned"))
    }
}

impl VectorStore for JsonFileStore {
    fn collection_exists(&self, name: &str) -> Result<bool> {
        let mut collections = self.lock()?;
        Ok(self.load_locked(&mut collections, name).is_some())
    }

    fn create_collection(
        &self,
        name: &str,
        dense_dim: u32,
        with_sparse: bool,
        payload_indices: &[&str],
    ) -> Result<()> {
        let mut collections = self.lock()?;
        if self.load_locked(&mut collections, name).is_some() {
            let existing = &collections[name].meta;
            if existing.dense_dim != dense_dim {
                bail!(
                    "collection '{name}' exists with dense_dim {} (requested {dense_dim})",
                    existing.dense_dim
                );
            }
            return Ok(());
        }

        let file = CollectionFile {
            meta: CollectionMeta {
                dense_dim,
                with_sparse,
                distance: "cosine".to_string(),
                dense_name: DENSE_VECTOR_NAME.to_string(),
                sparse_name: SPARSE_VECTOR_NAME.to_string(),
                payload_indices: payload_indices.iter().map(|s| s.to_string()).collect(),
                extra: BTreeMap::new(),
            },
            points: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        self.persist(name, &file)?;
        collections.insert(name.to_string(), file);
        Ok(())
    }

    fn upsert_points(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut collections = self.lock()?;
        self.load_locked(&mut collections, name);
        let file = collections
            .get_mut(name)
            .with_context(|| format!("collection '{name}' does not exist"))?;

        for point in points {
            if point.dense.len() as u32 != file.meta.dense_dim {
                bail!(
                    "point {} has dense dim {} but collection '{name}' expects {}",
                    point.id,
                    point.dense.len(),
                    file.meta.dense_dim
                );
            }
            file.points.insert(
                point.id.to_string(),
                StoredPoint { dense: point.dense, sparse: point.sparse, payload: point.payload },
            );
        }
        self.persist(name, file)
    }

    fn delete_points(&self, name: &str, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut collections = self.lock()?;
        self.load_locked(&mut collections, name);
        let Some(file) = collections.get_mut(name) else {
            return Ok(()); // deleting from a missing collection is a no-op
        };
        for id in ids {
            file.points.remove(&id.to_string());
        }
        self.persist(name, file)
    }

    fn scroll(&self, name: &str, filter: &PointFilter) -> Result<Vec<StoredRecord>> {
        let mut collections = self.lock()?;
        if self.load_locked(&mut collections, name).is_none() {
            return Ok(vec![]);
        }
        let file = &collections[name];
        Ok(file
            .points
            .iter()
            .filter(|(_, p)| filter.matches(&p.payload))
            .map(|(id, p)| StoredRecord {
                id: id.parse().unwrap_or_default(),
                payload: p.payload.clone(),
            })
            .collect())
    }

    fn count(&self, name: &str, filter: &PointFilter) -> Result<u64> {
        let mut collections = self.lock()?;
        if self.load_locked(&mut collections, name).is_none() {
            return Ok(0);
        }
        let file = &collections[name];
        Ok(file.points.values().filter(|p| filter.matches(&p.payload)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Entity, EntityChunk, EntityType};
    use crate::hashing::point_id;

    fn metadata_point(file: &str, name: &str, dim: u32) -> VectorPoint {
        let entity = Entity::new(name, EntityType::Function, vec![])
            .unwrap()
            .with_file_path(file)
            .with_lines(1, Some(2));
        let chunk = EntityChunk::metadata_for(&entity, false).unwrap();
        VectorPoint {
            id: point_id(&chunk.id),
            dense: vec![0.5; dim as usize],
            sparse: None,
            payload: chunk.to_payload(),
        }
    }

    #[test]
    fn create_is_idempotent_but_dim_mismatch_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();

        ensure_collection(&store, "t1", 4).unwrap();
        ensure_collection(&store, "t1", 4).unwrap();
        assert!(store.collection_exists("t1").unwrap());

        let err = store.create_collection("t1", 8, true, DEFAULT_PAYLOAD_INDICES);
        assert!(err.is_err());
    }

    #[test]
    fn upsert_scroll_count_delete_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        ensure_collection(&store, "t1", 4).unwrap();

        let p1 = metadata_point("a.py", "foo", 4);
        let p2 = metadata_point("b.py", "bar", 4);
        let id1 = p1.id;
        store.upsert_points("t1", vec![p1, p2]).unwrap();

        assert_eq!(store.count("t1", &PointFilter::default()).unwrap(), 2);
        let only_a = store
            .scroll("t1", &PointFilter::default().file_path("a.py"))
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].payload.entity_name(), "foo");

        store.delete_points("t1", &[id1]).unwrap();
        assert_eq!(store.count("t1", &PointFilter::default()).unwrap(), 1);
    }

    #[test]
    fn check_content_exists_uses_content_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        ensure_collection(&store, "t1", 4).unwrap();

        let p = metadata_point("a.py", "foo", 4);
        let hash = p.payload.content_hash().to_string();
        store.upsert_points("t1", vec![p]).unwrap();

        assert!(store.check_content_exists("t1", &hash).unwrap());
        assert!(!store.check_content_exists("t1", "0".repeat(64).as_str()).unwrap());
    }

    #[test]
    fn collections_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(tmp.path()).unwrap();
            ensure_collection(&store, "t1", 4).unwrap();
            store.upsert_points("t1", vec![metadata_point("a.py", "foo", 4)]).unwrap();
        }

        let store = JsonFileStore::open(tmp.path()).unwrap();
        assert_eq!(store.count("t1", &PointFilter::default()).unwrap(), 1);
        let by_file = store
            .find_entities_for_file_by_type("t1", "a.py", &["metadata", "implementation"])
            .unwrap();
        assert_eq!(by_file["metadata"].len(), 1);
        assert!(by_file["implementation"].is_empty());
    }

    #[test]
    fn dimension_mismatch_on_upsert_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        ensure_collection(&store, "t1", 8).unwrap();

        let p = metadata_point("a.py", "foo", 4);
        assert!(store.upsert_points("t1", vec![p]).is_err());
    }
}
