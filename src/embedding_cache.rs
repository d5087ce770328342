//! Two-tier embedding cache: in-memory FIFO map in front of an on-disk
//! binary store, keyed by the 16-hex SHA-256 prefix of the embedded text.
//!
//! Layout under `<cache_root>/.embedding_cache/<model>/`:
//!
//!   index.json              hash16 -> { dimension, created_ns, last_access_ns, size_bytes }
//!   embeddings/<hash16>.bin little-endian u32 dimension, then dimension f32 values
//!
//! Lookup order: memory -> disk (promote on hit) -> miss. `set` populates
//! both tiers. When tier 2 exceeds its size limit the oldest-accessed 25%
//! of entries are dropped in one pass. A single mutex serialises access.
//!
//! The 16-hex key is a deliberate trade-off: two texts sharing the prefix
//! may collide, so callers treat the cache as best-effort (the only cost is
//! a wrong embedding until the next re-index).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use crate::hashing::cache_key;

/// Number of `set` calls between automatic index persists.
const INDEX_SAVE_EVERY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskEntry {
    dimension: u32,
    created_ns: u64,
    last_access_ns: u64,
    size_bytes: u64,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingCacheStats {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub disk_size_mb: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub model: String,
}

struct Inner {
    index: HashMap<String, DiskEntry>,
    memory: HashMap<String, Vec<f32>>,
    memory_order: VecDeque<String>,
    hits: u64,
    misses: u64,
    sets_since_save: usize,
}

pub struct EmbeddingCache {
    cache_dir: PathBuf,
    embeddings_dir: PathBuf,
    index_path: PathBuf,
    model_name: String,
    max_memory_entries: usize,
    max_disk_bytes: u64,
    inner: Mutex<Inner>,
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn write_embedding(path: &Path, embedding: &[f32]) -> Result<u64> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(&(embedding.len() as u32).to_le_bytes())?;
    for v in embedding {
        file.write_all(&v.to_le_bytes())?;
    }
    Ok(4 + embedding.len() as u64 * 4)
}

fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut dim_buf = [0u8; 4];
    file.read_exact(&mut dim_buf)?;
    let dimension = u32::from_le_bytes(dim_buf) as usize;

    let mut data = vec![0u8; dimension * 4];
    file.read_exact(&mut data)?;
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl EmbeddingCache {
    pub fn open(
        cache_root: &Path,
        model_name: &str,
        max_memory_entries: usize,
        max_size_mb: u64,
    ) -> Self {
        let cache_dir = cache_root.join(".embedding_cache").join(model_name);
        let embeddings_dir = cache_dir.join("embeddings");
        let index_path = cache_dir.join("index.json");

        let index = match std::fs::read_to_string(&index_path) {
            Ok(text) => serde_json::from_str::<HashMap<String, DiskEntry>>(&text).unwrap_or_else(|_e| {
                crate::debug_log!("[cortexgraph] embedding-cache index corrupt ({}), starting fresh", _e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        crate::debug_log!(
            "[cortexgraph] embedding cache '{}' loaded with {} disk entries",
            model_name,
            index.len()
        );

        Self {
            cache_dir,
            embeddings_dir,
            index_path,
            model_name: model_name.to_string(),
            max_memory_entries: max_memory_entries.max(1),
            max_disk_bytes: max_size_mb * 1024 * 1024,
            inner: Mutex::new(Inner {
                index,
                memory: HashMap::new(),
                memory_order: VecDeque::new(),
                hits: 0,
                misses: 0,
                sets_since_save: 0,
            }),
        }
    }

    pub fn key_for(text: &str) -> String {
        cache_key(text)
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.get_by_key(&cache_key(text))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().ok()?;

        // Tier 1.
        if let Some(embedding) = inner.memory.get(key) {
            let out = embedding.clone();
            inner.hits += 1;
            return Some(out);
        }

        // Tier 2 — promote to memory on hit.
        if inner.index.contains_key(key) {
            let bin = self.embeddings_dir.join(format!("{key}.bin"));
            match read_embedding(&bin) {
                Ok(embedding) => {
                    if let Some(entry) = inner.index.get_mut(key) {
                        entry.last_access_ns = now_ns();
                    }
                    Self::put_memory(
                        &mut inner,
                        self.max_memory_entries,
                        key.to_string(),
                        embedding.clone(),
                    );
                    inner.hits += 1;
                    return Some(embedding);
                }
                Err(_e) => {
                    // Index entry without a readable file: self-heal.
                    crate::debug_log!("[cortexgraph] dropping unreadable cache entry {key}: {_e}");
                    inner.index.remove(key);
                }
            }
        }

        inner.misses += 1;
        None
    }

    pub fn set(&self, text: &str, embedding: &[f32]) {
        let key = cache_key(text);
        let Ok(mut inner) = self.inner.lock() else { return };

        if let Err(e) = self.set_locked(&mut inner, key, embedding) {
            eprintln!("[cortexgraph] failed to cache embedding: {e}");
        }
    }

    fn set_locked(&self, inner: &mut Inner, key: String, embedding: &[f32]) -> Result<()> {
        self.maybe_evict(inner);

        std::fs::create_dir_all(&self.embeddings_dir)
            .with_context(|| format!("Failed to create {}", self.embeddings_dir.display()))?;
        let bin = self.embeddings_dir.join(format!("{key}.bin"));
        let size_bytes = write_embedding(&bin, embedding)?;

        let now = now_ns();
        inner.index.insert(
            key.clone(),
            DiskEntry {
                dimension: embedding.len() as u32,
                created_ns: now,
                last_access_ns: now,
                size_bytes,
                extra: BTreeMap::new(),
            },
        );
        Self::put_memory(inner, self.max_memory_entries, key, embedding.to_vec());

        inner.sets_since_save += 1;
        if inner.sets_since_save >= INDEX_SAVE_EVERY {
            inner.sets_since_save = 0;
            self.save_index(inner)?;
        }
        Ok(())
    }

    /// FIFO insert into tier 1.
    fn put_memory(inner: &mut Inner, cap: usize, key: String, embedding: Vec<f32>) {
        if inner.memory.contains_key(&key) {
            inner.memory.insert(key, embedding);
            return;
        }
        while inner.memory.len() >= cap {
            let Some(oldest) = inner.memory_order.pop_front() else { break };
            inner.memory.remove(&oldest);
        }
        inner.memory_order.push_back(key.clone());
        inner.memory.insert(key, embedding);
    }

    fn disk_size(inner: &Inner) -> u64 {
        inner.index.values().map(|e| e.size_bytes).sum()
    }

    /// Drop the oldest-accessed 25% of disk entries in one pass when the
    /// tier-2 size limit is exceeded.
    fn maybe_evict(&self, inner: &mut Inner) {
        if self.max_disk_bytes == 0 || Self::disk_size(inner) < self.max_disk_bytes {
            return;
        }

        let mut by_access: Vec<(String, u64, u64)> = inner
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access_ns, e.size_bytes))
            .collect();
        by_access.sort_by_key(|(_, access, _)| *access);

        let to_remove = (by_access.len() / 4).max(1);
        let mut freed = 0u64;
        for (key, _, size) in by_access.into_iter().take(to_remove) {
            let bin = self.embeddings_dir.join(format!("{key}.bin"));
            let _ = std::fs::remove_file(&bin);
            inner.index.remove(&key);
            inner.memory.remove(&key);
            freed += size;
        }
        eprintln!(
            "[cortexgraph] evicted {} embedding-cache entries, freed {:.1}MB",
            to_remove,
            freed as f64 / 1024.0 / 1024.0
        );
    }

    fn save_index(&self, inner: &Inner) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create {}", self.cache_dir.display()))?;
        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&inner.index)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.index_path)
            .with_context(|| format!("Failed to replace {}", self.index_path.display()))?;
        Ok(())
    }

    /// Force-persist the index.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().map_err(|_| anyhow::anyhow!("embedding cache poisoned"))?;
        self.save_index(&inner)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let Ok(inner) = self.inner.lock() else {
            return EmbeddingCacheStats::default();
        };
        let total = inner.hits + inner.misses;
        EmbeddingCacheStats {
            memory_entries: inner.memory.len(),
            disk_entries: inner.index.len(),
            disk_size_mb: Self::disk_size(&inner) as f64 / 1024.0 / 1024.0,
            hits: inner.hits,
            misses: inner.misses,
            hit_ratio: if total > 0 { inner.hits as f64 / total as f64 } else { 0.0 },
            model: self.model_name.clone(),
        }
    }
}

impl Drop for EmbeddingCache {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock() {
            let _ = self.save_index(&inner);
        }
    }
}
