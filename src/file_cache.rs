//! Per-collection file-state cache: decides which files are unchanged so an
//! incremental run can skip them entirely.
//!
//! One JSON file per collection under `<cache_root>/state/<collection>.json`.
//! An entry records `(path, size_bytes, mtime_ns, sha256)`; a file is
//! unchanged only when all three of size, mtime, and content hash match the
//! file currently on disk. Size/mtime screen first (O(1) stat, no read);
//! hashing only happens for candidates that survive the screen, in parallel.
//!
//! Failure semantics: a corrupt cache file is treated as empty (full
//! re-index), never fatal. Writes are atomic (temp file + rename) so readers
//! observe either the old or the new file, never a partial one.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::hashing::file_sha256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStateEntry {
    pub path: String,
    pub size_bytes: u64,
    pub mtime_ns: u64,
    pub sha256: String,
    /// Unknown keys from newer versions survive a load/store cycle.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, FileStateEntry>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileCacheStats {
    pub total_entries: usize,
    pub unchanged_hits: usize,
    pub changed: usize,
    pub hit_rate: f64,
}

pub struct FileStateCache {
    state_path: PathBuf,
    file: CacheFile,
    unchanged_hits: usize,
    changed: usize,
}

fn mtime_ns(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl FileStateCache {
    /// Load (or initialise) the cache for `collection`.
    pub fn open(cache_root: &Path, collection: &str) -> Self {
        let state_dir = cache_root.join("state");
        let state_path = state_dir.join(format!("{collection}.json"));

        let file = match std::fs::read_to_string(&state_path) {
            Ok(text) => match serde_json::from_str::<CacheFile>(&text) {
                Ok(f) => f,
                Err(_e) => {
                    crate::debug_log!(
                        "[cortexgraph] file-state cache corrupt ({}), treating as empty",
                        _e
                    );
                    CacheFile::default()
                }
            },
            Err(_) => CacheFile::default(),
        };

        Self { state_path, file, unchanged_hits: 0, changed: 0 }
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// Split `candidates` into the files that need re-indexing.
    ///
    /// Phase 1: stat screen (size + mtime vs cached entry) — no file reads.
    /// Phase 2: surviving candidates are hashed in parallel; a matching
    /// sha256 confirms "truly unchanged" even when the screen was
    /// inconclusive.
    pub fn get_changed_files(&mut self, candidates: &[PathBuf]) -> Vec<PathBuf> {
        enum Screen {
            Changed(PathBuf),
            NeedsHash(PathBuf, String),
        }

        let mut screened: Vec<Screen> = Vec::with_capacity(candidates.len());
        for path in candidates {
            let key = Self::key(path);
            let Some(entry) = self.file.entries.get(&key) else {
                screened.push(Screen::Changed(path.clone()));
                continue;
            };
            let Ok(meta) = std::fs::metadata(path) else {
                screened.push(Screen::Changed(path.clone()));
                continue;
            };
            if meta.len() != entry.size_bytes || mtime_ns(&meta) != entry.mtime_ns {
                screened.push(Screen::Changed(path.clone()));
            } else {
                screened.push(Screen::NeedsHash(path.clone(), entry.sha256.clone()));
            }
        }

        let mut changed: Vec<PathBuf> = Vec::new();
        let mut unchanged = 0usize;

        let hash_candidates: Vec<(PathBuf, String)> = screened
            .iter()
            .filter_map(|s| match s {
                Screen::NeedsHash(p, h) => Some((p.clone(), h.clone())),
                Screen::Changed(_) => None,
            })
            .collect();

        let hash_results: Vec<(PathBuf, bool)> = hash_candidates
            .par_iter()
            .map(|(path, cached_hash)| {
                let same = file_sha256(path).map(|h| h == *cached_hash).unwrap_or(false);
                (path.clone(), same)
            })
            .collect();
        let same_by_path: HashMap<&PathBuf, bool> =
            hash_results.iter().map(|(p, same)| (p, *same)).collect();

        for s in &screened {
            match s {
                Screen::Changed(p) => changed.push(p.clone()),
                Screen::NeedsHash(p, _) => {
                    if same_by_path.get(p).copied().unwrap_or(false) {
                        unchanged += 1;
                    } else {
                        changed.push(p.clone());
                    }
                }
            }
        }

        self.unchanged_hits += unchanged;
        self.changed += changed.len();
        changed
    }

    /// Refresh the entries for `paths` from disk and rewrite the cache file
    /// in a single atomic pass.
    pub fn update_batch(&mut self, paths: &[PathBuf]) -> Result<()> {
        let refreshed: Vec<(String, Option<FileStateEntry>)> = paths
            .par_iter()
            .map(|path| {
                let key = Self::key(path);
                let entry = (|| -> Option<FileStateEntry> {
                    let meta = std::fs::metadata(path).ok()?;
                    let sha256 = file_sha256(path).ok()?;
                    Some(FileStateEntry {
                        path: key.clone(),
                        size_bytes: meta.len(),
                        mtime_ns: mtime_ns(&meta),
                        sha256,
                        extra: BTreeMap::new(),
                    })
                })();
                (key, entry)
            })
            .collect();

        for (key, entry) in refreshed {
            match entry {
                Some(e) => {
                    // Preserve unknown keys from an existing entry.
                    let extra = self
                        .file
                        .entries
                        .get(&key)
                        .map(|old| old.extra.clone())
                        .unwrap_or_default();
                    self.file.entries.insert(key, FileStateEntry { extra, ..e });
                }
                None => {
                    self.file.entries.remove(&key);
                }
            }
        }

        self.persist()
    }

    /// Drop entries for files no longer present in the indexed set, keeping
    /// invariant 4 (cache entries refer to files with chunks in the store).
    pub fn retain_paths(&mut self, live: &[PathBuf]) -> Result<()> {
        let keep: std::collections::HashSet<String> = live.iter().map(|p| Self::key(p)).collect();
        self.file.entries.retain(|k, _| keep.contains(k));
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let dir = self
            .state_path
            .parent()
            .context("file-state cache path has no parent dir")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = self.state_path.with_extension("json.tmp");
        let text = serde_json::to_string(&self.file).context("Failed to serialise file-state cache")?;
        std::fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("Failed to replace {}", self.state_path.display()))?;
        Ok(())
    }

    pub fn stats(&self) -> FileCacheStats {
        let total_checked = self.unchanged_hits + self.changed;
        FileCacheStats {
            total_entries: self.file.entries.len(),
            unchanged_hits: self.unchanged_hits,
            changed: self.changed,
            hit_rate: if total_checked > 0 {
                self.unchanged_hits as f64 / total_checked as f64
            } else {
                0.0
            },
        }
    }

    pub fn len(&self) -> usize {
        self.file.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.entries.is_empty()
    }
}
