//! Atomic resume checkpoint: which files a run has processed so far, so a
//! killed run can replay only the remainder and end up with a store
//! identical to an uninterrupted run.
//!
//! One JSON file per collection under `<cache_root>/checkpoints/`, rewritten
//! with temp-file + rename so a crash never leaves a partial checkpoint.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub collection: String,
    pub all_files: Vec<String>,
    pub processed_files: Vec<String>,
    pub failed_files: Vec<String>,
    pub last_batch_index: usize,
    pub entities_created: usize,
    pub relations_created: usize,
    pub chunks_created: usize,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub struct IndexingCheckpoint {
    dir: PathBuf,
    enabled: bool,
    state: Option<CheckpointState>,
}

impl IndexingCheckpoint {
    pub fn new(cache_root: &Path, enabled: bool) -> Self {
        Self { dir: cache_root.join("checkpoints"), enabled, state: None }
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }

    /// Start tracking a fresh run.
    pub fn create(&mut self, collection: &str, all_files: &[PathBuf]) {
        if !self.enabled {
            return;
        }
        self.state = Some(CheckpointState {
            collection: collection.to_string(),
            all_files: all_files.iter().map(|p| p.display().to_string()).collect(),
            processed_files: vec![],
            failed_files: vec![],
            last_batch_index: 0,
            entities_created: 0,
            relations_created: 0,
            chunks_created: 0,
            extra: BTreeMap::new(),
        });
    }

    pub fn update_batch(
        &mut self,
        processed: &[PathBuf],
        failed: &[PathBuf],
        batch_index: usize,
        entities: usize,
        relations: usize,
        chunks: usize,
    ) {
        let Some(state) = self.state.as_mut() else { return };
        state.processed_files.extend(processed.iter().map(|p| p.display().to_string()));
        state.failed_files.extend(failed.iter().map(|p| p.display().to_string()));
        state.last_batch_index = batch_index;
        state.entities_created += entities;
        state.relations_created += relations;
        state.chunks_created += chunks;
    }

    /// Persist atomically (temp + rename).
    pub fn save(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(state) = &self.state else { return Ok(()) };

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(&state.collection);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(state)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load a previous run's checkpoint, if one exists and parses. A corrupt
    /// checkpoint means "no resume", never a hard failure.
    pub fn load(&mut self, collection: &str) -> Option<&CheckpointState> {
        if !self.enabled {
            return None;
        }
        let text = std::fs::read_to_string(self.path_for(collection)).ok()?;
        match serde_json::from_str::<CheckpointState>(&text) {
            Ok(state) => {
                self.state = Some(state);
                self.state.as_ref()
            }
            Err(_e) => {
                crate::debug_log!("[cortexgraph] checkpoint for '{collection}' corrupt ({_e}), ignoring");
                None
            }
        }
    }

    /// Files the interrupted run had not yet finished. Failed files are
    /// retried; vanished files are dropped.
    pub fn pending_files(&self) -> Vec<PathBuf> {
        let Some(state) = &self.state else { return vec![] };
        let done: HashSet<&str> = state.processed_files.iter().map(String::as_str).collect();
        state
            .all_files
            .iter()
            .filter(|f| !done.contains(f.as_str()))
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect()
    }

    pub fn clear(&mut self, collection: &str) {
        let _ = std::fs::remove_file(self.path_for(collection));
        self.state = None;
    }

    pub fn state(&self) -> Option<&CheckpointState> {
        self.state.as_ref()
    }
}
