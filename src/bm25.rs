//! BM25 sparse vectors for the hybrid search side of the store.
//!
//! Corpus-fitted IDF weighting: the embedder is fitted once on the first
//! batch it sees (vocabulary + document frequencies), then every text maps
//! to `(vocab index, idf weight)` pairs. Only metadata and relation chunks
//! receive sparse vectors; implementation bodies stay dense-only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Sparse vector in index/value form, ready for a named sparse vector slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Weight assigned to a vocabulary term that never appeared in a fitted
/// document (possible after incremental refits).
const UNSEEN_TERM_WEIGHT: f32 = 0.1;

pub struct Bm25Embedder {
    vocabulary: HashMap<String, u32>,
    doc_freq: HashMap<String, u32>,
    corpus_len: usize,
    fitted: bool,
}

impl Default for Bm25Embedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Bm25Embedder {
    pub fn new() -> Self {
        Self {
            vocabulary: HashMap::new(),
            doc_freq: HashMap::new(),
            corpus_len: 0,
            fitted: false,
        }
    }

    /// Lowercase alphanumeric tokens, single-char tokens dropped.
    fn tokenize(text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_string)
            .collect()
    }

    /// Build vocabulary and document frequencies from `corpus`. Terms are
    /// indexed in sorted order so refits over the same corpus are identical.
    pub fn fit_corpus(&mut self, corpus: &[String]) {
        let mut vocab_terms: BTreeSet<String> = BTreeSet::new();
        let mut doc_freq: HashMap<String, u32> = HashMap::new();

        for doc in corpus {
            let unique: BTreeSet<String> = Self::tokenize(doc).into_iter().collect();
            for token in unique {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
                vocab_terms.insert(token);
            }
        }

        self.vocabulary = vocab_terms
            .into_iter()
            .enumerate()
            .map(|(idx, term)| (term, idx as u32))
            .collect();
        self.doc_freq = doc_freq;
        self.corpus_len = corpus.len();
        self.fitted = true;

        crate::debug_log!(
            "[cortexgraph] BM25 fitted on {} docs, vocabulary {}",
            self.corpus_len,
            self.vocabulary.len()
        );
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    /// Sparse vector for one text. Unknown tokens (outside the fitted
    /// vocabulary) are ignored; known-but-unseen terms get a small positive
    /// weight so they still contribute to matching.
    pub fn sparse_vector(&self, text: &str) -> SparseVector {
        if !self.fitted || self.vocabulary.is_empty() {
            return SparseVector::default();
        }

        let n = self.corpus_len as f32;
        let mut weights: HashMap<u32, f32> = HashMap::new();

        for token in Self::tokenize(text) {
            let Some(&idx) = self.vocabulary.get(&token) else { continue };
            let df = self.doc_freq.get(&token).copied().unwrap_or(0);
            let weight = if df > 0 {
                let idf = ((n - df as f32 + 0.5) / (df as f32 + 0.5)).ln();
                idf.max(0.0)
            } else {
                UNSEEN_TERM_WEIGHT
            };
            weights.insert(idx, weight);
        }

        let mut pairs: Vec<(u32, f32)> = weights.into_iter().collect();
        pairs.sort_by_key(|(idx, _)| *idx);

        SparseVector {
            indices: pairs.iter().map(|(i, _)| *i).collect(),
            values: pairs.iter().map(|(_, v)| *v).collect(),
        }
    }

    /// Embed a batch; fits on the batch itself when not yet fitted (the
    /// first apply of a run seeds the vocabulary).
    pub fn embed_batch(&mut self, texts: &[String]) -> Vec<SparseVector> {
        if !self.fitted {
            self.fit_corpus(texts);
        }
        texts.iter().map(|t| self.sparse_vector(t)).collect()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }
}
