//! Embedding engine bank: the `Embedder` contract, a local static-model
//! implementation, an OpenAI-compatible HTTP implementation, and the caching
//! wrapper that routes every call through the two-tier embedding cache.

use anyhow::Result;
use model2vec_rs::model::StaticModel;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::embedding_cache::EmbeddingCache;

/// What kind of chunk a batch of texts belongs to. Implementations may use
/// this to tune batching; the caching wrapper passes it straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Metadata,
    Implementation,
    Relation,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Metadata => "metadata",
            ItemKind::Implementation => "implementation",
            ItemKind::Relation => "relation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub text: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub token_count: u32,
    pub cost_estimate: f64,
    pub error: Option<String>,
}

impl EmbeddingResult {
    pub fn ok(text: String, embedding: Vec<f32>, model: &str, token_count: u32, cost: f64) -> Self {
        Self { text, embedding, model: model.to_string(), token_count, cost_estimate: cost, error: None }
    }

    pub fn failed(text: String, model: &str, error: impl Into<String>) -> Self {
        Self {
            text,
            embedding: vec![],
            model: model.to_string(),
            token_count: 0,
            cost_estimate: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && !self.embedding.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Character-based token approximation (4 chars/token), the fallback the
/// whole pipeline uses for budgeting and truncation.
pub fn approx_tokens(text: &str) -> u32 {
    ((text.len() / 4).max(1)) as u32
}

pub trait Embedder: Send + Sync {
    /// Embed a batch; one result per input, errors carried per item. The
    /// call returns only when every result or error is in.
    fn embed_batch(&self, texts: &[String], item_kind: ItemKind) -> Vec<EmbeddingResult>;

    fn dimension(&self) -> u32;

    fn max_input_tokens(&self) -> u32;

    fn model_name(&self) -> &str;

    /// Clip `text` to the model's input budget using the character heuristic.
    fn truncate_text(&self, text: &str) -> String {
        let max_chars = self.max_input_tokens() as usize * 4;
        if text.len() <= max_chars {
            return text.to_string();
        }
        let mut cut = max_chars;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text[..cut].to_string()
    }

    fn usage_stats(&self) -> UsageStats {
        UsageStats::default()
    }
}

// ---------------------------------------------------------------------------
// Local static-model embedder (no network)
// ---------------------------------------------------------------------------

/// Local embeddings via a HuggingFace static model. The dimension is probed
/// once at construction; `StaticModel` exposes no metadata for it.
pub struct Model2VecEmbedder {
    model: StaticModel,
    model_id: String,
    dimension: u32,
}

impl Model2VecEmbedder {
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)?;
        let dimension = model.encode_single("dimension probe").len() as u32;
        Ok(Self { model, model_id: model_id.to_string(), dimension })
    }
}

impl Embedder for Model2VecEmbedder {
    fn embed_batch(&self, texts: &[String], _item_kind: ItemKind) -> Vec<EmbeddingResult> {
        texts
            .iter()
            .map(|text| {
                let clipped = self.truncate_text(text);
                let embedding = self.model.encode_single(&clipped);
                if embedding.is_empty() {
                    EmbeddingResult::failed(text.clone(), &self.model_id, "empty embedding")
                } else {
                    EmbeddingResult::ok(text.clone(), embedding, &self.model_id, approx_tokens(&clipped), 0.0)
                }
            })
            .collect()
    }

    fn dimension(&self) -> u32 {
        self.dimension
    }

    fn max_input_tokens(&self) -> u32 {
        // Static models have no hard context window; cap to keep encode cost
        // bounded on generated monsters.
        4_000
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP embedder
// ---------------------------------------------------------------------------

const OPENAI_MAX_INPUT_TOKENS: u32 = 8_191;
const OPENAI_COST_PER_TOKEN: f64 = 0.000_000_02; // text-embedding-3-small
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Remote embedder speaking the OpenAI `/embeddings` protocol over blocking
/// HTTP. Owns its own rate-limit backoff and input truncation.
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    dimension: u32,
    stats: Mutex<UsageStats>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, dimension: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
            stats: Mutex::new(UsageStats::default()),
        }
    }

    fn fail_all(&self, texts: &[String], error: &str) -> Vec<EmbeddingResult> {
        texts
            .iter()
            .map(|t| EmbeddingResult::failed(t.clone(), &self.model, error))
            .collect()
    }

    fn request(&self, inputs: &[String]) -> Result<serde_json::Value, String> {
        let url = format!("{}/embeddings", self.base_url);
        let mut attempt = 0u32;
        loop {
            let response = ureq::post(&url)
                .set("Authorization", &format!("Bearer {}", self.api_key))
                .timeout(Duration::from_secs(60))
                .send_json(json!({ "model": self.model, "input": inputs }));

            match response {
                Ok(resp) => {
                    return resp
                        .into_json::<serde_json::Value>()
                        .map_err(|e| format!("invalid embeddings response: {e}"));
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let retryable = code == 429 || code >= 500;
                    if retryable && attempt < MAX_RETRIES {
                        let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                        crate::debug_log!(
                            "[cortexgraph] embeddings HTTP {code}, retrying in {delay}ms"
                        );
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    let body = resp.into_string().unwrap_or_default();
                    return Err(format!("embeddings HTTP {code}: {body}"));
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(format!("embeddings transport error: {e}"));
                }
            }
        }
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed_batch(&self, texts: &[String], _item_kind: ItemKind) -> Vec<EmbeddingResult> {
        if texts.is_empty() {
            return vec![];
        }

        let inputs: Vec<String> = texts.iter().map(|t| self.truncate_text(t)).collect();
        let body = match self.request(&inputs) {
            Ok(v) => v,
            Err(e) => return self.fail_all(texts, &e),
        };

        let Some(data) = body.get("data").and_then(|d| d.as_array()) else {
            return self.fail_all(texts, "embeddings response missing 'data'");
        };

        let mut out: Vec<EmbeddingResult> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let embedding: Option<Vec<f32>> = data
                .iter()
                .find(|item| item.get("index").and_then(|x| x.as_u64()) == Some(i as u64))
                .or_else(|| data.get(i))
                .and_then(|item| item.get("embedding"))
                .and_then(|e| e.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect());

            match embedding {
                Some(vector) if !vector.is_empty() => {
                    let tokens = approx_tokens(&inputs[i]);
                    out.push(EmbeddingResult::ok(
                        text.clone(),
                        vector,
                        &self.model,
                        tokens,
                        tokens as f64 * OPENAI_COST_PER_TOKEN,
                    ));
                }
                _ => out.push(EmbeddingResult::failed(
                    text.clone(),
                    &self.model,
                    format!("no embedding returned for item {i}"),
                )),
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.total_requests += 1;
            for r in &out {
                stats.total_tokens += r.token_count as u64;
                stats.total_cost += r.cost_estimate;
            }
        }

        out
    }

    fn dimension(&self) -> u32 {
        self.dimension
    }

    fn max_input_tokens(&self) -> u32 {
        OPENAI_MAX_INPUT_TOKENS
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_stats(&self) -> UsageStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// Routes every embedding request through the two-tier cache: hits are
/// served locally, misses go upstream in one batch, and fresh results are
/// written back to both tiers.
pub struct CachingEmbedder {
    upstream: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
    stats: Mutex<UsageStats>,
}

impl CachingEmbedder {
    pub fn new(upstream: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self { upstream, cache, stats: Mutex::new(UsageStats::default()) }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

impl Embedder for CachingEmbedder {
    fn embed_batch(&self, texts: &[String], item_kind: ItemKind) -> Vec<EmbeddingResult> {
        let model = self.upstream.model_name().to_string();

        let mut results: Vec<Option<EmbeddingResult>> = vec![None; texts.len()];
        let mut miss_indices: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(embedding) = self.cache.get(text) {
                results[i] = Some(EmbeddingResult::ok(text.clone(), embedding, &model, 0, 0.0));
            } else {
                miss_indices.push(i);
            }
        }

        let hits = texts.len() - miss_indices.len();

        if !miss_indices.is_empty() {
            let miss_texts: Vec<String> = miss_indices.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.upstream.embed_batch(&miss_texts, item_kind);

            for (slot, result) in miss_indices.iter().zip(fresh.into_iter()) {
                if result.success() {
                    self.cache.set(&texts[*slot], &result.embedding);
                }
                results[*slot] = Some(result);
            }

            // Persist the index after every write-back batch so a later
            // process sees these entries.
            if let Err(_e) = self.cache.flush() {
                crate::debug_log!("[cortexgraph] embedding-cache index flush failed: {_e}");
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.cache_hits += hits as u64;
            stats.cache_misses += (texts.len() - hits) as u64;
            if !miss_indices.is_empty() {
                stats.total_requests += 1;
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| {
                    EmbeddingResult::failed(texts[i].clone(), &model, "upstream returned no result")
                })
            })
            .collect()
    }

    fn dimension(&self) -> u32 {
        self.upstream.dimension()
    }

    fn max_input_tokens(&self) -> u32 {
        self.upstream.max_input_tokens()
    }

    fn model_name(&self) -> &str {
        self.upstream.model_name()
    }

    fn usage_stats(&self) -> UsageStats {
        let mine = self.stats.lock().map(|s| *s).unwrap_or_default();
        let upstream = self.upstream.usage_stats();
        UsageStats {
            total_requests: mine.total_requests,
            cache_hits: mine.cache_hits,
            cache_misses: mine.cache_misses,
            total_tokens: upstream.total_tokens,
            total_cost: upstream.total_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic upstream that counts how many batch calls reach it.
    struct CountingEmbedder {
        calls: AtomicU64,
    }

    impl Embedder for CountingEmbedder {
        fn embed_batch(&self, texts: &[String], _kind: ItemKind) -> Vec<EmbeddingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            texts
                .iter()
                .map(|t| {
                    EmbeddingResult::ok(t.clone(), vec![t.len() as f32, 1.0], "counting", 1, 0.0)
                })
                .collect()
        }
        fn dimension(&self) -> u32 {
            2
        }
        fn max_input_tokens(&self) -> u32 {
            8
        }
        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn cache_hit_skips_upstream_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::open(tmp.path(), "counting", 100, 100));
        let upstream = Arc::new(CountingEmbedder { calls: AtomicU64::new(0) });
        let embedder = CachingEmbedder::new(upstream.clone(), cache);

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = embedder.embed_batch(&texts, ItemKind::Metadata);
        assert!(first.iter().all(|r| r.success()));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let second = embedder.embed_batch(&texts, ItemKind::Metadata);
        assert!(second.iter().all(|r| r.success()));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1, "all hits, no upstream call");
        assert_eq!(embedder.usage_stats().cache_hits, 2);
    }

    #[test]
    fn partial_miss_sends_only_misses_upstream() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::open(tmp.path(), "counting", 100, 100));
        let upstream = Arc::new(CountingEmbedder { calls: AtomicU64::new(0) });
        let embedder = CachingEmbedder::new(upstream, cache);

        embedder.embed_batch(&["alpha".to_string()], ItemKind::Metadata);
        let mixed = embedder.embed_batch(
            &["alpha".to_string(), "gamma".to_string()],
            ItemKind::Metadata,
        );
        assert_eq!(mixed.len(), 2);
        assert!(mixed.iter().all(|r| r.success()));
        // "alpha" came from cache: embeddings must still line up per input.
        assert_eq!(mixed[0].embedding, vec![5.0, 1.0]);
        assert_eq!(mixed[1].embedding, vec![5.0, 1.0]);
    }

    #[test]
    fn truncate_text_respects_char_boundaries() {
        let upstream = CountingEmbedder { calls: AtomicU64::new(0) };
        // max 8 tokens * 4 = 32 chars
        let long = "é".repeat(40);
        let clipped = upstream.truncate_text(&long);
        assert!(clipped.len() <= 32);
        assert!(clipped.chars().all(|c| c == 'é'));
    }
}
