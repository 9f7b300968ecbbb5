//! Embedding trait, caching embedding service, and vector utilities.
//!
//! [`Embedder`] is the seam concrete backends implement (OpenAI, Ollama, or
//! a test double). [`EmbeddingService`] wraps an embedder with the policy
//! the index relies on:
//!
//! - blank inputs yield `None` without failing the batch
//! - inputs longer than [`MAX_EMBED_CHARS`] are truncated
//! - results are memoized in a bounded LRU cache keyed by normalized text
//! - backend failures are logged and surface as `None`, so callers degrade
//!   to keyword-only search instead of aborting

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use tracing::{debug, warn};

use crate::error::Result;

/// Inputs longer than this many characters are truncated before encoding.
pub const MAX_EMBED_CHARS: usize = 8000;

/// Default number of cached vectors.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default number of texts sent to the backend per call.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// A backend that turns texts into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedding front-end with truncation, blank skipping, and caching.
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl EmbeddingService {
    /// A service with the default batch size and cache capacity.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_options(embedder, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_CAPACITY)
    }

    /// `cache_capacity == 0` disables caching.
    pub fn with_options(
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        cache_capacity: usize,
    ) -> Self {
        let cache = NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            embedder,
            batch_size: batch_size.max(1),
            cache,
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Encode one text. `None` for blank input or on backend failure.
    pub async fn encode_one(&self, text: &str) -> Option<Vec<f32>> {
        self.encode_many(&[text.to_string()])
            .await
            .into_iter()
            .next()
            .flatten()
    }

    /// Encode many texts, preserving input order and length.
    ///
    /// Blank entries and entries in a failed backend batch come back as
    /// `None`; the rest of the batch is unaffected.
    pub async fn encode_many(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                continue;
            }
            let key = cache_key(text);
            if let Some(hit) = self.cache_get(&key) {
                results[i] = Some(hit);
                continue;
            }
            pending.push((i, key, truncate_for_embedding(text)));
        }

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, _, t)| t.clone()).collect();
            match self.embedder.embed(&inputs).await {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    for ((i, key, _), vector) in batch.iter().zip(vectors) {
                        self.cache_put(key.clone(), vector.clone());
                        results[*i] = Some(vector);
                    }
                }
                Ok(vectors) => {
                    warn!(
                        expected = inputs.len(),
                        got = vectors.len(),
                        "embedding backend returned a mismatched batch"
                    );
                }
                Err(e) => {
                    warn!(error = %e, batch = inputs.len(), "embedding batch failed");
                }
            }
        }

        debug!(
            requested = texts.len(),
            encoded = results.iter().filter(|r| r.is_some()).count(),
            "encoded texts"
        );
        results
    }

    fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        let mut guard = cache.lock().ok()?;
        guard.get(key).cloned()
    }

    fn cache_put(&self, key: String, vector: Vec<f32>) {
        if let Some(cache) = &self.cache {
            if let Ok(mut guard) = cache.lock() {
                guard.put(key, vector);
            }
        }
    }

    /// Number of cached vectors.
    pub fn cached_len(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|g| g.len()))
            .unwrap_or(0)
    }
}

/// Cache key: trimmed, lowercased text.
fn cache_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Cut text to [`MAX_EMBED_CHARS`] characters, marking the cut with `...`.
pub fn truncate_for_embedding(text: &str) -> String {
    match text.char_indices().nth(MAX_EMBED_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use filesync_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::SyncError;

    /// Embeds each text as `[len, 1.0]` and counts backend calls.
    struct LengthEmbedder {
        calls: AtomicUsize,
        texts_seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl LengthEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.lock().unwrap().extend(texts.iter().cloned());
            if self.fail {
                return Err(SyncError::remote("model unavailable"));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_blank_entries_are_none() {
        let service = EmbeddingService::new(Arc::new(LengthEmbedder::new(false)));
        let out = service
            .encode_many(&["alpha".into(), "   ".into(), "".into(), "beta".into()])
            .await;
        assert_eq!(out.len(), 4);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_none());
        assert!(out[3].is_some());
    }

    #[tokio::test]
    async fn test_cache_uses_normalized_key() {
        let embedder = Arc::new(LengthEmbedder::new(false));
        let service = EmbeddingService::new(embedder.clone());
        let first = service.encode_one("Quarterly Report").await;
        let second = service.encode_one("  quarterly report ").await;
        assert_eq!(first, second);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let embedder = Arc::new(LengthEmbedder::new(false));
        let service = EmbeddingService::with_options(embedder, 8, 2);
        for text in ["one", "two", "three"] {
            service.encode_one(text).await;
        }
        assert_eq!(service.cached_len(), 2);
    }

    #[tokio::test]
    async fn test_long_input_truncated() {
        let embedder = Arc::new(LengthEmbedder::new(false));
        let service = EmbeddingService::new(embedder.clone());
        let long = "x".repeat(MAX_EMBED_CHARS + 500);
        service.encode_one(&long).await;
        let seen = embedder.texts_seen.lock().unwrap();
        assert_eq!(seen[0].chars().count(), MAX_EMBED_CHARS + 3);
        assert!(seen[0].ends_with("..."));
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_none() {
        let service = EmbeddingService::new(Arc::new(LengthEmbedder::new(true)));
        let out = service.encode_many(&["alpha".into(), "beta".into()]).await;
        assert_eq!(out, vec![None, None]);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let embedder = Arc::new(LengthEmbedder::new(false));
        let service = EmbeddingService::with_options(embedder.clone(), 2, 0);
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let out = service.encode_many(&texts).await;
        assert!(out.iter().all(Option::is_some));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
