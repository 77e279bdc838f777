//! Embedding models for the retrieval index
//!
//! Supports:
//! - Ollama embeddings (`/api/embed`, e.g. bge-small-en-v1.5)
//! - Hash-based fallback (deterministic, offline, lower quality)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, EmbeddingProviderKind};
use crate::error::EmbeddingError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: usize = 1000;

/// Turns text into vectors. The same model must embed documents and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier persisted with the index
    fn model_name(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }
}

/// Build the embedder selected in configuration, with a query cache in front
pub fn from_config(config: &Config) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let inner: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(
            config.embedding_base_url(),
            &config.embedding.model,
        )?),
        EmbeddingProviderKind::Hash => {
            warn!("Using hash-based embeddings; retrieval quality will be low");
            Arc::new(HashEmbedder::new(config.embedding.dimension))
        }
    };
    info!("Embedding model: {}", inner.model_name());
    Ok(Arc::new(CachedEmbedder::new(inner)))
}

/// Deterministic feature-hashing embedder
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    name: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            name: format!("hash-{}", dimension),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = u64::from_le_bytes(bucket_bytes) as usize % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        normalize(&mut embedding);
        embedding
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Ollama embedding endpoint
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Embedding API error: {}", message);
            return Err(EmbeddingError::Endpoint {
                status: status.as_u16(),
                message,
            });
        }

        let result: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if result.embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.embeddings.len()
            )));
        }

        Ok(result.embeddings)
    }
}

/// LRU cache in front of another embedder, keyed by content hash
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<lru::LruCache<String, Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn cache_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let keys: Vec<String> = texts.iter().map(|t| cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = {
            let mut cache = self.cache.lock().await;
            keys.iter().map(|k| cache.get(k).cloned()).collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !missing.is_empty() {
            debug!(
                "Embedding {} of {} texts ({} cached)",
                missing.len(),
                texts.len(),
                texts.len() - missing.len()
            );
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let embedded = self.inner.embed_batch(&batch).await?;

            let mut cache = self.cache.lock().await;
            for (&i, embedding) in missing.iter().zip(embedded) {
                cache.put(keys[i].clone(), embedding.clone());
                results[i] = Some(embedding);
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".to_string()))
            })
            .collect()
    }
}

fn normalize(vector: &mut [f32]) {
    let mag: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag > 0.0 {
        for val in vector.iter_mut() {
            *val /= mag;
        }
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        inner: HashEmbedder,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn test_hash_embedding_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Hello world").await.unwrap();
        let b = embedder.embed("hello, WORLD").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let mag: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedding_similarity() {
        let embedder = HashEmbedder::new(384);
        let query = embedder.embed("refund policy for orders").await.unwrap();
        let close = embedder.embed("our refund policy covers all orders").await.unwrap();
        let far = embedder.embed("the weather is sunny today").await.unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_cache_skips_repeated_text() {
        let counting = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            inner: HashEmbedder::new(32),
        });
        let cached = CachedEmbedder::new(counting.clone());

        let first = cached
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let second = cached
            .embed_batch(&["b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
        assert_eq!(first[1], second[0]);
        assert_eq!(cached.cached_len().await, 3);
        assert_eq!(cached.model_name(), "counting");
    }

    #[test]
    fn test_from_config_hash() {
        let mut config = Config::default();
        config.embedding.provider = EmbeddingProviderKind::Hash;
        config.embedding.dimension = 16;
        let embedder = from_config(&config).unwrap();
        assert_eq!(embedder.model_name(), "hash-16");
    }
}
