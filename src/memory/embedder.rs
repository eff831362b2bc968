use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ArbiterError, Result};

/// Fixed dimensionality of the hash embedder. Provider embeddings may be
/// wider; similarity search only compares vectors of equal length.
pub const HASH_DIMENSIONS: usize = 256;

/// Generates vector embeddings from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---- Hash-based embedder (feature hashing, no external model) ----

/// Embeds text by hashing word tokens into fixed dimensions with a signed
/// contribution per token, then L2-normalizing. Deterministic and pure, so it
/// works offline and in tests; similarity is rough but stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0f32; HASH_DIMENSIONS];
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return vec;
        }

        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % HASH_DIMENSIONS;
            // Independent bytes of the same digest supply the sign
            let sign = if digest[4] & 1 == 0 { -1.0 } else { 1.0 };
            vec[idx] += sign;
        }

        normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 2 && !is_stopword(w))
        .map(String::from)
        .collect()
}

const STOPWORDS: &[&str] = &[
    "the", "is", "at", "on", "in", "to", "for", "of", "and", "or", "an", "it", "be", "as", "do",
    "by", "so", "if", "no", "up", "was", "are", "has", "had", "not", "but", "its", "can", "did",
    "all", "this", "that", "with", "from", "have", "they", "been", "will", "were", "than", "what",
    "when", "each", "which", "their", "said", "them", "would", "there", "could",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

// ---- Provider-based embedder (OpenAI-compatible /v1/embeddings) ----

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Calls an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct ProviderEmbedder {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl ProviderEmbedder {
    pub fn new(endpoint: &str, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.endpoint);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ArbiterError::Embedding(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArbiterError::Embedding(format!(
                "embedding endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ArbiterError::Embedding(format!("decode embedding response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(ArbiterError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---- Fallback embedder ----

/// Tries the primary embedder, degrading to the hash embedder on any error.
pub struct FallbackEmbedder {
    primary: Option<Box<dyn Embedder>>,
    fallback: HashEmbedder,
}

impl FallbackEmbedder {
    pub fn new(primary: Option<Box<dyn Embedder>>) -> Self {
        Self {
            primary,
            fallback: HashEmbedder::new(),
        }
    }
}

#[async_trait]
impl Embedder for FallbackEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(primary) = &self.primary {
            match primary.embed(texts).await {
                Ok(result) => return Ok(result),
                Err(e) => debug!(error = %e, "Primary embedder failed, using hash embedder"),
            }
        }
        self.fallback.embed(texts).await
    }
}

// ---- Vector math ----

/// Cosine similarity in [-1, 1]; 0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for i in 0..a.len() {
        dot += a[i] as f64 * b[i] as f64;
        norm_a += a[i] as f64 * a[i] as f64;
        norm_b += b[i] as f64 * b[i] as f64;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom) as f32
}

fn normalize(vec: &mut [f32]) {
    let norm: f64 = vec.iter().map(|&v| v as f64 * v as f64).sum::<f64>().sqrt();
    if norm == 0.0 {
        return;
    }
    for v in vec.iter_mut() {
        *v = (*v as f64 / norm) as f32;
    }
}

// ---- Fixed-width blob codec for storage ----

/// Encodes a float vector as little-endian bytes for blob storage.
pub fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decodes a blob back into a float vector. Returns an empty vector for
/// malformed input rather than guessing at a partial frame.
pub fn decode_embedding(data: &[u8]) -> Vec<f32> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Vec::new();
    }
    data.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed_one("fix the database connection pool");
        let b = embedder.embed_one("fix the database connection pool");
        assert_eq!(a, b);
    }

    #[test]
    fn test_embedding_is_normalized() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed_one("refactor the provider scoring logic");
        let norm: f64 = vec.iter().map(|&v| v as f64 * v as f64).sum::<f64>().sqrt();
        assert!((0.99..=1.01).contains(&norm), "norm was {}", norm);
    }

    #[test]
    fn test_empty_input_yields_zero_vector() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed_one("");
        assert_eq!(vec.len(), HASH_DIMENSIONS);
        assert!(vec.iter().all(|&v| v == 0.0));

        // Pure stopwords are equivalent to empty input
        let vec = embedder.embed_one("the and of to");
        assert!(vec.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_self_similarity_is_one() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed_one("repeated build failures on worker crate");
        let sim = cosine_similarity(&vec, &vec);
        assert!((sim - 1.0).abs() < 1e-3, "self similarity was {}", sim);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = HashEmbedder::new();
        let query = embedder.embed_one("test failures in payment module");
        let close = embedder.embed_one("repeated test failures in payment code");
        let far = embedder.embed_one("update readme typo section");

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_blob_roundtrip() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed_one("encode decode identity");
        let decoded = decode_embedding(&encode_embedding(&vec));
        assert_eq!(vec, decoded);
    }

    #[test]
    fn test_decode_rejects_partial_frames() {
        assert!(decode_embedding(&[1, 2, 3]).is_empty());
        assert!(decode_embedding(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_fallback_uses_hash_when_no_primary() {
        let embedder = FallbackEmbedder::new(None);
        let result = embedder
            .embed(&["provider outage lesson".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].len(), HASH_DIMENSIONS);
    }
}
