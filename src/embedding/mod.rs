//! Embedding provider abstraction and implementations.
//!
//! [`Provider`] is a closed set of backends resolved once from
//! configuration. Every variant implements [`EmbeddingProvider`]:
//!
//! | Config value | Variant | Notes |
//! |--------------|---------|-------|
//! | `"disabled"` | [`Provider::Disabled`] | every call fails with `ProviderUnavailable` |
//! | `"hash"` | [`Provider::Hash`] | deterministic feature hashing, offline |
//! | `"local"` | [`Provider::Local`] | fastembed model, downloaded on first load |
//! | `"openai"` | [`Provider::Remote`] | `POST /v1/embeddings` |
//! | `"ollama"` | [`Provider::Remote`] | `POST /api/embed` |
//!
//! Providers never retry and never substitute placeholder vectors: a failed
//! backend surfaces as [`RagError::ProviderUnavailable`].
//!
//! Also provides vector utilities:
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//! - [`normalize`]: L2 normalization used by the index
//! - [`cosine_similarity`]

mod local;
mod remote;
pub mod warmup;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

pub use local::LocalModel;
pub use remote::{RemoteApi, RemoteClient};

/// Interface shared by all embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One-time initialization. Concurrent callers share a single load.
    async fn load(&self) -> Result<()>;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality.
    fn dimension(&self) -> usize;

    fn info(&self) -> ProviderInfo;
}

/// Snapshot of a provider's identity and readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub kind: &'static str,
    pub model_id: String,
    pub dimension: usize,
    pub ready: bool,
}

/// The configured embedding backend.
pub enum Provider {
    Disabled,
    Hash(HashEmbedder),
    Local(LocalModel),
    Remote(RemoteClient),
}

impl Provider {
    /// Resolve the provider named in `[embedding] provider`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        match config.provider.as_str() {
            "disabled" => Ok(Provider::Disabled),
            "hash" => {
                let dims = config.dims.unwrap_or(0);
                if dims == 0 {
                    return Err(RagError::ProviderUnavailable(
                        "embedding.dims required for hash provider".into(),
                    ));
                }
                Ok(Provider::Hash(HashEmbedder::new(dims)))
            }
            "local" => Ok(Provider::Local(LocalModel::new(config)?)),
            "openai" => Ok(Provider::Remote(RemoteClient::new(RemoteApi::OpenAi, config)?)),
            "ollama" => Ok(Provider::Remote(RemoteClient::new(RemoteApi::Ollama, config)?)),
            other => Err(RagError::ProviderUnavailable(format!(
                "unknown embedding provider: {}",
                other
            ))),
        }
    }

    /// Embed a single query text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::ProviderUnavailable("empty embedding response".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for Provider {
    async fn load(&self) -> Result<()> {
        match self {
            Provider::Disabled => Err(disabled()),
            Provider::Hash(_) => Ok(()),
            Provider::Local(model) => model.load().await,
            Provider::Remote(client) => client.load(),
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = match self {
            Provider::Disabled => return Err(disabled()),
            Provider::Hash(hash) => hash.embed(texts),
            Provider::Local(model) => model.embed(texts).await?,
            Provider::Remote(client) => client.embed(texts).await?,
        };
        check_batch(texts.len(), self.dimension(), vectors)
    }

    fn dimension(&self) -> usize {
        match self {
            Provider::Disabled => 0,
            Provider::Hash(hash) => hash.dims,
            Provider::Local(model) => model.dims(),
            Provider::Remote(client) => client.dims(),
        }
    }

    fn info(&self) -> ProviderInfo {
        match self {
            Provider::Disabled => ProviderInfo {
                kind: "disabled",
                model_id: "disabled".to_string(),
                dimension: 0,
                ready: false,
            },
            Provider::Hash(hash) => ProviderInfo {
                kind: "hash",
                model_id: format!("feature-hash-{}", hash.dims),
                dimension: hash.dims,
                ready: true,
            },
            Provider::Local(model) => ProviderInfo {
                kind: "local",
                model_id: model.model_name().to_string(),
                dimension: model.dims(),
                ready: model.is_ready(),
            },
            Provider::Remote(client) => ProviderInfo {
                kind: client.api().as_str(),
                model_id: client.model().to_string(),
                dimension: client.dims(),
                ready: client.load().is_ok(),
            },
        }
    }
}

fn disabled() -> RagError {
    RagError::ProviderUnavailable(
        "embedding provider is disabled; set [embedding] provider in config".into(),
    )
}

/// Reject responses whose shape does not match the request.
fn check_batch(expected: usize, dims: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(RagError::ProviderUnavailable(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RagError::ProviderUnavailable(format!(
            "provider returned a {}-dimensional vector, expected {}",
            bad.len(),
            dims
        )));
    }
    Ok(vectors)
}

// ============ Hash Provider ============

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a hash-derived sign; the result is L2-normalized.
/// Texts sharing vocabulary get positive cosine similarity. No model, no
/// network, identical output across runs and platforms.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use rag_context::embedding::{vec_to_blob, blob_to_vec};
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

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Scale `v` to unit length in place. Returns `false` (leaving `v`
/// untouched) when the norm is zero or not finite.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Compute cosine similarity between two embedding vectors.
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

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        assert!(normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        assert!(!normalize(&mut v));
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_provider_deterministic() {
        let provider = Provider::Hash(HashEmbedder::new(64));
        let a = provider.embed(&texts(&["cats and dogs"])).await.unwrap();
        let b = provider.embed(&texts(&["cats and dogs"])).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_hash_provider_similarity_tracks_vocabulary() {
        let provider = Provider::Hash(HashEmbedder::new(256));
        let v = provider
            .embed(&texts(&["cats", "Cats!", "quantum chromodynamics"]))
            .await
            .unwrap();
        assert!((cosine_similarity(&v[0], &v[1]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&v[0], &v[2]) < 0.5);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_unavailable() {
        let provider = Provider::Disabled;
        let err = provider.embed(&texts(&["hello"])).await.unwrap_err();
        assert!(matches!(err, RagError::ProviderUnavailable(_)));
        assert!(provider.load().await.is_err());
        assert!(!provider.info().ready);
    }

    #[tokio::test]
    async fn test_empty_batch_is_empty() {
        let provider = Provider::Disabled;
        assert!(provider.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_check_batch_rejects_wrong_shape() {
        assert!(check_batch(2, 3, vec![vec![0.0; 3]]).is_err());
        assert!(check_batch(1, 3, vec![vec![0.0; 4]]).is_err());
        assert!(check_batch(1, 3, vec![vec![0.0; 3]]).is_ok());
    }

    #[test]
    fn test_from_config_resolves_variants() {
        let mut cfg = EmbeddingConfig::default();
        assert!(matches!(Provider::from_config(&cfg).unwrap(), Provider::Disabled));

        cfg.provider = "hash".into();
        cfg.dims = Some(32);
        let p = Provider::from_config(&cfg).unwrap();
        assert_eq!(p.dimension(), 32);
        assert_eq!(p.info().kind, "hash");

        cfg.provider = "nope".into();
        assert!(Provider::from_config(&cfg).is_err());
    }
}
