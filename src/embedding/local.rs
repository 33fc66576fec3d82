//! Local inference through fastembed.
//!
//! The model is downloaded from Hugging Face on first [`LocalModel::load`]
//! and cached; afterwards embeddings run offline. Model construction and
//! inference are CPU-bound and run on the blocking pool.

#[cfg(feature = "local-embeddings-fastembed")]
use std::sync::{Arc, Mutex};

#[cfg(feature = "local-embeddings-fastembed")]
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

pub struct LocalModel {
    model_name: String,
    dims: usize,
    #[cfg_attr(not(feature = "local-embeddings-fastembed"), allow(dead_code))]
    batch_size: usize,
    #[cfg(feature = "local-embeddings-fastembed")]
    model: OnceCell<Arc<Mutex<fastembed::TextEmbedding>>>,
}

impl LocalModel {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

        let dims = match config.dims {
            Some(d) if d > 0 => d,
            _ => default_dims(&model_name),
        };

        #[cfg(feature = "local-embeddings-fastembed")]
        fastembed_model(&model_name)?;

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            #[cfg(feature = "local-embeddings-fastembed")]
            model: OnceCell::new(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    pub fn is_ready(&self) -> bool {
        self.model.initialized()
    }

    #[cfg(not(feature = "local-embeddings-fastembed"))]
    pub fn is_ready(&self) -> bool {
        false
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    pub async fn load(&self) -> Result<()> {
        self.handle().await.map(|_| ())
    }

    #[cfg(not(feature = "local-embeddings-fastembed"))]
    pub async fn load(&self) -> Result<()> {
        Err(feature_missing())
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.handle().await?;
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|_| {
                RagError::ProviderUnavailable("local embedding model lock poisoned".into())
            })?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::ProviderUnavailable(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::ProviderUnavailable(format!("local embedding task failed: {}", e)))?
    }

    #[cfg(not(feature = "local-embeddings-fastembed"))]
    pub async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(feature_missing())
    }

    /// Initialize the model once; concurrent callers wait on the same cell.
    #[cfg(feature = "local-embeddings-fastembed")]
    async fn handle(&self) -> Result<Arc<Mutex<fastembed::TextEmbedding>>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let which = fastembed_model(&self.model_name)?;
                tracing::info!(model = %self.model_name, "loading local embedding model");
                let loaded = tokio::task::spawn_blocking(move || {
                    fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(which).with_show_download_progress(false),
                    )
                })
                .await
                .map_err(|e| {
                    RagError::ProviderUnavailable(format!("model load task failed: {}", e))
                })?
                .map_err(|e| {
                    RagError::ProviderUnavailable(format!(
                        "failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                tracing::info!(model = %self.model_name, "local embedding model ready");
                Ok::<_, RagError>(Arc::new(Mutex::new(loaded)))
            })
            .await?;
        Ok(model.clone())
    }
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
fn feature_missing() -> RagError {
    RagError::ProviderUnavailable(
        "local embedding provider requires --features local-embeddings-fastembed".into(),
    )
}

fn default_dims(model_name: &str) -> usize {
    match model_name {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::ProviderUnavailable(format!(
            "unknown local embedding model: '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dims_by_model() {
        assert_eq!(default_dims("all-minilm-l6-v2"), 384);
        assert_eq!(default_dims("bge-base-en-v1.5"), 768);
        assert_eq!(default_dims("bge-large-en-v1.5"), 1024);
    }

    #[test]
    fn test_new_does_not_load() {
        let config = EmbeddingConfig {
            provider: "local".into(),
            ..EmbeddingConfig::default()
        };
        let model = LocalModel::new(&config).unwrap();
        assert_eq!(model.model_name(), "all-minilm-l6-v2");
        assert_eq!(model.dims(), 384);
        assert!(!model.is_ready());
    }
}
