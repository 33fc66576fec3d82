//! HTTP embedding backends (OpenAI-compatible and Ollama).
//!
//! Requests are batched by `embedding.batch_size`. A failed request fails
//! the whole call immediately; retries are the caller's business.

use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApi {
    /// `POST {url}/v1/embeddings`, bearer token from `OPENAI_API_KEY`.
    OpenAi,
    /// `POST {url}/api/embed`, no auth.
    Ollama,
}

impl RemoteApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteApi::OpenAi => "openai",
            RemoteApi::Ollama => "ollama",
        }
    }

    fn default_url(&self) -> &'static str {
        match self {
            RemoteApi::OpenAi => "https://api.openai.com",
            RemoteApi::Ollama => "http://localhost:11434",
        }
    }
}

pub struct RemoteClient {
    api: RemoteApi,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    batch_size: usize,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(api: RemoteApi, config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            RagError::ProviderUnavailable(format!("embedding.model required for {}", api.as_str()))
        })?;
        let dims = config.dims.filter(|d| *d > 0).ok_or_else(|| {
            RagError::ProviderUnavailable(format!("embedding.dims required for {}", api.as_str()))
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| api.default_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::ProviderUnavailable(format!("http client: {}", e)))?;

        let api_key = match api {
            RemoteApi::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
            RemoteApi::Ollama => None,
        };

        Ok(Self {
            api,
            model,
            dims,
            url,
            api_key,
            batch_size: config.batch_size.max(1),
            http,
        })
    }

    pub fn api(&self) -> RemoteApi {
        self.api
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Remote backends need no download; only credentials are checked.
    pub fn load(&self) -> Result<()> {
        if self.api == RemoteApi::OpenAi && self.api_key.is_none() {
            return Err(RagError::ProviderUnavailable(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }
        Ok(())
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.load()?;
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let endpoint = match self.api {
            RemoteApi::OpenAi => format!("{}/v1/embeddings", self.url),
            RemoteApi::Ollama => format!("{}/api/embed", self.url),
        };

        let mut request = self.http.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            RagError::ProviderUnavailable(format!("{} request failed: {}", self.api.as_str(), e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::ProviderUnavailable(format!(
                "{} API error {}: {}",
                self.api.as_str(),
                status,
                text
            )));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            RagError::ProviderUnavailable(format!("{} response: {}", self.api.as_str(), e))
        })?;

        match self.api {
            RemoteApi::OpenAi => parse_openai_response(&json),
            RemoteApi::Ollama => parse_ollama_response(&json),
        }
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("openai", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| invalid("openai", "missing embedding"))?;
        indexed.push((index, to_vector("openai", embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| invalid("ollama", "missing embeddings array"))?
        .iter()
        .map(|e| to_vector("ollama", e))
        .collect()
}

fn to_vector(api: &str, value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| invalid(api, "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| invalid(api, "embedding contains a non-number"))
        })
        .collect()
}

fn invalid(api: &str, what: &str) -> RagError {
    RagError::ProviderUnavailable(format!("invalid {} response: {}", api, what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(matches!(err, RagError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.25], [1.0, 2.0]]});
        let v = parse_ollama_response(&json).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[1], vec![1.0, 2.0]);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        let json = serde_json::json!({"embeddings": [[0.5, "x"]]});
        assert!(parse_ollama_response(&json).is_err());
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        let client = RemoteClient::new(RemoteApi::Ollama, &config).unwrap();
        assert!(client.load().is_ok());
        assert_eq!(client.url, "http://localhost:11434");
    }

    #[test]
    fn test_model_required() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        assert!(RemoteClient::new(RemoteApi::Ollama, &config).is_err());
    }
}
