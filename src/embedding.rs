use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{ EmbeddingModel, InitOptions, TextEmbedding };
use parking_lot::Mutex;
use reqwest::header::{ AUTHORIZATION, CONTENT_TYPE };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::debug;

use crate::tokens::{ truncate_to_budget, TokenCodec, MAX_EMBEDDING_TOKENS };

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Text is empty")]
    EmptyInput,
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Embedding API error: {status} {body}")]
    Api {
        status: u16,
        body: String,
    },
    #[error("Unexpected response format from embedding API: {0}")]
    MalformedResponse(String),
    #[error("Local embedding model error: {0}")]
    Backend(String),
}

impl EmbeddingError {
    /// True when the input was rejected before any service was contacted.
    pub fn is_validation(&self) -> bool {
        matches!(self, EmbeddingError::EmptyInput)
    }
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Validates text and enforces the token budget in front of a backend.
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    codec: Option<Arc<dyn TokenCodec>>,
    max_tokens: usize,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, codec: Arc<dyn TokenCodec>) -> Self {
        Self {
            backend,
            codec: Some(codec),
            max_tokens: MAX_EMBEDDING_TOKENS,
        }
    }

    /// For backends that truncate with their own tokenizer, such as the local model.
    pub fn unbudgeted(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            codec: None,
            max_tokens: MAX_EMBEDDING_TOKENS,
        }
    }

    #[cfg(test)]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let Some(codec) = &self.codec else {
            return self.backend.embed(text).await;
        };
        let budgeted = truncate_to_budget(codec.as_ref(), text, self.max_tokens)?;
        if budgeted.truncated {
            debug!(tokens = budgeted.token_count, "truncated embedding input");
        }
        self.backend.embed(&budgeted.text).await
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self.client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&(EmbeddingRequest { input: text, model: &self.model }))
            .send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status: status.as_u16(), body });
        }

        let body = response.text().await?;
        let parsed: EmbeddingResponse = serde_json
            ::from_str(&body)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;
        parsed.data
            .into_iter()
            .next()
            .and_then(|datum| datum.embedding)
            .ok_or_else(|| EmbeddingError::MalformedResponse("missing data[0].embedding".into()))
    }
}

/// Local fastembed model, run on the blocking pool.
pub struct FastEmbedBackend {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedBackend {
    pub fn new() -> Result<Self, EmbeddingError> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true)
        ).map_err(|e| EmbeddingError::Backend(e.to_string()))?;
        Ok(Self { model: Arc::new(Mutex::new(model)) })
    }
}

#[async_trait]
impl EmbeddingBackend for FastEmbedBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let embeddings = tokio::task
            ::spawn_blocking(move || model.lock().embed(vec![text], None)).await
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Backend("model returned no embedding".into()))
    }
}
