//! Environment configuration.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | S3_BUCKET_NAME | required | Bucket for uploads and transcription output |
//! | AWS_REGION | required | Region of the bucket and the transcription service |
//! | PORT | required | HTTP listen port |
//! | OPENAI_API_KEY | required for `openai` backend | Embedding service credential |
//! | EMBEDDING_BACKEND | openai | `openai` or `local` (fastembed) |
//! | EMBEDDING_MODEL | text-embedding-ada-002 | Remote embedding model |
//! | EMBEDDING_ENDPOINT | https://api.openai.com/v1/embeddings | Remote embedding URL |
//! | TOKENIZER_PATH | ./models/tokenizer.json | Tokenizer matching the remote model; unused by `local` |
//! | MEDIA_DIR | ./media | Uploaded media and metadata documents |
//! | DB_PATH | platform data dir | RocksDB directory |
//! | TRANSCRIBE_LANGUAGE | ja-JP | Language submitted with each job |
//! | POLL_INTERVAL_SECS | 10 | Delay between job status polls |
//! | MAX_POLL_ATTEMPTS | 360 | Polls before a job is abandoned |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_EMBEDDING_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    OpenAi,
    Local,
}

impl FromStr for EmbeddingBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" | "fastembed" => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub region: String,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub embedding_backend: EmbeddingBackendKind,
    pub embedding_model: String,
    pub embedding_endpoint: String,
    pub tokenizer_path: PathBuf,
    pub media_dir: PathBuf,
    pub db_path: PathBuf,
    pub language: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
        where F: Fn(&str) -> Option<String>
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let bucket = required("S3_BUCKET_NAME")?;
        let region = required("AWS_REGION")?;
        let port = parse("PORT", &required("PORT")?)?;

        let embedding_backend = match get("EMBEDDING_BACKEND") {
            Some(value) =>
                value
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key: "EMBEDDING_BACKEND", value })?,
            None => EmbeddingBackendKind::OpenAi,
        };
        let openai_api_key = get("OPENAI_API_KEY");
        if embedding_backend == EmbeddingBackendKind::OpenAi && openai_api_key.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }

        let poll_interval_secs: u64 = match get("POLL_INTERVAL_SECS") {
            Some(v) => parse("POLL_INTERVAL_SECS", &v)?,
            None => 10,
        };
        let max_poll_attempts = match get("MAX_POLL_ATTEMPTS") {
            Some(v) => parse("MAX_POLL_ATTEMPTS", &v)?,
            None => 360,
        };

        let db_path = get("DB_PATH")
            .map(PathBuf::from)
            .or_else(|| dirs::data_local_dir().map(|d| d.join("transcript-search").join("db")))
            .unwrap_or_else(|| PathBuf::from("./db"));

        Ok(Self {
            bucket,
            region,
            port,
            openai_api_key,
            embedding_backend,
            embedding_model: get("EMBEDDING_MODEL").unwrap_or_else(||
                DEFAULT_EMBEDDING_MODEL.to_string()
            ),
            embedding_endpoint: get("EMBEDDING_ENDPOINT").unwrap_or_else(||
                DEFAULT_EMBEDDING_ENDPOINT.to_string()
            ),
            tokenizer_path: get("TOKENIZER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./models/tokenizer.json")),
            media_dir: get("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./media")),
            db_path,
            language: get("TRANSCRIBE_LANGUAGE").unwrap_or_else(|| "ja-JP".to_string()),
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_poll_attempts,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { key, value: value.to_string() })
}
