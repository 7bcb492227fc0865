use std::path::Path;

use crate::embedding::EmbeddingError;

/// Token ceiling applied before any text is sent for embedding.
pub const MAX_EMBEDDING_TOKENS: usize = 8000;

pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EmbeddingError>;
    fn decode(&self, ids: &[u32]) -> Result<String, EmbeddingError>;
}

/// `tokenizer.json` of the embedding model's tokenizer family.
pub struct HfTokenizer(tokenizers::Tokenizer);

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, EmbeddingError> {
        tokenizers::Tokenizer::from_file(path)
            .map(Self)
            .map_err(|e| EmbeddingError::Tokenizer(format!("{}: {}", path.display(), e)))
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EmbeddingError> {
        self.0
            .encode(text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))
    }

    fn decode(&self, ids: &[u32]) -> Result<String, EmbeddingError> {
        self.0.decode(ids, false).map_err(|e| EmbeddingError::Tokenizer(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budgeted {
    pub text: String,
    pub token_count: usize,
    pub truncated: bool,
}

/// Keeps the first `max_tokens` tokens of `text`. Text within budget is returned untouched.
pub fn truncate_to_budget(
    codec: &dyn TokenCodec,
    text: &str,
    max_tokens: usize
) -> Result<Budgeted, EmbeddingError> {
    let ids = codec.encode(text)?;
    if ids.len() <= max_tokens {
        return Ok(Budgeted {
            text: text.to_string(),
            token_count: ids.len(),
            truncated: false,
        });
    }
    let text = codec.decode(&ids[..max_tokens])?;
    Ok(Budgeted {
        text,
        token_count: max_tokens,
        truncated: true,
    })
}
