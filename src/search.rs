use std::cmp::Ordering;
use std::sync::Arc;

use regex::{ Regex, RegexBuilder };
use tracing::{ debug, error, info, warn };

use crate::embedding::EmbeddingClient;
use crate::error::{ Result, SearchError };
use crate::models::{ Chunk, SearchResult };
use crate::store::TranscriptStore;

pub const MAX_RESULTS: usize = 5;
pub const SIMILARITY_THRESHOLD: f32 = 0.5;

/// Cosine similarity clamped to `[0, 1]`. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x * y)
        .sum();
    let magnitude_a: f32 = a
        .iter()
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt();
    let magnitude_b: f32 = b
        .iter()
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product / (magnitude_a * magnitude_b);
    if similarity.is_finite() { similarity.clamp(0.0, 1.0) } else { 0.0 }
}

/// Case-insensitive matcher for the query taken literally.
fn literal_pattern(query: &str) -> Result<Regex> {
    RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .map_err(|e| SearchError::Validation(format!("unusable query: {e}")))
}

/// Wraps every match of `pattern` in `<mark>` tags.
pub fn highlight(pattern: &Regex, text: &str) -> String {
    pattern.replace_all(text, "<mark>$0</mark>").into_owned()
}

pub struct SearchEngine {
    store: Arc<dyn TranscriptStore>,
    embedder: Arc<EmbeddingClient>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn TranscriptStore>, embedder: Arc<EmbeddingClient>) -> Self {
        Self { store, embedder }
    }

    pub async fn search(
        &self,
        query: &str,
        file_id: &str,
        use_embedding: bool
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(SearchError::Validation("keyword is required".into()));
        }
        if file_id.trim().is_empty() {
            return Err(SearchError::Validation("fileId is required".into()));
        }
        debug!(query, file_id, use_embedding, "searching");
        let pattern = literal_pattern(query)?;

        let chunks = self.store.chunks(file_id).await?;
        if chunks.is_empty() {
            info!(file_id, "no embeddings found for file");
            return Ok(Vec::new());
        }

        let results = if use_embedding {
            self.rank_by_embedding(query, chunks).await
        } else {
            self.exact_matches(&pattern, file_id, &chunks).await?
        };

        let results: Vec<SearchResult> = results
            .into_iter()
            .map(|mut result| {
                result.context = highlight(&pattern, &result.text);
                result
            })
            .collect();
        info!(file_id, count = results.len(), "final search results");
        Ok(results)
    }

    async fn rank_by_embedding(&self, query: &str, chunks: Vec<Chunk>) -> Vec<SearchResult> {
        let query_embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                error!(error = %e, "error in embedding-based search");
                return Vec::new();
            }
        };

        let mut results: Vec<SearchResult> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let similarity = cosine_similarity(&query_embedding, &chunk.embedding);
                (similarity >= SIMILARITY_THRESHOLD).then(|| SearchResult {
                    text: chunk.text,
                    start_time: chunk.start_time,
                    end_time: chunk.end_time,
                    similarity,
                    context: String::new(),
                })
            })
            .collect();

        // Stable sort keeps transcript order among equal scores
        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal));
        results.truncate(MAX_RESULTS);
        results
    }

    async fn exact_matches(
        &self,
        pattern: &Regex,
        file_id: &str,
        chunks: &[Chunk]
    ) -> Result<Vec<SearchResult>> {
        let Some(transcript) = self.store.transcript(file_id).await? else {
            warn!(file_id, "chunks exist but transcript is missing");
            return Ok(Vec::new());
        };

        let results = pattern
            .find_iter(&transcript.text)
            .filter_map(|found| chunks.iter().find(|chunk| chunk.text.contains(found.as_str())))
            .take(MAX_RESULTS)
            .map(|chunk| SearchResult {
                text: chunk.text.clone(),
                start_time: chunk.start_time,
                end_time: chunk.end_time,
                similarity: 1.0,
                context: String::new(),
            })
            .collect();
        Ok(results)
    }
}
