use std::sync::Arc;

use tracing::{ info, warn };

use crate::chunker::{ chunk, DEFAULT_CHUNK_SIZE };
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::models::{ Chunk, Transcript };
use crate::store::TranscriptStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Nothing was written; the transcript was absent or unusable.
    Skipped { reason: String },
    Embedded { stored: usize, failed: usize },
}

/// Turns a stored transcript into searchable chunks.
pub struct EmbeddingPipeline {
    store: Arc<dyn TranscriptStore>,
    embedder: Arc<EmbeddingClient>,
    chunk_size: usize,
}

impl EmbeddingPipeline {
    pub fn new(store: Arc<dyn TranscriptStore>, embedder: Arc<EmbeddingClient>) -> Self {
        Self {
            store,
            embedder,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Persists `transcript` and regenerates its chunks.
    pub async fn ingest(&self, transcript: &Transcript) -> Result<PipelineOutcome> {
        self.store.upsert_transcript(transcript).await?;
        self.embed(&transcript.file_id).await
    }

    /// Regenerates the chunk set of `file_id` from its stored transcript.
    ///
    /// Chunks whose embedding fails are skipped. The new set replaces the old one in a
    /// single write once the whole pass is done; if every chunk failed the previous set
    /// is left in place.
    pub async fn embed(&self, file_id: &str) -> Result<PipelineOutcome> {
        let Some(transcript) = self.store.transcript(file_id).await? else {
            warn!(file_id, "transcript not found");
            return Ok(PipelineOutcome::Skipped { reason: "transcript not found".into() });
        };
        let items = match transcript.items() {
            Ok(items) => items,
            Err(e) => {
                warn!(file_id, error = %e, "transcript has no usable items");
                return Ok(PipelineOutcome::Skipped { reason: e.to_string() });
            }
        };

        let drafts = chunk(&items, self.chunk_size);
        let mut chunks = Vec::with_capacity(drafts.len());
        let mut failed = 0;
        for draft in drafts {
            match self.embedder.embed(&draft.text).await {
                Ok(embedding) => {
                    chunks.push(Chunk {
                        file_id: file_id.to_string(),
                        seq: chunks.len() as u32,
                        text: draft.text,
                        start_time: draft.start_time,
                        end_time: draft.end_time,
                        embedding,
                    });
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        file_id,
                        start_time = draft.start_time,
                        words = draft.word_count,
                        error = %e,
                        "error generating embedding for chunk"
                    );
                }
            }
        }

        if chunks.is_empty() && failed > 0 {
            warn!(file_id, failed, "every chunk failed to embed; keeping previous chunks");
            return Ok(PipelineOutcome::Embedded { stored: 0, failed });
        }

        self.store.replace_chunks(file_id, &chunks).await?;
        info!(file_id, stored = chunks.len(), failed, "generated and stored embeddings");
        Ok(PipelineOutcome::Embedded { stored: chunks.len(), failed })
    }
}
