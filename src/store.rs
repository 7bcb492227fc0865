use std::path::Path;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use surrealdb::engine::local::{ Db, RocksDb };
#[cfg(test)]
use surrealdb::engine::local::Mem;
use surrealdb::Surreal;
use tracing::{ debug, info };

use crate::error::Result;
use crate::models::{ Chunk, Transcript };

const TRANSCRIPT_TABLE: &str = "transcript";

/// Persistence seam shared by the job runner, the embedding pipeline and search.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Inserts or replaces the transcript for `transcript.file_id`.
    async fn upsert_transcript(&self, transcript: &Transcript) -> Result<()>;

    async fn transcript(&self, file_id: &str) -> Result<Option<Transcript>>;

    /// Atomically swaps the file's chunk set for `chunks`.
    async fn replace_chunks(&self, file_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks for a file in creation order.
    async fn chunks(&self, file_id: &str) -> Result<Vec<Chunk>>;

    async fn chunk_count(&self, file_id: &str) -> Result<usize>;
}

// The raw provider document is stored as JSON text so it round-trips byte-for-byte.
#[derive(Debug, Serialize, Deserialize)]
struct TranscriptRecord {
    file_id: String,
    raw: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: i64,
}

#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Db>,
}

impl SurrealStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db = Surreal::new::<RocksDb>(db_path).await?;
        info!(path = %db_path.display(), "opened transcript database");
        Self::init(db).await
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let db = Surreal::new::<Mem>(()).await?;
        Self::init(db).await
    }

    async fn init(db: Surreal<Db>) -> Result<Self> {
        db.use_ns("media").use_db("transcripts").await?;
        db.query(
            "
            DEFINE TABLE transcript SCHEMAFUL;
            DEFINE FIELD file_id ON transcript TYPE string;
            DEFINE FIELD raw ON transcript TYPE string;
            DEFINE FIELD text ON transcript TYPE string;

            DEFINE TABLE chunk SCHEMAFUL;
            DEFINE FIELD file_id ON chunk TYPE string;
            DEFINE FIELD seq ON chunk TYPE int;
            DEFINE FIELD text ON chunk TYPE string;
            DEFINE FIELD start_time ON chunk TYPE number;
            DEFINE FIELD end_time ON chunk TYPE number;
            DEFINE FIELD embedding ON chunk TYPE array<float>;

            DEFINE INDEX idx_chunk_file ON chunk FIELDS file_id;
        "
        ).await?.check()?;
        Ok(Self { db })
    }
}

#[async_trait]
impl TranscriptStore for SurrealStore {
    async fn upsert_transcript(&self, transcript: &Transcript) -> Result<()> {
        let record = TranscriptRecord {
            file_id: transcript.file_id.clone(),
            raw: serde_json::to_string(&transcript.raw)?,
            text: transcript.text.clone(),
        };
        let _: Option<TranscriptRecord> = self.db
            .update((TRANSCRIPT_TABLE, transcript.file_id.as_str()))
            .content(record).await?;
        info!(file_id = %transcript.file_id, "inserted/updated transcript");
        Ok(())
    }

    async fn transcript(&self, file_id: &str) -> Result<Option<Transcript>> {
        let record: Option<TranscriptRecord> = self.db.select((TRANSCRIPT_TABLE, file_id)).await?;
        record
            .map(|r| {
                Ok(Transcript {
                    file_id: r.file_id,
                    raw: serde_json::from_str(&r.raw)?,
                    text: r.text,
                })
            })
            .transpose()
    }

    async fn replace_chunks(&self, file_id: &str, chunks: &[Chunk]) -> Result<()> {
        // One transaction, so readers never observe a half-written chunk set.
        let mut query = self.db
            .query("BEGIN TRANSACTION")
            .query("DELETE chunk WHERE file_id = $file_id")
            .bind(("file_id", file_id.to_string()));
        if !chunks.is_empty() {
            query = query.query("INSERT INTO chunk $chunks").bind(("chunks", chunks.to_vec()));
        }
        query.query("COMMIT TRANSACTION").await?.check()?;
        debug!(file_id, count = chunks.len(), "replaced chunks");
        Ok(())
    }

    async fn chunks(&self, file_id: &str) -> Result<Vec<Chunk>> {
        let chunks: Vec<Chunk> = self.db
            .query("SELECT * FROM chunk WHERE file_id = $file_id ORDER BY seq ASC")
            .bind(("file_id", file_id.to_string())).await?
            .take(0)?;
        Ok(chunks)
    }

    async fn chunk_count(&self, file_id: &str) -> Result<usize> {
        let count: Vec<CountResult> = self.db
            .query("SELECT count() AS count FROM chunk WHERE file_id = $file_id GROUP ALL")
            .bind(("file_id", file_id.to_string())).await?
            .take(0)?;
        Ok(count.first().map_or(0, |c| c.count.max(0) as usize))
    }
}
