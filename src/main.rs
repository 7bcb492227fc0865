use std::sync::Arc;

use anyhow::{ Context, Result };
use clap::{ Parser, Subcommand };
use tokio_util::sync::CancellationToken;
use tracing::{ info, warn };
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod chunker;
mod config;
mod embedding;
mod error;
mod job;
mod locks;
mod media;
mod models;
mod pipeline;
mod search;
mod server;
mod store;
mod tokens;
#[cfg(feature = "aws")]
mod aws;
#[cfg(test)]
mod testing;

use config::{ Config, EmbeddingBackendKind };
use embedding::{ EmbeddingBackend, EmbeddingClient, FastEmbedBackend, OpenAiBackend };
use locks::KeyedLocks;
use media::MediaLibrary;
use models::Transcript;
use pipeline::{ EmbeddingPipeline, PipelineOutcome };
use search::SearchEngine;
use store::{ SurrealStore, TranscriptStore };
use tokens::HfTokenizer;

#[derive(Parser)]
#[command(name = "transcript-search", about = "Transcribe media and search it by meaning")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Re-embed transcripts already stored in the media directory
    Reprocess {
        /// Only this file id; every metadata document otherwise
        file_id: Option<String>,
    },
    /// Search one file's transcript
    Search {
        #[arg(long)]
        file_id: String,
        #[arg(long)]
        keyword: String,
        /// Rank by embedding similarity instead of exact match
        #[arg(long)]
        embedding: bool,
    },
}

struct Services {
    store: Arc<SurrealStore>,
    embedder: Arc<EmbeddingClient>,
    pipeline: Arc<EmbeddingPipeline>,
    media: MediaLibrary,
    locks: KeyedLocks,
}

impl Services {
    async fn build(config: &Config) -> Result<Self> {
        let embedder = Arc::new(embedding_client(config)?);

        let store = Arc::new(SurrealStore::open(&config.db_path).await?);
        let pipeline = Arc::new(EmbeddingPipeline::new(store.clone(), embedder.clone()));
        let media = MediaLibrary::open(&config.media_dir).await?;
        info!(
            db = %config.db_path.display(),
            media = %config.media_dir.display(),
            backend = ?config.embedding_backend,
            "services ready"
        );
        Ok(Self { store, embedder, pipeline, media, locks: KeyedLocks::new() })
    }
}

/// The token budget only applies to the remote model; the local one truncates on its own.
fn embedding_client(config: &Config) -> Result<EmbeddingClient> {
    match config.embedding_backend {
        EmbeddingBackendKind::OpenAi => {
            let key = config.openai_api_key.clone().context("OPENAI_API_KEY is not set")?;
            let codec = HfTokenizer::from_file(&config.tokenizer_path).with_context(||
                format!("loading tokenizer from {}", config.tokenizer_path.display())
            )?;
            let backend = OpenAiBackend::new(&config.embedding_endpoint, key, &config.embedding_model);
            Ok(EmbeddingClient::new(Arc::new(backend), Arc::new(codec)))
        }
        EmbeddingBackendKind::Local => {
            let backend: Arc<dyn EmbeddingBackend> = Arc::new(FastEmbedBackend::new()?);
            Ok(EmbeddingClient::unbudgeted(backend))
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReprocessSummary {
    embedded: usize,
    skipped: usize,
    failed: usize,
}

/// Rebuilds chunks from the transcripts kept in metadata documents.
async fn reprocess(
    media: &MediaLibrary,
    pipeline: &EmbeddingPipeline,
    locks: &KeyedLocks,
    file_id: Option<String>
) -> Result<ReprocessSummary> {
    let ids = match file_id {
        Some(id) => vec![id],
        None => media.metadata_file_ids()?,
    };
    info!(files = ids.len(), "reprocessing transcripts");

    let mut summary = ReprocessSummary::default();
    for id in ids {
        let _guard = locks.lock(&id).await;
        let document = match media.read_metadata(&id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                warn!(file_id = %id, "no metadata document");
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(file_id = %id, error = %e, "could not read metadata document");
                summary.failed += 1;
                continue;
            }
        };
        if document.get("results").is_none() {
            warn!(file_id = %id, status = ?document.get("status"), "no transcript in metadata document");
            summary.skipped += 1;
            continue;
        }

        match pipeline.ingest(&Transcript::new(id.clone(), document)).await {
            Ok(PipelineOutcome::Embedded { stored, failed }) => {
                info!(file_id = %id, stored, failed, "reprocessed");
                summary.embedded += 1;
            }
            Ok(PipelineOutcome::Skipped { reason }) => {
                warn!(file_id = %id, reason = %reason, "skipped");
                summary.skipped += 1;
            }
            Err(e) => {
                warn!(file_id = %id, error = %e, "reprocessing failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(feature = "aws")]
async fn serve(config: Config, services: Services) -> Result<()> {
    use job::{ JobRunner, JobSettings };

    let sdk = aws::load_config(&config.region).await;
    let settings = JobSettings {
        language: config.language.clone(),
        poll_interval: config.poll_interval,
        max_poll_attempts: config.max_poll_attempts,
    };
    let (runner, mut events) = JobRunner::new(
        Arc::new(aws::S3ObjectStore::new(&sdk, &config.bucket)),
        Arc::new(aws::TranscribeService::new(&sdk)),
        services.pipeline.clone(),
        services.media.clone(),
        services.locks.clone(),
        settings
    );
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event.detail {
                Some(detail) =>
                    warn!(file_id = %event.file_id, status = %event.status, detail = %detail, "job status"),
                None => info!(file_id = %event.file_id, status = %event.status, "job status"),
            }
        }
    });

    let shutdown = CancellationToken::new();
    let state = server::AppState {
        search: Arc::new(SearchEngine::new(services.store.clone(), services.embedder.clone())),
        runner: Arc::new(runner),
        media: services.media.clone(),
        shutdown: shutdown.clone(),
        max_file_size: server::MAX_FILE_SIZE,
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "server is running");
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        }).await?;
    Ok(())
}

#[cfg(not(feature = "aws"))]
async fn serve(_config: Config, _services: Services) -> Result<()> {
    anyhow::bail!("the server needs the `aws` feature for storage and transcription")
}

async fn search_command(services: &Services, file_id: &str, keyword: &str, embedding: bool) -> Result<()> {
    let chunks = services.store.chunk_count(file_id).await?;
    println!("Searching {} chunks of {} for '{}'...", chunks, file_id, keyword);

    let engine = SearchEngine::new(services.store.clone(), services.embedder.clone());
    let results = engine.search(keyword, file_id, embedding).await?;
    if results.is_empty() {
        println!("No results found!");
        return Ok(());
    }

    println!("\nSearch Results:");
    println!("---------------");
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.2}s - {:.2}s]", i + 1, result.start_time, result.end_time);
        println!("   Similarity: {:.4}", result.similarity);
        println!("   {}", result.context);
        println!();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber
        ::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let services = Services::build(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, services).await,
        Command::Reprocess { file_id } => {
            let summary = reprocess(
                &services.media,
                &services.pipeline,
                &services.locks,
                file_id
            ).await?;
            println!(
                "Reprocessing complete: {} embedded, {} skipped, {} failed",
                summary.embedded,
                summary.skipped,
                summary.failed
            );
            Ok(())
        }
        Command::Search { file_id, keyword, embedding } => {
            search_command(&services, &file_id, &keyword, embedding).await
        }
    }
}
