use std::fmt;
use std::future::Future;
use std::path::{ Path, PathBuf };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, error, info, warn };
use url::Url;

use crate::error::{ Result, SearchError };
use crate::locks::KeyedLocks;
use crate::media::MediaLibrary;
use crate::models::Transcript;
use crate::pipeline::{ EmbeddingPipeline, PipelineOutcome };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Uploading,
    Transcribing,
    Saving,
    Completed,
    Error,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Uploading => 0,
            JobStatus::Transcribing => 1,
            JobStatus::Saving => 2,
            JobStatus::Completed => 3,
            JobStatus::Error => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Forward one step at a time; `Error` is reachable from any non-terminal state.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Error || next.rank() == self.rank() + 1
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Uploading => "uploading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Saving => "saving",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub file_id: String,
    pub status: JobStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

/// Accepts `s3://bucket/key`, path-style and virtual-hosted S3 https URLs.
pub fn parse_object_uri(uri: &str) -> Result<ObjectLocation> {
    let invalid = || SearchError::Transcription(format!("unrecognised transcript location: {uri}"));
    let url = Url::parse(uri).map_err(|_| invalid())?;
    let host = url.host_str().ok_or_else(invalid)?;
    let path = url.path().trim_start_matches('/');

    let (bucket, key) = match url.scheme() {
        "s3" => (host.to_string(), path.to_string()),
        "https" | "http" if host.starts_with("s3.") || host.starts_with("s3-") => {
            let (bucket, key) = path.split_once('/').ok_or_else(invalid)?;
            (bucket.to_string(), key.to_string())
        }
        "https" | "http" => {
            let bucket = host.split('.').next().unwrap_or_default();
            (bucket.to_string(), path.to_string())
        }
        _ => {
            return Err(invalid());
        }
    };
    if bucket.is_empty() || key.is_empty() {
        return Err(invalid());
    }
    Ok(ObjectLocation { bucket, key })
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    pub job_name: String,
    pub media_uri: String,
    pub media_format: String,
    pub language: String,
    pub output_bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteJobState {
    InProgress,
    Completed { transcript_uri: String },
    Failed { reason: String },
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn start(&self, request: &TranscriptionRequest) -> Result<()>;

    async fn state(&self, job_name: &str) -> Result<RemoteJobState>;
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub language: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            language: "ja-JP".to_string(),
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 360,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub file_id: String,
    pub status: JobStatus,
    pub pipeline: PipelineOutcome,
}

struct Job {
    file_id: String,
    status: JobStatus,
}

fn media_format(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp3" | "mp4" | "wav" | "flac" | "ogg" | "amr" | "webm" | "m4a" => extension,
        _ => "mp4".to_string(),
    }
}

async fn cancellable<T>(cancel: &CancellationToken, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SearchError::Cancelled),
        result = work => result,
    }
}

/// Takes one upload from local disk to searchable chunks.
pub struct JobRunner {
    object_store: Arc<dyn ObjectStore>,
    transcription: Arc<dyn TranscriptionService>,
    pipeline: Arc<EmbeddingPipeline>,
    media: MediaLibrary,
    locks: KeyedLocks,
    settings: JobSettings,
    events: mpsc::UnboundedSender<JobEvent>,
    job_counter: AtomicU64,
}

impl JobRunner {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        transcription: Arc<dyn TranscriptionService>,
        pipeline: Arc<EmbeddingPipeline>,
        media: MediaLibrary,
        locks: KeyedLocks,
        settings: JobSettings
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let runner = Self {
            object_store,
            transcription,
            pipeline,
            media,
            locks,
            settings,
            events,
            job_counter: AtomicU64::new(0),
        };
        (runner, receiver)
    }

    pub fn spawn(
        self: &Arc<Self>,
        local_path: PathBuf,
        file_id: String,
        cancel: CancellationToken
    ) -> JoinHandle<Result<JobOutcome>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let result = runner.run(&local_path, &file_id, &cancel).await;
            if let Ok(outcome) = &result {
                debug!(
                    file_id = %outcome.file_id,
                    status = %outcome.status,
                    pipeline = ?outcome.pipeline,
                    "job finished"
                );
            }
            result
        })
    }

    pub async fn run(
        &self,
        local_path: &Path,
        file_id: &str,
        cancel: &CancellationToken
    ) -> Result<JobOutcome> {
        MediaLibrary::validate_file_id(file_id)?;
        let _guard = self.locks.lock(file_id).await;

        let mut job = Job { file_id: file_id.to_string(), status: JobStatus::Uploading };
        self.publish(&job, None).await;

        match self.drive(&mut job, local_path, cancel).await {
            Ok(pipeline) => {
                info!(file_id, "transcription completed, embeddings generated, and metadata saved");
                Ok(JobOutcome { file_id: job.file_id, status: job.status, pipeline })
            }
            Err(e) => {
                error!(file_id, status = %job.status, error = %e, "transcription job failed");
                // Error is reachable from every non-terminal state.
                job.status = JobStatus::Error;
                self.publish(&job, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job: &mut Job,
        local_path: &Path,
        cancel: &CancellationToken
    ) -> Result<PipelineOutcome> {
        let body = tokio::fs::read(local_path).await?;
        let size = body.len();
        cancellable(cancel, self.object_store.put_object(&job.file_id, body)).await?;
        info!(file_id = %job.file_id, bytes = size, "uploaded media to object store");

        self.advance(job, JobStatus::Transcribing).await?;
        let request = TranscriptionRequest {
            job_name: self.next_job_name(),
            media_uri: format!("s3://{}/{}", self.object_store.bucket(), job.file_id),
            media_format: media_format(local_path),
            language: self.settings.language.clone(),
            output_bucket: self.object_store.bucket().to_string(),
        };
        cancellable(cancel, self.transcription.start(&request)).await?;
        info!(file_id = %job.file_id, job_name = %request.job_name, "started transcription job");

        let transcript_uri = self.wait_for_completion(&request.job_name, cancel).await?;
        let location = parse_object_uri(&transcript_uri)?;
        debug!(bucket = %location.bucket, key = %location.key, "fetching transcript");
        let bytes = cancellable(cancel, self.object_store.get_object(&location)).await?;
        let raw: Value = serde_json::from_slice(&bytes)?;

        self.advance(job, JobStatus::Saving).await?;
        let transcript = Transcript::new(job.file_id.clone(), raw);
        let outcome = self.pipeline.ingest(&transcript).await?;

        Self::check_transition(job, JobStatus::Completed)?;
        // Completed is only reported once the document carrying the transcript is on disk.
        self.media.write_completed(&job.file_id, &transcript.raw).await?;
        job.status = JobStatus::Completed;
        self.emit(job, None);
        Ok(outcome)
    }

    async fn wait_for_completion(&self, job_name: &str, cancel: &CancellationToken) -> Result<String> {
        let attempts = self.settings.max_poll_attempts.max(1);
        for attempt in 1..=attempts {
            match cancellable(cancel, self.transcription.state(job_name)).await? {
                RemoteJobState::Completed { transcript_uri } => {
                    info!(job_name, transcript_uri = %transcript_uri, "transcription job completed");
                    return Ok(transcript_uri);
                }
                RemoteJobState::Failed { reason } => {
                    return Err(SearchError::Transcription(format!("job {job_name} failed: {reason}")));
                }
                RemoteJobState::InProgress => {
                    debug!(job_name, attempt, "transcription job still running");
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SearchError::Cancelled),
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        Err(SearchError::PollTimeout { attempts })
    }

    fn check_transition(job: &Job, next: JobStatus) -> Result<()> {
        if !job.status.can_advance_to(next) {
            return Err(SearchError::InvalidTransition {
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }

    async fn advance(&self, job: &mut Job, next: JobStatus) -> Result<()> {
        Self::check_transition(job, next)?;
        job.status = next;
        self.publish(job, None).await;
        Ok(())
    }

    async fn publish(&self, job: &Job, detail: Option<String>) {
        if let Err(e) = self.media.write_status(&job.file_id, job.status).await {
            warn!(file_id = %job.file_id, error = %e, "could not write status document");
        }
        self.emit(job, detail);
    }

    fn emit(&self, job: &Job, detail: Option<String>) {
        // A dropped receiver only means nobody is observing.
        let _ = self.events.send(JobEvent {
            file_id: job.file_id.clone(),
            status: job.status,
            detail,
        });
    }

    fn next_job_name(&self) -> String {
        let n = self.job_counter.fetch_add(1, Ordering::Relaxed);
        format!("transcribe_{}_{}", chrono::Utc::now().timestamp_millis(), n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ SurrealStore, TranscriptStore };
    use crate::testing::{ keyword_client, provider_document, word, MemoryObjectStore, ScriptedTranscription };
    use tempfile::TempDir;

    struct Harness {
        runner: Arc<JobRunner>,
        events: mpsc::UnboundedReceiver<JobEvent>,
        objects: Arc<MemoryObjectStore>,
        transcription: Arc<ScriptedTranscription>,
        store: Arc<SurrealStore>,
        media: MediaLibrary,
        upload: PathBuf,
        _dir: TempDir,
    }

    async fn harness(states: Vec<RemoteJobState>, max_poll_attempts: u32) -> anyhow::Result<Harness> {
        let dir = TempDir::new()?;
        let media = MediaLibrary::open(dir.path()).await?;
        let upload = media.root().join("1_talk.mp4");
        tokio::fs::write(&upload, b"fake video bytes").await?;

        let objects = Arc::new(MemoryObjectStore::new("media-bucket"));
        let transcription = Arc::new(ScriptedTranscription::new(states));
        let store = Arc::new(SurrealStore::in_memory().await?);
        let pipeline = Arc::new(EmbeddingPipeline::new(store.clone(), keyword_client(None)));
        let (runner, events) = JobRunner::new(
            objects.clone(),
            transcription.clone(),
            pipeline,
            media.clone(),
            KeyedLocks::new(),
            JobSettings {
                language: "ja-JP".into(),
                poll_interval: Duration::from_millis(1),
                max_poll_attempts,
            }
        );
        Ok(Harness {
            runner: Arc::new(runner),
            events,
            objects,
            transcription,
            store,
            media,
            upload,
            _dir: dir,
        })
    }

    fn statuses(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobStatus> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.status);
        }
        seen
    }

    fn output_document(n: usize) -> Vec<u8> {
        let items: Vec<_> = (0..n)
            .map(|i| word("rust", i as f64, (i as f64) + 0.5))
            .collect();
        serde_json::to_vec(&provider_document("rust", &items)).unwrap()
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Uploading.can_advance_to(Transcribing));
        assert!(Transcribing.can_advance_to(Saving));
        assert!(Saving.can_advance_to(Completed));
        assert!(!Uploading.can_advance_to(Saving));
        assert!(!Saving.can_advance_to(Transcribing));
        for status in [Uploading, Transcribing, Saving] {
            assert!(status.can_advance_to(Error));
        }
        for next in [Uploading, Transcribing, Saving, Completed, Error] {
            assert!(!Completed.can_advance_to(next));
            assert!(!Error.can_advance_to(next));
        }
        assert_eq!(serde_json::to_value(Transcribing).unwrap(), "transcribing");
    }

    #[test]
    fn test_parse_object_uri() {
        let parsed = parse_object_uri("s3://media-bucket/transcribe_1.json").unwrap();
        assert_eq!(parsed, ObjectLocation { bucket: "media-bucket".into(), key: "transcribe_1.json".into() });

        let parsed = parse_object_uri(
            "https://s3.ap-northeast-1.amazonaws.com/media-bucket/out/transcribe_1.json"
        ).unwrap();
        assert_eq!(parsed.bucket, "media-bucket");
        assert_eq!(parsed.key, "out/transcribe_1.json");

        let parsed = parse_object_uri(
            "https://media-bucket.s3.ap-northeast-1.amazonaws.com/transcribe_1.json"
        ).unwrap();
        assert_eq!(parsed.bucket, "media-bucket");
        assert_eq!(parsed.key, "transcribe_1.json");

        assert!(parse_object_uri("not a url").is_err());
        assert!(parse_object_uri("https://s3.amazonaws.com/only-bucket").is_err());
        assert!(parse_object_uri("ftp://host/key").is_err());
    }

    #[test]
    fn test_media_format() {
        assert_eq!(media_format(Path::new("a.MP3")), "mp3");
        assert_eq!(media_format(Path::new("a.mov")), "mp4");
        assert_eq!(media_format(Path::new("noext")), "mp4");
    }

    #[tokio::test]
    async fn test_successful_job() -> anyhow::Result<()> {
        let mut h = harness(
            vec![
                RemoteJobState::InProgress,
                RemoteJobState::InProgress,
                RemoteJobState::Completed { transcript_uri: "s3://media-bucket/out.json".into() }
            ],
            10
        ).await?;
        h.objects.insert("media-bucket", "out.json", output_document(25));

        let outcome = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await?;
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.pipeline, PipelineOutcome::Embedded { stored: 2, failed: 0 });

        assert_eq!(
            statuses(&mut h.events),
            vec![JobStatus::Uploading, JobStatus::Transcribing, JobStatus::Saving, JobStatus::Completed]
        );
        assert_eq!(h.objects.get("media-bucket", "1_talk.mp4").unwrap(), b"fake video bytes");

        let requests = h.transcription.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].media_uri, "s3://media-bucket/1_talk.mp4");
        assert_eq!(requests[0].language, "ja-JP");
        assert_eq!(requests[0].media_format, "mp4");
        assert_eq!(h.transcription.polls(), 3);

        assert!(h.store.transcript("1_talk.mp4").await?.is_some());
        assert_eq!(h.store.chunk_count("1_talk.mp4").await?, 2);
        let doc = h.media.read_metadata("1_talk.mp4").await?.unwrap();
        assert_eq!(doc["status"], "completed");
        assert!(doc.get("results").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_failure_is_fatal() -> anyhow::Result<()> {
        let mut h = harness(vec![], 10).await?;
        h.objects.fail_puts();

        let err = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SearchError::ObjectStore(_)));
        assert_eq!(statuses(&mut h.events), vec![JobStatus::Uploading, JobStatus::Error]);
        assert!(h.transcription.requests().is_empty());
        let doc = h.media.read_metadata("1_talk.mp4").await?.unwrap();
        assert_eq!(doc["status"], "error");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_transcription_job() -> anyhow::Result<()> {
        let mut h = harness(
            vec![RemoteJobState::InProgress, RemoteJobState::Failed { reason: "unsupported media".into() }],
            10
        ).await?;

        let err = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("unsupported media"));
        assert_eq!(
            statuses(&mut h.events),
            vec![JobStatus::Uploading, JobStatus::Transcribing, JobStatus::Error]
        );
        assert_eq!(h.store.chunk_count("1_talk.mp4").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_attempts_are_bounded() -> anyhow::Result<()> {
        let h = harness(vec![RemoteJobState::InProgress], 3).await?;
        let err = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SearchError::PollTimeout { attempts: 3 }));
        assert_eq!(h.transcription.polls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() -> anyhow::Result<()> {
        let mut h = harness(vec![RemoteJobState::InProgress], 1_000_000).await?;
        let cancel = CancellationToken::new();
        let handle = h.runner.spawn(h.upload.clone(), "1_talk.mp4".into(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await??;
        assert!(matches!(result, Err(SearchError::Cancelled)));
        assert_eq!(statuses(&mut h.events).last(), Some(&JobStatus::Error));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_transcript_object() -> anyhow::Result<()> {
        let h = harness(
            vec![RemoteJobState::Completed { transcript_uri: "s3://media-bucket/missing.json".into() }],
            10
        ).await?;
        let err = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SearchError::ObjectStore(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_unsafe_file_id() -> anyhow::Result<()> {
        let h = harness(vec![], 10).await?;
        let err = h.runner.run(&h.upload, "../escape", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_client_error());
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_completion_document_fails_the_job() -> anyhow::Result<()> {
        let mut h = harness(
            vec![RemoteJobState::Completed { transcript_uri: "s3://media-bucket/out.json".into() }],
            10
        ).await?;
        h.objects.insert("media-bucket", "out.json", output_document(5));
        // A directory where the metadata document belongs makes every rename onto it fail.
        let blocker = h.media.metadata_path("1_talk.mp4")?;
        tokio::fs::create_dir(&blocker).await?;
        tokio::fs::write(blocker.join("keep"), b"").await?;

        let err = h.runner.run(&h.upload, "1_talk.mp4", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SearchError::Io(_)));
        assert_eq!(
            statuses(&mut h.events),
            vec![JobStatus::Uploading, JobStatus::Transcribing, JobStatus::Saving, JobStatus::Error]
        );
        Ok(())
    }
}
