//! S3 and Amazon Transcribe implementations of the job runner's service traits.

use async_trait::async_trait;
use aws_config::{ BehaviorVersion, Region, SdkConfig };
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_transcribe::types::{ LanguageCode, Media, MediaFormat, TranscriptionJobStatus };

use crate::error::{ Result, SearchError };
use crate::job::{ ObjectLocation, ObjectStore, RemoteJobState, TranscriptionRequest, TranscriptionService };

pub async fn load_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load().await
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: &SdkConfig, bucket: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send().await
            .map_err(|e| SearchError::ObjectStore(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        let output = self.client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send().await
            .map_err(|e| SearchError::ObjectStore(DisplayErrorContext(&e).to_string()))?;
        let bytes = output.body
            .collect().await
            .map_err(|e| SearchError::ObjectStore(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

pub struct TranscribeService {
    client: aws_sdk_transcribe::Client,
}

impl TranscribeService {
    pub fn new(config: &SdkConfig) -> Self {
        Self { client: aws_sdk_transcribe::Client::new(config) }
    }
}

#[async_trait]
impl TranscriptionService for TranscribeService {
    async fn start(&self, request: &TranscriptionRequest) -> Result<()> {
        self.client
            .start_transcription_job()
            .transcription_job_name(&request.job_name)
            .language_code(LanguageCode::from(request.language.as_str()))
            .media_format(MediaFormat::from(request.media_format.as_str()))
            .media(Media::builder().media_file_uri(&request.media_uri).build())
            .output_bucket_name(&request.output_bucket)
            .send().await
            .map_err(|e| SearchError::Transcription(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn state(&self, job_name: &str) -> Result<RemoteJobState> {
        let output = self.client
            .get_transcription_job()
            .transcription_job_name(job_name)
            .send().await
            .map_err(|e| SearchError::Transcription(DisplayErrorContext(&e).to_string()))?;
        let Some(job) = output.transcription_job() else {
            return Err(SearchError::Transcription(format!("job {job_name} not returned")));
        };

        let state = match job.transcription_job_status() {
            Some(TranscriptionJobStatus::Completed) => {
                let uri = job
                    .transcript()
                    .and_then(|t| t.transcript_file_uri())
                    .ok_or_else(|| {
                        SearchError::Transcription(format!("job {job_name} completed without a transcript"))
                    })?;
                RemoteJobState::Completed { transcript_uri: uri.to_string() }
            }
            Some(TranscriptionJobStatus::Failed) =>
                RemoteJobState::Failed {
                    reason: job.failure_reason().unwrap_or("unknown").to_string(),
                },
            _ => RemoteJobState::InProgress,
        };
        Ok(state)
    }
}
