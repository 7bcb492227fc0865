//! Deterministic fakes for the external services.

use std::collections::{ HashMap, VecDeque };
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{ json, Value };

use crate::embedding::{ EmbeddingBackend, EmbeddingClient, EmbeddingError };
use crate::error::{ Result, SearchError };
use crate::job::{ ObjectLocation, ObjectStore, RemoteJobState, TranscriptionRequest, TranscriptionService };
use crate::models::{ Alternative, ItemKind, TranscriptItem };
use crate::tokens::TokenCodec;

/// One token per character.
pub struct CharCodec;

impl TokenCodec for CharCodec {
    fn encode(&self, text: &str) -> std::result::Result<Vec<u32>, EmbeddingError> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> std::result::Result<String, EmbeddingError> {
        ids.iter()
            .map(|id| char::from_u32(*id).ok_or_else(|| EmbeddingError::Tokenizer(format!("bad id {id}"))))
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl EmbeddingBackend for RecordingBackend {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        self.calls.lock().push(text.to_string());
        Ok(vec![1.0, 0.0])
    }
}

const VOCABULARY: &[&str] = &[
    "rust", "memory", "safety", "speed", "python", "data", "science", "weather", "birds", "trees",
    "echo", "price", "こんにちは", "言いました",
];

/// Embeds text as occurrence counts over a small vocabulary.
pub struct KeywordBackend {
    vocabulary: Vec<String>,
    fail_on: Option<String>,
}

impl Default for KeywordBackend {
    fn default() -> Self {
        Self {
            vocabulary: VOCABULARY.iter().map(|w| w.to_string()).collect(),
            fail_on: None,
        }
    }
}

impl KeywordBackend {
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl EmbeddingBackend for KeywordBackend {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        if self.fail_on.as_deref().is_some_and(|needle| text.contains(needle)) {
            return Err(EmbeddingError::Api { status: 500, body: "scripted failure".into() });
        }
        let lower = text.to_lowercase();
        Ok(
            self.vocabulary
                .iter()
                .map(|w| lower.matches(w.as_str()).count() as f32)
                .collect()
        )
    }
}

pub fn keyword_client(fail_on: Option<&str>) -> Arc<EmbeddingClient> {
    let backend = match fail_on {
        Some(needle) => KeywordBackend::default().failing_on(needle),
        None => KeywordBackend::default(),
    };
    Arc::new(EmbeddingClient::new(Arc::new(backend), Arc::new(CharCodec)))
}

pub fn word(content: &str, start: f64, end: f64) -> TranscriptItem {
    TranscriptItem {
        kind: ItemKind::Pronunciation,
        start_time: Some(json!(format!("{start:.3}"))),
        end_time: Some(json!(format!("{end:.3}"))),
        alternatives: vec![Alternative { content: content.to_string(), confidence: Some(json!("0.99")) }],
    }
}

pub fn punctuation(content: &str) -> TranscriptItem {
    TranscriptItem {
        kind: ItemKind::Punctuation,
        start_time: None,
        end_time: None,
        alternatives: vec![Alternative { content: content.to_string(), confidence: Some(json!("0.0")) }],
    }
}

/// Minimal speech-to-text output document.
pub fn provider_document(text: &str, items: &[TranscriptItem]) -> Value {
    json!({
        "jobName": "transcribe_test",
        "results": {
            "transcripts": [{ "transcript": text }],
            "items": items,
        },
        "status": "COMPLETED",
    })
}

pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.objects.lock().insert((bucket.to_string(), key.to_string()), body);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(&(bucket.to_string(), key.to_string())).cloned()
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(SearchError::ObjectStore("access denied".into()));
        }
        let bucket = self.bucket.clone();
        self.insert(&bucket, key, body);
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        self.get(&location.bucket, &location.key).ok_or_else(||
            SearchError::ObjectStore(format!("no such key: {}", location.key))
        )
    }
}

/// Replays job states in order, then repeats the last one.
pub struct ScriptedTranscription {
    states: Mutex<VecDeque<RemoteJobState>>,
    requests: Mutex<Vec<TranscriptionRequest>>,
    polls: AtomicUsize,
}

impl ScriptedTranscription {
    pub fn new(states: Vec<RemoteJobState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            requests: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> Vec<TranscriptionRequest> {
        self.requests.lock().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionService for ScriptedTranscription {
    async fn start(&self, request: &TranscriptionRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }

    async fn state(&self, _job_name: &str) -> Result<RemoteJobState> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut states = self.states.lock();
        let state = if states.len() > 1 { states.pop_front() } else { states.front().cloned() };
        Ok(state.unwrap_or(RemoteJobState::InProgress))
    }
}
