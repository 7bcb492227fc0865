use serde::{ Deserialize, Serialize };
use serde_json::Value;

use crate::error::SearchError;

/// Word-level entry of a provider transcript (`results.items[]`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TranscriptItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub start_time: Option<Value>,
    #[serde(default)]
    pub end_time: Option<Value>,
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Pronunciation,
    Punctuation,
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Alternative {
    pub content: String,
    #[serde(default)]
    pub confidence: Option<Value>,
}

impl TranscriptItem {
    pub fn is_spoken(&self) -> bool {
        self.kind == ItemKind::Pronunciation
    }

    /// Surface text of the best alternative.
    pub fn content(&self) -> &str {
        self.alternatives
            .first()
            .map(|alt| alt.content.as_str())
            .unwrap_or("")
    }

    pub fn start_seconds(&self) -> Option<f64> {
        self.start_time.as_ref().and_then(seconds)
    }

    pub fn end_seconds(&self) -> Option<f64> {
        self.end_time.as_ref().and_then(seconds)
    }
}

// Providers send times as "1.23" strings; plain numbers are accepted too.
fn seconds(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|s| s.is_finite())
}

#[derive(Debug, Deserialize)]
struct ProviderDocument {
    results: ProviderResults,
}

#[derive(Debug, Deserialize)]
struct ProviderResults {
    items: Vec<TranscriptItem>,
}

/// A file's persisted transcript: the raw provider document plus its flattened text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Transcript {
    pub file_id: String,
    pub raw: Value,
    pub text: String,
}

impl Transcript {
    pub fn new(file_id: impl Into<String>, raw: Value) -> Self {
        let text = raw
            .pointer("/results/transcripts/0/transcript")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            file_id: file_id.into(),
            raw,
            text,
        }
    }

    pub fn items(&self) -> Result<Vec<TranscriptItem>, SearchError> {
        serde_json::from_value::<ProviderDocument>(self.raw.clone())
            .map(|doc| doc.results.items)
            .map_err(|e| SearchError::InvalidTranscript {
                file_id: self.file_id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Chunk text and timing before it has an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub word_count: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Chunk {
    pub file_id: String,
    pub seq: u32,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SearchResult {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub similarity: f32,
    pub context: String,
}
