//! Core data models shared by the pipeline stages.
//!
//! These types flow from retrieval through dispatch and parsing into the
//! per-module batch results returned to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A retrieved context document.
///
/// `score` is only meaningful on query results; stored documents carry `0.0`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f64,
}

/// A document submitted for ingestion into the context store.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct UpsertSummary {
    pub accepted_count: usize,
}

/// A single chat-style generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Outcome of one dispatcher call.
///
/// Empty text is never folded into `Success`; callers branch on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResult {
    Success { text: String },
    Unavailable { reason: String },
    Malformed { raw_text: String },
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success { .. })
    }
}

/// One element of a parsed backend reply, tagged with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRecord {
    pub index: usize,
    pub value: serde_json::Value,
}

/// A row written (inserted or updated) during a module run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InsertedRecord {
    pub id: i64,
    pub natural_key: String,
}

/// A record that did not persist, and why.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordFailure {
    pub index: usize,
    pub natural_key: Option<String>,
    pub error: String,
}

/// Per-module aggregate returned to the caller; never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchResult {
    pub module: String,
    pub attempted: usize,
    pub inserted: Vec<InsertedRecord>,
    pub failures: Vec<RecordFailure>,
}

impl BatchResult {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            attempted: 0,
            inserted: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.inserted.len()
    }
}
