//! Turns free-form backend text into enrichment records.
//!
//! Models wrap JSON in prose and Markdown fences about as often as not.
//! The rule is: take the interior of the first fenced block if there is one,
//! otherwise the whole text, and require a JSON array. A lone object is an
//! error, not a one-element batch.

use serde_json::Value;
use thiserror::Error;

use crate::models::EnrichmentRecord;

/// Sentences emitted by unconfigured backends in place of real output.
const PLACEHOLDER_MARKERS: &[&str] = &[
    "demo response",
    "not currently configured",
    "ai service is not configured",
];

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,

    #[error("backend returned placeholder text instead of data")]
    Placeholder,

    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON array, got {0}")]
    NotAnArray(&'static str),
}

impl ParseError {
    /// Placeholder text means "backend not configured", which callers report
    /// as a warning rather than a hard failure.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, ParseError::Placeholder)
    }
}

pub fn parse(text: &str) -> Result<Vec<EnrichmentRecord>, ParseError> {
    let candidate = fenced_block(text).unwrap_or(text).trim();
    if candidate.is_empty() {
        return Err(ParseError::Empty);
    }

    let value: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(e) => {
            return Err(if is_placeholder(text) {
                ParseError::Placeholder
            } else {
                ParseError::InvalidJson(e.to_string())
            })
        }
    };

    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, value)| EnrichmentRecord { index, value })
            .collect()),
        Value::Object(_) => Err(ParseError::NotAnArray("object")),
        Value::String(_) => Err(ParseError::NotAnArray("string")),
        Value::Number(_) => Err(ParseError::NotAnArray("number")),
        Value::Bool(_) => Err(ParseError::NotAnArray("boolean")),
        Value::Null => Err(ParseError::NotAnArray("null")),
    }
}

/// Interior of the first ``` fence, minus an optional language tag.
///
/// An unterminated fence runs to the end of the text.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let tag_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let body = &rest[tag_len..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

fn is_placeholder(text: &str) -> bool {
    let lower = text.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}
