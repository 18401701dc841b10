//! Core data models used throughout Docket.
//!
//! These types represent the catalog records, chunks, index entries, and
//! policy records that flow through the indexing, retrieval, and reminder
//! pipelines.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Catalog record for one document, keyed by its normalized name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub name: String,
    pub source_path: Option<String>,
    pub content_hash: String,
    pub indexed: bool,
    pub chunk_count: i64,
    pub indexed_at: Option<DateTime<Utc>>,
}

/// An ordered text segment of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document: String,
    pub sequence: i64,
    pub text: String,
    /// Character offset of the chunk's first character in the source text.
    pub start_offset: usize,
    /// Number of leading characters shared with the previous chunk.
    pub overlap: usize,
}

/// The persisted unit of the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub document: String,
    pub sequence: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl IndexEntry {
    pub fn id(&self) -> String {
        format!("{}#{}", self.document, self.sequence)
    }
}

/// A ranked hit returned from similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub document: String,
    pub sequence: i64,
    pub text: String,
    pub score: f64,
}

/// Insurance policy record tracked by the reminder monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub due_date: Option<NaiveDate>,
    pub last_checked: Option<DateTime<Utc>>,
    pub notified: bool,
    pub uploaded_at: DateTime<Utc>,
}

/// Observable notification state of a [`Policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    ExtractionFailed,
    DateExtracted,
    Pending,
    Notified,
}

impl Policy {
    pub fn state(&self) -> PolicyState {
        match (self.due_date, self.notified, self.last_checked) {
            (None, _, _) => PolicyState::ExtractionFailed,
            (Some(_), true, _) => PolicyState::Notified,
            (Some(_), false, None) => PolicyState::DateExtracted,
            (Some(_), false, Some(_)) => PolicyState::Pending,
        }
    }
}

/// A reminder raised for a policy whose due date entered the lead window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderEvent {
    pub policy: String,
    pub due_date: NaiveDate,
    pub days_remaining: i64,
}
