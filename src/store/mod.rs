//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the storage boundary of the retrieval
//! pipeline: a named collection of [`IndexEntry`] rows keyed by
//! `(document, sequence)` that supports upsert, ranked similarity search
//! with an optional single-document filter, deletion by document, and a
//! full clear.
//!
//! Ranking contract shared by all backends: hits are ordered by cosine
//! similarity, highest first, and entries with equal scores keep their
//! insertion order. Re-upserting an existing `(document, sequence)` key
//! keeps its original position.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::KbResult;
use crate::models::{IndexEntry, SearchHit};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// Abstract vector storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite entries by key |
/// | [`replace_document`](VectorIndex::replace_document) | Atomically swap a document's entry set |
/// | [`similarity_search`](VectorIndex::similarity_search) | Top-k cosine search |
/// | [`delete_document`](VectorIndex::delete_document) | Drop every entry of one document |
/// | [`clear`](VectorIndex::clear) | Drop everything |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite entries keyed by `(document, sequence)`.
    async fn upsert(&self, entries: &[IndexEntry]) -> KbResult<()>;

    /// Make `entries` the complete entry set for `document`: upsert them
    /// and remove any entry of that document not present in `entries`.
    /// Either all changes land or none do.
    async fn replace_document(&self, document: &str, entries: &[IndexEntry]) -> KbResult<()>;

    /// Return the `k` most similar entries, optionally restricted to one
    /// document.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        document: Option<&str>,
    ) -> KbResult<Vec<SearchHit>>;

    /// Delete every entry of `document`, returning the number removed.
    async fn delete_document(&self, document: &str) -> KbResult<u64>;

    /// Remove all entries.
    async fn clear(&self) -> KbResult<()>;

    /// Count entries, optionally for one document.
    async fn count(&self, document: Option<&str>) -> KbResult<u64>;
}

/// Order scored candidates by score descending. `sort_by` is stable, so
/// candidates must arrive in insertion order for the tie-break to hold.
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
    hits
}
