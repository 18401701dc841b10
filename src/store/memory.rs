//! In-memory [`VectorIndex`] implementation for tests and ephemeral use.
//!
//! Entries live in a `Vec` behind `std::sync::RwLock`, in insertion order.
//! Search is brute-force cosine similarity over all stored vectors.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{KbError, KbResult};
use crate::models::{IndexEntry, SearchHit};

use super::{rank_hits, VectorIndex};

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<Vec<IndexEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> KbResult<std::sync::RwLockWriteGuard<'_, Vec<IndexEntry>>> {
        self.entries
            .write()
            .map_err(|_| KbError::IndexWrite("in-memory index lock poisoned".to_string()))
    }

    fn read(&self) -> KbResult<std::sync::RwLockReadGuard<'_, Vec<IndexEntry>>> {
        self.entries
            .read()
            .map_err(|_| KbError::IndexWrite("in-memory index lock poisoned".to_string()))
    }
}

fn upsert_into(stored: &mut Vec<IndexEntry>, entries: &[IndexEntry]) {
    for entry in entries {
        match stored
            .iter_mut()
            .find(|e| e.document == entry.document && e.sequence == entry.sequence)
        {
            Some(existing) => *existing = entry.clone(),
            None => stored.push(entry.clone()),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> KbResult<()> {
        upsert_into(&mut *self.write()?, entries);
        Ok(())
    }

    async fn replace_document(&self, document: &str, entries: &[IndexEntry]) -> KbResult<()> {
        if let Some(stray) = entries.iter().find(|e| e.document != document) {
            return Err(KbError::IndexWrite(format!(
                "entry {} does not belong to document '{}'",
                stray.id(),
                document
            )));
        }
        let mut stored = self.write()?;
        stored.retain(|e| {
            e.document != document || entries.iter().any(|n| n.sequence == e.sequence)
        });
        upsert_into(&mut stored, entries);
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        document: Option<&str>,
    ) -> KbResult<Vec<SearchHit>> {
        let stored = self.read()?;
        let hits = stored
            .iter()
            .filter(|e| document.map_or(true, |d| e.document == d))
            .map(|e| SearchHit {
                document: e.document.clone(),
                sequence: e.sequence,
                text: e.text.clone(),
                score: cosine_similarity(query, &e.embedding) as f64,
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn delete_document(&self, document: &str) -> KbResult<u64> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|e| e.document != document);
        Ok((before - stored.len()) as u64)
    }

    async fn clear(&self) -> KbResult<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn count(&self, document: Option<&str>) -> KbResult<u64> {
        let stored = self.read()?;
        Ok(stored
            .iter()
            .filter(|e| document.map_or(true, |d| e.document == d))
            .count() as u64)
    }
}
