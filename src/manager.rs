//! Knowledge base manager: the write path of the retrieval pipeline.
//!
//! [`KnowledgeBase`] owns the catalog and drives
//! chunk → embed → vector-index upsert for each document. It is the only
//! writer of the catalog and of the vector index.
//!
//! # Concurrency
//!
//! - Indexing and removal of the *same* document serialize on a
//!   per-document async mutex. Different documents proceed in parallel.
//!   A document's mutex is dropped from the lock table once nobody holds
//!   or waits on it.
//! - [`KnowledgeBase::rebuild_index`] takes a write gate that excludes
//!   every index/remove operation for its whole duration. Index and
//!   remove take the gate shared.
//! - Reads (status, catalog lookups, similarity search) take neither lock.
//!
//! # Idempotence
//!
//! Each document's text is hashed with SHA-256. Re-indexing a document
//! whose catalog entry is already indexed with the same hash, and whose
//! index entry count matches the catalog, is a no-op.
//! The index is written in one transaction before the catalog is marked
//! indexed, so a failed write never leaves a document marked indexed. If
//! the catalog write fails afterwards, the document's index entries are
//! dropped so the next index call rebuilds them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::catalog::Catalog;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config};
use crate::documents::{normalize_name, DirectoryDocuments, DocumentSource, LoadedDocument};
use crate::embedding::{create_provider, embed_batched, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::models::{DocumentRecord, IndexEntry};
use crate::store::{SqliteIndex, VectorIndex};

/// Result of indexing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The document was (re-)chunked, embedded, and stored.
    Indexed { chunks: usize },
    /// The catalog already holds this exact content.
    Unchanged { chunks: usize },
}

/// Per-document result of a bulk operation.
#[derive(Debug)]
pub struct DocumentOutcome {
    pub name: String,
    pub result: KbResult<IndexOutcome>,
}

/// Snapshot of knowledge-base state for status displays.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct KbStatus {
    pub total_documents: usize,
    pub indexed_count: usize,
    pub pending_count: usize,
    pub index_entries: u64,
    pub indexed: Vec<String>,
    pub pending: Vec<String>,
}

/// Tunables for the indexing pipeline.
#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub batch_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        let chunking = ChunkingConfig::default();
        Self {
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
            batch_size: 64,
        }
    }
}

type DocLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct KnowledgeBase {
    catalog: Catalog,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    documents: Arc<dyn DocumentSource>,
    settings: IndexSettings,
    doc_locks: DocLocks,
    gate: tokio::sync::RwLock<()>,
}

/// Held per-document lock. Dropping it releases the lock and prunes the
/// table entry when no other task holds a handle to it.
struct DocGuard<'a> {
    locks: &'a DocLocks,
    name: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for DocGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// SHA-256 of the document text, hex encoded.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn now_secs() -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0)
}

impl KnowledgeBase {
    pub fn new(
        catalog: Catalog,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        documents: Arc<dyn DocumentSource>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            catalog,
            index,
            embedder,
            documents,
            settings,
            doc_locks: Mutex::new(HashMap::new()),
            gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Wire up the SQLite-backed knowledge base described by `config`.
    pub async fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let catalog = Catalog::open(pool.clone()).await?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let documents = Arc::new(DirectoryDocuments::new(&config.documents)?);
        Ok(Self::new(
            catalog,
            Arc::new(SqliteIndex::new(pool)),
            embedder,
            documents,
            IndexSettings {
                chunk_size: config.chunking.chunk_size,
                chunk_overlap: config.chunking.chunk_overlap,
                batch_size: config.embedding.batch_size,
            },
        ))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn documents(&self) -> &dyn DocumentSource {
        self.documents.as_ref()
    }

    async fn lock_document(&self, name: &str) -> DocGuard<'_> {
        let lock = {
            let mut locks = self.doc_locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(name.to_string()).or_default().clone()
        };
        DocGuard {
            locks: &self.doc_locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Index `text` under `name`.
    pub async fn index_document(&self, name: &str, text: &str) -> KbResult<IndexOutcome> {
        let doc = LoadedDocument {
            name: normalize_name(name)?,
            source_path: None,
            text: text.to_string(),
        };
        let _gate = self.gate.read().await;
        let _guard = self.lock_document(&doc.name).await;
        self.index_locked(doc).await
    }

    /// Load `name` from the document source and index it.
    pub async fn index_from_source(&self, name: &str) -> KbResult<IndexOutcome> {
        let name = normalize_name(name)?;
        let _gate = self.gate.read().await;
        let _guard = self.lock_document(&name).await;
        let doc = self.documents.load(&name).await?;
        self.index_locked(doc).await
    }

    /// Caller must hold the gate (shared or exclusive) and, unless it holds
    /// the gate exclusively, the document's lock.
    async fn index_locked(&self, doc: LoadedDocument) -> KbResult<IndexOutcome> {
        let hash = content_hash(&doc.text);
        if let Some(existing) = self.catalog.get(&doc.name) {
            if existing.indexed
                && existing.content_hash == hash
                && self.index.count(Some(&doc.name)).await? == existing.chunk_count as u64
            {
                tracing::debug!(document = %doc.name, "content unchanged, skipping");
                return Ok(IndexOutcome::Unchanged {
                    chunks: existing.chunk_count as usize,
                });
            }
        }

        let chunks = chunk_text(
            &doc.name,
            &doc.text,
            self.settings.chunk_size,
            self.settings.chunk_overlap,
        )?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, self.settings.batch_size).await?;

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| IndexEntry {
                document: chunk.document,
                sequence: chunk.sequence,
                text: chunk.text,
                embedding,
            })
            .collect();
        let chunk_count = entries.len();

        self.index.replace_document(&doc.name, &entries).await?;
        let recorded = self
            .catalog
            .upsert(DocumentRecord {
                name: doc.name.clone(),
                source_path: doc.source_path,
                content_hash: hash,
                indexed: true,
                chunk_count: chunk_count as i64,
                indexed_at: now_secs(),
            })
            .await;
        if let Err(e) = recorded {
            if let Err(rollback) = self.index.delete_document(&doc.name).await {
                tracing::error!(document = %doc.name, error = %rollback, "failed to roll back index entries");
            }
            return Err(e);
        }

        tracing::info!(document = %doc.name, chunks = chunk_count, "indexed document");
        Ok(IndexOutcome::Indexed {
            chunks: chunk_count,
        })
    }

    /// Remove a document's index entries and catalog record. Returns
    /// `false` when the document was never indexed.
    pub async fn remove_document(&self, name: &str) -> KbResult<bool> {
        let name = normalize_name(name)?;
        let _gate = self.gate.read().await;
        let _guard = self.lock_document(&name).await;

        let deleted = self.index.delete_document(&name).await?;
        let existed = self.catalog.remove(&name).await?;
        if existed || deleted > 0 {
            tracing::info!(document = %name, entries = deleted, "removed document");
        }
        Ok(existed || deleted > 0)
    }

    /// Clear the index and catalog, then re-index every document in the
    /// document source. Runs with exclusive access to the whole catalog.
    pub async fn rebuild_index(&self) -> KbResult<Vec<DocumentOutcome>> {
        let _gate = self.gate.write().await;
        tracing::info!("rebuilding index");

        self.index.clear().await?;
        self.catalog.clear().await?;

        let names = self.documents.list().await?;
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let result = match self.documents.load(&name).await {
                Ok(doc) => self.index_locked(doc).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!(document = %name, error = %e, "rebuild failed for document");
            }
            outcomes.push(DocumentOutcome { name, result });
        }
        Ok(outcomes)
    }

    /// Index every document present in the source but not yet indexed.
    pub async fn index_pending(&self) -> KbResult<Vec<DocumentOutcome>> {
        let pending: Vec<String> = self
            .documents
            .list()
            .await?
            .into_iter()
            .filter(|n| !self.catalog.is_indexed(n))
            .collect();
        Ok(self.index_each(pending).await)
    }

    /// Index every document in the source. Unchanged documents are
    /// skipped by their content hash.
    pub async fn index_all(&self) -> KbResult<Vec<DocumentOutcome>> {
        let names = self.documents.list().await?;
        Ok(self.index_each(names).await)
    }

    async fn index_each(&self, names: Vec<String>) -> Vec<DocumentOutcome> {
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let result = self.index_from_source(&name).await;
            if let Err(e) = &result {
                tracing::warn!(document = %name, error = %e, "indexing failed");
            }
            outcomes.push(DocumentOutcome { name, result });
        }
        outcomes
    }

    pub async fn get_status(&self) -> KbResult<KbStatus> {
        let present = self.documents.list().await?;
        let indexed: Vec<String> = self
            .catalog
            .list()
            .into_iter()
            .filter(|r| r.indexed)
            .map(|r| r.name)
            .collect();
        let pending: Vec<String> = present
            .iter()
            .filter(|n| !self.catalog.is_indexed(n))
            .cloned()
            .collect();
        // Documents indexed directly by name count even when the source
        // does not hold them.
        let total_documents = present
            .iter()
            .chain(indexed.iter())
            .collect::<BTreeSet<_>>()
            .len();

        Ok(KbStatus {
            total_documents,
            indexed_count: indexed.len(),
            pending_count: pending.len(),
            index_entries: self.index.count(None).await?,
            indexed,
            pending,
        })
    }

    pub fn document_info(&self, name: &str) -> Option<DocumentRecord> {
        normalize_name(name).ok().and_then(|n| self.catalog.get(&n))
    }

    pub fn indexed_documents(&self) -> Vec<DocumentRecord> {
        self.catalog
            .list()
            .into_iter()
            .filter(|r| r.indexed)
            .collect()
    }

    pub fn is_indexed(&self, name: &str) -> bool {
        normalize_name(name).is_ok_and(|n| self.catalog.is_indexed(&n))
    }
}
