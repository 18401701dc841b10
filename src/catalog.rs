//! Persistent catalog of document indexing state.
//!
//! The catalog maps a normalized document name to its [`DocumentRecord`].
//! Records are stored in the `documents` table and mirrored in an
//! in-memory map that is loaded once at open. Every mutation writes
//! SQLite first and only then updates the mirror, so a failed write
//! leaves both views unchanged.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::DateTime;
use sqlx::{Row, SqlitePool};

use crate::error::{KbError, KbResult};
use crate::models::DocumentRecord;

pub struct Catalog {
    pool: SqlitePool,
    records: RwLock<BTreeMap<String, DocumentRecord>>,
}

impl Catalog {
    /// Load every catalog record from the database.
    pub async fn open(pool: SqlitePool) -> KbResult<Self> {
        let rows = sqlx::query(
            "SELECT name, source_path, content_hash, indexed, chunk_count, indexed_at FROM documents",
        )
        .fetch_all(&pool)
        .await?;

        let mut records = BTreeMap::new();
        for row in rows {
            let indexed_at: Option<i64> = row.get("indexed_at");
            let record = DocumentRecord {
                name: row.get("name"),
                source_path: row.get("source_path"),
                content_hash: row.get("content_hash"),
                indexed: row.get::<i64, _>("indexed") != 0,
                chunk_count: row.get("chunk_count"),
                indexed_at: indexed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            };
            records.insert(record.name.clone(), record);
        }
        tracing::debug!(documents = records.len(), "catalog loaded");

        Ok(Self {
            pool,
            records: RwLock::new(records),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DocumentRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DocumentRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<DocumentRecord> {
        self.read().get(name).cloned()
    }

    pub fn is_indexed(&self, name: &str) -> bool {
        self.read().get(name).is_some_and(|r| r.indexed)
    }

    /// All records, ordered by name.
    pub fn list(&self) -> Vec<DocumentRecord> {
        self.read().values().cloned().collect()
    }

    pub async fn upsert(&self, record: DocumentRecord) -> KbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (name, source_path, content_hash, indexed, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                source_path = excluded.source_path,
                content_hash = excluded.content_hash,
                indexed = excluded.indexed,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&record.name)
        .bind(&record.source_path)
        .bind(&record.content_hash)
        .bind(record.indexed as i64)
        .bind(record.chunk_count)
        .bind(record.indexed_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await
        .map_err(|e| KbError::IndexWrite(e.to_string()))?;

        self.write().insert(record.name.clone(), record);
        Ok(())
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub async fn remove(&self, name: &str) -> KbResult<bool> {
        sqlx::query("DELETE FROM documents WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| KbError::IndexWrite(e.to_string()))?;
        Ok(self.write().remove(name).is_some())
    }

    pub async fn clear(&self) -> KbResult<()> {
        sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await
            .map_err(|e| KbError::IndexWrite(e.to_string()))?;
        self.write().clear();
        Ok(())
    }
}
