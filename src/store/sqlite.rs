//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs in `index_entries`.
//! Search loads candidate rows in `seq` order and scores them in Rust.
//! Equal scores therefore fall back to insertion order.

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{KbError, KbResult};
use crate::models::{IndexEntry, SearchHit};

use super::{rank_hits, VectorIndex};

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn write_err(err: sqlx::Error) -> KbError {
    KbError::IndexWrite(err.to_string())
}

async fn upsert_in_tx(tx: &mut Transaction<'_, Sqlite>, entries: &[IndexEntry]) -> KbResult<()> {
    for entry in entries {
        // ON CONFLICT ... DO UPDATE keeps the existing `seq`.
        sqlx::query(
            r#"
            INSERT INTO index_entries (document, chunk_index, text, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document, chunk_index) DO UPDATE SET
                text = excluded.text,
                embedding = excluded.embedding
            "#,
        )
        .bind(&entry.document)
        .bind(entry.sequence)
        .bind(&entry.text)
        .bind(vec_to_blob(&entry.embedding))
        .execute(&mut **tx)
        .await
        .map_err(write_err)?;
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> KbResult<()> {
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        upsert_in_tx(&mut tx, entries).await?;
        tx.commit().await.map_err(write_err)?;
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

        let mut tx = self.pool.begin().await.map_err(write_err)?;
        upsert_in_tx(&mut tx, entries).await?;

        // Chunk sequences are contiguous from zero, so anything at or past
        // the new count is stale.
        sqlx::query("DELETE FROM index_entries WHERE document = ? AND chunk_index >= ?")
            .bind(document)
            .bind(entries.len() as i64)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        document: Option<&str>,
    ) -> KbResult<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = match document {
            Some(doc) => {
                sqlx::query(
                    "SELECT document, chunk_index, text, embedding FROM index_entries WHERE document = ? ORDER BY seq ASC",
                )
                .bind(doc)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT document, chunk_index, text, embedding FROM index_entries ORDER BY seq ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                SearchHit {
                    document: row.get("document"),
                    sequence: row.get("chunk_index"),
                    text: row.get("text"),
                    score: cosine_similarity(query, &vector) as f64,
                }
            })
            .collect();

        Ok(rank_hits(hits, k))
    }

    async fn delete_document(&self, document: &str) -> KbResult<u64> {
        let result = sqlx::query("DELETE FROM index_entries WHERE document = ?")
            .bind(document)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> KbResult<()> {
        sqlx::query("DELETE FROM index_entries")
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn count(&self, document: Option<&str>) -> KbResult<u64> {
        let count: i64 = match document {
            Some(doc) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM index_entries WHERE document = ?")
                    .bind(doc)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("index.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (tmp, SqliteIndex::new(pool))
    }

    fn entry(doc: &str, seq: i64, v: Vec<f32>) -> IndexEntry {
        IndexEntry {
            document: doc.to_string(),
            sequence: seq,
            text: format!("{} chunk {}", doc, seq),
            embedding: v,
        }
    }

    #[tokio::test]
    async fn test_ties_resolve_in_insertion_order() {
        let (_tmp, index) = open().await;
        index
            .upsert(&[
                entry("b.txt", 0, vec![1.0, 0.0]),
                entry("a.txt", 0, vec![1.0, 0.0]),
                entry("c.txt", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        // Re-upserting keeps the original position.
        index.upsert(&[entry("b.txt", 0, vec![1.0, 0.0])]).await.unwrap();

        let hits = index.similarity_search(&[1.0, 0.0], 3, None).await.unwrap();
        let order: Vec<&str> = hits.iter().map(|h| h.document.as_str()).collect();
        assert_eq!(order, vec!["b.txt", "a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_replace_document_shrinks_entry_set() {
        let (_tmp, index) = open().await;
        let three: Vec<IndexEntry> = (0..3).map(|i| entry("p.pdf", i, vec![1.0])).collect();
        index.replace_document("p.pdf", &three).await.unwrap();
        assert_eq!(index.count(Some("p.pdf")).await.unwrap(), 3);

        index
            .replace_document("p.pdf", &three[..1])
            .await
            .unwrap();
        assert_eq!(index.count(Some("p.pdf")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_document_rejects_foreign_entries() {
        let (_tmp, index) = open().await;
        let err = index
            .replace_document("p.pdf", &[entry("other.pdf", 0, vec![1.0])])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "index_write_error");
        assert_eq!(index.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filtered_search_and_delete() {
        let (_tmp, index) = open().await;
        index
            .upsert(&[entry("a", 0, vec![1.0, 0.0]), entry("b", 0, vec![0.0, 1.0])])
            .await
            .unwrap();

        let hits = index
            .similarity_search(&[1.0, 0.0], 5, Some("b"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document, "b");

        assert_eq!(index.delete_document("b").await.unwrap(), 1);
        assert!(index
            .similarity_search(&[1.0, 0.0], 5, Some("b"))
            .await
            .unwrap()
            .is_empty());

        index.clear().await.unwrap();
        assert_eq!(index.count(None).await.unwrap(), 0);
    }
}
