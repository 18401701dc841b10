//! Idempotent schema setup for the catalog, vector index, and policy
//! tables.

use sqlx::SqlitePool;

use crate::error::KbResult;

pub async fn run_migrations(pool: &SqlitePool) -> KbResult<()> {
    // Knowledge base catalog: one row per document name
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            name TEXT PRIMARY KEY,
            source_path TEXT,
            content_hash TEXT NOT NULL,
            indexed INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector index entries. `seq` records insertion order and is kept on
    // re-index so ranking ties resolve the same way every time.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            document TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            UNIQUE(document, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            name TEXT PRIMARY KEY,
            due_date TEXT,
            last_checked INTEGER,
            notified INTEGER NOT NULL DEFAULT 0,
            uploaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_entries_document ON index_entries(document)")
        .execute(pool)
        .await?;

    Ok(())
}
