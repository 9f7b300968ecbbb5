use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            access_token TEXT,
            refresh_token TEXT,
            expires_at INTEGER,
            client_id TEXT NOT NULL,
            client_secret TEXT NOT NULL,
            scopes_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scopes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            connector TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            config_json TEXT NOT NULL DEFAULT '{}',
            last_successful_at INTEGER,
            last_attempt_status TEXT NOT NULL DEFAULT 'NOT_STARTED',
            last_pruned_at INTEGER,
            total_docs_indexed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            link TEXT,
            checksum TEXT,
            remote_modified_at INTEGER,
            updated_at INTEGER NOT NULL,
            storage_path TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER,
            hidden INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scope_documents (
            scope_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            linked_at INTEGER NOT NULL,
            PRIMARY KEY (scope_id, document_id),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            scope_id TEXT NOT NULL,
            run_type TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            new_docs_indexed INTEGER NOT NULL DEFAULT 0,
            docs_removed INTEGER NOT NULL DEFAULT 0,
            error_msg TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_records (
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            parent_doc_id TEXT,
            title TEXT NOT NULL,
            text TEXT NOT NULL,
            search_text TEXT NOT NULL,
            content_preview TEXT NOT NULL,
            link TEXT,
            is_chunk INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_start INTEGER,
            chunk_end INTEGER,
            token_count INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            quality_score REAL NOT NULL,
            indexed_at INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scope_documents_document ON scope_documents(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_scope ON runs(scope_id, started_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_records_doc ON index_records(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_records_parent ON index_records(parent_doc_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
