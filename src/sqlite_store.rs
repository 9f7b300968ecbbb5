//! SQLite implementation of the credential, document, and scope stores.
//!
//! Timestamps are stored as unix seconds. Every `sqlx` failure surfaces as
//! [`SyncError::Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use filesync_core::models::{
    Credential, DocumentRecord, Run, RunStatus, ScopeConfig, SyncScope, UpsertOutcome,
};
use filesync_core::store::{CredentialStore, DocumentStore, ScopeStore};
use filesync_core::{Result, SyncError};

pub(crate) fn store_err(e: sqlx::Error) -> SyncError {
    SyncError::store(e.to_string())
}

pub(crate) fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn opt_from_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(from_ts)
}

/// SQLite-backed [`CredentialStore`], [`DocumentStore`], and [`ScopeStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_credential(row: &SqliteRow) -> Result<Credential> {
    let scopes_json: String = row.try_get("scopes_json").map_err(store_err)?;
    let scopes: Vec<String> = serde_json::from_str(&scopes_json)
        .map_err(|e| SyncError::store(format!("invalid credential scopes: {}", e)))?;
    Ok(Credential {
        id: row.try_get("id").map_err(store_err)?,
        provider: row.try_get("provider").map_err(store_err)?,
        access_token: row.try_get("access_token").map_err(store_err)?,
        refresh_token: row.try_get("refresh_token").map_err(store_err)?,
        expires_at: opt_from_ts(row.try_get("expires_at").map_err(store_err)?),
        client_id: row.try_get("client_id").map_err(store_err)?,
        client_secret: row.try_get("client_secret").map_err(store_err)?,
        scopes,
        updated_at: from_ts(row.try_get("updated_at").map_err(store_err)?),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<DocumentRecord> {
    let hidden: i64 = row.try_get("hidden").map_err(store_err)?;
    Ok(DocumentRecord {
        id: row.try_get("id").map_err(store_err)?,
        source_id: row.try_get("source_id").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        link: row.try_get("link").map_err(store_err)?,
        checksum: row.try_get("checksum").map_err(store_err)?,
        remote_modified_at: opt_from_ts(row.try_get("remote_modified_at").map_err(store_err)?),
        updated_at: from_ts(row.try_get("updated_at").map_err(store_err)?),
        storage_path: row.try_get("storage_path").map_err(store_err)?,
        chunk_count: row.try_get("chunk_count").map_err(store_err)?,
        indexed_at: opt_from_ts(row.try_get("indexed_at").map_err(store_err)?),
        hidden: hidden != 0,
    })
}

fn row_to_scope(row: &SqliteRow) -> Result<SyncScope> {
    let config_json: String = row.try_get("config_json").map_err(store_err)?;
    let config: ScopeConfig = serde_json::from_str(&config_json)
        .map_err(|e| SyncError::store(format!("invalid scope config: {}", e)))?;
    let status: String = row.try_get("last_attempt_status").map_err(store_err)?;
    Ok(SyncScope {
        id: row.try_get("id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        connector: row.try_get("connector").map_err(store_err)?,
        credential_id: row.try_get("credential_id").map_err(store_err)?,
        config,
        last_successful_at: opt_from_ts(row.try_get("last_successful_at").map_err(store_err)?),
        last_attempt_status: status.parse()?,
        last_pruned_at: opt_from_ts(row.try_get("last_pruned_at").map_err(store_err)?),
        total_docs_indexed: row.try_get("total_docs_indexed").map_err(store_err)?,
        created_at: from_ts(row.try_get("created_at").map_err(store_err)?),
    })
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let run_type: String = row.try_get("run_type").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(Run {
        id: row.try_get("id").map_err(store_err)?,
        scope_id: row.try_get("scope_id").map_err(store_err)?,
        run_type: run_type.parse()?,
        status: status.parse()?,
        started_at: from_ts(row.try_get("started_at").map_err(store_err)?),
        finished_at: opt_from_ts(row.try_get("finished_at").map_err(store_err)?),
        new_docs_indexed: row.try_get("new_docs_indexed").map_err(store_err)?,
        docs_removed: row.try_get("docs_removed").map_err(store_err)?,
        error_msg: row.try_get("error_msg").map_err(store_err)?,
    })
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get_credential(&self, id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_credential).transpose()
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        let scopes_json = serde_json::to_string(&credential.scopes)
            .map_err(|e| SyncError::store(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO credentials (id, provider, access_token, refresh_token, expires_at, client_id, client_secret, scopes_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                scopes_json = excluded.scopes_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.provider)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at.map(ts))
        .bind(&credential.client_id)
        .bind(&credential.client_secret)
        .bind(scopes_json)
        .bind(ts(credential.updated_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing: Option<(Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT checksum, remote_modified_at FROM documents WHERE id = ?",
        )
        .bind(&doc.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let outcome = match &existing {
            None => UpsertOutcome::Inserted,
            Some((old_checksum, old_modified)) => {
                let changed = match (old_checksum, &doc.checksum) {
                    (Some(old), Some(new)) => old != new,
                    _ => *old_modified != doc.remote_modified_at.map(ts),
                };
                if changed {
                    UpsertOutcome::Changed
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, title, link, checksum, remote_modified_at, updated_at, storage_path, chunk_count, indexed_at, hidden)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0, NULL, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                title = excluded.title,
                link = excluded.link,
                checksum = excluded.checksum,
                remote_modified_at = excluded.remote_modified_at,
                updated_at = excluded.updated_at,
                indexed_at = CASE WHEN ? THEN NULL ELSE documents.indexed_at END
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_id)
        .bind(&doc.title)
        .bind(&doc.link)
        .bind(&doc.checksum)
        .bind(doc.remote_modified_at.map(ts))
        .bind(ts(doc.updated_at))
        .bind(doc.hidden)
        .bind(outcome == UpsertOutcome::Changed)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(outcome)
    }

    async fn link_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO scope_documents (scope_id, document_id, linked_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(scope_id)
        .bind(doc_id)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn unlink_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scope_documents WHERE scope_id = ? AND document_id = ?")
            .bind(scope_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scope_document_ids(&self, scope_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT document_id FROM scope_documents WHERE scope_id = ? ORDER BY document_id",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn reference_count(&self, doc_id: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scope_documents WHERE document_id = ?")
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(count as usize)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM scope_documents WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_indexed(
        &self,
        doc_id: &str,
        chunk_count: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE documents SET chunk_count = ?, indexed_at = ? WHERE id = ?")
            .bind(chunk_count)
            .bind(ts(at))
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_storage_path(&self, doc_id: &str, path: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE documents SET storage_path = ? WHERE id = ?")
            .bind(path)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_document).collect()
    }
}

#[async_trait]
impl ScopeStore for SqliteStore {
    async fn create_scope(&self, scope: &SyncScope) -> Result<()> {
        let config_json = serde_json::to_string(&scope.config)
            .map_err(|e| SyncError::store(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO scopes (id, name, connector, credential_id, config_json, last_successful_at, last_attempt_status, last_pruned_at, total_docs_indexed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&scope.id)
        .bind(&scope.name)
        .bind(&scope.connector)
        .bind(&scope.credential_id)
        .bind(config_json)
        .bind(scope.last_successful_at.map(ts))
        .bind(scope.last_attempt_status.as_str())
        .bind(scope.last_pruned_at.map(ts))
        .bind(scope.total_docs_indexed)
        .bind(ts(scope.created_at))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_scope(&self, id: &str) -> Result<Option<SyncScope>> {
        let row = sqlx::query("SELECT * FROM scopes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_scope).transpose()
    }

    async fn list_scopes(&self) -> Result<Vec<SyncScope>> {
        let rows = sqlx::query("SELECT * FROM scopes ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_scope).collect()
    }

    async fn record_sync_success(
        &self,
        scope_id: &str,
        at: DateTime<Utc>,
        new_docs: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scopes SET
                last_successful_at = ?,
                last_attempt_status = 'SUCCESS',
                total_docs_indexed = total_docs_indexed + ?
            WHERE id = ?
            "#,
        )
        .bind(ts(at))
        .bind(new_docs)
        .bind(scope_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::store(format!("unknown scope '{}'", scope_id)));
        }
        Ok(())
    }

    async fn record_attempt_status(&self, scope_id: &str, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE scopes SET last_attempt_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(scope_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_prune(&self, scope_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE scopes SET last_pruned_at = ? WHERE id = ?")
            .bind(ts(at))
            .bind(scope_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, scope_id, run_type, status, started_at, finished_at, new_docs_indexed, docs_removed, error_msg)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.scope_id)
        .bind(run.run_type.as_str())
        .bind(run.status.as_str())
        .bind(ts(run.started_at))
        .bind(run.finished_at.map(ts))
        .bind(run.new_docs_indexed)
        .bind(run.docs_removed)
        .bind(&run.error_msg)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn finish_run(&self, run: &Run) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = ?,
                finished_at = ?,
                new_docs_indexed = ?,
                docs_removed = ?,
                error_msg = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.finished_at.map(ts))
        .bind(run.new_docs_indexed)
        .bind(run.docs_removed)
        .bind(&run.error_msg)
        .bind(&run.id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, scope_id: &str, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE scope_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(scope_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_run).collect()
    }

    async fn active_runs(&self, live_since: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status = 'IN_PROGRESS' AND started_at >= ? ORDER BY started_at",
        )
        .bind(ts(live_since))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_run).collect()
    }

    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Run>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = sqlx::query("SELECT * FROM runs WHERE status = 'IN_PROGRESS' AND started_at < ?")
            .bind(ts(stale_before))
            .fetch_all(&mut *tx)
            .await
            .map_err(store_err)?;

        let now = Utc::now();
        let mut reaped = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = row_to_run(row)?;
            sqlx::query(
                "UPDATE runs SET status = 'FAILED', finished_at = ?, error_msg = ? WHERE id = ? AND status = 'IN_PROGRESS'",
            )
            .bind(ts(now))
            .bind(reason)
            .bind(&run.id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            run.status = RunStatus::Failed;
            run.finished_at = Some(now);
            run.error_msg = Some(reason.to_string());
            reaped.push(run);
        }

        tx.commit().await.map_err(store_err)?;
        Ok(reaped)
    }

    async fn delete_failed_runs_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM runs WHERE status = 'FAILED' AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(ts(before))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() as usize)
    }
}
