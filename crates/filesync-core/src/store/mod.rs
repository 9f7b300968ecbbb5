//! Storage abstractions for filesync.
//!
//! Four traits split persistence by concern so each backend can be swapped
//! or faked independently:
//!
//! | Trait | Holds |
//! |-------|-------|
//! | [`CredentialStore`] | OAuth credentials, last-writer-wins |
//! | [`DocumentStore`] | Document records and the scope membership join |
//! | [`ScopeStore`] | Sync scopes and run bookkeeping |
//! | [`IndexBackend`] | Search index records |
//!
//! The SQLite implementations live in the `filesync` app crate; the
//! in-memory ones in [`memory`] back tests and embedded use.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{
    Credential, DocumentRecord, IndexRecord, Run, RunStatus, SyncScope, UpsertOutcome,
};
use crate::search::Filter;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, id: &str) -> Result<Option<Credential>>;

    /// Insert or overwrite the whole credential row.
    async fn save_credential(&self, credential: &Credential) -> Result<()>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Insert a document, or refresh its remote metadata if it exists.
    ///
    /// A changed checksum (or modified time when no checksum is known)
    /// clears `indexed_at` so the next pass re-indexes it. Local fields
    /// (`storage_path`, `chunk_count`) are left alone.
    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<UpsertOutcome>;

    /// Link a document to a scope. Returns `false` if already linked.
    async fn link_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool>;

    /// Remove a membership link. Returns `false` if it did not exist.
    async fn unlink_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool>;

    /// Ids of every document linked to the scope.
    async fn scope_document_ids(&self, scope_id: &str) -> Result<Vec<String>>;

    /// Number of scopes linking the document.
    async fn reference_count(&self, doc_id: &str) -> Result<usize>;

    /// Delete the document row. Returns `false` if it did not exist.
    async fn delete_document(&self, doc_id: &str) -> Result<bool>;

    async fn mark_indexed(&self, doc_id: &str, chunk_count: i64, at: DateTime<Utc>)
        -> Result<()>;

    async fn set_storage_path(&self, doc_id: &str, path: Option<&str>) -> Result<()>;

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>>;
}

#[async_trait]
pub trait ScopeStore: Send + Sync {
    async fn create_scope(&self, scope: &SyncScope) -> Result<()>;

    async fn get_scope(&self, id: &str) -> Result<Option<SyncScope>>;

    async fn list_scopes(&self) -> Result<Vec<SyncScope>>;

    /// Set last success time and status, and add to the cumulative count.
    async fn record_sync_success(
        &self,
        scope_id: &str,
        at: DateTime<Utc>,
        new_docs: i64,
    ) -> Result<()>;

    async fn record_attempt_status(&self, scope_id: &str, status: RunStatus) -> Result<()>;

    async fn record_prune(&self, scope_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Persist a run's terminal state.
    ///
    /// Only an `IN_PROGRESS` run can be finished; finishing a terminal run
    /// is a no-op that returns `false`.
    async fn finish_run(&self, run: &Run) -> Result<bool>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Most recent runs first.
    async fn list_runs(&self, scope_id: &str, limit: usize) -> Result<Vec<Run>>;

    /// `IN_PROGRESS` runs started at or after `live_since`.
    async fn active_runs(&self, live_since: DateTime<Utc>) -> Result<Vec<Run>>;

    /// Fail every `IN_PROGRESS` run started before `stale_before`.
    async fn reap_stale_runs(&self, stale_before: DateTime<Utc>, reason: &str)
        -> Result<Vec<Run>>;

    /// Delete `FAILED` runs that finished before `before`.
    async fn delete_failed_runs_before(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Record counts reported by an [`IndexBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub total: usize,
    pub full_documents: usize,
    pub chunks: usize,
    pub with_embeddings: usize,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Replace every record of `doc_id` with `records`, all or nothing.
    async fn replace_records(&self, doc_id: &str, records: &[IndexRecord]) -> Result<()>;

    /// Delete records whose `doc_id`, `parent_doc_id`, or own id is `doc_id`.
    async fn delete_records(&self, doc_id: &str) -> Result<usize>;

    /// Records passing every filter.
    async fn load_records(&self, filters: &[Filter]) -> Result<Vec<IndexRecord>>;

    async fn counts(&self) -> Result<RecordCounts>;
}
