//! In-memory store and index implementations for tests and embedded use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Nothing is
//! persisted; dropping the value discards everything.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::models::{
    Credential, DocumentRecord, IndexRecord, Run, RunStatus, SyncScope, UpsertOutcome,
};
use crate::search::Filter;

use super::{CredentialStore, DocumentStore, IndexBackend, RecordCounts, ScopeStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| SyncError::store("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| SyncError::store("in-memory store lock poisoned"))
}

/// In-memory credential, document, and scope store.
#[derive(Default)]
pub struct InMemoryStore {
    credentials: RwLock<HashMap<String, Credential>>,
    documents: RwLock<HashMap<String, DocumentRecord>>,
    /// `(scope_id, doc_id)` membership pairs.
    links: RwLock<BTreeSet<(String, String)>>,
    scopes: RwLock<HashMap<String, SyncScope>>,
    runs: RwLock<Vec<Run>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn get_credential(&self, id: &str) -> Result<Option<Credential>> {
        Ok(read(&self.credentials)?.get(id).cloned())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        write(&self.credentials)?.insert(credential.id.clone(), credential.clone());
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        Ok(read(&self.documents)?.get(id).cloned())
    }

    async fn upsert_document(&self, doc: &DocumentRecord) -> Result<UpsertOutcome> {
        let mut docs = write(&self.documents)?;
        match docs.get_mut(&doc.id) {
            None => {
                docs.insert(doc.id.clone(), doc.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) => {
                let changed = match (&existing.checksum, &doc.checksum) {
                    (Some(old), Some(new)) => old != new,
                    _ => existing.remote_modified_at != doc.remote_modified_at,
                };
                existing.source_id = doc.source_id.clone();
                existing.title = doc.title.clone();
                existing.link = doc.link.clone();
                existing.checksum = doc.checksum.clone();
                existing.remote_modified_at = doc.remote_modified_at;
                existing.updated_at = doc.updated_at;
                if changed {
                    existing.indexed_at = None;
                    Ok(UpsertOutcome::Changed)
                } else {
                    Ok(UpsertOutcome::Unchanged)
                }
            }
        }
    }

    async fn link_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool> {
        Ok(write(&self.links)?.insert((scope_id.to_string(), doc_id.to_string())))
    }

    async fn unlink_scope(&self, scope_id: &str, doc_id: &str) -> Result<bool> {
        Ok(write(&self.links)?.remove(&(scope_id.to_string(), doc_id.to_string())))
    }

    async fn scope_document_ids(&self, scope_id: &str) -> Result<Vec<String>> {
        Ok(read(&self.links)?
            .iter()
            .filter(|(s, _)| s == scope_id)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn reference_count(&self, doc_id: &str) -> Result<usize> {
        Ok(read(&self.links)?.iter().filter(|(_, d)| d == doc_id).count())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        write(&self.links)?.retain(|(_, d)| d != doc_id);
        Ok(write(&self.documents)?.remove(doc_id).is_some())
    }

    async fn mark_indexed(
        &self,
        doc_id: &str,
        chunk_count: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(doc) = write(&self.documents)?.get_mut(doc_id) {
            doc.chunk_count = chunk_count;
            doc.indexed_at = Some(at);
        }
        Ok(())
    }

    async fn set_storage_path(&self, doc_id: &str, path: Option<&str>) -> Result<()> {
        if let Some(doc) = write(&self.documents)?.get_mut(doc_id) {
            doc.storage_path = path.map(str::to_string);
        }
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let mut docs: Vec<DocumentRecord> = read(&self.documents)?.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

#[async_trait]
impl ScopeStore for InMemoryStore {
    async fn create_scope(&self, scope: &SyncScope) -> Result<()> {
        let mut scopes = write(&self.scopes)?;
        if scopes.contains_key(&scope.id) {
            return Err(SyncError::store(format!("scope '{}' already exists", scope.id)));
        }
        scopes.insert(scope.id.clone(), scope.clone());
        Ok(())
    }

    async fn get_scope(&self, id: &str) -> Result<Option<SyncScope>> {
        Ok(read(&self.scopes)?.get(id).cloned())
    }

    async fn list_scopes(&self) -> Result<Vec<SyncScope>> {
        let mut scopes: Vec<SyncScope> = read(&self.scopes)?.values().cloned().collect();
        scopes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(scopes)
    }

    async fn record_sync_success(
        &self,
        scope_id: &str,
        at: DateTime<Utc>,
        new_docs: i64,
    ) -> Result<()> {
        let mut scopes = write(&self.scopes)?;
        let scope = scopes
            .get_mut(scope_id)
            .ok_or_else(|| SyncError::store(format!("unknown scope '{}'", scope_id)))?;
        scope.last_successful_at = Some(at);
        scope.last_attempt_status = RunStatus::Success;
        scope.total_docs_indexed += new_docs;
        Ok(())
    }

    async fn record_attempt_status(&self, scope_id: &str, status: RunStatus) -> Result<()> {
        if let Some(scope) = write(&self.scopes)?.get_mut(scope_id) {
            scope.last_attempt_status = status;
        }
        Ok(())
    }

    async fn record_prune(&self, scope_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(scope) = write(&self.scopes)?.get_mut(scope_id) {
            scope.last_pruned_at = Some(at);
        }
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        write(&self.runs)?.push(run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &Run) -> Result<bool> {
        let mut runs = write(&self.runs)?;
        match runs
            .iter_mut()
            .find(|r| r.id == run.id && r.status == RunStatus::InProgress)
        {
            Some(stored) => {
                *stored = run.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(read(&self.runs)?.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, scope_id: &str, limit: usize) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = read(&self.runs)?
            .iter()
            .filter(|r| r.scope_id == scope_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn active_runs(&self, live_since: DateTime<Utc>) -> Result<Vec<Run>> {
        Ok(read(&self.runs)?
            .iter()
            .filter(|r| r.status == RunStatus::InProgress && r.started_at >= live_since)
            .cloned()
            .collect())
    }

    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Run>> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        for run in write(&self.runs)?.iter_mut() {
            if run.status == RunStatus::InProgress && run.started_at < stale_before {
                run.status = RunStatus::Failed;
                run.finished_at = Some(now);
                run.error_msg = Some(reason.to_string());
                reaped.push(run.clone());
            }
        }
        Ok(reaped)
    }

    async fn delete_failed_runs_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut runs = write(&self.runs)?;
        let len = runs.len();
        runs.retain(|r| {
            !(r.status == RunStatus::Failed && r.finished_at.map(|f| f < before).unwrap_or(false))
        });
        Ok(len - runs.len())
    }
}

/// In-memory [`IndexBackend`]. Records are kept in insertion order.
#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<Vec<IndexRecord>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn belongs_to(record: &IndexRecord, doc_id: &str) -> bool {
    record.doc_id == doc_id || record.id == doc_id || record.parent_doc_id.as_deref() == Some(doc_id)
}

#[async_trait]
impl IndexBackend for InMemoryIndex {
    async fn replace_records(&self, doc_id: &str, records: &[IndexRecord]) -> Result<()> {
        let mut stored = write(&self.records)?;
        stored.retain(|r| !belongs_to(r, doc_id));
        stored.extend(records.iter().cloned());
        Ok(())
    }

    async fn delete_records(&self, doc_id: &str) -> Result<usize> {
        let mut stored = write(&self.records)?;
        let len = stored.len();
        stored.retain(|r| !belongs_to(r, doc_id));
        Ok(len - stored.len())
    }

    async fn load_records(&self, filters: &[Filter]) -> Result<Vec<IndexRecord>> {
        Ok(read(&self.records)?
            .iter()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<RecordCounts> {
        let stored = read(&self.records)?;
        let chunks = stored.iter().filter(|r| r.is_chunk).count();
        Ok(RecordCounts {
            total: stored.len(),
            full_documents: stored.len() - chunks,
            chunks,
            with_embeddings: stored.iter().filter(|r| r.embedding.is_some()).count(),
        })
    }
}
