//! Sync orchestration and reconciliation.
//!
//! One pass over a scope:
//!
//! ```text
//! token ─▶ list_all_items ─▶ upsert + link ─▶ index new/changed (bounded pool)
//!                                               │
//!                     run SUCCESS/FAILED ◀──────┘
//!                               │
//!              local copies (best-effort) ─▶ prune (best-effort)
//! ```
//!
//! Documents are written before they are indexed, and a document only
//! gets `indexed_at` once all of its records are in the index. A failed
//! pass leaves earlier documents in place; anything not yet indexed is
//! picked up again by the next pass.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use filesync_core::models::{
    DocumentRecord, FileDescriptor, PruneReport, Run, RunStatus, RunType, SyncScope,
    UpsertOutcome,
};
use filesync_core::search::{IndexDocument, IndexOutcome, SearchIndex};
use filesync_core::store::{DocumentStore, ScopeStore};
use filesync_core::{Result, SyncError};

use crate::auth::TokenRefresher;
use crate::connector::{Connector, ConnectorRegistry};
use crate::extract::extract_text_from_bytes;
use crate::storage::{CopyReport, LocalCopies};

const DEFAULT_INDEX_WORKERS: usize = 4;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub scope_id: String,
    pub listed: usize,
    pub new_documents: usize,
    pub newly_linked: usize,
    pub changed: usize,
    /// Documents written to the index, re-indexed ones included.
    pub indexed: usize,
    /// The part of `indexed` that replaced records after a checksum change.
    pub reindexed: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub copies: Option<CopyReport>,
    /// `None` when prune failed or another prune of the scope was running.
    pub prune: Option<PruneReport>,
}

impl SyncReport {
    /// Documents indexed for the first time in this pass.
    pub fn newly_indexed(&self) -> usize {
        self.indexed - self.reindexed
    }
}

pub type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Membership of a scope in an in-flight set, released on drop.
pub struct InFlight {
    set: InFlightSet,
    scope_id: String,
}

impl InFlight {
    pub fn claim(set: &InFlightSet, scope_id: &str) -> Option<Self> {
        let mut guard = set.lock().ok()?;
        if !guard.insert(scope_id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            scope_id: scope_id.to_string(),
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.set.lock() {
            guard.remove(&self.scope_id);
        }
    }
}

pub(crate) fn in_flight(set: &InFlightSet, scope_id: &str) -> bool {
    set.lock().map(|s| s.contains(scope_id)).unwrap_or(false)
}

struct PendingIndex {
    doc: DocumentRecord,
    file: FileDescriptor,
    changed: bool,
}

pub struct SyncOrchestrator {
    documents: Arc<dyn DocumentStore>,
    scopes: Arc<dyn ScopeStore>,
    connectors: Arc<ConnectorRegistry>,
    tokens: Arc<TokenRefresher>,
    index: Arc<SearchIndex>,
    copies: Option<Arc<LocalCopies>>,
    index_workers: usize,
    pruning: InFlightSet,
}

impl SyncOrchestrator {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        scopes: Arc<dyn ScopeStore>,
        connectors: Arc<ConnectorRegistry>,
        tokens: Arc<TokenRefresher>,
        index: Arc<SearchIndex>,
    ) -> Self {
        Self {
            documents,
            scopes,
            connectors,
            tokens,
            index,
            copies: None,
            index_workers: DEFAULT_INDEX_WORKERS,
            pruning: InFlightSet::default(),
        }
    }

    pub fn with_local_copies(mut self, copies: Arc<LocalCopies>) -> Self {
        self.copies = Some(copies);
        self
    }

    pub fn with_index_workers(mut self, workers: usize) -> Self {
        self.index_workers = workers.max(1);
        self
    }

    pub fn scopes(&self) -> &Arc<dyn ScopeStore> {
        &self.scopes
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    pub fn local_copies(&self) -> Option<&Arc<LocalCopies>> {
        self.copies.as_ref()
    }

    async fn load_scope(&self, scope_id: &str) -> Result<SyncScope> {
        self.scopes
            .get_scope(scope_id)
            .await?
            .ok_or_else(|| SyncError::store(format!("scope '{}' not found", scope_id)))
    }

    /// Create the `IN_PROGRESS` run for a pass and mark the scope as
    /// attempting. The pass itself runs in [`execute`](Self::execute).
    pub async fn start_run(&self, scope_id: &str) -> Result<(SyncScope, Run)> {
        let scope = self.load_scope(scope_id).await?;
        let run = Run::start(&scope.id, scope.next_run_type());
        self.scopes.create_run(&run).await?;
        self.scopes
            .record_attempt_status(&scope.id, RunStatus::InProgress)
            .await?;
        info!(scope = %scope.id, run = %run.id, run_type = run.run_type.as_str(), "run started");
        Ok((scope, run))
    }

    /// Start and execute a pass in one call.
    pub async fn run_sync(&self, scope_id: &str) -> Result<SyncReport> {
        let (scope, run) = self.start_run(scope_id).await?;
        self.execute(&scope, run).await
    }

    /// Drive `run` to a terminal state.
    #[instrument(skip_all, fields(scope = %scope.id, run = %run.id))]
    pub async fn execute(&self, scope: &SyncScope, mut run: Run) -> Result<SyncReport> {
        let mut report = SyncReport {
            run_id: run.id.clone(),
            scope_id: scope.id.clone(),
            ..SyncReport::default()
        };

        let outcome = self.sync_pass(scope, &mut report).await;
        let now = Utc::now();
        run.finished_at = Some(now);
        run.new_docs_indexed = report.newly_indexed() as i64;

        let outcome = match outcome {
            Ok(()) => self.record_success(scope, &mut run, &report).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            run.status = RunStatus::Failed;
            run.error_msg = Some(e.to_string());
            if let Err(store_err) = self.scopes.finish_run(&run).await {
                error!(error = %store_err, "could not record failed run");
            }
            if let Err(store_err) = self
                .scopes
                .record_attempt_status(&scope.id, RunStatus::Failed)
                .await
            {
                error!(error = %store_err, "could not record failed attempt");
            }
            warn!(error = %e, "sync pass failed");
            return Err(e);
        }

        info!(
            listed = report.listed,
            new = report.new_documents,
            indexed = report.indexed,
            "sync pass succeeded"
        );

        report.copies = match self.sync_local_copies(scope).await {
            Ok(copies) => copies,
            Err(e) => {
                warn!(error = %e, "local copy sync failed; run stays successful");
                None
            }
        };
        report.prune = match self.claim_prune(&scope.id) {
            Some(claim) => match self.prune_claimed(&claim).await {
                Ok(pruned) => Some(pruned),
                Err(e) => {
                    warn!(error = %e, "prune after sync failed; run stays successful");
                    None
                }
            },
            None => {
                info!("prune already in flight; skipped after sync");
                None
            }
        };

        Ok(report)
    }

    async fn record_success(
        &self,
        scope: &SyncScope,
        run: &mut Run,
        report: &SyncReport,
    ) -> Result<()> {
        run.status = RunStatus::Success;
        self.scopes.finish_run(run).await?;
        let at = run.finished_at.unwrap_or_else(Utc::now);
        self.scopes
            .record_sync_success(&scope.id, at, report.newly_indexed() as i64)
            .await
    }

    async fn sync_pass(&self, scope: &SyncScope, report: &mut SyncReport) -> Result<()> {
        let connector = self.connectors.get(&scope.connector)?;
        let token = self
            .tokens
            .get_valid_access_token(&scope.credential_id, connector.as_ref())
            .await?;

        let files = connector.list_all_items(&token, &scope.config).await?;
        report.listed = files.len();
        debug!(files = files.len(), "listed remote files");

        let mut pending = Vec::new();
        for file in files {
            let doc_id = connector.document_id(&file.source_id);
            let record =
                DocumentRecord::from_descriptor(doc_id, connector.document_link(&file.source_id), &file);
            let outcome = self.documents.upsert_document(&record).await?;
            let linked = self.documents.link_scope(&scope.id, &record.id).await?;

            match outcome {
                UpsertOutcome::Inserted => report.new_documents += 1,
                UpsertOutcome::Changed => report.changed += 1,
                UpsertOutcome::Unchanged => {}
            }
            if linked {
                report.newly_linked += 1;
            }

            let needs_index = match outcome {
                UpsertOutcome::Inserted | UpsertOutcome::Changed => true,
                UpsertOutcome::Unchanged if linked => true,
                UpsertOutcome::Unchanged => self
                    .documents
                    .get_document(&record.id)
                    .await?
                    .map(|d| d.indexed_at.is_none())
                    .unwrap_or(true),
            };
            if needs_index {
                pending.push(PendingIndex {
                    doc: record,
                    file,
                    changed: outcome == UpsertOutcome::Changed,
                });
            }
        }

        let total = pending.len();
        let results: Vec<(String, bool, Result<IndexOutcome>)> = stream::iter(pending)
            .map(|item| {
                let connector = connector.clone();
                let token = token.as_str();
                async move {
                    let result = self.index_one(connector.as_ref(), token, &item).await;
                    (item.doc.id, item.changed, result)
                }
            })
            .buffer_unordered(self.index_workers)
            .collect()
            .await;

        let mut first_failure = None;
        for (doc_id, changed, result) in results {
            match result {
                Ok(IndexOutcome::Indexed { .. }) => {
                    report.indexed += 1;
                    if changed {
                        report.reindexed += 1;
                    }
                }
                Ok(IndexOutcome::Skipped { .. }) => report.skipped_empty += 1,
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "document not indexed");
                    report.failed += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(e) => Err(with_context(
                e,
                format!("{} of {} documents failed to index", report.failed, total),
            )),
        }
    }

    async fn index_one(
        &self,
        connector: &dyn Connector,
        token: &str,
        item: &PendingIndex,
    ) -> Result<IndexOutcome> {
        let bytes = connector.download(token, &item.file.source_id).await?;

        if let Some(copies) = &self.copies {
            match copies.store_copy(&item.doc, &bytes).await {
                Ok(path) => {
                    let path = path.to_string_lossy();
                    self.documents
                        .set_storage_path(&item.doc.id, Some(&path))
                        .await?;
                }
                Err(e) => warn!(doc_id = %item.doc.id, error = %e, "local copy failed"),
            }
        }

        let name = item.file.name.clone();
        let text = match tokio::task::spawn_blocking(move || extract_text_from_bytes(&bytes, &name))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(doc_id = %item.doc.id, error = %e, "extraction task failed");
                String::new()
            }
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("path".into(), item.file.path.clone().into());
        metadata.insert("size".into(), item.file.size.into());
        if let Some(modified) = item.file.modified_at {
            metadata.insert("modified_at".into(), modified.to_rfc3339().into());
        }

        let outcome = self
            .index
            .index(&IndexDocument {
                doc_id: item.doc.id.clone(),
                title: item.doc.title.clone(),
                text,
                link: item.doc.link.clone(),
                file_name: Some(item.file.name.clone()),
                metadata,
            })
            .await?;

        self.documents
            .mark_indexed(&item.doc.id, outcome.record_count() as i64, Utc::now())
            .await?;
        Ok(outcome)
    }

    async fn sync_local_copies(&self, scope: &SyncScope) -> Result<Option<CopyReport>> {
        let Some(copies) = &self.copies else {
            return Ok(None);
        };
        let connector = self.connectors.get(&scope.connector)?;
        let token = self
            .tokens
            .get_valid_access_token(&scope.credential_id, connector.as_ref())
            .await?;
        let report = copies
            .sync_scope(self.documents.as_ref(), &scope.id, connector.as_ref(), &token)
            .await?;
        Ok(Some(report))
    }

    /// Claim the scope's prune slot. `None` while another prune of the
    /// scope is running in this process.
    pub fn claim_prune(&self, scope_id: &str) -> Option<InFlight> {
        InFlight::claim(&self.pruning, scope_id)
    }

    pub fn is_pruning(&self, scope_id: &str) -> bool {
        in_flight(&self.pruning, scope_id)
    }

    /// Remove documents this scope tracks but the remote no longer lists.
    ///
    /// Fails without touching anything if a prune of the scope is
    /// already running.
    pub async fn prune(&self, scope_id: &str) -> Result<PruneReport> {
        let claim = self.claim_prune(scope_id).ok_or_else(|| {
            SyncError::store(format!("prune of scope '{}' already in flight", scope_id))
        })?;
        self.prune_claimed(&claim).await
    }

    /// Prune under a claim from [`claim_prune`](Self::claim_prune).
    ///
    /// A document leaves the store, the local cache, and the index only
    /// when no other scope still links it.
    #[instrument(skip_all, fields(scope = claim.scope_id()))]
    pub async fn prune_claimed(&self, claim: &InFlight) -> Result<PruneReport> {
        let scope = self.load_scope(claim.scope_id()).await?;
        let mut run = Run::start(&scope.id, RunType::Prune);
        self.scopes.create_run(&run).await?;

        let mut report = PruneReport::default();
        let result = self.prune_pass(&scope, &mut report).await;
        let now = Utc::now();
        run.finished_at = Some(now);
        run.docs_removed = report.removed_from_store as i64;

        let result = match result {
            Ok(()) => self.record_prune(&scope, &mut run, now).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(
                    removed_from_store = report.removed_from_store,
                    removed_local_copies = report.removed_local_copies,
                    removed_from_index = report.removed_from_index,
                    "prune finished"
                );
                Ok(report)
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error_msg = Some(e.to_string());
                if let Err(store_err) = self.scopes.finish_run(&run).await {
                    error!(error = %store_err, "could not record failed prune run");
                }
                warn!(error = %e, "prune failed");
                Err(e)
            }
        }
    }

    async fn record_prune(
        &self,
        scope: &SyncScope,
        run: &mut Run,
        at: DateTime<Utc>,
    ) -> Result<()> {
        run.status = RunStatus::Success;
        self.scopes.finish_run(run).await?;
        self.scopes.record_prune(&scope.id, at).await
    }

    async fn prune_pass(&self, scope: &SyncScope, report: &mut PruneReport) -> Result<()> {
        let connector = self.connectors.get(&scope.connector)?;
        let token = self
            .tokens
            .get_valid_access_token(&scope.credential_id, connector.as_ref())
            .await?;

        let remote: HashSet<String> = connector
            .list_all_items(&token, &scope.config)
            .await?
            .iter()
            .map(|file| connector.document_id(&file.source_id))
            .collect();

        let gone: Vec<String> = self
            .documents
            .scope_document_ids(&scope.id)
            .await?
            .into_iter()
            .filter(|id| !remote.contains(id))
            .collect();

        let mut failed = 0;
        let mut first_failure = None;
        for doc_id in &gone {
            if let Err(e) = self.prune_document(scope, doc_id, report).await {
                warn!(doc_id = %doc_id, error = %e, "document not pruned; kept for the next pass");
                failed += 1;
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            None => Ok(()),
            Some(e) => Err(with_context(
                e,
                format!("{} of {} removed documents could not be pruned", failed, gone.len()),
            )),
        }
    }

    /// Drop one document the remote no longer lists.
    ///
    /// Index records and the local copy go before the store row, so the
    /// membership link survives any failure and the next pass retries.
    async fn prune_document(
        &self,
        scope: &SyncScope,
        doc_id: &str,
        report: &mut PruneReport,
    ) -> Result<()> {
        if self.documents.reference_count(doc_id).await? > 1 {
            self.documents.unlink_scope(&scope.id, doc_id).await?;
            debug!(doc_id, "still linked by another scope");
            return Ok(());
        }

        if self.index.delete(doc_id).await? > 0 {
            report.removed_from_index += 1;
        }
        let doc = self.documents.get_document(doc_id).await?;
        if let (Some(copies), Some(doc)) = (&self.copies, &doc) {
            match copies.remove_copy(&doc.source_id).await {
                Ok(true) => report.removed_local_copies += 1,
                Ok(false) => {}
                Err(e) => warn!(doc_id, error = %e, "could not remove local copy"),
            }
        }
        // Drops every link with the row; a scope that linked it meanwhile
        // re-inserts and re-indexes it on its next pass.
        if self.documents.delete_document(doc_id).await? {
            report.removed_from_store += 1;
        }
        Ok(())
    }
}

fn with_context(e: SyncError, context: String) -> SyncError {
    match e {
        SyncError::Auth(msg) => SyncError::Auth(format!("{}: {}", context, msg)),
        SyncError::Remote(msg) => SyncError::Remote(format!("{}: {}", context, msg)),
        SyncError::Store(msg) => SyncError::Store(format!("{}: {}", context, msg)),
        SyncError::Index(msg) => SyncError::Index(format!("{}: {}", context, msg)),
        SyncError::Extraction(msg) => SyncError::Extraction(format!("{}: {}", context, msg)),
    }
}
