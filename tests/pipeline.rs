//! End-to-end sync, prune, and search over a fixture connector.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use filesync::auth::TokenRefresher;
use filesync::connector::{Connector, ConnectorRegistry};
use filesync::db;
use filesync::migrate;
use filesync::sqlite_index::SqliteIndex;
use filesync::sqlite_store::SqliteStore;
use filesync::storage::LocalCopies;
use filesync::sync::SyncOrchestrator;
use filesync_core::chunk::ChunkerConfig;
use filesync_core::models::{
    Credential, FileDescriptor, IndexRecord, Run, RunStatus, RunType, ScopeConfig, SyncScope,
    TokenGrant,
};
use filesync_core::search::{Filter, IndexTier, SearchIndex, SearchRequest};
use filesync_core::store::memory::{InMemoryIndex, InMemoryStore};
use filesync_core::store::{
    CredentialStore, DocumentStore, IndexBackend, RecordCounts, ScopeStore,
};
use filesync_core::{Result, SyncError};

// ============ Fixture connector ============

#[derive(Clone)]
struct FixtureFile {
    source_id: String,
    name: String,
    path: String,
    content: Vec<u8>,
    checksum: String,
}

impl FixtureFile {
    fn new(source_id: &str, path: &str, content: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Self {
            source_id: source_id.to_string(),
            name,
            path: path.to_string(),
            content: content.as_bytes().to_vec(),
            checksum: format!("sha1-{}-{}", source_id, content.len()),
        }
    }
}

#[derive(Default)]
struct FixtureConnector {
    files: Mutex<Vec<FixtureFile>>,
    /// `(access_token, source_id)` pairs the token can no longer see.
    hidden: Mutex<HashSet<(String, String)>>,
    /// Source ids whose download fails.
    broken: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    downloads: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FixtureConnector {
    fn with_files(files: Vec<FixtureFile>) -> Arc<Self> {
        let connector = Self::default();
        *connector.files.lock().unwrap() = files;
        Arc::new(connector)
    }

    fn remove(&self, source_id: &str) {
        self.files
            .lock()
            .unwrap()
            .retain(|f| f.source_id != source_id);
    }

    fn replace(&self, file: FixtureFile) {
        let mut files = self.files.lock().unwrap();
        files.retain(|f| f.source_id != file.source_id);
        files.push(file);
    }

    fn hide(&self, token: &str, source_id: &str) {
        self.hidden
            .lock()
            .unwrap()
            .insert((token.to_string(), source_id.to_string()));
    }
}

#[async_trait]
impl Connector for FixtureConnector {
    fn name(&self) -> &str {
        "fixture"
    }

    fn document_link(&self, source_id: &str) -> Option<String> {
        Some(format!("https://fixture.test/{}", source_id))
    }

    async fn list_all_items(
        &self,
        access_token: &str,
        config: &ScopeConfig,
    ) -> Result<Vec<FileDescriptor>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SyncError::remote("listing unavailable"));
        }
        let hidden = self.hidden.lock().unwrap().clone();
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !hidden.contains(&(access_token.to_string(), f.source_id.clone())))
            .filter(|f| config.admits(&f.name, f.content.len() as u64))
            .map(|f| FileDescriptor {
                source_id: f.source_id.clone(),
                name: f.name.clone(),
                path: f.path.clone(),
                size: f.content.len() as u64,
                modified_at: None,
                checksum: Some(f.checksum.clone()),
            })
            .collect())
    }

    async fn download(&self, _access_token: &str, source_id: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(source_id) {
            return Err(SyncError::remote(format!("download of {} timed out", source_id)));
        }
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.source_id == source_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| SyncError::remote(format!("no such file {}", source_id)))
    }

    fn build_authorize_url(&self, state: &str) -> Result<String> {
        Ok(format!("https://fixture.test/authorize?state={}", state))
    }

    async fn exchange_code_for_tokens(&self, _code: &str) -> Result<TokenGrant> {
        Err(SyncError::auth("exchange not supported"))
    }

    async fn refresh_tokens(&self, _credential: &Credential) -> Result<TokenGrant> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            access_token: format!("fresh-token-{}", n),
            refresh_token: Some(format!("fresh-refresh-{}", n)),
            expires_in: Some(3600),
            scopes: None,
        })
    }

    fn client_credentials(&self) -> (String, String) {
        ("fixture-client".into(), "fixture-secret".into())
    }
}

// ============ Failing stores ============

/// Index backend whose next `delete_records` calls fail.
struct FlakyIndex {
    inner: Arc<InMemoryIndex>,
    failing_deletes: AtomicUsize,
}

#[async_trait]
impl IndexBackend for FlakyIndex {
    async fn replace_records(&self, doc_id: &str, records: &[IndexRecord]) -> Result<()> {
        self.inner.replace_records(doc_id, records).await
    }

    async fn delete_records(&self, doc_id: &str) -> Result<usize> {
        let pending = self.failing_deletes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_deletes.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::index("transient delete failure"));
        }
        self.inner.delete_records(doc_id).await
    }

    async fn load_records(&self, filters: &[Filter]) -> Result<Vec<IndexRecord>> {
        self.inner.load_records(filters).await
    }

    async fn counts(&self) -> Result<RecordCounts> {
        self.inner.counts().await
    }
}

/// Scope store whose next successful `finish_run` calls fail.
struct FlakyScopes {
    inner: Arc<InMemoryStore>,
    failing_success_writes: AtomicUsize,
}

#[async_trait]
impl ScopeStore for FlakyScopes {
    async fn create_scope(&self, scope: &SyncScope) -> Result<()> {
        self.inner.create_scope(scope).await
    }

    async fn get_scope(&self, id: &str) -> Result<Option<SyncScope>> {
        self.inner.get_scope(id).await
    }

    async fn list_scopes(&self) -> Result<Vec<SyncScope>> {
        self.inner.list_scopes().await
    }

    async fn record_sync_success(
        &self,
        scope_id: &str,
        at: DateTime<Utc>,
        new_docs: i64,
    ) -> Result<()> {
        self.inner.record_sync_success(scope_id, at, new_docs).await
    }

    async fn record_attempt_status(&self, scope_id: &str, status: RunStatus) -> Result<()> {
        self.inner.record_attempt_status(scope_id, status).await
    }

    async fn record_prune(&self, scope_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_prune(scope_id, at).await
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        self.inner.create_run(run).await
    }

    async fn finish_run(&self, run: &Run) -> Result<bool> {
        let pending = self.failing_success_writes.load(Ordering::SeqCst);
        if run.status == RunStatus::Success && pending > 0 {
            self.failing_success_writes.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::store("database is locked"));
        }
        self.inner.finish_run(run).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, scope_id: &str, limit: usize) -> Result<Vec<Run>> {
        self.inner.list_runs(scope_id, limit).await
    }

    async fn active_runs(&self, live_since: DateTime<Utc>) -> Result<Vec<Run>> {
        self.inner.active_runs(live_since).await
    }

    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Run>> {
        self.inner.reap_stale_runs(stale_before, reason).await
    }

    async fn delete_failed_runs_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_failed_runs_before(before).await
    }
}

// ============ Harness ============

fn two_file_tree() -> Vec<FixtureFile> {
    vec![
        FixtureFile::new("1", "notes.txt", "Release checklist for the spring launch."),
        FixtureFile::new(
            "2",
            "plans/roadmap.md",
            "Roadmap: migrate the billing service and retire the legacy importer.",
        ),
    ]
}

fn small_chunker() -> ChunkerConfig {
    ChunkerConfig {
        chunk_size: 64,
        overlap_size: 8,
        min_chunk_size: 100,
    }
}

fn credential(id: &str, token: &str, expires_in_secs: i64) -> Credential {
    let now = Utc::now();
    Credential {
        id: id.into(),
        provider: "fixture".into(),
        access_token: Some(token.into()),
        refresh_token: Some(format!("{}-refresh", id)),
        expires_at: Some(now + Duration::seconds(expires_in_secs)),
        client_id: "fixture-client".into(),
        client_secret: "fixture-secret".into(),
        scopes: Vec::new(),
        updated_at: now,
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    backend: Arc<InMemoryIndex>,
    connector: Arc<FixtureConnector>,
    orchestrator: SyncOrchestrator,
}

impl Harness {
    fn new(connector: Arc<FixtureConnector>) -> Self {
        Self::with_stores(
            connector,
            |backend| backend as Arc<dyn IndexBackend>,
            |store| store as Arc<dyn ScopeStore>,
        )
    }

    /// Build with the index backend and scope store wrapped by the caller.
    fn with_stores(
        connector: Arc<FixtureConnector>,
        wrap_index: impl FnOnce(Arc<InMemoryIndex>) -> Arc<dyn IndexBackend>,
        wrap_scopes: impl FnOnce(Arc<InMemoryStore>) -> Arc<dyn ScopeStore>,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(InMemoryIndex::new());
        let index = Arc::new(
            SearchIndex::new(wrap_index(backend.clone()), IndexTier::Advanced)
                .with_chunker(small_chunker()),
        );
        let mut registry = ConnectorRegistry::new();
        registry.register(connector.clone());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            wrap_scopes(store.clone()),
            Arc::new(registry),
            Arc::new(TokenRefresher::new(store.clone())),
            index,
        )
        .with_index_workers(2);
        Self {
            store,
            backend,
            connector,
            orchestrator,
        }
    }

    async fn add_scope(&self, credential: Credential) -> String {
        self.store.save_credential(&credential).await.unwrap();
        let scope = SyncScope::new(
            format!("scope-{}", credential.id),
            "fixture",
            credential.id.clone(),
            ScopeConfig::default(),
        );
        self.store.create_scope(&scope).await.unwrap();
        scope.id
    }

    async fn record_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .backend
            .load_records(&[])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.group_id().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ============ Sync and prune ============

#[tokio::test]
async fn test_sync_then_prune_removes_exactly_the_deleted_file() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;

    let report = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(report.listed, 2);
    assert_eq!(report.new_documents, 2);
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.prune.unwrap().removed_from_store, 0);

    let doc = h.store.get_document("fixture:1").await.unwrap().unwrap();
    assert_eq!(doc.link.as_deref(), Some("https://fixture.test/1"));
    assert!(doc.indexed_at.is_some());
    assert_eq!(doc.chunk_count, 1);
    assert_eq!(h.record_ids().await, vec!["fixture:1", "fixture:2"]);

    h.connector.remove("2");
    let pruned = h.orchestrator.prune(&scope_id).await.unwrap();
    assert_eq!(pruned.removed_from_store, 1);
    assert_eq!(pruned.removed_from_index, 1);

    assert!(h.store.get_document("fixture:2").await.unwrap().is_none());
    assert!(h.store.get_document("fixture:1").await.unwrap().is_some());
    assert_eq!(
        h.store.scope_document_ids(&scope_id).await.unwrap(),
        vec!["fixture:1".to_string()]
    );
    assert_eq!(h.record_ids().await, vec!["fixture:1"]);

    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert!(scope.last_pruned_at.is_some());
}

#[tokio::test]
async fn test_second_prune_removes_nothing() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    h.orchestrator.run_sync(&scope_id).await.unwrap();

    h.connector.remove("1");
    let first = h.orchestrator.prune(&scope_id).await.unwrap();
    assert_eq!(first.removed_from_store, 1);

    let second = h.orchestrator.prune(&scope_id).await.unwrap();
    assert_eq!(second.removed_from_store, 0);
    assert_eq!(second.removed_from_index, 0);
}

#[tokio::test]
async fn test_document_shared_by_two_scopes_survives_one_prune() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_a = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    let scope_b = h.add_scope(credential("cred-b", "token-b", 3600)).await;
    h.orchestrator.run_sync(&scope_a).await.unwrap();
    let report_b = h.orchestrator.run_sync(&scope_b).await.unwrap();
    assert_eq!(report_b.new_documents, 0);
    assert_eq!(report_b.newly_linked, 2);
    assert_eq!(h.store.reference_count("fixture:2").await.unwrap(), 2);

    h.connector.hide("token-a", "2");
    let pruned_a = h.orchestrator.prune(&scope_a).await.unwrap();
    assert_eq!(pruned_a.removed_from_store, 0);
    assert_eq!(pruned_a.removed_from_index, 0);
    assert!(h.store.get_document("fixture:2").await.unwrap().is_some());
    assert_eq!(h.store.reference_count("fixture:2").await.unwrap(), 1);
    assert_eq!(
        h.store.scope_document_ids(&scope_a).await.unwrap(),
        vec!["fixture:1".to_string()]
    );
    assert!(h.record_ids().await.contains(&"fixture:2".to_string()));

    h.connector.hide("token-b", "2");
    let pruned_b = h.orchestrator.prune(&scope_b).await.unwrap();
    assert_eq!(pruned_b.removed_from_store, 1);
    assert!(h.store.get_document("fixture:2").await.unwrap().is_none());
    assert_eq!(h.record_ids().await, vec!["fixture:1"]);
}

#[tokio::test]
async fn test_index_failure_during_prune_is_retried_next_pass() {
    let mut flaky = None;
    let h = Harness::with_stores(
        FixtureConnector::with_files(two_file_tree()),
        |backend| {
            let index = Arc::new(FlakyIndex {
                inner: backend,
                failing_deletes: AtomicUsize::new(0),
            });
            flaky = Some(index.clone());
            index as Arc<dyn IndexBackend>
        },
        |store| store as Arc<dyn ScopeStore>,
    );
    let flaky = flaky.unwrap();
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    h.orchestrator.run_sync(&scope_id).await.unwrap();

    h.connector.remove("1");
    flaky.failing_deletes.store(1, Ordering::SeqCst);
    let err = h.orchestrator.prune(&scope_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Index(_)));
    assert!(err
        .to_string()
        .contains("1 of 1 removed documents could not be pruned"));

    // Nothing was dropped, so the document is still tracked for the retry.
    assert!(h.store.get_document("fixture:1").await.unwrap().is_some());
    assert!(h
        .store
        .scope_document_ids(&scope_id)
        .await
        .unwrap()
        .contains(&"fixture:1".to_string()));
    let prune_run = h
        .store
        .list_runs(&scope_id, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.run_type == RunType::Prune && r.status == RunStatus::Failed);
    assert!(prune_run.is_some());

    let retried = h.orchestrator.prune(&scope_id).await.unwrap();
    assert_eq!(retried.removed_from_store, 1);
    assert_eq!(retried.removed_from_index, 1);
    assert!(h.store.get_document("fixture:1").await.unwrap().is_none());
    assert_eq!(h.record_ids().await, vec!["fixture:2"]);
}

#[tokio::test]
async fn test_unchanged_files_are_not_downloaded_again() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;

    h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(h.connector.downloads.load(Ordering::SeqCst), 2);

    let second = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(second.listed, 2);
    assert_eq!(second.new_documents, 0);
    assert_eq!(second.indexed, 0);
    assert_eq!(h.connector.downloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_changed_checksum_reindexes_the_document() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    h.orchestrator.run_sync(&scope_id).await.unwrap();

    h.connector.replace(FixtureFile::new(
        "1",
        "notes.txt",
        "Release checklist, revised: add the observatory telemetry review.",
    ));
    let report = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.reindexed, 1);
    assert_eq!(report.newly_indexed(), 0);
    assert_eq!(h.connector.downloads.load(Ordering::SeqCst), 3);

    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.total_docs_indexed, 2);
    let latest = h
        .store
        .list_runs(&scope_id, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.run_type != RunType::Prune)
        .unwrap();
    assert_eq!(latest.run_type, RunType::Incremental);
    assert_eq!(latest.new_docs_indexed, 0);

    let response = h
        .orchestrator
        .index()
        .search(&SearchRequest::new("observatory"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "fixture:1");
}

#[tokio::test]
async fn test_scope_filters_limit_what_is_tracked() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    h.store
        .save_credential(&credential("cred-a", "token-a", 3600))
        .await
        .unwrap();
    let scope = SyncScope::new(
        "markdown only",
        "fixture",
        "cred-a",
        ScopeConfig {
            include_exts: vec!["md".into()],
            ..ScopeConfig::default()
        },
    );
    h.store.create_scope(&scope).await.unwrap();

    let report = h.orchestrator.run_sync(&scope.id).await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(
        h.store.scope_document_ids(&scope.id).await.unwrap(),
        vec!["fixture:2".to_string()]
    );
}

// ============ Tokens and run bookkeeping ============

#[tokio::test]
async fn test_expired_token_is_refreshed_once_across_passes() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "stale-token", -60)).await;

    h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(h.connector.refreshes.load(Ordering::SeqCst), 1);

    let saved = h.store.get_credential("cred-a").await.unwrap().unwrap();
    assert_eq!(saved.access_token.as_deref(), Some("fresh-token-1"));
    assert_eq!(saved.refresh_token.as_deref(), Some("fresh-refresh-1"));

    h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(h.connector.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listing_failure_fails_the_run_and_recovery_succeeds() {
    let h = Harness::new(FixtureConnector::with_files(two_file_tree()));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;

    h.connector.fail_listing.store(true, Ordering::SeqCst);
    let err = h.orchestrator.run_sync(&scope_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));

    let runs = h.store.list_runs(&scope_id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].run_type, RunType::Backfill);
    assert!(runs[0].finished_at.is_some());
    assert!(runs[0]
        .error_msg
        .as_deref()
        .unwrap()
        .contains("listing unavailable"));

    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.last_attempt_status, RunStatus::Failed);
    assert!(scope.last_successful_at.is_none());
    assert!(h.store.list_documents().await.unwrap().is_empty());

    h.connector.fail_listing.store(false, Ordering::SeqCst);
    h.orchestrator.run_sync(&scope_id).await.unwrap();

    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.last_attempt_status, RunStatus::Success);
    assert!(scope.last_successful_at.is_some());
    assert_eq!(scope.total_docs_indexed, 2);

    let sync_runs: Vec<_> = h
        .store
        .list_runs(&scope_id, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.run_type != RunType::Prune)
        .collect();
    assert_eq!(sync_runs.len(), 2);
    assert_eq!(sync_runs[0].status, RunStatus::Success);
    assert_eq!(sync_runs[0].new_docs_indexed, 2);
}

#[tokio::test]
async fn test_run_fails_when_success_cannot_be_recorded() {
    let h = Harness::with_stores(
        FixtureConnector::with_files(two_file_tree()),
        |backend| backend as Arc<dyn IndexBackend>,
        |store| {
            Arc::new(FlakyScopes {
                inner: store,
                failing_success_writes: AtomicUsize::new(1),
            }) as Arc<dyn ScopeStore>
        },
    );
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;

    let err = h.orchestrator.run_sync(&scope_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));

    let runs = h.store.list_runs(&scope_id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].finished_at.is_some());
    assert!(runs[0]
        .error_msg
        .as_deref()
        .unwrap()
        .contains("database is locked"));
    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.last_attempt_status, RunStatus::Failed);

    h.orchestrator.run_sync(&scope_id).await.unwrap();
    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.last_attempt_status, RunStatus::Success);
    assert!(h
        .store
        .list_runs(&scope_id, 10)
        .await
        .unwrap()
        .iter()
        .all(|r| r.status != RunStatus::InProgress));
}

#[tokio::test]
async fn test_unknown_scope_is_an_error() {
    let h = Harness::new(FixtureConnector::with_files(Vec::new()));
    let err = h.orchestrator.run_sync("missing").await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));
}

#[tokio::test]
async fn test_download_failure_fails_the_run_but_keeps_indexed_documents() {
    let mut files = two_file_tree();
    files.push(FixtureFile::new("3", "ghost.txt", "Shortly unavailable content."));
    let h = Harness::new(FixtureConnector::with_files(files));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    h.connector.broken.lock().unwrap().insert("3".to_string());

    let err = h.orchestrator.run_sync(&scope_id).await.unwrap_err();
    assert!(err.to_string().contains("1 of 3 documents failed to index"));

    let indexed = h.store.get_document("fixture:1").await.unwrap().unwrap();
    assert!(indexed.indexed_at.is_some());
    let pending = h.store.get_document("fixture:3").await.unwrap().unwrap();
    assert!(pending.indexed_at.is_none());

    let scope = h.store.get_scope(&scope_id).await.unwrap().unwrap();
    assert_eq!(scope.last_attempt_status, RunStatus::Failed);

    h.connector.broken.lock().unwrap().clear();
    let before = h.connector.downloads.load(Ordering::SeqCst);
    let report = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(h.connector.downloads.load(Ordering::SeqCst), before + 1);
}

// ============ Search ============

fn handbook() -> String {
    let filler = "The operations handbook explains how on-call rotations hand over \
                  open incidents, which dashboards to watch, and how to page the owning team.";
    let mut paragraphs: Vec<String> = (0..8).map(|i| format!("Section {}. {}", i, filler)).collect();
    paragraphs[5] = format!(
        "Section 5. The zeppelin hangar maintenance window is announced a week ahead. {}",
        filler
    );
    paragraphs.join("\n\n")
}

#[tokio::test]
async fn test_long_document_is_found_by_keyword_with_chunk_counts() {
    let mut files = two_file_tree();
    files.push(FixtureFile::new("3", "handbook.md", &handbook()));
    let h = Harness::new(FixtureConnector::with_files(files));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;
    h.orchestrator.run_sync(&scope_id).await.unwrap();

    let records = h.backend.load_records(&[]).await.unwrap();
    let chunks: Vec<_> = records
        .iter()
        .filter(|r| r.parent_doc_id.as_deref() == Some("fixture:3"))
        .collect();
    assert!(chunks.len() >= 2);
    assert!(chunks.iter().all(|r| r.is_chunk));

    let doc = h.store.get_document("fixture:3").await.unwrap().unwrap();
    assert_eq!(doc.chunk_count, chunks.len() as i64);

    let response = h
        .orchestrator
        .index()
        .search(&SearchRequest::new("zeppelin hangar"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert_eq!(hit.doc_id, "fixture:3");
    assert_eq!(hit.link.as_deref(), Some("https://fixture.test/3"));
    assert!(hit.total_chunks >= 2);
    assert!(hit.matched_chunks >= 1);
}

// ============ File formats ============

fn docx_with_text(phrase: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[tokio::test]
async fn test_office_text_is_searchable_and_binaries_are_skipped() {
    let h = Harness::new(FixtureConnector::with_files(vec![
        FixtureFile {
            source_id: "10".into(),
            name: "minutes.docx".into(),
            path: "board/minutes.docx".into(),
            content: docx_with_text("office test phrase about the lighthouse budget"),
            checksum: "docx-1".into(),
        },
        FixtureFile {
            source_id: "11".into(),
            name: "logo.png".into(),
            path: "assets/logo.png".into(),
            content: vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3],
            checksum: "png-1".into(),
        },
    ]));
    let scope_id = h.add_scope(credential("cred-a", "token-a", 3600)).await;

    let report = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(report.listed, 2);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.skipped_empty, 1);

    // Skipped documents count as processed and are not fetched again.
    let logo = h.store.get_document("fixture:11").await.unwrap().unwrap();
    assert!(logo.indexed_at.is_some());
    assert_eq!(logo.chunk_count, 0);
    let again = h.orchestrator.run_sync(&scope_id).await.unwrap();
    assert_eq!(again.indexed + again.skipped_empty, 0);

    let response = h
        .orchestrator
        .index()
        .search(&SearchRequest::new("lighthouse"))
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].doc_id, "fixture:10");
    assert_eq!(response.results[0].file_type, "document");
}

// ============ SQLite-backed pipeline ============

#[tokio::test]
async fn test_sqlite_pipeline_with_local_copies() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("filesync.sqlite"))
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let index = Arc::new(SearchIndex::new(
        Arc::new(SqliteIndex::new(pool.clone())),
        IndexTier::Advanced,
    ));
    let connector = FixtureConnector::with_files(two_file_tree());
    let mut registry = ConnectorRegistry::new();
    registry.register(connector.clone());
    let copies = Arc::new(LocalCopies::new(tmp.path().join("documents")));
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        store.clone(),
        Arc::new(registry),
        Arc::new(TokenRefresher::new(store.clone())),
        index.clone(),
    )
    .with_local_copies(copies.clone());

    store
        .save_credential(&credential("cred-a", "token-a", 3600))
        .await
        .unwrap();
    let scope = SyncScope::new("docs", "fixture", "cred-a", ScopeConfig::default());
    store.create_scope(&scope).await.unwrap();

    let report = orchestrator.run_sync(&scope.id).await.unwrap();
    assert_eq!(report.indexed, 2);
    assert!(copies.read_sidecar("1").await.is_some());
    assert!(copies.read_sidecar("2").await.is_some());
    let doc = store.get_document("fixture:2").await.unwrap().unwrap();
    assert!(doc.storage_path.is_some());

    connector.remove("2");
    let pruned = orchestrator.prune(&scope.id).await.unwrap();
    assert_eq!(pruned.removed_from_store, 1);
    assert_eq!(pruned.removed_local_copies, 1);
    assert_eq!(pruned.removed_from_index, 1);
    assert!(copies.read_sidecar("2").await.is_none());
    assert!(store.get_document("fixture:2").await.unwrap().is_none());

    let response = index
        .search(&SearchRequest::new("billing"))
        .await
        .unwrap();
    assert!(response.results.is_empty());

    pool.close().await;
}
