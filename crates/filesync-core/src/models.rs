//! Core data models shared by the sync pipeline.
//!
//! | Type | Role |
//! |------|------|
//! | [`Credential`] | OAuth access/refresh tokens for one provider account |
//! | [`SyncScope`] | A connector + credential pairing with provider config |
//! | [`FileDescriptor`] | A remote file as listed by the enumerator (transient) |
//! | [`DocumentRecord`] | System-of-record entry for one source id |
//! | [`Chunk`] | A span of extracted text sized for retrieval |
//! | [`Run`] | Bookkeeping for one sync or prune pass |
//! | [`IndexRecord`] | A retrievable unit stored in the search index |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Tokens are treated as expired this many seconds before `expires_at`.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Lifetime assumed when a token response omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// OAuth-style credentials for one provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Provider tag, matching a registered connector name (e.g. `"box"`).
    pub provider: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token must be refreshed before use at `now`.
    ///
    /// A missing token or unknown expiry always needs a refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) if !token.is_empty() => {
                now >= expires_at - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
            }
            _ => true,
        }
    }

    /// Apply a token grant in place.
    ///
    /// Refresh tokens may rotate: a grant without one keeps the prior value.
    pub fn apply_grant(&mut self, grant: TokenGrant, now: DateTime<Utc>) {
        let lifetime = grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        self.access_token = Some(grant.access_token);
        if let Some(refresh) = grant.refresh_token {
            self.refresh_token = Some(refresh);
        }
        if let Some(scopes) = grant.scopes {
            self.scopes = scopes;
        }
        self.expires_at = Some(now + Duration::seconds(lifetime));
        self.updated_at = now;
    }
}

/// Tokens returned by a provider's token endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// Provider configuration for a sync scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Root folders to walk. `"0"` is the account root.
    #[serde(default = "default_folder_ids")]
    pub folder_ids: Vec<String>,
    /// Lowercase extensions without the dot. Empty means all.
    #[serde(default)]
    pub include_exts: Vec<String>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

fn default_folder_ids() -> Vec<String> {
    vec!["0".to_string()]
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            folder_ids: default_folder_ids(),
            include_exts: Vec::new(),
            max_size_mb: None,
        }
    }
}

impl ScopeConfig {
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Inclusion policy for a file: extension allow-list and size cap.
    pub fn admits(&self, name: &str, size: u64) -> bool {
        if !self.include_exts.is_empty() {
            let ext = file_extension(name);
            let allowed = ext
                .as_deref()
                .map(|e| self.include_exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false);
            if !allowed {
                return false;
            }
        }
        match self.max_size_bytes() {
            Some(max) => size <= max,
            None => true,
        }
    }
}

/// Lowercase extension of a file name, without the dot.
pub fn file_extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A connector + credential pairing that is synced as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncScope {
    pub id: String,
    pub name: String,
    /// Registered connector name.
    pub connector: String,
    pub credential_id: String,
    pub config: ScopeConfig,
    pub last_successful_at: Option<DateTime<Utc>>,
    pub last_attempt_status: RunStatus,
    pub last_pruned_at: Option<DateTime<Utc>>,
    pub total_docs_indexed: i64,
    pub created_at: DateTime<Utc>,
}

impl SyncScope {
    pub fn new(
        name: impl Into<String>,
        connector: impl Into<String>,
        credential_id: impl Into<String>,
        config: ScopeConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            connector: connector.into(),
            credential_id: credential_id.into(),
            config,
            last_successful_at: None,
            last_attempt_status: RunStatus::NotStarted,
            last_pruned_at: None,
            total_docs_indexed: 0,
            created_at: Utc::now(),
        }
    }

    /// Whether an incremental pass should be dispatched at `now`.
    ///
    /// Due when the scope never succeeded, its last attempt failed or never
    /// started, or its last success is older than `refresh_interval`.
    /// Callers still exclude scopes with a live run.
    pub fn is_due_for_sync(&self, now: DateTime<Utc>, refresh_interval: Duration) -> bool {
        if matches!(
            self.last_attempt_status,
            RunStatus::Failed | RunStatus::NotStarted
        ) {
            return true;
        }
        match self.last_successful_at {
            None => true,
            Some(at) => at < now - refresh_interval,
        }
    }

    pub fn is_due_for_prune(&self, now: DateTime<Utc>, prune_interval: Duration) -> bool {
        self.last_pruned_at
            .map(|at| at < now - prune_interval)
            .unwrap_or(true)
    }

    /// `Backfill` until the first success, `Incremental` afterwards.
    pub fn next_run_type(&self) -> RunType {
        if self.last_successful_at.is_none() {
            RunType::Backfill
        } else {
            RunType::Incremental
        }
    }
}

/// A remote file as listed by the enumerator. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    /// Provider-native id (without the provider prefix).
    pub source_id: String,
    pub name: String,
    /// Slash-separated path from the walked root.
    pub path: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

impl FileDescriptor {
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.name)
    }
}

/// System-of-record entry for one source id.
///
/// Scope membership lives in a separate join so a document shared by two
/// scopes survives until neither references it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    /// Globally unique, provider-prefixed id (e.g. `box:123`).
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub link: Option<String>,
    pub checksum: Option<String>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub storage_path: Option<String>,
    pub chunk_count: i64,
    pub indexed_at: Option<DateTime<Utc>>,
    pub hidden: bool,
}

impl DocumentRecord {
    pub fn from_descriptor(id: String, link: Option<String>, file: &FileDescriptor) -> Self {
        Self {
            id,
            source_id: file.source_id.clone(),
            title: file.name.clone(),
            link,
            checksum: file.checksum.clone(),
            remote_modified_at: file.modified_at,
            updated_at: Utc::now(),
            storage_path: None,
            chunk_count: 0,
            indexed_at: None,
            hidden: false,
        }
    }

    /// Whether the remote content differs from what was last recorded.
    pub fn content_changed(&self, file: &FileDescriptor) -> bool {
        match (&self.checksum, &file.checksum) {
            (Some(old), Some(new)) => old != new,
            _ => self.remote_modified_at != file.modified_at,
        }
    }
}

/// Result of an idempotent document upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Existing row whose checksum or modified time changed.
    Changed,
    Unchanged,
}

/// A retrieval-sized span of a document's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// `{parent_doc_id}#chunk_{ordinal}`.
    pub id: String,
    pub parent_doc_id: String,
    /// Zero-based, contiguous within the parent.
    pub ordinal: usize,
    /// Byte offset of the first character (inclusive).
    pub start_char: usize,
    /// Byte offset one past the last character (exclusive).
    pub end_char: usize,
    pub text: String,
    pub token_count: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Backfill,
    Incremental,
    Prune,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Backfill => "BACKFILL",
            RunType::Incremental => "INCREMENTAL",
            RunType::Prune => "PRUNE",
        }
    }
}

impl FromStr for RunType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKFILL" => Ok(RunType::Backfill),
            "INCREMENTAL" => Ok(RunType::Incremental),
            "PRUNE" => Ok(RunType::Prune),
            other => Err(SyncError::store(format!("unknown run type '{}'", other))),
        }
    }
}

/// `NOT_STARTED → IN_PROGRESS → {SUCCESS, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotStarted => "NOT_STARTED",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(RunStatus::NotStarted),
            "IN_PROGRESS" => Ok(RunStatus::InProgress),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(SyncError::store(format!("unknown run status '{}'", other))),
        }
    }
}

/// One sync or prune pass over a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub id: String,
    pub scope_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub new_docs_indexed: i64,
    pub docs_removed: i64,
    pub error_msg: Option<String>,
}

impl Run {
    /// A fresh `IN_PROGRESS` run.
    pub fn start(scope_id: &str, run_type: RunType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope_id: scope_id.to_string(),
            run_type,
            status: RunStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            new_docs_indexed: 0,
            docs_removed: 0,
            error_msg: None,
        }
    }
}

/// Counters produced by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed_from_store: usize,
    pub removed_local_copies: usize,
    pub removed_from_index: usize,
}

/// A retrievable unit in the search index: a whole document or one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Record id: the document id, or the chunk id for chunk records.
    pub id: String,
    pub doc_id: String,
    pub parent_doc_id: Option<String>,
    pub title: String,
    pub text: String,
    pub search_text: String,
    pub content_preview: String,
    pub link: Option<String>,
    pub is_chunk: bool,
    pub chunk_index: usize,
    pub chunk_start: Option<usize>,
    pub chunk_end: Option<usize>,
    pub token_count: usize,
    /// Number of chunk records the parent document was indexed as.
    pub total_chunks: usize,
    pub file_type: String,
    pub quality_score: f64,
    pub indexed_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl IndexRecord {
    /// The id results are grouped under.
    pub fn group_id(&self) -> &str {
        self.parent_doc_id.as_deref().unwrap_or(&self.doc_id)
    }
}
