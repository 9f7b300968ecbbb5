//! Local copies of synced originals.
//!
//! Copies live under `<documents_dir>/files/` as `{source_id}_{name}` with a
//! JSON sidecar per file under `<documents_dir>/metadata/{source_id}.json`.
//! The sidecar records what the copy was taken from, so a later pass only
//! re-downloads files whose remote checksum or modified time moved.
//!
//! Everything here is best-effort from the orchestrator's point of view: a
//! failed copy is logged and counted, never fatal to a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use filesync_core::models::DocumentRecord;
use filesync_core::store::DocumentStore;
use filesync_core::{Result, SyncError};

use crate::config::StorageConfig;
use crate::connector::Connector;

const MAX_FILENAME_CHARS: usize = 200;

/// Replace characters that are unsafe in file names and cap the length.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> SyncError {
    SyncError::store(format!("{} {}: {}", context, path.display(), e))
}

/// Sidecar describing one local copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyMetadata {
    pub document_id: String,
    pub source_id: String,
    pub local_path: String,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub size: u64,
    pub sha256: String,
    pub synced_at: DateTime<Utc>,
}

impl CopyMetadata {
    fn is_current_for(&self, doc: &DocumentRecord) -> bool {
        match (&self.checksum, &doc.checksum) {
            (Some(local), Some(remote)) => local == remote,
            _ => self.remote_modified_at == doc.remote_modified_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Downloaded,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub total: usize,
    pub downloaded: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct LocalCopies {
    files_dir: PathBuf,
    metadata_dir: PathBuf,
}

impl LocalCopies {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            files_dir: root.join("files"),
            metadata_dir: root.join("metadata"),
        }
    }

    /// `None` when local copies are disabled.
    pub fn from_config(config: &StorageConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(&config.documents_dir))
    }

    pub fn copy_path(&self, source_id: &str, name: &str) -> PathBuf {
        self.files_dir
            .join(format!("{}_{}", source_id, sanitize_filename(name)))
    }

    fn sidecar_path(&self, source_id: &str) -> PathBuf {
        self.metadata_dir.join(format!("{}.json", source_id))
    }

    pub async fn read_sidecar(&self, source_id: &str) -> Option<CopyMetadata> {
        let raw = tokio::fs::read(self.sidecar_path(source_id)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.files_dir, &self.metadata_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_err("creating", dir, e))?;
        }
        Ok(())
    }

    /// Write `bytes` as the copy of `doc` and record its sidecar.
    pub async fn store_copy(&self, doc: &DocumentRecord, bytes: &[u8]) -> Result<PathBuf> {
        self.ensure_dirs().await?;
        let path = self.copy_path(&doc.source_id, &doc.title);

        if let Some(previous) = self.read_sidecar(&doc.source_id).await {
            let old = PathBuf::from(&previous.local_path);
            if old != path {
                discard(&old).await;
            }
        }

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_err("writing", &path, e))?;

        let meta = CopyMetadata {
            document_id: doc.id.clone(),
            source_id: doc.source_id.clone(),
            local_path: path.to_string_lossy().into_owned(),
            remote_modified_at: doc.remote_modified_at,
            checksum: doc.checksum.clone(),
            size: bytes.len() as u64,
            sha256: format!("{:x}", Sha256::digest(bytes)),
            synced_at: Utc::now(),
        };
        let sidecar = self.sidecar_path(&doc.source_id);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| SyncError::store(format!("encoding sidecar: {}", e)))?;
        tokio::fs::write(&sidecar, json)
            .await
            .map_err(|e| io_err("writing", &sidecar, e))?;

        debug!(doc_id = %doc.id, path = %path.display(), "stored local copy");
        Ok(path)
    }

    /// Download `doc` unless an up-to-date copy already exists.
    pub async fn ensure_copy(
        &self,
        connector: &dyn Connector,
        access_token: &str,
        doc: &DocumentRecord,
    ) -> Result<(PathBuf, CopyOutcome)> {
        let existing = self.read_sidecar(&doc.source_id).await;
        if let Some(meta) = &existing {
            let path = PathBuf::from(&meta.local_path);
            if meta.is_current_for(doc) && tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok((path, CopyOutcome::Unchanged));
            }
        }

        let bytes = connector.download(access_token, &doc.source_id).await?;
        let path = self.store_copy(doc, &bytes).await?;
        let outcome = if existing.is_some() {
            CopyOutcome::Updated
        } else {
            CopyOutcome::Downloaded
        };
        Ok((path, outcome))
    }

    /// Ensure copies for every document linked to `scope_id` and record
    /// their `storage_path`. Per-document failures are counted, not raised.
    pub async fn sync_scope(
        &self,
        documents: &dyn DocumentStore,
        scope_id: &str,
        connector: &dyn Connector,
        access_token: &str,
    ) -> Result<CopyReport> {
        let mut report = CopyReport::default();
        for doc_id in documents.scope_document_ids(scope_id).await? {
            let Some(doc) = documents.get_document(&doc_id).await? else {
                continue;
            };
            report.total += 1;
            match self.ensure_copy(connector, access_token, &doc).await {
                Ok((path, outcome)) => {
                    match outcome {
                        CopyOutcome::Downloaded => report.downloaded += 1,
                        CopyOutcome::Updated => report.updated += 1,
                        CopyOutcome::Unchanged => report.skipped += 1,
                    }
                    let path = path.to_string_lossy();
                    if doc.storage_path.as_deref() != Some(path.as_ref()) {
                        documents.set_storage_path(&doc.id, Some(&path)).await?;
                    }
                }
                Err(e) => {
                    warn!(doc_id = %doc.id, error = %e, "local copy failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            scope = scope_id,
            total = report.total,
            downloaded = report.downloaded,
            updated = report.updated,
            errors = report.errors,
            "local copies synced"
        );
        Ok(report)
    }

    /// Delete the copy and sidecar for `source_id`. Returns `true` if a copy
    /// file was removed.
    pub async fn remove_copy(&self, source_id: &str) -> Result<bool> {
        let mut removed = false;
        let mut candidates = Vec::new();
        if let Some(meta) = self.read_sidecar(source_id).await {
            candidates.push(PathBuf::from(meta.local_path));
        }
        candidates.extend(self.files_for(source_id).await?);

        for path in candidates {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err("removing", &path, e)),
            }
        }

        let sidecar = self.sidecar_path(source_id);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("removing", &sidecar, e)),
        }
        Ok(removed)
    }

    async fn files_for(&self, source_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_", source_id);
        Ok(self
            .list_files()
            .await?
            .into_iter()
            .filter(|(_, name)| name.starts_with(&prefix))
            .map(|(path, _)| path)
            .collect())
    }

    async fn list_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut entries = match tokio::fs::read_dir(&self.files_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("reading", &self.files_dir, e)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("reading", &self.files_dir, e))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let name = name.to_string();
                files.push((path, name));
            }
        }
        Ok(files)
    }

    /// Delete copies whose source id no longer belongs to any stored document.
    pub async fn cleanup_orphans(&self, documents: &dyn DocumentStore) -> Result<usize> {
        let known: HashSet<String> = documents
            .list_documents()
            .await?
            .into_iter()
            .map(|d| d.source_id)
            .collect();

        let mut removed = 0;
        for (path, name) in self.list_files().await? {
            let Some((source_id, _)) = name.split_once('_') else {
                continue;
            };
            if known.contains(source_id) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not remove orphaned copy");
                continue;
            }
            discard(&self.sidecar_path(source_id)).await;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "removed orphaned local copies");
        }
        Ok(removed)
    }
}

/// Best-effort removal; a file that is already gone is not an error.
async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale file"),
    }
}
