//! Paginated remote enumeration.
//!
//! [`RemoteEnumerator`] walks a forest of remote folders through a
//! [`FolderSource`] and yields normalized [`FileDescriptor`]s. Listing is
//! stateless: nothing is persisted between calls, and a failure anywhere
//! aborts the whole listing with [`SyncError::Remote`](crate::SyncError).
//!
//! Filtering policy:
//! - trashed or deleted entries are skipped
//! - folders are always recursed; extension and size filters never apply
//!   to them
//! - files must pass [`ScopeConfig::admits`]
//!
//! A file reachable from more than one configured root is yielded once.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::{FileDescriptor, ScopeConfig};

/// Items requested per page. A shorter page ends pagination.
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// One item of a folder listing page, as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    /// Trashed or deleted on the provider side.
    pub trashed: bool,
}

/// Provider capability: one page of a folder's direct children.
#[async_trait]
pub trait FolderSource: Send + Sync {
    async fn list_folder_page(
        &self,
        access_token: &str,
        folder_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RemoteEntry>>;
}

/// Depth-first walker over a [`FolderSource`].
#[derive(Debug, Clone)]
pub struct RemoteEnumerator {
    page_size: usize,
}

impl Default for RemoteEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteEnumerator {
    pub fn new() -> Self {
        Self {
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    /// List every admitted file under `config.folder_ids`, recursively.
    #[instrument(skip(self, source, access_token, config), fields(roots = config.folder_ids.len()))]
    pub async fn list_all(
        &self,
        source: &dyn FolderSource,
        access_token: &str,
        config: &ScopeConfig,
    ) -> Result<Vec<FileDescriptor>> {
        let mut files = Vec::new();
        let mut seen_files: HashSet<String> = HashSet::new();
        let mut seen_folders: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, String)> = config
            .folder_ids
            .iter()
            .rev()
            .map(|id| (id.clone(), String::new()))
            .collect();

        while let Some((folder_id, prefix)) = stack.pop() {
            if !seen_folders.insert(folder_id.clone()) {
                continue;
            }

            let mut offset = 0;
            let mut subfolders = Vec::new();
            loop {
                let page = source
                    .list_folder_page(access_token, &folder_id, offset, self.page_size)
                    .await?;
                let page_len = page.len();

                for entry in page {
                    if entry.trashed {
                        continue;
                    }
                    let path = join_path(&prefix, &entry.name);
                    match entry.kind {
                        EntryKind::Folder => subfolders.push((entry.id, path)),
                        EntryKind::File => {
                            if !config.admits(&entry.name, entry.size) {
                                continue;
                            }
                            if !seen_files.insert(entry.id.clone()) {
                                continue;
                            }
                            files.push(FileDescriptor {
                                source_id: entry.id,
                                name: entry.name,
                                path,
                                size: entry.size,
                                modified_at: entry.modified_at,
                                checksum: entry.checksum,
                            });
                        }
                    }
                }

                if page_len < self.page_size {
                    break;
                }
                offset += page_len;
            }

            debug!(folder = %folder_id, subfolders = subfolders.len(), "listed folder");
            stack.extend(subfolders.into_iter().rev());
        }

        Ok(files)
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::SyncError;

    #[derive(Default)]
    struct FixtureTree {
        folders: HashMap<String, Vec<RemoteEntry>>,
        pages_served: AtomicUsize,
        fail_folder: Option<String>,
    }

    impl FixtureTree {
        fn with(mut self, folder: &str, entries: Vec<RemoteEntry>) -> Self {
            self.folders.insert(folder.to_string(), entries);
            self
        }
    }

    fn file(id: &str, name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            kind: EntryKind::File,
            size,
            modified_at: None,
            checksum: Some(format!("sha-{}", id)),
            trashed: false,
        }
    }

    fn folder(id: &str, name: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            kind: EntryKind::Folder,
            size: 0,
            modified_at: None,
            checksum: None,
            trashed: false,
        }
    }

    #[async_trait]
    impl FolderSource for FixtureTree {
        async fn list_folder_page(
            &self,
            _access_token: &str,
            folder_id: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<RemoteEntry>> {
            self.pages_served.fetch_add(1, Ordering::SeqCst);
            if self.fail_folder.as_deref() == Some(folder_id) {
                return Err(SyncError::remote("HTTP 503"));
            }
            let entries = self.folders.get(folder_id).cloned().unwrap_or_default();
            Ok(entries.into_iter().skip(offset).take(limit).collect())
        }
    }

    fn ids(files: &[FileDescriptor]) -> Vec<String> {
        let mut ids: Vec<String> = files.iter().map(|f| f.source_id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_recurses_into_folders() {
        let tree = FixtureTree::default()
            .with("0", vec![file("f1", "a.txt", 10), folder("100", "sub")])
            .with("100", vec![file("f2", "b.txt", 20)]);
        let files = RemoteEnumerator::new()
            .list_all(&tree, "token", &ScopeConfig::default())
            .await
            .unwrap();
        assert_eq!(ids(&files), vec!["f1", "f2"]);
        let f2 = files.iter().find(|f| f.source_id == "f2").unwrap();
        assert_eq!(f2.path, "sub/b.txt");
        assert_eq!(f2.size, 20);
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let entries: Vec<RemoteEntry> = (0..7)
            .map(|i| file(&format!("f{}", i), &format!("{}.txt", i), 1))
            .collect();
        let tree = FixtureTree::default().with("0", entries);
        let files = RemoteEnumerator::with_page_size(3)
            .list_all(&tree, "token", &ScopeConfig::default())
            .await
            .unwrap();
        assert_eq!(files.len(), 7);
        assert_eq!(tree.pages_served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_fetches_trailing_empty_page() {
        let entries: Vec<RemoteEntry> = (0..6)
            .map(|i| file(&format!("f{}", i), &format!("{}.txt", i), 1))
            .collect();
        let tree = FixtureTree::default().with("0", entries);
        let files = RemoteEnumerator::with_page_size(3)
            .list_all(&tree, "token", &ScopeConfig::default())
            .await
            .unwrap();
        assert_eq!(files.len(), 6);
        assert_eq!(tree.pages_served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_filters_apply_to_files_not_folders() {
        let mut trashed = file("t1", "gone.pdf", 1);
        trashed.trashed = true;
        let tree = FixtureTree::default()
            .with(
                "0",
                vec![
                    file("p1", "keep.pdf", 100),
                    file("x1", "skip.exe", 100),
                    file("big", "huge.pdf", 5 * 1024 * 1024),
                    trashed,
                    folder("200", "folder.exe"),
                ],
            )
            .with("200", vec![file("p2", "nested.PDF", 100)]);
        let config = ScopeConfig {
            folder_ids: vec!["0".into()],
            include_exts: vec!["pdf".into()],
            max_size_mb: Some(1),
        };
        let files = RemoteEnumerator::new()
            .list_all(&tree, "token", &config)
            .await
            .unwrap();
        assert_eq!(ids(&files), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_overlapping_roots_yield_each_file_once() {
        let tree = FixtureTree::default()
            .with("0", vec![file("f1", "a.txt", 1), folder("100", "sub")])
            .with("100", vec![file("f2", "b.txt", 1)]);
        let config = ScopeConfig {
            folder_ids: vec!["100".into(), "0".into()],
            ..ScopeConfig::default()
        };
        let first = RemoteEnumerator::new()
            .list_all(&tree, "token", &config)
            .await
            .unwrap();
        let second = RemoteEnumerator::new()
            .list_all(&tree, "token", &ScopeConfig::default())
            .await
            .unwrap();
        assert_eq!(ids(&first), vec!["f1", "f2"]);
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_failure_aborts_listing() {
        let mut tree = FixtureTree::default()
            .with("0", vec![file("f1", "a.txt", 1), folder("100", "sub")])
            .with("100", vec![file("f2", "b.txt", 1)]);
        tree.fail_folder = Some("100".into());
        let err = RemoteEnumerator::new()
            .list_all(&tree, "token", &ScopeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
    }
}
