//! Handlers for the scope, auth, sync, and prune subcommands.
//!
//! Each handler opens its own [`AppContext`], prints a short summary to
//! stdout ending in `ok`, and closes the pool.

use anyhow::{bail, Result};

use filesync_core::models::{ScopeConfig, SyncScope};
use filesync_core::store::{CredentialStore, ScopeStore};

use crate::auth;
use crate::config::Config;
use crate::context::AppContext;
use crate::sync::SyncReport;

/// Options for `filesync scope add`.
#[derive(Debug, Clone)]
pub struct NewScope {
    pub name: String,
    pub connector: String,
    pub credential_id: String,
    pub folder_ids: Vec<String>,
    pub include_exts: Vec<String>,
    pub max_size_mb: Option<u64>,
}

impl NewScope {
    pub fn scope_config(&self) -> ScopeConfig {
        let mut config = ScopeConfig {
            include_exts: self
                .include_exts
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_size_mb: self.max_size_mb,
            ..ScopeConfig::default()
        };
        if !self.folder_ids.is_empty() {
            config.folder_ids = self.folder_ids.clone();
        }
        config
    }
}

pub async fn scope_add(config: &Config, new: NewScope) -> Result<SyncScope> {
    let ctx = AppContext::open(config).await?;
    ctx.connectors.get(&new.connector)?;
    if ctx.store.get_credential(&new.credential_id).await?.is_none() {
        bail!(
            "Unknown credential: '{}'. Run `filesync auth exchange` first.",
            new.credential_id
        );
    }

    let scope = SyncScope::new(
        new.name.clone(),
        new.connector.clone(),
        new.credential_id.clone(),
        new.scope_config(),
    );
    ctx.store.create_scope(&scope).await?;

    println!("scope add");
    println!("  id: {}", scope.id);
    println!("  name: {}", scope.name);
    println!("  connector: {}", scope.connector);
    println!("  folders: {}", scope.config.folder_ids.join(", "));
    println!("ok");

    ctx.close().await;
    Ok(scope)
}

pub async fn scope_list(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let scopes = ctx.store.list_scopes().await?;

    if scopes.is_empty() {
        println!("No scopes configured.");
    } else {
        println!(
            "{:<36}  {:<20}  {:<8}  {:<12}  {:>6}",
            "ID", "NAME", "CONN", "STATUS", "DOCS"
        );
        for s in &scopes {
            println!(
                "{:<36}  {:<20}  {:<8}  {:<12}  {:>6}",
                s.id,
                s.name,
                s.connector,
                s.last_attempt_status.as_str(),
                s.total_docs_indexed
            );
        }
    }

    ctx.close().await;
    Ok(())
}

pub async fn auth_url(config: &Config, connector: &str) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let connector = ctx.connectors.get(connector)?;
    let (url, state) = auth::authorize_url(connector.as_ref())?;

    println!("auth url {}", connector.name());
    println!("  state: {}", state);
    println!("  {}", url);
    println!("ok");

    ctx.close().await;
    Ok(())
}

pub async fn auth_exchange(
    config: &Config,
    connector: &str,
    code: &str,
    id: Option<String>,
) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let connector = ctx.connectors.get(connector)?;
    let credential =
        auth::exchange_code(ctx.store.as_ref(), connector.as_ref(), code, id).await?;

    println!("auth exchange {}", connector.name());
    println!("  credential: {}", credential.id);
    if let Some(expires_at) = credential.expires_at {
        println!("  expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("ok");

    ctx.close().await;
    Ok(())
}

pub async fn sync(config: &Config, scope_id: &str) -> Result<SyncReport> {
    let ctx = AppContext::open(config).await?;
    let result = ctx.orchestrator.run_sync(scope_id).await;
    ctx.close().await;
    let report = result?;

    println!("sync {}", report.scope_id);
    println!("  run: {}", report.run_id);
    println!("  listed: {}", report.listed);
    println!("  new documents: {}", report.new_documents);
    println!("  changed: {}", report.changed);
    println!("  indexed: {}", report.indexed);
    if report.reindexed > 0 {
        println!("  re-indexed after change: {}", report.reindexed);
    }
    if report.skipped_empty > 0 {
        println!("  skipped (no text): {}", report.skipped_empty);
    }
    if let Some(copies) = &report.copies {
        println!(
            "  local copies: {} downloaded, {} updated, {} unchanged, {} errors",
            copies.downloaded, copies.updated, copies.skipped, copies.errors
        );
    }
    if let Some(prune) = &report.prune {
        println!("  pruned: {}", prune.removed_from_store);
    }
    println!("ok");
    Ok(report)
}

pub async fn prune(config: &Config, scope_id: &str) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let result = ctx.orchestrator.prune(scope_id).await;
    ctx.close().await;
    let report = result?;

    println!("prune {}", scope_id);
    println!("  removed documents: {}", report.removed_from_store);
    println!("  removed local copies: {}", report.removed_local_copies);
    println!("  removed from index: {}", report.removed_from_index);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_config_normalizes_extensions() {
        let new = NewScope {
            name: "docs".into(),
            connector: "box".into(),
            credential_id: "c".into(),
            folder_ids: Vec::new(),
            include_exts: vec![".PDF".into(), "docx".into()],
            max_size_mb: Some(25),
        };
        let config = new.scope_config();
        assert_eq!(config.folder_ids, vec!["0".to_string()]);
        assert_eq!(config.include_exts, vec!["pdf".to_string(), "docx".to_string()]);
        assert_eq!(config.max_size_bytes(), Some(25 * 1024 * 1024));
    }
}
