//! Index and sync overview for `filesync stats`.
//!
//! Prints database size, document and index record counts, embedding
//! coverage, and a per-scope table with last sync status.

use anyhow::Result;
use serde::Serialize;

use filesync_core::models::{RunStatus, SyncScope};
use filesync_core::search::IndexStats;
use filesync_core::store::ScopeStore;

use crate::config::Config;
use crate::context::AppContext;

#[derive(Debug, Serialize)]
pub struct Overview {
    pub documents: i64,
    pub linked: i64,
    pub index: IndexStats,
    pub scopes: Vec<ScopeLine>,
}

#[derive(Debug, Serialize)]
pub struct ScopeLine {
    pub id: String,
    pub name: String,
    pub connector: String,
    pub documents: i64,
    pub total_docs_indexed: i64,
    pub last_attempt_status: RunStatus,
    pub last_successful_at: Option<i64>,
}

/// Gather counts from the stores and the index.
pub async fn collect(ctx: &AppContext) -> Result<Overview> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&ctx.pool)
        .await?;
    let linked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scope_documents")
        .fetch_one(&ctx.pool)
        .await?;

    let mut scopes = Vec::new();
    for scope in ctx.store.list_scopes().await? {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scope_documents WHERE scope_id = ?")
                .bind(&scope.id)
                .fetch_one(&ctx.pool)
                .await?;
        scopes.push(scope_line(scope, count));
    }

    Ok(Overview {
        documents,
        linked,
        index: ctx.index.stats().await?,
        scopes,
    })
}

fn scope_line(scope: SyncScope, documents: i64) -> ScopeLine {
    ScopeLine {
        id: scope.id,
        name: scope.name,
        connector: scope.connector,
        documents,
        total_docs_indexed: scope.total_docs_indexed,
        last_attempt_status: scope.last_attempt_status,
        last_successful_at: scope.last_successful_at.map(|t| t.timestamp()),
    }
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let overview = collect(&ctx).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let index = &overview.index;

    println!("filesync stats");
    println!("  database: {} ({})", config.db.path.display(), format_bytes(db_size));
    println!("  documents: {}", overview.documents);
    println!("  scope links: {}", overview.linked);
    println!("  index tier: {}", index.tier);
    println!(
        "  index records: {} ({} whole documents, {} chunks)",
        index.total_records, index.full_documents, index.chunks
    );
    if index.embeddings_enabled {
        println!(
            "  embedded: {} / {} ({}%)",
            index.with_embeddings,
            index.total_records,
            if index.total_records > 0 {
                index.with_embeddings * 100 / index.total_records
            } else {
                0
            }
        );
    } else {
        println!("  embedded: disabled");
    }

    if !overview.scopes.is_empty() {
        println!();
        println!(
            "  {:<36} {:<20} {:>6} {:<12}   {}",
            "SCOPE", "NAME", "DOCS", "STATUS", "LAST SYNC"
        );
        println!("  {}", "-".repeat(94));
        for s in &overview.scopes {
            let last = match s.last_successful_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<36} {:<20} {:>6} {:<12}   {}",
                s.id,
                s.name,
                s.documents,
                s.last_attempt_status.as_str(),
                last
            );
        }
    }
    println!("ok");

    ctx.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
