//! `filesync search`: query the index from the command line.

use anyhow::{bail, Result};

use filesync_core::search::{Filter, SearchRequest, SearchResponse};
use filesync_core::store::{DocumentStore, ScopeStore};

use crate::config::Config;
use crate::context::AppContext;

/// A request for `query` with the configured defaults, optionally limited
/// to the documents linked to one scope.
pub async fn build_request(
    ctx: &AppContext,
    query: &str,
    size: Option<usize>,
    scope: Option<&str>,
) -> Result<SearchRequest> {
    let config: &Config = &ctx.config;
    let mut request = SearchRequest::new(query)
        .size(size.unwrap_or(config.search.default_size))
        .weights(config.search.semantic_weight, config.search.keyword_weight);

    if let Some(scope_id) = scope {
        if ctx.store.get_scope(scope_id).await?.is_none() {
            bail!("Unknown scope: '{}'", scope_id);
        }
        let ids = ctx.store.scope_document_ids(scope_id).await?;
        request = request.filter(Filter::any_of("group_id", ids));
    }
    Ok(request)
}

pub async fn run_search(
    config: &Config,
    query: &str,
    size: Option<usize>,
    scope: Option<String>,
    json: bool,
) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let request = build_request(&ctx, query, size, scope.as_deref()).await?;
    let response = ctx.index.search(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }

    ctx.close().await;
    Ok(())
}

fn print_response(response: &SearchResponse) {
    println!("search \"{}\" ({:?})", response.query, response.mode);
    if response.results.is_empty() {
        println!("  no results");
    }
    for (rank, result) in response.results.iter().enumerate() {
        println!();
        println!("{}. [{:.3}] {}", rank + 1, result.score, result.title);
        println!("   id: {}  type: {}", result.doc_id, result.file_type);
        if let Some(link) = &result.link {
            println!("   link: {}", link);
        }
        if result.total_chunks > 1 {
            println!(
                "   chunks: {} matched of {}",
                result.matched_chunks, result.total_chunks
            );
        }
        for chunk in &result.chunks {
            let fragment = chunk
                .highlights
                .first()
                .map(String::as_str)
                .unwrap_or(chunk.text.as_str());
            println!("   > #{} {}", chunk.chunk_index, one_line(fragment, 150));
        }
    }
    println!();
    println!("  results: {}  took: {} ms", response.results.len(), response.took_ms);
    println!("ok");
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
