//! Search index service with keyword and hybrid retrieval.
//!
//! [`SearchIndex`] turns documents into [`IndexRecord`]s, stores them
//! through an [`IndexBackend`], and answers queries. The backend only
//! stores and filters records; all scoring happens here so every backend
//! ranks identically.
//!
//! # Index tiers
//!
//! The tier is fixed at construction from configuration:
//!
//! - [`IndexTier::Basic`] writes one record per document and scores
//!   queries by keywords only.
//! - [`IndexTier::Advanced`] chunks documents longer than the chunk
//!   threshold (one record per chunk, each carrying `parent_doc_id`),
//!   derives `file_type`, `quality_score`, and `search_text`, attaches
//!   embeddings when an [`EmbeddingService`] is injected, and searches in
//!   hybrid mode.
//!
//! # Scoring
//!
//! Hybrid (query embedded successfully):
//!
//! ```text
//! keyword  = max(2·title, search_text, text) + 2·phrase(text)
//! semantic = cosine(query, record) + 1
//! score    = keyword_weight · keyword + semantic_weight · semantic
//! ```
//!
//! Keyword-only (Basic tier, no embeddings, or the query failed to embed):
//!
//! ```text
//! score = max(3·title, 2·search_text, text) + 2·phrase(text) + wildcard(title)
//! ```
//!
//! Field matches are fuzzy: terms of 3–5 characters tolerate one edit,
//! longer terms two. Raw hits are grouped by parent document; a document
//! ranks by its best chunk and shows at most three chunks.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::chunk::{chunk_text, estimate_tokens, ChunkerConfig};
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{Result, SyncError};
use crate::models::{file_extension, IndexRecord};
use crate::store::{IndexBackend, RecordCounts};

/// Documents with more characters than this are chunked (Advanced tier).
pub const CHUNK_THRESHOLD: usize = 1000;

/// Chunks shown per document in search results.
pub const TOP_CHUNKS_PER_DOC: usize = 3;

const FULL_PREVIEW_CHARS: usize = 500;
const CHUNK_PREVIEW_CHARS: usize = 300;
const HIGHLIGHT_FRAGMENT_CHARS: usize = 150;
const HIGHLIGHT_FRAGMENTS: usize = 3;

const PHRASE_BOOST: f64 = 2.0;
const FUZZY_MATCH_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexTier {
    Basic,
    Advanced,
}

impl FromStr for IndexTier {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(IndexTier::Basic),
            "advanced" => Ok(IndexTier::Advanced),
            other => Err(SyncError::index(format!(
                "unknown index tier '{}', expected basic or advanced",
                other
            ))),
        }
    }
}

impl fmt::Display for IndexTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexTier::Basic => f.write_str("basic"),
            IndexTier::Advanced => f.write_str("advanced"),
        }
    }
}

/// Equality or membership filter on a record field.
///
/// Built-in fields are `doc_id`, `parent_doc_id`, `group_id` (the parent
/// document for chunks, the record itself otherwise), `file_type`,
/// `is_chunk`, and `link`; any other name is looked up in the record's metadata, where
/// an array value matches if any element does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            values: vec![value.into()],
        }
    }

    pub fn any_of(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }

    pub fn matches(&self, record: &IndexRecord) -> bool {
        let accepts = |v: &str| self.values.iter().any(|x| x == v);
        match self.field.as_str() {
            "doc_id" => accepts(&record.doc_id),
            "parent_doc_id" => record.parent_doc_id.as_deref().map(accepts).unwrap_or(false),
            "group_id" => accepts(record.group_id()),
            "file_type" => accepts(&record.file_type),
            "is_chunk" => accepts(if record.is_chunk { "true" } else { "false" }),
            "link" => record.link.as_deref().map(accepts).unwrap_or(false),
            field => match record.metadata.get(field) {
                Some(Value::Array(items)) => items.iter().any(|v| value_matches(v, &accepts)),
                Some(v) => value_matches(v, &accepts),
                None => false,
            },
        }
    }
}

fn value_matches(value: &Value, accepts: &impl Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => accepts(s),
        Value::Null => false,
        other => accepts(&other.to_string()),
    }
}

/// A document handed to [`SearchIndex::index`].
#[derive(Debug, Clone, Default)]
pub struct IndexDocument {
    pub doc_id: String,
    pub title: String,
    pub text: String,
    pub link: Option<String>,
    /// Original file name, used for file type classification.
    pub file_name: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IndexOutcome {
    Indexed { records: usize, embedded: usize },
    Skipped { reason: String },
}

impl IndexOutcome {
    pub fn record_count(&self) -> usize {
        match self {
            IndexOutcome::Indexed { records, .. } => *records,
            IndexOutcome::Skipped { .. } => 0,
        }
    }
}

/// Query parameters for [`SearchIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub size: usize,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub filters: Vec<Filter>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            size: 10,
            semantic_weight: 0.5,
            keyword_weight: 0.5,
            filters: Vec::new(),
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn weights(mut self, semantic: f64, keyword: f64) -> Self {
        self.semantic_weight = semantic;
        self.keyword_weight = keyword;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Keyword,
}

/// One matching record shown under its document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub score: f64,
    pub chunk_index: usize,
    pub text: String,
    pub highlights: Vec<String>,
}

/// A document-level search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub title: String,
    /// Best chunk score.
    pub score: f64,
    pub source: Option<String>,
    pub link: Option<String>,
    pub file_type: String,
    pub indexed_at: DateTime<Utc>,
    /// Top chunks by score.
    pub chunks: Vec<ChunkHit>,
    /// Raw hits for this document before truncation.
    pub matched_chunks: usize,
    /// Records the document was indexed as.
    pub total_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub total: usize,
    pub took_ms: u128,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub tier: IndexTier,
    pub total_records: usize,
    pub full_documents: usize,
    pub chunks: usize,
    pub with_embeddings: usize,
    pub embeddings_enabled: bool,
}

/// Document and chunk index over a pluggable [`IndexBackend`].
pub struct SearchIndex {
    backend: Arc<dyn IndexBackend>,
    embeddings: Option<Arc<EmbeddingService>>,
    chunker: ChunkerConfig,
    tier: IndexTier,
    chunk_threshold: usize,
}

impl SearchIndex {
    pub fn new(backend: Arc<dyn IndexBackend>, tier: IndexTier) -> Self {
        Self {
            backend,
            embeddings: None,
            chunker: ChunkerConfig::default(),
            tier,
            chunk_threshold: CHUNK_THRESHOLD,
        }
    }

    /// Attach an embedding service. Ignored by the Basic tier.
    pub fn with_embeddings(mut self, service: Arc<EmbeddingService>) -> Self {
        self.embeddings = Some(service);
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_chunk_threshold(mut self, threshold: usize) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    pub fn tier(&self) -> IndexTier {
        self.tier
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.tier == IndexTier::Advanced && self.embeddings.is_some()
    }

    /// Index a document, replacing any records it had before.
    pub async fn index(&self, doc: &IndexDocument) -> Result<IndexOutcome> {
        if doc.text.trim().is_empty() {
            self.backend.replace_records(&doc.doc_id, &[]).await?;
            warn!(doc_id = %doc.doc_id, "empty text, nothing indexed");
            return Ok(IndexOutcome::Skipped {
                reason: "empty_text".to_string(),
            });
        }

        let now = Utc::now();
        let base = base_record(doc, now);
        let mut records = match self.tier {
            IndexTier::Advanced if doc.text.chars().count() > self.chunk_threshold => {
                self.chunk_records(doc, &base)
            }
            _ => Vec::new(),
        };
        if records.is_empty() {
            records.push(base);
        }

        let mut embedded = 0;
        if let (IndexTier::Advanced, Some(service)) = (self.tier, &self.embeddings) {
            let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
            for (record, vector) in records.iter_mut().zip(service.encode_many(&texts).await) {
                if vector.is_some() {
                    embedded += 1;
                }
                record.embedding = vector;
            }
        }

        self.backend.replace_records(&doc.doc_id, &records).await?;
        info!(
            doc_id = %doc.doc_id,
            records = records.len(),
            embedded,
            "indexed document"
        );
        Ok(IndexOutcome::Indexed {
            records: records.len(),
            embedded,
        })
    }

    fn chunk_records(&self, doc: &IndexDocument, base: &IndexRecord) -> Vec<IndexRecord> {
        let chunks = chunk_text(&doc.doc_id, &doc.text, &self.chunker);
        let total = chunks.len();
        chunks
            .into_iter()
            .map(|chunk| {
                let mut record = base.clone();
                record.id = chunk.id;
                record.parent_doc_id = Some(doc.doc_id.clone());
                record.search_text = search_text(&doc.title, &chunk.text);
                record.content_preview = preview(&chunk.text, CHUNK_PREVIEW_CHARS);
                record.is_chunk = true;
                record.chunk_index = chunk.ordinal;
                record.chunk_start = Some(chunk.start_char);
                record.chunk_end = Some(chunk.end_char);
                record.token_count = chunk.token_count;
                record.total_chunks = total;
                record.text = chunk.text;
                record
            })
            .collect()
    }

    /// Delete a document and all of its chunks. Returns records removed.
    pub async fn delete(&self, doc_id: &str) -> Result<usize> {
        let removed = self.backend.delete_records(doc_id).await?;
        debug!(doc_id, removed, "deleted index records");
        Ok(removed)
    }

    /// Rank documents for `req`.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let query = req.query.trim();
        if query.is_empty() || req.size == 0 {
            return Ok(SearchResponse {
                query: req.query.clone(),
                mode: SearchMode::Keyword,
                total: 0,
                took_ms: 0,
                results: Vec::new(),
            });
        }

        let query_vec = match (&self.embeddings, self.tier) {
            (Some(service), IndexTier::Advanced) => {
                let vec = service.encode_one(query).await;
                if vec.is_none() {
                    warn!("query embedding failed, falling back to keyword search");
                }
                vec
            }
            _ => None,
        };
        let mode = if query_vec.is_some() {
            SearchMode::Hybrid
        } else {
            SearchMode::Keyword
        };

        let parsed = ParsedQuery::new(query);
        let records = self.backend.load_records(&req.filters).await?;
        let mut hits: Vec<ScoredHit> = records
            .into_iter()
            .filter_map(|record| {
                let score = match &query_vec {
                    Some(qv) => hybrid_score(&parsed, &record, qv, req),
                    None => keyword_only_score(&parsed, &record),
                };
                (score > 0.0).then_some(ScoredHit { record, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(req.size.saturating_mul(TOP_CHUNKS_PER_DOC));

        let mut results = group_by_parent(hits, &parsed);
        results.truncate(req.size);

        Ok(SearchResponse {
            query: req.query.clone(),
            mode,
            total: results.len(),
            took_ms: started.elapsed().as_millis(),
            results,
        })
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let RecordCounts {
            total,
            full_documents,
            chunks,
            with_embeddings,
        } = self.backend.counts().await?;
        Ok(IndexStats {
            tier: self.tier,
            total_records: total,
            full_documents,
            chunks,
            with_embeddings,
            embeddings_enabled: self.embeddings_enabled(),
        })
    }
}

/// The whole-document record every index write starts from.
fn base_record(doc: &IndexDocument, now: DateTime<Utc>) -> IndexRecord {
    let mut metadata = doc.metadata.clone();
    let word_count = doc.text.split_whitespace().count();
    metadata.insert("word_count".into(), Value::from(word_count));
    metadata.insert("text_length".into(), Value::from(doc.text.chars().count()));
    if let Some((source, source_id)) = doc.doc_id.split_once(':') {
        metadata
            .entry("source")
            .or_insert_with(|| Value::from(source));
        metadata
            .entry("source_id")
            .or_insert_with(|| Value::from(source_id));
    }
    if let Some(name) = &doc.file_name {
        metadata.insert("file_name".into(), Value::from(name.as_str()));
    }

    let type_hint = doc.file_name.as_deref().unwrap_or(&doc.title);
    IndexRecord {
        id: doc.doc_id.clone(),
        doc_id: doc.doc_id.clone(),
        parent_doc_id: None,
        title: doc.title.clone(),
        text: doc.text.clone(),
        search_text: search_text(&doc.title, &doc.text),
        content_preview: preview(&doc.text, FULL_PREVIEW_CHARS),
        link: doc.link.clone(),
        is_chunk: false,
        chunk_index: 0,
        chunk_start: None,
        chunk_end: None,
        token_count: estimate_tokens(&doc.text),
        total_chunks: 1,
        file_type: classify_file_type(type_hint).to_string(),
        quality_score: quality_score(&doc.text),
        indexed_at: now,
        metadata,
        embedding: None,
    }
}

/// Coarse file type from a file name's extension.
pub fn classify_file_type(name: &str) -> &'static str {
    match file_extension(name).as_deref() {
        Some("pdf") => "pdf",
        Some("doc") | Some("docx") => "document",
        Some("ppt") | Some("pptx") => "presentation",
        Some("xls") | Some("xlsx") => "spreadsheet",
        Some("txt") | Some("md") => "text",
        _ => "other",
    }
}

/// Heuristic quality in `[0, 1]`, rounded to three decimals.
///
/// `0.6 · min(1, words / 1000) + 0.4 · min(1, sentences / (words / 20))`,
/// where sentences are non-blank `.`-separated segments.
pub fn quality_score(text: &str) -> f64 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    let sentences = text.split('.').filter(|s| !s.trim().is_empty()).count();
    let length_score = (words as f64 / 1000.0).min(1.0);
    let readability = (sentences as f64 / (words as f64 / 20.0)).min(1.0);
    let score = length_score * 0.6 + readability * 0.4;
    (score * 1000.0).round() / 1000.0
}

/// Title and body joined for the combined search field.
pub fn search_text(title: &str, body: &str) -> String {
    [title, body]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// A token with its byte span in the source text.
struct Token {
    start: usize,
    end: usize,
    lower: String,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            tokens.push(Token {
                start: s,
                end: i,
                lower: text[s..i].to_lowercase(),
            });
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
            lower: text[s..].to_lowercase(),
        });
    }
    tokens
}

struct ParsedQuery {
    lower: String,
    terms: Vec<String>,
}

impl ParsedQuery {
    fn new(query: &str) -> Self {
        Self {
            lower: query.to_lowercase(),
            terms: tokenize(query).into_iter().map(|t| t.lower).collect(),
        }
    }
}

/// Edits tolerated for a term of this many characters.
fn fuzziness(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

/// Levenshtein distance, or `None` once it must exceed `max`.
fn edit_distance_within(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let distance = prev[b.len()];
    (distance <= max).then_some(distance)
}

fn term_matches(term: &str, token: &str) -> Option<f64> {
    if term == token {
        return Some(1.0);
    }
    let max = fuzziness(term);
    if max == 0 {
        return None;
    }
    edit_distance_within(term, token, max).map(|_| FUZZY_MATCH_WEIGHT)
}

/// Saturating term frequency: one match scores 1.0.
fn saturate(tf: f64) -> f64 {
    tf * 2.2 / (tf + 1.2)
}

/// Fuzzy match score of all query terms against one field.
fn field_score(terms: &[String], tokens: &[Token]) -> f64 {
    terms
        .iter()
        .map(|term| {
            let mut exact = 0.0;
            let mut fuzzy = 0.0;
            for token in tokens {
                match term_matches(term, &token.lower) {
                    Some(w) if w >= 1.0 => exact += 1.0,
                    Some(_) => fuzzy += 1.0,
                    None => {}
                }
            }
            if exact > 0.0 {
                saturate(exact)
            } else if fuzzy > 0.0 {
                FUZZY_MATCH_WEIGHT * saturate(fuzzy)
            } else {
                0.0
            }
        })
        .sum()
}

/// Best single weighted field, like a best-fields multi-match.
fn best_fields(terms: &[String], fields: &[(&str, f64)]) -> f64 {
    fields
        .iter()
        .map(|(text, weight)| weight * field_score(terms, &tokenize(text)))
        .fold(0.0, f64::max)
}

/// Whether the query terms appear contiguously in `text`.
fn phrase_matches(terms: &[String], text: &str) -> bool {
    if terms.is_empty() {
        return false;
    }
    let tokens: Vec<String> = tokenize(text).into_iter().map(|t| t.lower).collect();
    tokens.windows(terms.len()).any(|w| w == terms)
}

fn hybrid_score(q: &ParsedQuery, record: &IndexRecord, query_vec: &[f32], req: &SearchRequest) -> f64 {
    let mut score = 0.0;
    if req.keyword_weight > 0.0 {
        let fields = [
            (record.title.as_str(), 2.0),
            (record.search_text.as_str(), 1.0),
            (record.text.as_str(), 1.0),
        ];
        let mut keyword = best_fields(&q.terms, &fields);
        if phrase_matches(&q.terms, &record.text) {
            keyword += PHRASE_BOOST;
        }
        score += req.keyword_weight * keyword;
    }
    if req.semantic_weight > 0.0 {
        if let Some(vector) = &record.embedding {
            let semantic = f64::from(cosine_similarity(query_vec, vector)) + 1.0;
            score += req.semantic_weight * semantic;
        }
    }
    score
}

fn keyword_only_score(q: &ParsedQuery, record: &IndexRecord) -> f64 {
    let fields = [
        (record.title.as_str(), 3.0),
        (record.search_text.as_str(), 2.0),
        (record.text.as_str(), 1.0),
    ];
    let mut score = best_fields(&q.terms, &fields);
    if phrase_matches(&q.terms, &record.text) {
        score += PHRASE_BOOST;
    }
    if !q.lower.is_empty() && record.title.to_lowercase().contains(&q.lower) {
        score += 1.0;
    }
    score
}

/// Up to three ~150 character fragments around matching terms.
fn highlights(text: &str, terms: &[String]) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut covered_until = 0;
    for token in tokenize(text) {
        if fragments.len() >= HIGHLIGHT_FRAGMENTS {
            break;
        }
        if token.start < covered_until || !terms.iter().any(|t| term_matches(t, &token.lower).is_some())
        {
            continue;
        }
        let start = floor_char_boundary(text, token.start.saturating_sub(HIGHLIGHT_FRAGMENT_CHARS / 3));
        let end = floor_char_boundary(text, (start + HIGHLIGHT_FRAGMENT_CHARS).max(token.end));
        fragments.push(text[start..end].trim().to_string());
        covered_until = end;
    }
    fragments
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

struct ScoredHit {
    record: IndexRecord,
    score: f64,
}

/// Group raw hits by parent document, best document first.
fn group_by_parent(hits: Vec<ScoredHit>, q: &ParsedQuery) -> Vec<SearchResult> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ScoredHit>> = HashMap::new();
    for hit in hits {
        let key = hit.record.group_id().to_string();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(hit);
    }

    let mut results: Vec<SearchResult> = order
        .into_iter()
        .filter_map(|doc_id| {
            let mut group = groups.remove(&doc_id)?;
            group.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let best = group.first()?;
            let max_score = best.score;
            let info = &best.record;
            let title = info.title.clone();
            let source = info
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string);
            let link = info.link.clone();
            let file_type = info.file_type.clone();
            let indexed_at = info.indexed_at;
            let total_chunks = info.total_chunks;
            let matched_chunks = group.len();
            let chunks = group
                .into_iter()
                .take(TOP_CHUNKS_PER_DOC)
                .map(|hit| ChunkHit {
                    highlights: highlights(&hit.record.text, &q.terms),
                    chunk_id: hit.record.id,
                    score: hit.score,
                    chunk_index: hit.record.chunk_index,
                    text: hit.record.text,
                })
                .collect();
            Some(SearchResult {
                doc_id,
                title,
                score: max_score,
                source,
                link,
                file_type,
                indexed_at,
                chunks,
                matched_chunks,
                total_chunks,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    results
}
