//! Boundary-respecting text chunker.
//!
//! Splits extracted document text into overlapping [`Chunk`]s sized for
//! retrieval. Every chunk is a contiguous slice of the source text, so its
//! `[start_char, end_char)` span can be used to locate it in the original.
//!
//! # Algorithm
//!
//! 1. Text whose trimmed length is below `min_chunk_size` yields no chunks.
//! 2. Units are paragraphs (blocks separated by blank lines, at least 50
//!    characters). With no usable paragraph, units are sentences.
//! 3. Units accumulate into the running chunk while its estimated token
//!    count (`chars / 4`) stays within `chunk_size`.
//! 4. When the next unit would overflow, the running chunk is closed and the
//!    next one is seeded with its last `overlap_size` words.
//! 5. A paragraph that alone exceeds `chunk_size` closes the running chunk
//!    and is chunked at sentence granularity. Its chunks continue the same
//!    ordinal sequence. A sentence that still overflows is hard-split at
//!    whitespace.
//! 6. A closing chunk shorter than `min_chunk_size` is merged into its
//!    predecessor.
//!
//! Chunk ids are `{document_id}#chunk_{ordinal}` and each chunk carries a
//! SHA-256 hash of its text. Output is deterministic for identical input.
//!
//! # Example
//!
//! ```rust
//! use filesync_core::chunk::{chunk_text, ChunkerConfig};
//!
//! let text = "A paragraph that is long enough to be a unit on its own, surely.\n\n".repeat(3);
//! let chunks = chunk_text("box:1", &text, &ChunkerConfig::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "box:1#chunk_0");
//! ```

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const MIN_PARAGRAPH_CHARS: usize = 50;

/// Sentences must be strictly longer than this to count as units.
const MIN_SENTENCE_CHARS: usize = 10;

/// Chunk sizing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Target chunk size in estimated tokens.
    pub chunk_size: usize,
    /// Words carried from the end of one chunk into the next.
    pub overlap_size: usize,
    /// Minimum trimmed character length of a document (and of a tail chunk).
    pub min_chunk_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap_size: 50,
            min_chunk_size: 100,
        }
    }
}

/// Rough token estimate: one token per four characters, at least one.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Split `text` into chunks for `document_id`.
///
/// Ordinals are contiguous from zero. Re-chunking identical input yields
/// identical spans, ids, and hashes.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    if text.trim().chars().count() < config.min_chunk_size {
        return Vec::new();
    }

    let mut builder = ChunkBuilder::new(document_id, text, config);
    let paragraphs = paragraph_spans(text);

    if paragraphs.is_empty() {
        let whole = trim_span(text, Span::new(0, text.len()));
        for unit in sentence_units(text, whole, config.chunk_size) {
            builder.add_unit(unit);
        }
    } else {
        for para in paragraphs {
            if estimate_tokens(para.slice(text)) > config.chunk_size {
                builder.close();
                for unit in sentence_units(text, para, config.chunk_size) {
                    builder.add_unit(unit);
                }
                builder.close();
            } else {
                builder.add_unit(para);
            }
        }
    }

    builder.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }

    fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Shrink a span so it starts and ends on non-whitespace.
fn trim_span(text: &str, span: Span) -> Span {
    let slice = span.slice(text);
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return Span::new(span.start, span.start);
    }
    Span::new(span.start + leading, span.end - trailing)
}

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("valid paragraph regex"))
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("valid sentence regex"))
}

/// Blank-line separated blocks of at least [`MIN_PARAGRAPH_CHARS`].
fn paragraph_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut last = 0;
    let mut push = |span: Span| {
        let span = trim_span(text, span);
        if !span.is_empty() && span.slice(text).chars().count() >= MIN_PARAGRAPH_CHARS {
            spans.push(span);
        }
    };
    for m in paragraph_break().find_iter(text) {
        push(Span::new(last, m.start()));
        last = m.end();
    }
    push(Span::new(last, text.len()));
    spans
}

/// Sentence spans inside `region`.
///
/// A boundary follows `.`, `!` or `?` plus whitespace when the whitespace
/// holds a newline, the next character is uppercase, or a period is
/// followed by a digit.
fn sentence_spans(text: &str, region: Span) -> Vec<Span> {
    let slice = region.slice(text);
    let mut spans = Vec::new();
    let mut last = 0;
    let mut push = |span: Span| {
        let span = trim_span(text, span);
        if !span.is_empty() && span.slice(text).chars().count() > MIN_SENTENCE_CHARS {
            spans.push(span);
        }
    };
    for m in sentence_end().find_iter(slice) {
        let matched = m.as_str();
        let next = slice[m.end()..].chars().next();
        let is_boundary = matched.contains('\n')
            || next.map(char::is_uppercase).unwrap_or(false)
            || (matched.starts_with('.') && next.map(|c| c.is_ascii_digit()).unwrap_or(false));
        if !is_boundary {
            continue;
        }
        // The terminator is a single ASCII byte.
        push(Span::new(region.start + last, region.start + m.start() + 1));
        last = m.end();
    }
    push(Span::new(region.start + last, region.end));
    spans
}

/// Sentence units for `region`, hard-splitting any that overflow.
fn sentence_units(text: &str, region: Span, chunk_size: usize) -> Vec<Span> {
    let mut sentences = sentence_spans(text, region);
    if sentences.is_empty() && !region.is_empty() {
        sentences.push(region);
    }
    let max_bytes = chunk_size.saturating_mul(CHARS_PER_TOKEN).max(1);
    sentences
        .into_iter()
        .flat_map(|s| {
            if estimate_tokens(s.slice(text)) > chunk_size {
                hard_split(text, s, max_bytes)
            } else {
                vec![s]
            }
        })
        .collect()
}

/// Split a span into pieces of at most `max_bytes`, preferring whitespace.
fn hard_split(text: &str, span: Span, max_bytes: usize) -> Vec<Span> {
    let mut pieces = Vec::new();
    let mut start = span.start;
    while start < span.end {
        if span.end - start <= max_bytes {
            pieces.push(Span::new(start, span.end));
            break;
        }
        let limit = snap_to_char_boundary(text, start + max_bytes);
        let cut = text[start..limit]
            .rfind(char::is_whitespace)
            .map(|pos| start + pos)
            .filter(|&pos| pos > start)
            .unwrap_or(limit);
        let cut = if cut <= start {
            next_char_boundary(text, start)
        } else {
            cut
        };
        let piece = trim_span(text, Span::new(start, cut));
        if !piece.is_empty() {
            pieces.push(piece);
        }
        start = skip_whitespace(text, cut, span.end);
    }
    pieces
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

fn skip_whitespace(text: &str, from: usize, limit: usize) -> usize {
    let slice = &text[from..limit];
    from + (slice.len() - slice.trim_start().len())
}

/// Greedy accumulator that turns unit spans into chunks.
struct ChunkBuilder<'a> {
    document_id: &'a str,
    text: &'a str,
    config: &'a ChunkerConfig,
    chunks: Vec<Chunk>,
    current: Option<Span>,
    /// Where the next fresh chunk resumes so text between units is kept.
    resume_at: usize,
}

impl<'a> ChunkBuilder<'a> {
    fn new(document_id: &'a str, text: &'a str, config: &'a ChunkerConfig) -> Self {
        Self {
            document_id,
            text,
            config,
            chunks: Vec::new(),
            current: None,
            resume_at: skip_whitespace(text, 0, text.len()),
        }
    }

    fn add_unit(&mut self, unit: Span) {
        let current = match self.current {
            None => {
                let start = skip_whitespace(self.text, self.resume_at.min(unit.start), unit.start);
                self.current = Some(Span::new(start, unit.end));
                return;
            }
            Some(current) => current,
        };

        let merged = Span::new(current.start, unit.end);
        if estimate_tokens(merged.slice(self.text)) <= self.config.chunk_size {
            self.current = Some(merged);
            return;
        }

        self.emit(current);
        let seed = self.overlap_start(current).min(unit.start);
        self.current = Some(Span::new(seed, unit.end));
    }

    /// Start of the last `overlap_size` words of `span`.
    fn overlap_start(&self, span: Span) -> usize {
        if self.config.overlap_size == 0 {
            return span.end;
        }
        let slice = span.slice(self.text);
        let mut word_starts = Vec::new();
        let mut in_word = false;
        for (i, c) in slice.char_indices() {
            if c.is_whitespace() {
                in_word = false;
            } else if !in_word {
                word_starts.push(i);
                in_word = true;
            }
        }
        if word_starts.len() <= self.config.overlap_size {
            return span.start;
        }
        span.start + word_starts[word_starts.len() - self.config.overlap_size]
    }

    /// Close the running chunk, if any.
    fn close(&mut self) {
        if let Some(current) = self.current.take() {
            self.emit_or_merge(current);
        }
    }

    fn finish(mut self) -> Vec<Chunk> {
        if let Some(current) = self.current.take() {
            let end = trim_span(self.text, Span::new(current.end, self.text.len()));
            let end = if end.is_empty() { current.end } else { end.end };
            self.emit_or_merge(Span::new(current.start, end));
        }
        self.chunks
    }

    fn emit_or_merge(&mut self, span: Span) {
        let short = span.slice(self.text).trim().chars().count() < self.config.min_chunk_size;
        match self.chunks.pop() {
            Some(previous) if short => {
                let merged = Span::new(previous.start_char, span.end.max(previous.end_char));
                self.chunks.push(self.make_chunk(previous.ordinal, merged));
                self.resume_at = merged.end;
            }
            previous => {
                if let Some(previous) = previous {
                    self.chunks.push(previous);
                }
                self.emit(span);
            }
        }
    }

    fn emit(&mut self, span: Span) {
        let chunk = self.make_chunk(self.chunks.len(), span);
        self.chunks.push(chunk);
        self.resume_at = span.end;
    }

    fn make_chunk(&self, ordinal: usize, span: Span) -> Chunk {
        let text = span.slice(self.text);
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Chunk {
            id: format!("{}#chunk_{}", self.document_id, ordinal),
            parent_doc_id: self.document_id.to_string(),
            ordinal,
            start_char: span.start,
            end_char: span.end,
            text: text.to_string(),
            token_count: estimate_tokens(text),
            hash: format!("{:x}", hasher.finalize()),
        }
    }
}
