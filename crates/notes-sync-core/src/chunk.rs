//! Paragraph-aware chunker with overlap, used by the local index.
//!
//! Session notes are split into chunks of at most `max_tokens` (estimated at
//! four characters per token). Paragraphs (`\n\n`-separated) are packed
//! greedily; a paragraph longer than the limit is cut at the last newline or
//! space before the limit. Each chunk after the first starts with the last
//! `overlap_tokens` worth of the previous chunk so passages that straddle a
//! boundary stay retrievable.
//!
//! ```rust
//! use notes_sync_core::chunk::{chunk_text, ChunkingParams};
//!
//! let params = ChunkingParams { max_tokens: 300, overlap_tokens: 75 };
//! let chunks = chunk_text("documents/1", "Hello.\n\nSecond paragraph.", params);
//! assert_eq!(chunks.len(), 1);
//! ```

use sha2::{Digest, Sha256};

use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            overlap_tokens: 75,
        }
    }
}

/// Split `text` into chunks. Always returns at least one chunk.
pub fn chunk_text(document_name: &str, text: &str, params: ChunkingParams) -> Vec<Chunk> {
    let max_chars = params.max_tokens.max(1) * CHARS_PER_TOKEN;
    // Overlap must leave room for new text in every chunk.
    let overlap_chars = (params.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut segments = Vec::new();
    for para in text.split("\n\n") {
        let para = para.trim();
        if !para.is_empty() {
            split_long(para, max_chars, &mut segments);
        }
    }

    let mut texts: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut fresh = false;

    for seg in segments {
        let would_be = if buf.is_empty() {
            seg.len()
        } else {
            buf.len() + 2 + seg.len()
        };

        if would_be > max_chars && fresh {
            let tail = overlap_tail(&buf, overlap_chars).to_string();
            texts.push(std::mem::take(&mut buf));
            fresh = false;
            if !tail.is_empty() && tail.len() + 2 + seg.len() <= max_chars {
                buf = tail;
            }
        } else if would_be > max_chars {
            // Only carried-over overlap in the buffer; drop it.
            buf.clear();
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(seg);
        fresh = true;
    }

    if fresh {
        texts.push(buf);
    }
    if texts.is_empty() {
        texts.push(text.trim().to_string());
    }

    texts
        .into_iter()
        .enumerate()
        .map(|(i, t)| make_chunk(document_name, i as i64, t))
        .collect()
}

/// Push `para` onto `out`, hard-splitting pieces longer than `max_chars`.
fn split_long<'a>(para: &'a str, max_chars: usize, out: &mut Vec<&'a str>) {
    let mut rest = para;
    while rest.len() > max_chars {
        let limit = floor_char_boundary(rest, max_chars);
        let cut = rest[..limit]
            .rfind(['\n', ' '])
            .filter(|&pos| pos > 0)
            .unwrap_or(limit);
        let cut = if cut == 0 {
            // A single char wider than the limit.
            rest.char_indices().nth(1).map(|(i, _)| i).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest);
    }
}

/// The last `n` bytes of `s`, widened to a char boundary and trimmed to
/// start at a word.
fn overlap_tail(s: &str, n: usize) -> &str {
    if n == 0 || s.is_empty() {
        return "";
    }
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
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

fn make_chunk(document_name: &str, index: i64, text: String) -> Chunk {
    let hash = hex::encode(Sha256::digest(text.as_bytes()));
    Chunk {
        id: format!("{}#{}", document_name, index),
        document_name: document_name.to_string(),
        chunk_index: index,
        text,
        hash,
    }
}
