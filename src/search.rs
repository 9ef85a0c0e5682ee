//! Keyword search over the local SQLite index.
//!
//! Runs an FTS5 `MATCH` over chunk text, ranks by bm25, and keeps the best
//! chunk per document so each note appears once in the results.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use notes_sync_core::models::METADATA_IDENTIFIER;

/// How many chunk candidates to pull before grouping by document.
const CANDIDATES_PER_RESULT: i64 = 5;

/// One matching note.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Document identifier (relative note path), when the document carries one.
    pub identifier: Option<String>,
    pub resource_name: String,
    pub display_name: String,
    /// Higher is better.
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone)]
struct ChunkCandidate {
    document_name: String,
    score: f64,
    snippet: String,
}

/// Turn free text into an FTS5 query: every word becomes a quoted phrase,
/// so punctuation in the input cannot be read as query syntax.
pub fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Search the local index for `query`, returning at most `limit` notes.
pub async fn search(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let fts = fts_query(query);
    if fts.is_empty() || limit <= 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT document_name, rank,
               snippet(index_chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet
        FROM index_chunks_fts
        WHERE index_chunks_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&fts)
    .bind(limit.saturating_mul(CANDIDATES_PER_RESULT))
    .fetch_all(pool)
    .await?;

    let candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                document_name: row.get("document_name"),
                score: -rank, // negate so higher = better
                snippet: row.get("snippet"),
            }
        })
        .collect();

    // Group by document using MAX aggregation
    let mut best: HashMap<String, ChunkCandidate> = HashMap::new();
    for cand in candidates {
        match best.get(&cand.document_name) {
            Some(existing) if existing.score >= cand.score => {}
            _ => {
                best.insert(cand.document_name.clone(), cand);
            }
        }
    }

    let mut hits = Vec::with_capacity(best.len());
    for (name, cand) in best {
        let row = sqlx::query(
            "SELECT display_name, metadata_json FROM index_documents WHERE name = ?",
        )
        .bind(&name)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else { continue };
        let metadata_json: String = row.get("metadata_json");
        let identifier = serde_json::from_str::<HashMap<String, String>>(&metadata_json)
            .ok()
            .and_then(|mut m| m.remove(METADATA_IDENTIFIER));

        hits.push(SearchHit {
            identifier,
            resource_name: name,
            display_name: row.get("display_name"),
            score: cand.score,
            snippet: cand.snippet,
        });
    }

    // Sort: score desc, name asc (deterministic)
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.resource_name.cmp(&b.resource_name))
    });
    hits.truncate(limit as usize);

    Ok(hits)
}
