//! Storage and index overview.
//!
//! Summarizes what is stored per collection and whether each collection's
//! index is in memory or cached on disk. Printed by `ragctx stats`.

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::engine::RetrievalEngine;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub id: i64,
    pub name: String,
    pub documents: i64,
    pub archived: i64,
    pub chunks: i64,
    pub index_loaded: bool,
    pub index_vectors: usize,
    pub index_cached: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub provider: String,
    pub model_id: String,
    pub dimension: usize,
    pub collections: Vec<CollectionStats>,
}

impl Stats {
    pub fn total_documents(&self) -> i64 {
        self.collections.iter().map(|c| c.documents).sum()
    }

    pub fn total_chunks(&self) -> i64 {
        self.collections.iter().map(|c| c.chunks).sum()
    }
}

pub async fn collect_stats(engine: &RetrievalEngine) -> Result<Stats> {
    let info = engine.provider().info();
    let collections = engine
        .store()
        .collection_counts()
        .await?
        .into_iter()
        .map(|c| CollectionStats {
            id: c.collection.id.0,
            index_loaded: engine.index().is_loaded(c.collection.id),
            index_vectors: engine.index().len(c.collection.id),
            index_cached: engine.index().has_cache(c.collection.id),
            name: c.collection.name,
            documents: c.documents,
            archived: c.archived,
            chunks: c.chunks,
            created_at: c.collection.created_at,
        })
        .collect();

    Ok(Stats {
        provider: info.kind.to_string(),
        model_id: info.model_id,
        dimension: info.dimension,
        collections,
    })
}

/// Print a stats summary to stdout.
pub fn print_stats(stats: &Stats, db_path: &std::path::Path) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("rag-context stats");
    println!("=================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Embeddings:  {} ({}, {} dims)",
        stats.provider, stats.model_id, stats.dimension
    );
    println!();
    println!("  Documents:   {}", stats.total_documents());
    println!("  Chunks:      {}", stats.total_chunks());

    if !stats.collections.is_empty() {
        println!();
        println!(
            "  {:>4}  {:<24} {:>6} {:>8} {:>8}  {:<8} {}",
            "ID", "COLLECTION", "DOCS", "ARCHIVED", "CHUNKS", "INDEX", "CREATED"
        );
        println!("  {}", "-".repeat(84));
        for c in &stats.collections {
            let index = match (c.index_loaded, c.index_cached) {
                (true, _) => "loaded",
                (false, true) => "cached",
                (false, false) => "none",
            };
            println!(
                "  {:>4}  {:<24} {:>6} {:>8} {:>8}  {:<8} {}",
                c.id,
                c.name,
                c.documents,
                c.archived,
                c.chunks,
                index,
                format_ts_relative(c.created_at)
            );
        }
    }
    println!();
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

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
