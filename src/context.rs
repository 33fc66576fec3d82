//! Budgeted context assembly.
//!
//! Combines topic snippets and retrieval hits into one string that never
//! exceeds [`ContextBudget::total_budget`] characters. A request moves
//! through these steps:
//!
//! ```text
//! collect ──▶ allocate ──▶ truncate topics ──▶ reclaim ──▶ truncate hits ──▶ concatenate
//! ```
//!
//! - **collect**: drop empty sources; collapse topics whose names have a
//!   word-set Jaccard similarity at or above `dedup_threshold` (first wins).
//! - **allocate**: reserve the section separator, honour the `topic_min`
//!   and `rag_min` floors (shrinking the retrieval floor first, never below
//!   `rag_floor_min`, then the topic floor), and split the remaining slack
//!   `topic_share` / `1 - topic_share`.
//! - **truncate topics**: each topic gets room proportional to
//!   `1 + min(len, cap)/cap + len(name)/divisor`.
//! - **reclaim**: topic room left unused is handed to the retrieval section,
//!   at most `reclaim_cap` characters.
//! - **truncate hits**: each hit gets room proportional to its score,
//!   clamped to `[hit_min, hit_max]`, in rank order until the section is full.
//!
//! Every cut prefers a sentence or line boundary in the last half of the
//! allotted span. [`assemble_context`] wraps this with topic loading and
//! search; failures there drop the affected source and never fail the call.

use std::collections::HashSet;

use tracing::warn;

use crate::config::ContextBudget;
use crate::engine::RetrievalEngine;
use crate::models::{CollectionId, Hit};
use crate::topics::TopicSource;

/// Joins the topic section and the retrieval section.
pub const SECTION_SEPARATOR: &str = "\n\n";

/// Joins entries inside a section.
const ENTRY_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSnippet {
    pub name: String,
    pub text: String,
}

impl TopicSnippet {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Character room given to each section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub topic: usize,
    pub rag: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub text: String,
    pub topic_chars: usize,
    pub rag_chars: usize,
    pub topics_used: usize,
    pub hits_used: usize,
}

/// Split the budget between the two sections after setting aside `reserve`
/// characters for separators.
///
/// When the floors do not fit, the retrieval floor gives way first, down to
/// `rag_floor_min`; the topic floor is only clamped once retrieval sits at
/// that minimum. With `total_budget = 3000`, `topic_min = 1000`,
/// `rag_min = 2000` and the default `rag_floor_min = 1000` this yields
/// `{ topic: 1000, rag: 1998 }`; raising `rag_floor_min` to 2000 yields
/// `{ topic: 998, rag: 2000 }`. Either way the sum never exceeds the total.
pub fn allocate(budget: &ContextBudget, reserve: usize) -> Allocation {
    let usable = budget.total_budget.saturating_sub(reserve);
    let mut topic = budget.topic_min;
    let mut rag = budget.rag_min;

    if topic + rag > usable {
        let rag_floor = budget.rag_floor_min.min(rag);
        rag = usable.saturating_sub(topic).max(rag_floor).min(rag);
        if topic + rag > usable {
            rag = rag.min(usable);
            topic = usable - rag;
        }
    }

    let slack = usable.saturating_sub(topic + rag);
    let topic_extra = ((slack as f64) * budget.topic_share).round() as usize;
    Allocation {
        topic: topic + topic_extra.min(slack),
        rag: rag + slack.saturating_sub(topic_extra),
    }
}

/// Assemble context from already-loaded topics and ranked hits.
pub fn assemble(topics: &[TopicSnippet], hits: &[Hit], budget: &ContextBudget) -> AssembledContext {
    let topics = dedup_topics(topics, budget.dedup_threshold);
    let hits: Vec<&Hit> = hits.iter().filter(|h| !h.text.trim().is_empty()).collect();

    let alloc = allocate(budget, SECTION_SEPARATOR.len());

    let topic_entries = fill_topics(&topics, alloc.topic, budget);
    let topic_text = topic_entries.join(ENTRY_SEPARATOR);
    let topic_chars = char_len(&topic_text);

    let mut rag_room = alloc.rag;
    if !hits.is_empty() && topic_chars < alloc.topic {
        rag_room += (alloc.topic - topic_chars).min(budget.reclaim_cap);
    }

    let hit_entries = fill_hits(&hits, rag_room, budget);
    let rag_text = hit_entries.join(ENTRY_SEPARATOR);
    let rag_chars = char_len(&rag_text);

    let text = [topic_text.as_str(), rag_text.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR);

    let (text, topic_chars, rag_chars) =
        clamp_to_total(text, topic_chars, rag_chars, budget.total_budget);

    AssembledContext {
        text,
        topic_chars,
        rag_chars,
        topics_used: topic_entries.len(),
        hits_used: hit_entries.len(),
    }
}

/// Hard cut at `total`, keeping the per-section counts in step with what
/// survives. The topic section is the prefix; the retrieval section follows
/// the separator.
fn clamp_to_total(
    text: String,
    topic_chars: usize,
    rag_chars: usize,
    total: usize,
) -> (String, usize, usize) {
    if char_len(&text) <= total {
        return (text, topic_chars, rag_chars);
    }
    let cut: String = text.chars().take(total).collect();
    let joined = if topic_chars > 0 && rag_chars > 0 {
        char_len(SECTION_SEPARATOR)
    } else {
        0
    };
    let topic_kept = topic_chars.min(total);
    let rag_kept = total.saturating_sub(topic_chars + joined).min(rag_chars);
    (cut, topic_kept, rag_kept)
}

/// Load topics, search, and assemble. Sources that fail are skipped.
pub async fn assemble_context(
    engine: &RetrievalEngine,
    topics: &dyn TopicSource,
    query: &str,
    topic_names: &[String],
    collection_ids: &[CollectionId],
    budget: &ContextBudget,
) -> String {
    let mut snippets = Vec::with_capacity(topic_names.len());
    for name in topic_names {
        match topics.load_topic_text(name).await {
            Ok(text) => snippets.push(TopicSnippet::new(name.clone(), text)),
            Err(e) => warn!(topic = %name, error = %e, "topic unavailable, skipping"),
        }
    }

    let hits = if collection_ids.is_empty() {
        Vec::new()
    } else {
        match engine.search_default(query, collection_ids).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "retrieval failed, assembling without hits");
                Vec::new()
            }
        }
    };

    assemble(&snippets, &hits, budget).text
}

fn fill_topics(topics: &[&TopicSnippet], room: usize, budget: &ContextBudget) -> Vec<String> {
    if topics.is_empty() || room == 0 {
        return Vec::new();
    }
    let joins = topics.len() - 1;
    let available = room.saturating_sub(joins);

    let weights: Vec<f64> = topics.iter().map(|t| topic_weight(t, budget)).collect();
    let total: f64 = weights.iter().sum();

    topics
        .iter()
        .zip(&weights)
        .filter_map(|(t, w)| {
            let share = ((available as f64) * w / total).floor() as usize;
            let piece = truncate_at_boundary(t.text.trim(), share);
            (!piece.is_empty()).then(|| piece.to_string())
        })
        .collect()
}

fn topic_weight(topic: &TopicSnippet, budget: &ContextBudget) -> f64 {
    let cap = budget.topic_len_cap as f64;
    let len = (char_len(topic.text.trim()) as f64).min(cap);
    1.0 + len / cap + char_len(&topic.name) as f64 / budget.topic_name_divisor
}

fn fill_hits(hits: &[&Hit], room: usize, budget: &ContextBudget) -> Vec<String> {
    if hits.is_empty() || room == 0 {
        return Vec::new();
    }
    let weight = |h: &Hit| h.score.max(0.0) as f64 + 1e-3;
    let total: f64 = hits.iter().map(|h| weight(h)).sum();

    let mut entries: Vec<String> = Vec::new();
    let mut used = 0usize;
    for hit in hits {
        let join = if entries.is_empty() { 0 } else { ENTRY_SEPARATOR.len() };
        let remaining = room.saturating_sub(used + join);
        if remaining == 0 || (!entries.is_empty() && remaining < budget.hit_min) {
            break;
        }

        let ideal = ((room as f64) * weight(hit) / total).floor() as usize;
        let share = ideal.clamp(budget.hit_min, budget.hit_max).min(remaining);
        let piece = truncate_at_boundary(hit.text.trim(), share);
        if piece.is_empty() {
            continue;
        }
        used += join + char_len(piece);
        entries.push(piece.to_string());
    }
    entries
}

/// Cut `text` to at most `limit` characters.
///
/// When a cut is needed, the last sentence or line boundary (`.`, newline,
/// `! `, `? `) that ends within the second half of the span wins; without
/// one the text is cut hard at `limit`.
pub fn truncate_at_boundary(text: &str, limit: usize) -> &str {
    if limit == 0 {
        return "";
    }
    let Some((cut, _)) = text.char_indices().nth(limit) else {
        return text;
    };
    let head = &text[..cut];
    let half = limit / 2;

    let mut best = None;
    for (chars_seen, (at, c)) in head.char_indices().enumerate() {
        let end = at + c.len_utf8();
        let boundary = match c {
            '.' | '\n' => true,
            '!' | '?' => text[end..].starts_with(' '),
            _ => false,
        };
        if boundary && chars_seen + 1 >= half {
            best = Some(end);
        }
    }

    match best {
        Some(end) => head[..end].trim_end(),
        None => head,
    }
}

/// Keep the first of any group of topics whose names are near-duplicates.
fn dedup_topics(topics: &[TopicSnippet], threshold: f64) -> Vec<&TopicSnippet> {
    let mut kept: Vec<(&TopicSnippet, HashSet<String>)> = Vec::new();
    for topic in topics {
        if topic.text.trim().is_empty() {
            continue;
        }
        let words = word_set(&topic.name);
        let duplicate = kept
            .iter()
            .any(|(k, kw)| jaccard(kw, &words, &k.name, &topic.name) >= threshold);
        if !duplicate {
            kept.push((topic, words));
        }
    }
    kept.into_iter().map(|(t, _)| t).collect()
}

fn word_set(name: &str) -> HashSet<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>, name_a: &str, name_b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return if name_a == name_b { 1.0 } else { 0.0 };
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkId, DocumentId};

    fn budget(total: usize, topic_min: usize, rag_min: usize) -> ContextBudget {
        ContextBudget {
            total_budget: total,
            topic_min,
            rag_min,
            rag_floor_min: rag_min.min(1000),
            ..ContextBudget::default()
        }
    }

    fn hit(id: i64, text: &str, score: f32) -> Hit {
        Hit {
            chunk_id: ChunkId(id),
            document_id: DocumentId(id),
            collection_id: CollectionId(1),
            document_name: format!("doc{}", id),
            text: text.to_string(),
            score,
        }
    }

    fn long_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence {} carries some detail about the subject.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_allocate_splits_slack_70_30() {
        let a = allocate(&budget(6000, 1000, 2000), 0);
        assert_eq!(a.topic, 1000 + 2100);
        assert_eq!(a.rag, 2000 + 900);
    }

    #[test]
    fn test_allocate_shrinks_rag_floor_first() {
        let mut b = budget(2500, 1000, 2000);
        b.rag_floor_min = 1000;
        let a = allocate(&b, 0);
        assert_eq!(a, Allocation { topic: 1000, rag: 1500 });
    }

    #[test]
    fn test_allocate_clamps_topic_when_rag_at_floor() {
        let mut b = budget(3000, 1000, 2000);
        b.rag_floor_min = 2000;
        let a = allocate(&b, SECTION_SEPARATOR.len());
        assert_eq!(a.rag, 2000);
        assert_eq!(a.topic, 998);
        assert!(a.topic + a.rag + SECTION_SEPARATOR.len() <= 3000);
    }

    #[test]
    fn test_allocate_default_floor_shrinks_rag_only() {
        let b = ContextBudget {
            total_budget: 3000,
            topic_min: 1000,
            rag_min: 2000,
            ..ContextBudget::default()
        };
        assert_eq!(b.rag_floor_min, 1000);
        let a = allocate(&b, SECTION_SEPARATOR.len());
        assert_eq!(a, Allocation { topic: 1000, rag: 1998 });
    }

    #[test]
    fn test_clamp_to_total_recounts_sections() {
        // "aaaa" + "\n\n" + "bbbbbb", cut inside the retrieval section
        let text = "aaaa\n\nbbbbbb".to_string();
        let (cut, topic, rag) = clamp_to_total(text.clone(), 4, 6, 9);
        assert_eq!(cut, "aaaa\n\nbbb");
        assert_eq!((topic, rag), (4, 3));

        // Cut inside the topic section drops the retrieval count
        let (cut, topic, rag) = clamp_to_total(text.clone(), 4, 6, 3);
        assert_eq!(cut, "aaa");
        assert_eq!((topic, rag), (3, 0));

        // Under the limit nothing changes
        let (cut, topic, rag) = clamp_to_total(text.clone(), 4, 6, 100);
        assert_eq!(cut, text);
        assert_eq!((topic, rag), (4, 6));

        // Retrieval only
        let (cut, topic, rag) = clamp_to_total("bbbbbb".to_string(), 0, 6, 4);
        assert_eq!(cut, "bbbb");
        assert_eq!((topic, rag), (0, 4));
    }

    #[test]
    fn test_allocate_tiny_total() {
        let a = allocate(&budget(100, 1000, 2000), 2);
        assert!(a.topic + a.rag <= 98);
    }

    #[test]
    fn test_budget_conservation() {
        let mut b = budget(3000, 1000, 2000);
        b.rag_floor_min = 2000;
        let topics = vec![
            TopicSnippet::new("shipping rates", long_text(80)),
            TopicSnippet::new("returns", long_text(40)),
        ];
        let hits: Vec<Hit> = (0..10).map(|i| hit(i, &long_text(30), 0.9 - i as f32 * 0.05)).collect();
        let out = assemble(&topics, &hits, &b);
        assert!(out.text.chars().count() <= 3000, "len {}", out.text.chars().count());
        assert!(out.topics_used > 0);
        assert!(out.hits_used > 0);
    }

    #[test]
    fn test_budget_conservation_many_budgets() {
        let topics = vec![TopicSnippet::new("alpha", long_text(50))];
        let hits: Vec<Hit> = (0..6).map(|i| hit(i, &long_text(20), 0.5)).collect();
        for total in [10, 50, 300, 1200, 4000, 9000] {
            let out = assemble(&topics, &hits, &budget(total, total / 3, total / 2));
            assert!(out.text.chars().count() <= total, "total {}", total);
        }
    }

    #[test]
    fn test_truncate_prefers_sentence_boundary() {
        let text = "First sentence here. Second sentence goes on and on";
        let cut = truncate_at_boundary(text, 30);
        assert_eq!(cut, "First sentence here.");
    }

    #[test]
    fn test_truncate_ignores_early_boundary() {
        let text = "Hi. this run of words has no other boundary at all";
        let cut = truncate_at_boundary(text, 30);
        assert_eq!(cut.chars().count(), 30);
    }

    #[test]
    fn test_truncate_bang_and_newline() {
        assert_eq!(truncate_at_boundary("Stop right there! Then more words", 24), "Stop right there!");
        assert_eq!(truncate_at_boundary("line one\nline two continues", 16), "line one");
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_at_boundary("short", 10), "short");
        assert_eq!(truncate_at_boundary("short", 0), "");
    }

    #[test]
    fn test_truncate_multibyte() {
        let text = "ñandú ".repeat(20);
        let cut = truncate_at_boundary(&text, 13);
        assert!(cut.chars().count() <= 13);
    }

    #[test]
    fn test_dedup_near_duplicate_topics() {
        let topics = vec![
            TopicSnippet::new("Return Policy Details", "first"),
            TopicSnippet::new("return policy details", "second"),
            TopicSnippet::new("Shipping", "third"),
        ];
        let kept = dedup_topics(&topics, 0.8);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text, "first");
        assert_eq!(kept[1].name, "Shipping");
    }

    #[test]
    fn test_dedup_keeps_distinct_overlap() {
        let topics = vec![
            TopicSnippet::new("return policy", "a"),
            TopicSnippet::new("return shipping", "b"),
        ];
        assert_eq!(dedup_topics(&topics, 0.8).len(), 2);
    }

    #[test]
    fn test_longer_topic_gets_more_room() {
        let b = budget(4000, 2000, 1000);
        let topics = vec![
            TopicSnippet::new("a", long_text(100)),
            TopicSnippet::new("a much more specific topic name", long_text(100)),
        ];
        let entries = fill_topics(&topics.iter().collect::<Vec<_>>(), 2000, &b);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].len() > entries[0].len());
    }

    #[test]
    fn test_higher_score_gets_more_room() {
        let mut b = budget(6000, 0, 3000);
        b.hit_min = 50;
        b.hit_max = 3000;
        let high = hit(1, &long_text(100), 0.9);
        let low = hit(2, &long_text(100), 0.1);
        let entries = fill_hits(&[&high, &low], 3000, &b);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].len() > entries[1].len());
        assert!(entries[1].chars().count() >= 25);
    }

    #[test]
    fn test_hit_max_caps_single_hit() {
        let mut b = budget(6000, 0, 5000);
        b.hit_max = 400;
        let only = hit(1, &long_text(200), 1.0);
        let entries = fill_hits(&[&only], 5000, &b);
        assert!(entries[0].chars().count() <= 400);
    }

    #[test]
    fn test_reclaim_unused_topic_room() {
        let mut b = budget(6000, 3000, 1000);
        b.rag_floor_min = 500;
        b.hit_max = 10_000;
        b.reclaim_cap = 1500;
        let topics = vec![TopicSnippet::new("tiny", "Short topic.")];
        let hits = vec![hit(1, &long_text(300), 0.8)];
        let out = assemble(&topics, &hits, &b);
        let alloc = allocate(&b, SECTION_SEPARATOR.len());
        assert!(out.rag_chars > alloc.rag);
        assert!(out.rag_chars <= alloc.rag + 1500);
        assert!(out.text.chars().count() <= 6000);
    }

    #[test]
    fn test_no_sources_is_empty() {
        let out = assemble(&[], &[], &ContextBudget::default());
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_sections_joined_by_blank_line() {
        let topics = vec![TopicSnippet::new("t", "Topic text.")];
        let hits = vec![hit(1, "Hit text.", 0.5)];
        let out = assemble(&topics, &hits, &ContextBudget::default());
        assert_eq!(out.text, "Topic text.\n\nHit text.");
    }
}
