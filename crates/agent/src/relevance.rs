//! Relevance engine — which memories matter for the declared task.
//!
//! Scoring is a small additive heuristic:
//!
//! | Signal | Points |
//! |--------|--------|
//! | each task keyword found in the content | +1 |
//! | importance | +0.5 per level |
//! | surfaced within the last 7 days | +1 |
//! | distraction / challenge / insight | +0.5 |
//!
//! Keywords are the whitespace-separated task words longer than three
//! characters, lowercased. Repeated keywords count once per repetition.
//! Items scoring zero or less are discarded; the rest are stably sorted by
//! score so equal scores keep store order.

use chrono::{DateTime, Duration, Utc};
use tandem_core::{MemoryItem, MemoryStore, StoreError};

const RECENCY_WINDOW_DAYS: i64 = 7;
const MIN_KEYWORD_CHARS: usize = 4;

/// A memory item together with the score that selected it.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f64,
}

/// Ranks an owner's memories against a task.
#[derive(Debug, Clone, Copy)]
pub struct RelevanceEngine {
    top_k: usize,
}

impl Default for RelevanceEngine {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl RelevanceEngine {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Pure ranking over an already-loaded item list.
    pub fn rank(&self, items: &[MemoryItem], task: &str, now: DateTime<Utc>) -> Vec<ScoredMemory> {
        let keywords = task_keywords(task);

        let mut scored: Vec<ScoredMemory> = items
            .iter()
            .map(|item| ScoredMemory {
                score: score_memory(item, &keywords, now),
                item: item.clone(),
            })
            .filter(|s| s.score > 0.0)
            .collect();

        // sort_by is stable
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.top_k);
        scored
    }

    /// Load the owner's items and rank them. Never touches anything.
    pub async fn relevant(
        &self,
        store: &dyn MemoryStore,
        owner_id: &str,
        task: &str,
    ) -> Result<Vec<ScoredMemory>, StoreError> {
        let items = store.list_memories(owner_id).await?;
        Ok(self.rank(&items, task, Utc::now()))
    }
}

/// Lowercased task words long enough to be meaningful.
pub fn task_keywords(task: &str) -> Vec<String> {
    task.split_whitespace()
        .filter(|w| w.chars().count() >= MIN_KEYWORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

/// Score one item. `keywords` must already be lowercased.
pub fn score_memory(item: &MemoryItem, keywords: &[String], now: DateTime<Utc>) -> f64 {
    let content = item.content.to_lowercase();

    let keyword_hits = keywords.iter().filter(|k| content.contains(k.as_str())).count();
    let mut score = keyword_hits as f64;

    score += f64::from(item.importance) * 0.5;

    if item
        .last_referenced_at
        .is_some_and(|at| now.signed_duration_since(at) <= Duration::days(RECENCY_WINDOW_DAYS))
    {
        score += 1.0;
    }

    if item.category.is_coaching_signal() {
        score += 0.5;
    }

    score
}
