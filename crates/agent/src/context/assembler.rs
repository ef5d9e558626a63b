//! Context assembly pipeline.
//!
//! Builds the system prompt for one chat turn from five sources:
//!
//! 1. **Profile** (name, work, interests) and the session itself — fixed,
//!    never trimmed
//! 2. **Relevant context** — relevance-ranked memories for the task
//! 3. **Category buckets** — the most important items per category
//! 4. **Recent sessions** — summaries of completed sessions, newest first
//!
//! Variable sections are filled in that priority order under a token
//! budget. Items that do not fit are dropped and recorded; a section left
//! with no items renders its fallback text.
//!
//! # Determinism
//!
//! `render` is a pure function of its inputs. Only `assemble` performs I/O
//! (loading inputs, then touching the bucket items that made it in).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tandem_core::{
    ChatTurn, FocusSession, MemoryCategory, MemoryItem, MemoryStore, Message, Owner,
    OwnerDirectory, SessionStore, SessionSummary, StoreError,
};
use tracing::{debug, warn};

use crate::context::token;
use crate::prompt::{PromptSections, render_system_prompt};
use crate::relevance::{RelevanceEngine, ScoredMemory};

// ── Types ─────────────────────────────────────────────────────────────────

/// Assembly limits.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Items per category bucket.
    pub bucket_size: usize,
    /// Completed sessions to summarize.
    pub recent_sessions: usize,
    /// Estimated-token ceiling for the whole system prompt.
    pub token_budget: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            bucket_size: 5,
            recent_sessions: 10,
            token_budget: 3000,
        }
    }
}

impl From<&tandem_config::ContextConfig> for ContextSettings {
    fn from(config: &tandem_config::ContextConfig) -> Self {
        Self {
            bucket_size: config.bucket_size,
            recent_sessions: config.recent_sessions,
            token_budget: config.token_budget,
        }
    }
}

/// Everything `render` needs, already loaded.
pub struct ContextInputs<'a> {
    pub owner: &'a Owner,
    pub session: &'a FocusSession,
    /// Relevance output, best first.
    pub relevant: &'a [ScoredMemory],
    /// One bucket per category in render order, most important first.
    pub buckets: &'a [(MemoryCategory, Vec<MemoryItem>)],
    /// Newest first.
    pub recent_sessions: &'a [SessionSummary],
}

/// The prompt for one turn. Recomputed every turn, never cached.
#[derive(Debug, Clone)]
pub struct RenderedContext {
    pub text: String,
    pub metadata: AssemblyMetadata,
    /// Bucket items that were rendered (and are therefore touched).
    pub surfaced_memory_ids: Vec<String>,
}

/// Detailed metadata about the assembly process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Estimated tokens of the rendered prompt.
    pub total_tokens: usize,
    /// Tokens of the fixed template, profile and session details.
    pub fixed_tokens: usize,
    pub budget: usize,
    /// Budget utilization percentage (0.0–100.0).
    pub utilization_pct: f32,
    pub per_section: Vec<SectionStats>,
    pub drops: Vec<DropInfo>,
}

/// Statistics for a single variable section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionStats {
    pub name: String,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

/// Items dropped from a section during budget enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    pub section: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

/// Errors from context assembly.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("Unknown owner: {owner_id}")]
    UnknownOwner { owner_id: String },

    #[error("Fixed prompt content ({fixed_tokens} tokens) exceeds budget ({budget} tokens)")]
    BudgetExceeded { fixed_tokens: usize, budget: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Loads a turn's inputs from the stores and renders them.
pub struct ContextAssembler {
    owners: Arc<dyn OwnerDirectory>,
    sessions: Arc<dyn SessionStore>,
    memories: Arc<dyn MemoryStore>,
    relevance: RelevanceEngine,
    settings: ContextSettings,
}

impl ContextAssembler {
    pub fn new(
        owners: Arc<dyn OwnerDirectory>,
        sessions: Arc<dyn SessionStore>,
        memories: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            owners,
            sessions,
            memories,
            relevance: RelevanceEngine::default(),
            settings: ContextSettings::default(),
        }
    }

    pub fn with_relevance(mut self, relevance: RelevanceEngine) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_settings(mut self, settings: ContextSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Assemble the system prompt for a turn in `session`.
    pub async fn assemble(&self, session: &FocusSession) -> Result<RenderedContext, AssemblyError> {
        let owner_id = session.owner_id.as_str();

        let owner = self
            .owners
            .find_owner(owner_id)
            .await?
            .ok_or_else(|| AssemblyError::UnknownOwner {
                owner_id: owner_id.to_string(),
            })?;

        let recent = self
            .sessions
            .recent_completed_sessions(owner_id, Some(&session.id), self.settings.recent_sessions)
            .await?;

        let relevant = self
            .relevance
            .relevant(self.memories.as_ref(), owner_id, &session.task)
            .await?;

        let mut buckets = Vec::with_capacity(MemoryCategory::ALL.len());
        for category in MemoryCategory::ALL {
            let items = self
                .memories
                .list_by_category(owner_id, category, self.settings.bucket_size)
                .await?;
            buckets.push((category, items));
        }

        let rendered = self.render(&ContextInputs {
            owner: &owner,
            session,
            relevant: &relevant,
            buckets: &buckets,
            recent_sessions: &recent,
        })?;

        for memory_id in &rendered.surfaced_memory_ids {
            if let Err(e) = self.memories.touch_memory(owner_id, memory_id).await {
                warn!(owner_id, memory_id = %memory_id, error = %e, "Failed to touch memory");
            }
        }

        debug!(
            session_id = %session.id,
            tokens = rendered.metadata.total_tokens,
            budget = rendered.metadata.budget,
            drops = rendered.metadata.drops.len(),
            "Context assembled"
        );

        Ok(rendered)
    }

    /// Render loaded inputs under the token budget.
    pub fn render(&self, input: &ContextInputs<'_>) -> Result<RenderedContext, AssemblyError> {
        let budget = self.settings.token_budget;

        let mut sections = PromptSections {
            name: Some(input.owner.name.clone()),
            work_context: input.owner.work_context.clone(),
            interests: (!input.owner.interests.is_empty())
                .then(|| input.owner.interests.join(", ")),
            task: input.session.task.clone(),
            planned_minutes: input.session.planned_minutes,
            checkin_minutes: input.session.checkin_minutes,
            relevant: None,
            buckets: MemoryCategory::ALL.iter().map(|c| (c.heading(), None)).collect(),
            recent_sessions: None,
        };

        // ── Fixed part (always kept) ──────────────────────────────────────
        let fixed_tokens = token::estimate_tokens(&render_system_prompt(&sections));
        if fixed_tokens > budget {
            return Err(AssemblyError::BudgetExceeded {
                fixed_tokens,
                budget,
            });
        }
        let mut remaining = budget - fixed_tokens;
        let mut stats = Vec::new();
        let mut drops = Vec::new();

        // ── Relevant context ──────────────────────────────────────────────
        let relevant_lines: Vec<String> = input
            .relevant
            .iter()
            .map(|s| format!("- [{}] {}", s.item.category, s.item.content))
            .collect();
        let filled = fill_section("relevant", &relevant_lines, &mut remaining);
        sections.relevant = filled.body(&relevant_lines);
        filled.record(&mut stats, &mut drops, "Lowest-ranked items dropped");

        // ── Category buckets ──────────────────────────────────────────────
        let mut surfaced_memory_ids = Vec::new();
        for (category, items) in input.buckets {
            let lines: Vec<String> = items.iter().map(|m| format!("- {}", m.content)).collect();
            let filled = fill_section(category.as_str(), &lines, &mut remaining);

            surfaced_memory_ids.extend(
                filled
                    .included
                    .iter()
                    .map(|&i| items[i].id.clone()),
            );
            if let Some(slot) = sections
                .buckets
                .iter_mut()
                .find(|(heading, _)| *heading == category.heading())
            {
                slot.1 = filled.body(&lines);
            }
            filled.record(&mut stats, &mut drops, "Least important items dropped");
        }

        // ── Recent sessions ───────────────────────────────────────────────
        let session_lines: Vec<String> = input.recent_sessions.iter().map(session_line).collect();
        let filled = fill_section("recent_sessions", &session_lines, &mut remaining);
        sections.recent_sessions = filled.body(&session_lines);
        filled.record(&mut stats, &mut drops, "Oldest sessions dropped");

        let text = render_system_prompt(&sections);
        let total_tokens = token::estimate_tokens(&text);

        Ok(RenderedContext {
            text,
            metadata: AssemblyMetadata {
                total_tokens,
                fixed_tokens,
                budget,
                utilization_pct: (total_tokens as f32 / budget.max(1) as f32) * 100.0,
                per_section: stats,
                drops,
            },
            surfaced_memory_ids,
        })
    }
}

/// The most recent `window` turns as provider messages, oldest first.
pub fn conversation_window(turns: &[ChatTurn], window: usize) -> Vec<Message> {
    let start = turns.len().saturating_sub(window);
    turns[start..].iter().map(Message::from).collect()
}

fn session_line(summary: &SessionSummary) -> String {
    let mut line = format!(
        "- {}: {} ({} min)",
        summary.date.format("%Y-%m-%d"),
        summary.task,
        summary.duration_minutes
    );
    if let Some(outcome) = &summary.outcome {
        line.push_str(&format!(". Outcome: {outcome}"));
    }
    line
}

// ── Budget filling ────────────────────────────────────────────────────────

struct FilledSection {
    name: String,
    included: Vec<usize>,
    tokens: usize,
    total: usize,
    dropped_tokens: usize,
}

impl FilledSection {
    fn body(&self, lines: &[String]) -> Option<String> {
        if self.included.is_empty() {
            return None;
        }
        Some(
            self.included
                .iter()
                .map(|&i| lines[i].as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn record(self, stats: &mut Vec<SectionStats>, drops: &mut Vec<DropInfo>, reason: &str) {
        let dropped = self.total - self.included.len();
        if dropped > 0 {
            drops.push(DropInfo {
                section: self.name.clone(),
                items_dropped: dropped,
                tokens_dropped: self.dropped_tokens,
                reason: reason.into(),
            });
        }
        stats.push(SectionStats {
            name: self.name,
            tokens: self.tokens,
            items_included: self.included.len(),
            items_total: self.total,
        });
    }
}

/// Greedily take lines in order while they fit.
fn fill_section(name: &str, lines: &[String], remaining: &mut usize) -> FilledSection {
    let mut filled = FilledSection {
        name: name.to_string(),
        included: Vec::new(),
        tokens: 0,
        total: lines.len(),
        dropped_tokens: 0,
    };

    for (i, line) in lines.iter().enumerate() {
        // +1 for the joining newline
        let cost = token::estimate_tokens(line) + 1;
        if cost <= *remaining {
            *remaining -= cost;
            filled.tokens += cost;
            filled.included.push(i);
        } else {
            filled.dropped_tokens += cost;
        }
    }
    filled
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tandem_core::{Role, SessionStatus};
    use tandem_store::InMemoryStore;

    use crate::prompt::{FIRST_SESSION, NO_RELEVANT_CONTEXT, NOT_YET_SHARED};

    fn assembler(store: &InMemoryStore) -> ContextAssembler {
        let store = Arc::new(store.clone());
        ContextAssembler::new(store.clone(), store.clone(), store)
    }

    async fn owner(store: &InMemoryStore, owner: Owner) -> Owner {
        store.create_owner(owner).await.unwrap()
    }

    fn empty_buckets() -> Vec<(MemoryCategory, Vec<MemoryItem>)> {
        MemoryCategory::ALL.iter().map(|c| (*c, Vec::new())).collect()
    }

    #[tokio::test]
    async fn first_session_renders_every_fallback() {
        let store = InMemoryStore::new();
        let mut bare = Owner::new("", "anon@example.com");
        bare.name = String::new();
        let owner = owner(&store, bare).await;
        let session = store
            .create_session(FocusSession::new(&owner.id, "Plan the week", 25, 5))
            .await
            .unwrap();

        let rendered = assembler(&store).assemble(&session).await.unwrap();

        assert!(rendered.text.contains(&format!("Name: {NOT_YET_SHARED}")));
        assert!(rendered.text.contains(&format!("Work: {NOT_YET_SHARED}")));
        assert!(rendered.text.contains(&format!("Interests: {NOT_YET_SHARED}")));
        assert!(rendered.text.contains(FIRST_SESSION));
        assert!(rendered.text.contains(NO_RELEVANT_CONTEXT));
        for category in MemoryCategory::ALL {
            assert!(
                rendered
                    .text
                    .contains(&format!("### {}\n{NOT_YET_SHARED}", category.heading()))
            );
        }
        assert!(rendered.metadata.drops.is_empty());
        assert!(rendered.surfaced_memory_ids.is_empty());
    }

    #[tokio::test]
    async fn unknown_owner_fails_fast() {
        let store = InMemoryStore::new();
        let session = FocusSession::new("ghost", "Anything", 25, 5);
        let err = assembler(&store).assemble(&session).await.unwrap_err();
        assert!(matches!(err, AssemblyError::UnknownOwner { owner_id } if owner_id == "ghost"));
    }

    #[tokio::test]
    async fn populated_context_and_touching() {
        let store = InMemoryStore::new();
        let owner = owner(
            &store,
            Owner::new("Ada", "ada@example.com")
                .with_work_context("Compiler engineer")
                .with_interests(vec!["chess".into(), "climbing".into()]),
        )
        .await;

        let bucketed = store
            .add_memory(MemoryItem::new(&owner.id, MemoryCategory::Project, "Parser rewrite", 4))
            .await
            .unwrap();

        let mut past = FocusSession::new(&owner.id, "Benchmark lexer", 30, 10);
        past.started_at = Utc::now() - Duration::days(1);
        past.status = SessionStatus::Completed;
        past.ended_at = Some(past.started_at + Duration::minutes(28));
        past.outcome = Some("Found the hot loop".into());
        store.create_session(past).await.unwrap();

        let current = store
            .create_session(FocusSession::new(&owner.id, "Finish parser rewrite", 50, 15))
            .await
            .unwrap();

        let rendered = assembler(&store).assemble(&current).await.unwrap();

        assert!(rendered.text.contains("Name: Ada"));
        assert!(rendered.text.contains("Work: Compiler engineer"));
        assert!(rendered.text.contains("Interests: chess, climbing"));
        assert!(rendered.text.contains("- [project] Parser rewrite"));
        assert!(rendered.text.contains("### Current projects\n- Parser rewrite"));
        assert!(rendered.text.contains("Benchmark lexer (28 min). Outcome: Found the hot loop"));
        assert!(!rendered.text.contains("Finish parser rewrite (50 min)"));

        assert_eq!(rendered.surfaced_memory_ids, vec![bucketed.id.clone()]);
        let stored = store.list_memories(&owner.id).await.unwrap();
        assert!(stored[0].last_referenced_at.is_some());
    }

    #[tokio::test]
    async fn relevance_alone_never_touches() {
        let store = InMemoryStore::new();
        let owner = owner(&store, Owner::new("Ada", "ada@example.com")).await;
        let session = FocusSession::new(&owner.id, "Write tests", 25, 5);

        let item = MemoryItem::new(&owner.id, MemoryCategory::Insight, "Tests first works", 5);
        let relevant = vec![ScoredMemory {
            item: item.clone(),
            score: 3.0,
        }];

        let rendered = assembler(&store)
            .render(&ContextInputs {
                owner: &owner,
                session: &session,
                relevant: &relevant,
                buckets: &empty_buckets(),
                recent_sessions: &[],
            })
            .unwrap();
        assert!(rendered.text.contains("- [insight] Tests first works"));
        assert!(rendered.surfaced_memory_ids.is_empty());
    }

    #[test]
    fn budget_trimming_records_drops() {
        let store = InMemoryStore::new();
        let owner = Owner::new("Ada", "ada@example.com");
        let session = FocusSession::new(&owner.id, "Deep work", 25, 5);

        let base = assembler(&store)
            .render(&ContextInputs {
                owner: &owner,
                session: &session,
                relevant: &[],
                buckets: &empty_buckets(),
                recent_sessions: &[],
            })
            .unwrap();

        // Room for the fixed part plus roughly one 100-char line.
        let settings = ContextSettings {
            token_budget: base.metadata.fixed_tokens + 40,
            ..ContextSettings::default()
        };

        let long = "x".repeat(100);
        let mut buckets = empty_buckets();
        buckets[0].1 = (0..3)
            .map(|i| MemoryItem::new(&owner.id, MemoryCategory::Project, format!("{i}{long}"), 5 - i))
            .collect();

        let rendered = assembler(&store)
            .with_settings(settings)
            .render(&ContextInputs {
                owner: &owner,
                session: &session,
                relevant: &[],
                buckets: &buckets,
                recent_sessions: &[],
            })
            .unwrap();

        assert_eq!(rendered.surfaced_memory_ids, vec![buckets[0].1[0].id.clone()]);
        let drop = rendered
            .metadata
            .drops
            .iter()
            .find(|d| d.section == "project")
            .unwrap();
        assert_eq!(drop.items_dropped, 2);
        assert!(rendered.text.contains(&format!("- 0{long}")));
        assert!(!rendered.text.contains(&format!("- 1{long}")));
    }

    #[test]
    fn fixed_part_over_budget_fails() {
        let store = InMemoryStore::new();
        let owner = Owner::new("Ada", "ada@example.com");
        let session = FocusSession::new(&owner.id, "Deep work", 25, 5);

        let err = assembler(&store)
            .with_settings(ContextSettings {
                token_budget: 10,
                ..ContextSettings::default()
            })
            .render(&ContextInputs {
                owner: &owner,
                session: &session,
                relevant: &[],
                buckets: &empty_buckets(),
                recent_sessions: &[],
            })
            .unwrap_err();
        assert!(matches!(err, AssemblyError::BudgetExceeded { budget: 10, .. }));
    }

    #[test]
    fn window_keeps_latest_turns_in_order() {
        let turns: Vec<ChatTurn> = (0..5)
            .map(|i| ChatTurn {
                id: format!("t{i}"),
                session_id: "s".into(),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("turn {i}"),
                created_at: Utc::now(),
            })
            .collect();

        let window = conversation_window(&turns, 3);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(conversation_window(&turns, 40).len(), 5);
    }
}
