//! Memory items — durable, categorized facts about an owner.
//!
//! Memories personalize every generated reply. They are created by the
//! owner (or inferred from conversation), edited in place, "touched" when
//! surfaced into a prompt, and only ever deleted explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// The closed set of memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Project,
    Interest,
    Challenge,
    Insight,
    Distraction,
    Goal,
    Preference,
    Win,
    Context,
}

impl MemoryCategory {
    /// Every category, in prompt rendering order.
    pub const ALL: [MemoryCategory; 9] = [
        MemoryCategory::Project,
        MemoryCategory::Goal,
        MemoryCategory::Challenge,
        MemoryCategory::Distraction,
        MemoryCategory::Insight,
        MemoryCategory::Preference,
        MemoryCategory::Interest,
        MemoryCategory::Win,
        MemoryCategory::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Project => "project",
            MemoryCategory::Interest => "interest",
            MemoryCategory::Challenge => "challenge",
            MemoryCategory::Insight => "insight",
            MemoryCategory::Distraction => "distraction",
            MemoryCategory::Goal => "goal",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Win => "win",
            MemoryCategory::Context => "context",
        }
    }

    /// Section heading used when rendering this category's bucket.
    pub fn heading(&self) -> &'static str {
        match self {
            MemoryCategory::Project => "Current projects",
            MemoryCategory::Interest => "Interests",
            MemoryCategory::Challenge => "Known challenges",
            MemoryCategory::Insight => "What has worked before",
            MemoryCategory::Distraction => "Common distractions",
            MemoryCategory::Goal => "Goals",
            MemoryCategory::Preference => "Preferences",
            MemoryCategory::Win => "Recent wins",
            MemoryCategory::Context => "Other context",
        }
    }

    /// Categories that are disproportionately useful for in-the-moment coaching.
    pub fn is_coaching_signal(&self) -> bool {
        matches!(
            self,
            MemoryCategory::Distraction | MemoryCategory::Challenge | MemoryCategory::Insight
        )
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemoryCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown memory category '{s}'"))
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single durable fact about an owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub owner_id: String,
    pub category: MemoryCategory,
    pub content: String,
    /// Weight in `1..=5`.
    pub importance: u8,
    /// Last time this item was surfaced into a prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_referenced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Provenance tag ("manual", "conversation", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MemoryItem {
    pub fn new(
        owner_id: impl Into<String>,
        category: MemoryCategory,
        content: impl Into<String>,
        importance: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            category,
            content: content.into(),
            importance,
            last_referenced_at: None,
            created_at: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Keyed-row storage for memory items.
///
/// Every operation takes the owner id and never reads or writes another
/// owner's rows.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add_memory(&self, item: MemoryItem) -> Result<MemoryItem, StoreError>;

    /// Replace content, category and importance. Returns `false` if no such
    /// item belongs to the owner.
    async fn update_memory(&self, owner_id: &str, item: &MemoryItem) -> Result<bool, StoreError>;

    /// All of the owner's items in storage (insertion) order.
    async fn list_memories(&self, owner_id: &str) -> Result<Vec<MemoryItem>, StoreError>;

    /// One category's items, most important first (newest first on ties).
    async fn list_by_category(
        &self,
        owner_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, StoreError>;

    /// Bump `last_referenced_at` to now.
    async fn touch_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError>;

    async fn delete_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError>;
}
