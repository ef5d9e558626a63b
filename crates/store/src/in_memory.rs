//! In-memory backend — useful for testing and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tandem_core::{
    ChatHistory, ChatTurn, FocusSession, Identity, IdentityValidator, MemoryCategory, MemoryItem,
    MemoryStore, Owner, OwnerDirectory, Role, SessionStatus, SessionStore, SessionSummary,
    StoreError,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{TokenIssuer, generate_token, token_digest};

struct IssuedToken {
    owner_id: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    owners: HashMap<String, Owner>,
    tokens: HashMap<String, IssuedToken>,
    sessions: Vec<FocusSession>,
    turns: Vec<ChatTurn>,
    memories: Vec<MemoryItem>,
}

/// Every table behind one lock, so multi-row checks are atomic.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OwnerDirectory for InMemoryStore {
    async fn create_owner(&self, owner: Owner) -> Result<Owner, StoreError> {
        let mut tables = self.tables.write().await;
        tables.owners.insert(owner.id.clone(), owner.clone());
        Ok(owner)
    }

    async fn find_owner(&self, owner_id: &str) -> Result<Option<Owner>, StoreError> {
        Ok(self.tables.read().await.owners.get(owner_id).cloned())
    }
}

#[async_trait]
impl TokenIssuer for InMemoryStore {
    async fn issue_token(
        &self,
        owner_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.owners.contains_key(owner_id) {
            return Err(StoreError::NotFound(format!("owner {owner_id}")));
        }

        let token = generate_token();
        tables.tokens.insert(
            token_digest(&token),
            IssuedToken {
                owner_id: owner_id.to_string(),
                expires_at,
            },
        );
        Ok(token)
    }
}

#[async_trait]
impl IdentityValidator for InMemoryStore {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let tables = self.tables.read().await;
        let Some(issued) = tables.tokens.get(&token_digest(token)) else {
            return Ok(None);
        };
        if issued.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Ok(None);
        }
        Ok(tables.owners.get(&issued.owner_id).map(Identity::from))
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: FocusSession) -> Result<FocusSession, StoreError> {
        let mut tables = self.tables.write().await;
        if session.is_active()
            && tables
                .sessions
                .iter()
                .any(|s| s.owner_id == session.owner_id && s.is_active())
        {
            return Err(StoreError::ActiveSessionExists {
                owner_id: session.owner_id,
            });
        }
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn find_session(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<FocusSession>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .iter()
            .find(|s| s.id == session_id && s.owner_id == owner_id)
            .cloned())
    }

    async fn is_session_active(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .iter()
            .any(|s| s.id == session_id && s.is_active()))
    }

    async fn active_session(&self, owner_id: &str) -> Result<Option<FocusSession>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .iter()
            .find(|s| s.owner_id == owner_id && s.is_active())
            .cloned())
    }

    async fn update_session(&self, session: &FocusSession) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        if session.is_active()
            && tables
                .sessions
                .iter()
                .any(|s| s.owner_id == session.owner_id && s.is_active() && s.id != session.id)
        {
            return Err(StoreError::ActiveSessionExists {
                owner_id: session.owner_id.clone(),
            });
        }

        let existing = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id && s.owner_id == session.owner_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        existing.status = session.status;
        existing.ended_at = session.ended_at;
        existing.outcome = session.outcome.clone();
        Ok(())
    }

    async fn recent_completed_sessions(
        &self,
        owner_id: &str,
        exclude_session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let tables = self.tables.read().await;
        let mut completed: Vec<&FocusSession> = tables
            .sessions
            .iter()
            .filter(|s| s.owner_id == owner_id && s.status == SessionStatus::Completed)
            .filter(|s| exclude_session_id != Some(s.id.as_str()))
            .collect();
        completed.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(completed
            .into_iter()
            .take(limit)
            .map(SessionSummary::from)
            .collect())
    }
}

#[async_trait]
impl ChatHistory for InMemoryStore {
    async fn append_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<ChatTurn, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.iter().any(|s| s.id == session_id) {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        let turn = ChatTurn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.turns.push(turn.clone());
        Ok(turn)
    }

    async fn list_turns(&self, session_id: &str) -> Result<Vec<ChatTurn>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .turns
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn add_memory(&self, item: MemoryItem) -> Result<MemoryItem, StoreError> {
        self.tables.write().await.memories.push(item.clone());
        Ok(item)
    }

    async fn update_memory(&self, owner_id: &str, item: &MemoryItem) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables
            .memories
            .iter_mut()
            .find(|m| m.id == item.id && m.owner_id == owner_id)
        {
            Some(existing) => {
                existing.category = item.category;
                existing.content = item.content.clone();
                existing.importance = item.importance;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_memories(&self, owner_id: &str) -> Result<Vec<MemoryItem>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .memories
            .iter()
            .filter(|m| m.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn list_by_category(
        &self,
        owner_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let tables = self.tables.read().await;
        // Reverse insertion order first so the stable sort breaks
        // timestamp ties newest-first.
        let mut items: Vec<MemoryItem> = tables
            .memories
            .iter()
            .rev()
            .filter(|m| m.owner_id == owner_id && m.category == category)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(b.created_at.cmp(&a.created_at))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn touch_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables
            .memories
            .iter_mut()
            .find(|m| m.id == memory_id && m.owner_id == owner_id)
        {
            Some(item) => {
                item.last_referenced_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_memory(&self, owner_id: &str, memory_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.memories.len();
        tables
            .memories
            .retain(|m| !(m.id == memory_id && m.owner_id == owner_id));
        Ok(tables.memories.len() < before)
    }
}
