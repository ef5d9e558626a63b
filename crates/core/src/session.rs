//! Focus sessions — bounded units of declared work.
//!
//! Lifecycle:
//!
//! ```text
//! (start) ──► active ──► completed ──┐
//!               │                     ├──► active   (reactivation)
//!               └──────► abandoned ──┘
//! ```
//!
//! An owner has at most one `active` session at any time. Stores enforce
//! that on every write that can produce an active row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Lifecycle status of a focus session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "abandoned" => Ok(SessionStatus::Abandoned),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot move session from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// A bounded unit of declared work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusSession {
    pub id: String,
    pub owner_id: String,
    /// What the owner declared they would work on.
    pub task: String,
    pub planned_minutes: u32,
    /// How often the companion should check in.
    pub checkin_minutes: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Post-hoc note on how it went.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl FocusSession {
    /// A fresh `active` session starting now.
    pub fn new(
        owner_id: impl Into<String>,
        task: impl Into<String>,
        planned_minutes: u32,
        checkin_minutes: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            task: task.into(),
            planned_minutes,
            checkin_minutes,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Apply a lifecycle transition.
    ///
    /// `active → completed | abandoned` stamps `ended_at`; a terminal
    /// session may only move back to `active`, which clears it.
    pub fn transition(
        &mut self,
        to: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let legal = match (self.status, to) {
            (SessionStatus::Active, SessionStatus::Completed)
            | (SessionStatus::Active, SessionStatus::Abandoned) => true,
            (from, SessionStatus::Active) => from.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(TransitionError {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }

        self.status = to;
        self.ended_at = if to.is_terminal() { Some(at) } else { None };
        Ok(())
    }
}

/// A completed session condensed for prompt context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub date: DateTime<Utc>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub duration_minutes: u32,
}

impl From<&FocusSession> for SessionSummary {
    fn from(session: &FocusSession) -> Self {
        let duration_minutes = session
            .ended_at
            .map(|end| (end - session.started_at).num_minutes().max(0) as u32)
            .unwrap_or(session.planned_minutes);
        Self {
            session_id: session.id.clone(),
            date: session.started_at,
            task: session.task.clone(),
            outcome: session.outcome.clone(),
            duration_minutes,
        }
    }
}

/// Keyed-row storage for focus sessions.
///
/// Reads are scoped by owner wherever an owner is known.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `ActiveSessionExists` (and writes
    /// nothing) if the owner already has an active one.
    async fn create_session(&self, session: FocusSession) -> Result<FocusSession, StoreError>;

    /// A session by id, only if it belongs to `owner_id`.
    async fn find_session(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<FocusSession>, StoreError>;

    /// Whether the session currently has status `active`.
    ///
    /// Not owner-scoped, and a missing session reads as inactive. The
    /// gateway's turn guard uses [`find_session`](Self::find_session)
    /// instead so it can tell a purged session from a finished one.
    async fn is_session_active(&self, session_id: &str) -> Result<bool, StoreError>;

    /// The owner's active session, if any.
    async fn active_session(&self, owner_id: &str) -> Result<Option<FocusSession>, StoreError>;

    /// Persist status/end/outcome changes of an owner's session. Moving a
    /// session back to `active` obeys the single-active invariant.
    async fn update_session(&self, session: &FocusSession) -> Result<(), StoreError>;

    /// Most recent completed sessions, newest first.
    async fn recent_completed_sessions(
        &self,
        owner_id: &str,
        exclude_session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError>;
}
