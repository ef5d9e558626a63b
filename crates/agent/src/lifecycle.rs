//! Focus session lifecycle: start, end, abandon, reactivate.
//!
//! Starting a session also produces the opening greeting, stored as the
//! first assistant turn of the session.

use std::sync::Arc;

use chrono::Utc;
use tandem_core::validate::check_minutes;
use tandem_core::{
    ChatHistory, DomainEvent, EventBus, FocusSession, InputLimits, Owner, OwnerDirectory, Role,
    SessionStatus, SessionStore, StoreError, TransitionError, ValidationError,
};
use tracing::{info, warn};

use crate::generation::GenerationGateway;
use crate::prompt::{fallback_greeting, greeting_prompt};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Owner {owner_id} already has an active session")]
    SessionAlreadyActive { owner_id: String },

    #[error("Session not found")]
    SessionNotFound,

    #[error("Unknown owner: {0}")]
    UnknownOwner(String),

    #[error("Cannot move session from {} to {}", .0.from, .0.to)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ActiveSessionExists { owner_id } => Self::SessionAlreadyActive { owner_id },
            StoreError::NotFound(_) => Self::SessionNotFound,
            other => Self::Store(other),
        }
    }
}

/// A freshly started session and its greeting.
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub session: FocusSession,
    pub greeting: String,
}

pub struct SessionService {
    owners: Arc<dyn OwnerDirectory>,
    sessions: Arc<dyn SessionStore>,
    history: Arc<dyn ChatHistory>,
    generation: Arc<GenerationGateway>,
    limits: InputLimits,
    events: Arc<EventBus>,
}

impl SessionService {
    pub fn new(
        owners: Arc<dyn OwnerDirectory>,
        sessions: Arc<dyn SessionStore>,
        history: Arc<dyn ChatHistory>,
        generation: Arc<GenerationGateway>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            owners,
            sessions,
            history,
            generation,
            limits: InputLimits::default(),
            events,
        }
    }

    pub fn with_limits(mut self, limits: InputLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Open a new active session for `owner_id`.
    ///
    /// Fails without writing anything if the owner already has one.
    pub async fn start_session(
        &self,
        owner_id: &str,
        task: &str,
        planned_minutes: i64,
        checkin_minutes: i64,
    ) -> Result<SessionStart, LifecycleError> {
        self.limits.check_task(task)?;
        let planned = check_minutes("planned_minutes", planned_minutes)?;
        let checkin = check_minutes("checkin_minutes", checkin_minutes)?;

        let owner = self
            .owners
            .find_owner(owner_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownOwner(owner_id.to_string()))?;

        if self.sessions.active_session(owner_id).await?.is_some() {
            return Err(LifecycleError::SessionAlreadyActive {
                owner_id: owner_id.to_string(),
            });
        }

        let session = self
            .sessions
            .create_session(FocusSession::new(owner_id, task.trim(), planned, checkin))
            .await?;

        let greeting = self.greeting(&owner, &session).await;
        self.history
            .append_turn(&session.id, Role::Assistant, &greeting)
            .await?;

        info!(session_id = %session.id, owner_id, planned, "Focus session started");
        self.events.publish(DomainEvent::SessionStarted {
            session_id: session.id.clone(),
            owner_id: owner_id.to_string(),
            timestamp: Utc::now(),
        });

        Ok(SessionStart { session, greeting })
    }

    async fn greeting(&self, owner: &Owner, session: &FocusSession) -> String {
        let (system, messages) = greeting_prompt(owner, session);
        match self.generation.complete(system, messages).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => fallback_greeting(owner, session),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Greeting generation failed, using fallback");
                fallback_greeting(owner, session)
            }
        }
    }

    /// Mark a session completed, optionally recording how it went.
    pub async fn end_session(
        &self,
        owner_id: &str,
        session_id: &str,
        outcome: Option<&str>,
    ) -> Result<FocusSession, LifecycleError> {
        if let Some(outcome) = outcome {
            self.limits.check_message(outcome)?;
        }
        let outcome = outcome.map(|o| o.trim().to_string());
        self.transition(owner_id, session_id, SessionStatus::Completed, outcome)
            .await
    }

    pub async fn abandon_session(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<FocusSession, LifecycleError> {
        self.transition(owner_id, session_id, SessionStatus::Abandoned, None)
            .await
    }

    /// Bring a terminal session back to active.
    pub async fn reactivate_session(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<FocusSession, LifecycleError> {
        self.transition(owner_id, session_id, SessionStatus::Active, None)
            .await
    }

    async fn transition(
        &self,
        owner_id: &str,
        session_id: &str,
        to: SessionStatus,
        outcome: Option<String>,
    ) -> Result<FocusSession, LifecycleError> {
        let mut session = self
            .sessions
            .find_session(session_id, owner_id)
            .await?
            .ok_or(LifecycleError::SessionNotFound)?;

        session.transition(to, Utc::now())?;
        if outcome.is_some() {
            session.outcome = outcome;
        }
        self.sessions.update_session(&session).await?;

        info!(session_id, owner_id, status = to.as_str(), "Session status changed");
        if to.is_terminal() {
            self.events.publish(DomainEvent::SessionEnded {
                session_id: session.id.clone(),
                status: to.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tandem_core::{Provider, ProviderError, ProviderRequest, ProviderResponse};
    use tandem_store::InMemoryStore;

    struct FixedProvider(Result<&'static str, ()>);

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            match self.0 {
                Ok(text) => Ok(ProviderResponse {
                    content: text.into(),
                    usage: None,
                    model: request.model,
                }),
                Err(()) => Err(ProviderError::Network("offline".into())),
            }
        }
    }

    async fn service(reply: Result<&'static str, ()>) -> (SessionService, InMemoryStore, Owner) {
        let store = InMemoryStore::new();
        let owner = store
            .create_owner(Owner::new("Ada", "ada@example.com"))
            .await
            .unwrap();
        let shared = Arc::new(store.clone());
        let generation = Arc::new(GenerationGateway::new(Arc::new(FixedProvider(reply)), "m"));
        let service = SessionService::new(
            shared.clone(),
            shared.clone(),
            shared,
            generation,
            Arc::new(EventBus::default()),
        );
        (service, store, owner)
    }

    #[tokio::test]
    async fn start_persists_greeting_as_first_turn() {
        let (service, store, owner) = service(Ok("Let's do this!")).await;
        let started = service
            .start_session(&owner.id, "  Write intro  ", 25, 10)
            .await
            .unwrap();

        assert_eq!(started.session.task, "Write intro");
        assert_eq!(started.greeting, "Let's do this!");
        let turns = store.list_turns(&started.session.id).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(turns[0].content, "Let's do this!");
    }

    #[tokio::test]
    async fn greeting_falls_back_when_generation_fails() {
        let (service, _store, owner) = service(Err(())).await;
        let started = service
            .start_session(&owner.id, "Inbox zero", 25, 10)
            .await
            .unwrap();
        assert!(started.greeting.contains("Inbox zero"));
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_a_row() {
        let (service, store, owner) = service(Ok("hi")).await;
        let first = service
            .start_session(&owner.id, "One", 25, 10)
            .await
            .unwrap();

        let err = service
            .start_session(&owner.id, "Two", 25, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SessionAlreadyActive { .. }));

        let active = store.active_session(&owner.id).await.unwrap().unwrap();
        assert_eq!(active.id, first.session.id);
        assert!(
            store
                .recent_completed_sessions(&owner.id, None, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn invalid_input_rejected_before_mutation() {
        let (service, store, owner) = service(Ok("hi")).await;

        let long_task = "x".repeat(501);
        assert!(matches!(
            service.start_session(&owner.id, &long_task, 25, 10).await,
            Err(LifecycleError::Validation(ValidationError::TooLong { .. }))
        ));
        assert!(matches!(
            service.start_session(&owner.id, "ok", 0, 10).await,
            Err(LifecycleError::Validation(ValidationError::OutOfRange { .. }))
        ));
        assert!(store.active_session(&owner.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_then_reactivate() {
        let (service, store, owner) = service(Ok("hi")).await;
        let started = service
            .start_session(&owner.id, "Focus", 25, 10)
            .await
            .unwrap();
        let id = started.session.id;

        let ended = service
            .end_session(&owner.id, &id, Some("Shipped it"))
            .await
            .unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(ended.ended_at.is_some());
        assert!(!store.is_session_active(&id).await.unwrap());

        assert!(matches!(
            service.abandon_session(&owner.id, &id).await,
            Err(LifecycleError::InvalidTransition(_))
        ));

        let revived = service.reactivate_session(&owner.id, &id).await.unwrap();
        assert!(revived.is_active());
        assert!(revived.ended_at.is_none());
        assert_eq!(revived.outcome.as_deref(), Some("Shipped it"));
    }

    #[tokio::test]
    async fn reactivation_blocked_by_other_active_session() {
        let (service, _store, owner) = service(Ok("hi")).await;
        let first = service.start_session(&owner.id, "A", 25, 10).await.unwrap();
        service
            .abandon_session(&owner.id, &first.session.id)
            .await
            .unwrap();
        service.start_session(&owner.id, "B", 25, 10).await.unwrap();

        assert!(matches!(
            service
                .reactivate_session(&owner.id, &first.session.id)
                .await,
            Err(LifecycleError::SessionAlreadyActive { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_session_is_not_found() {
        let (service, store, owner) = service(Ok("hi")).await;
        let started = service.start_session(&owner.id, "A", 25, 10).await.unwrap();
        let other = store
            .create_owner(Owner::new("Bob", "bob@example.com"))
            .await
            .unwrap();

        assert!(matches!(
            service.end_session(&other.id, &started.session.id, None).await,
            Err(LifecycleError::SessionNotFound)
        ));
    }
}
