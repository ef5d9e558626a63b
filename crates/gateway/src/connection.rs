//! The per-connection protocol state machine.
//!
//! ```text
//! UNAUTHENTICATED ──token ok──▶ AUTHENTICATED ──join──▶ JOINED ──message──▶ STREAMING
//!        │                         ▲    ▲                 │  ▲                  │
//!   token bad/missing              │    └─────leave───────┘  └──done / failed───┘
//!        ▼                         │
//!     CLOSED ◀───────── disconnect (any state)
//! ```
//!
//! A [`Connection`] is transport-free: it consumes decoded text frames and
//! writes every server event to an outbound channel. Replies stream from a
//! spawned task so the connection keeps reading frames (and rejecting new
//! turns) while a reply is in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tandem_agent::{AssemblyError, GenerationEvent, conversation_window};
use tandem_core::{DomainEvent, FocusSession, Identity, Role, StoreError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::protocol::{
    CLOSE_NORMAL, CLOSE_UNAUTHORIZED, ClientMessage, Outbound, ProtocolError, ServerMessage,
};
use crate::registry::{ConnectionRegistry, Registration};
use crate::state::{ConnectionId, ConnectionState, ProtocolState};

/// Result of re-checking the joined session before a turn is accepted.
#[derive(Debug)]
pub enum Liveness {
    Active(FocusSession),
    Inactive,
    Missing,
}

/// One authenticated client connection.
pub struct Connection {
    ctx: Arc<ServerContext>,
    identity: Identity,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    _registration: Registration,
}

/// What the connection and its stream task both touch.
struct Shared {
    id: ConnectionId,
    protocol: Mutex<ProtocolState>,
    registry: Arc<ConnectionRegistry>,
    outbound: mpsc::Sender<Outbound>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProtocolState> {
        self.protocol.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn protocol(&self) -> ProtocolState {
        self.lock().clone()
    }

    /// Replace the state, returning the previous one.
    fn set(&self, next: ProtocolState) -> ProtocolState {
        let previous = std::mem::replace(&mut *self.lock(), next.clone());
        self.registry.update(&self.id, next);
        previous
    }

    /// STREAMING → JOINED for `session_id`, queueing `last` in the same
    /// step so any turn that observes JOINED is queued behind it. No-op if
    /// the connection has moved on (closed) in the meantime.
    async fn finish_stream(&self, session_id: &str, last: ServerMessage) {
        let permit = self.outbound.reserve().await.ok();

        let mut protocol = self.lock();
        match &*protocol {
            ProtocolState::Streaming { session_id: s } if s == session_id => {}
            _ => return,
        }
        let joined = ProtocolState::Joined {
            session_id: session_id.to_string(),
        };
        *protocol = joined.clone();
        match permit {
            Some(permit) => permit.send(Outbound::Message(last)),
            None => debug!(connection_id = %self.id, "Outbound channel closed, dropping frame"),
        }
        drop(protocol);

        self.registry.update(&self.id, joined);
    }

    async fn emit(&self, message: ServerMessage) {
        if self.outbound.send(Outbound::Message(message)).await.is_err() {
            debug!(connection_id = %self.id, "Outbound channel closed, dropping frame");
        }
    }
}

impl Connection {
    /// Authenticate a new connection with the token it presented.
    ///
    /// On failure the error frame and a 4001 close are written to
    /// `outbound` before returning; no client frame is ever processed.
    pub async fn open(
        ctx: Arc<ServerContext>,
        token: Option<&str>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<Self, ProtocolError> {
        let id = ConnectionId::new();

        let identity = match authenticate(&ctx, token).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(connection_id = %id, reason = %err, "Connection rejected");
                let _ = outbound
                    .send(Outbound::Message(ServerMessage::error(&err)))
                    .await;
                let _ = outbound
                    .send(Outbound::Close {
                        code: CLOSE_UNAUTHORIZED,
                        reason: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let mut state = ConnectionState::new(id.clone());
        state.identity = Some(identity.clone());
        state.protocol = ProtocolState::Authenticated;
        let registration = ctx.registry.register(state);

        let shared = Arc::new(Shared {
            id: id.clone(),
            protocol: Mutex::new(ProtocolState::Authenticated),
            registry: ctx.registry.clone(),
            outbound,
        });

        info!(
            connection_id = %id,
            owner_id = %identity.id,
            live_connections = ctx.registry.len(),
            "Connection authenticated"
        );
        ctx.events.publish(DomainEvent::ConnectionOpened {
            connection_id: id.to_string(),
            owner_id: identity.id.clone(),
            timestamp: Utc::now(),
        });
        shared
            .emit(ServerMessage::Authenticated {
                user: identity.clone(),
            })
            .await;

        Ok(Self {
            ctx,
            identity,
            shared,
            cancel: CancellationToken::new(),
            stream_task: Mutex::new(None),
            _registration: registration,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ProtocolState {
        self.shared.protocol()
    }

    /// Decode and handle one text frame. Any rejection is reported to the
    /// client as a single `error` frame.
    pub async fn handle_frame(&self, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            debug!(connection_id = %self.shared.id, error = %err, "Frame rejected");
            self.shared.emit(ServerMessage::error(&err)).await;
        }
    }

    pub async fn handle(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        match message {
            ClientMessage::Join { session_id } => self.join(session_id).await,
            ClientMessage::Message { content } => self.turn(content).await,
            ClientMessage::Leave => self.leave().await,
        }
    }

    async fn join(&self, session_id: String) -> Result<(), ProtocolError> {
        match self.shared.protocol() {
            ProtocolState::Authenticated | ProtocolState::Joined { .. } => {}
            ProtocolState::Streaming { .. } => return Err(ProtocolError::Busy),
            ProtocolState::Unauthenticated | ProtocolState::Closed => {
                return Err(ProtocolError::NotJoined);
            }
        }

        let session = self
            .ctx
            .sessions
            .find_session(&session_id, &self.identity.id)
            .await
            .map_err(|e| self.storage_failure(e))?
            .ok_or(ProtocolError::SessionNotFound)?;
        if !session.is_active() {
            return Err(ProtocolError::SessionNotActive);
        }

        self.shared.set(ProtocolState::Joined {
            session_id: session.id.clone(),
        });
        info!(connection_id = %self.shared.id, session_id = %session.id, "Joined session");
        self.shared
            .emit(ServerMessage::Joined {
                session_id: session.id,
            })
            .await;
        Ok(())
    }

    async fn leave(&self) -> Result<(), ProtocolError> {
        let session_id = match self.shared.protocol() {
            ProtocolState::Joined { session_id } => session_id,
            ProtocolState::Streaming { .. } => return Err(ProtocolError::Busy),
            _ => return Err(ProtocolError::NotJoined),
        };

        self.shared.set(ProtocolState::Authenticated);
        info!(connection_id = %self.shared.id, session_id = %session_id, "Left session");
        self.shared.emit(ServerMessage::Left { session_id }).await;
        Ok(())
    }

    /// Re-check that the joined session is still active.
    pub async fn liveness(&self, session_id: &str) -> Result<Liveness, StoreError> {
        let liveness = match self
            .ctx
            .sessions
            .find_session(session_id, &self.identity.id)
            .await?
        {
            Some(session) if session.is_active() => Liveness::Active(session),
            Some(_) => Liveness::Inactive,
            None => Liveness::Missing,
        };
        Ok(liveness)
    }

    async fn turn(&self, content: String) -> Result<(), ProtocolError> {
        let session_id = match self.shared.protocol() {
            ProtocolState::Joined { session_id } => session_id,
            ProtocolState::Streaming { .. } => return Err(ProtocolError::Busy),
            _ => return Err(ProtocolError::NotJoined),
        };

        self.ctx.limits.check_message(&content)?;

        let session = match self
            .liveness(&session_id)
            .await
            .map_err(|e| self.storage_failure(e))?
        {
            Liveness::Active(session) => session,
            Liveness::Inactive => return Err(ProtocolError::SessionNotActive),
            Liveness::Missing => return Err(ProtocolError::SessionNotFound),
        };

        self.ctx
            .history
            .append_turn(&session.id, Role::User, &content)
            .await
            .map_err(|e| self.storage_failure(e))?;

        self.shared.set(ProtocolState::Streaming {
            session_id: session.id.clone(),
        });
        debug!(connection_id = %self.shared.id, session_id = %session.id, "Turn accepted");
        self.ctx.events.publish(DomainEvent::TurnAccepted {
            session_id: session.id.clone(),
            timestamp: Utc::now(),
        });
        self.shared.emit(ServerMessage::StreamStart).await;

        let task = ReplyStream {
            ctx: self.ctx.clone(),
            shared: self.shared.clone(),
            session,
            cancel: self.cancel.child_token(),
        };
        let handle = tokio::spawn(task.run());
        *self
            .stream_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn storage_failure(&self, e: StoreError) -> ProtocolError {
        error!(connection_id = %self.shared.id, owner_id = %self.identity.id, error = %e, "Store operation failed");
        ProtocolError::Storage
    }

    /// Tear the connection down with a normal closure. An in-flight reply
    /// stops forwarding and is never persisted.
    pub async fn close(self) {
        self.cancel.cancel();
        let previous = self.shared.set(ProtocolState::Closed);

        let task = self
            .stream_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(connection_id = %self.shared.id, error = %e, "Reply task ended abnormally");
        }

        info!(
            connection_id = %self.shared.id,
            last_state = previous.name(),
            session_id = previous.session_id(),
            "Connection closed"
        );
        let _ = self
            .shared
            .outbound
            .send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            })
            .await;
        self.ctx.events.publish(DomainEvent::ConnectionClosed {
            connection_id: self.shared.id.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn authenticate(ctx: &ServerContext, token: Option<&str>) -> Result<Identity, ProtocolError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ProtocolError::MissingToken)?;

    match ctx.validator.validate(token).await {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err(ProtocolError::InvalidToken),
        Err(e) => {
            error!(error = %e, "Token validation failed");
            Err(ProtocolError::InvalidToken)
        }
    }
}

// ── Reply streaming ───────────────────────────────────────────────────────

enum ReplyOutcome {
    Completed { reply: String, tokens_used: u32 },
    Failed(ProtocolError),
    Cancelled,
}

/// Generates, forwards and persists one reply.
struct ReplyStream {
    ctx: Arc<ServerContext>,
    shared: Arc<Shared>,
    session: FocusSession,
    cancel: CancellationToken,
}

impl ReplyStream {
    async fn run(self) {
        let session_id = self.session.id.as_str();

        match self.generate().await {
            ReplyOutcome::Completed { reply, tokens_used } => {
                if let Err(e) = self
                    .ctx
                    .history
                    .append_turn(session_id, Role::Assistant, &reply)
                    .await
                {
                    error!(session_id, error = %e, "Failed to persist reply");
                    self.shared
                        .finish_stream(session_id, ServerMessage::error(&ProtocolError::Storage))
                        .await;
                    return;
                }

                self.shared
                    .finish_stream(
                        session_id,
                        ServerMessage::StreamEnd {
                            content: reply.clone(),
                        },
                    )
                    .await;
                info!(session_id, chars = reply.len(), tokens_used, "Reply completed");
                self.ctx.events.publish(DomainEvent::ReplyCompleted {
                    session_id: session_id.to_string(),
                    chars: reply.chars().count(),
                    tokens_used,
                    timestamp: Utc::now(),
                });
            }
            ReplyOutcome::Failed(err) => {
                self.shared
                    .finish_stream(session_id, ServerMessage::error(&err))
                    .await;
                self.ctx.events.publish(DomainEvent::GenerationFailed {
                    session_id: session_id.to_string(),
                    error_message: err.to_string(),
                    timestamp: Utc::now(),
                });
            }
            ReplyOutcome::Cancelled => {
                debug!(session_id, "Connection closed mid-reply, discarding");
                self.ctx.events.publish(DomainEvent::ReplyDiscarded {
                    session_id: session_id.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    async fn generate(&self) -> ReplyOutcome {
        let session_id = self.session.id.as_str();

        let rendered = match self.ctx.assembler.assemble(&self.session).await {
            Ok(rendered) => rendered,
            Err(AssemblyError::UnknownOwner { owner_id }) => {
                error!(session_id, owner_id = %owner_id, "Cannot build context: unknown owner");
                return ReplyOutcome::Failed(ProtocolError::ContextUnavailable);
            }
            Err(e) => {
                error!(session_id, error = %e, "Cannot build context");
                return ReplyOutcome::Failed(ProtocolError::ContextUnavailable);
            }
        };

        let turns = match self.ctx.history.list_turns(session_id).await {
            Ok(turns) => turns,
            Err(e) => {
                error!(session_id, error = %e, "Cannot load chat history");
                return ReplyOutcome::Failed(ProtocolError::ContextUnavailable);
            }
        };
        let messages = conversation_window(&turns, self.ctx.history_window);

        if self.cancel.is_cancelled() {
            return ReplyOutcome::Cancelled;
        }

        let mut events =
            self.ctx
                .generation
                .stream_reply(rendered.text, messages, self.cancel.clone());
        let mut reply = String::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReplyOutcome::Cancelled,
                event = events.recv() => event,
            };

            match event {
                Some(GenerationEvent::Fragment(text)) => {
                    reply.push_str(&text);
                    self.shared
                        .emit(ServerMessage::StreamChunk { content: text })
                        .await;
                }
                Some(GenerationEvent::Done(usage)) => {
                    if self.cancel.is_cancelled() {
                        return ReplyOutcome::Cancelled;
                    }
                    return ReplyOutcome::Completed {
                        reply,
                        tokens_used: usage.map(|u| u.total_tokens).unwrap_or(0),
                    };
                }
                Some(GenerationEvent::Failed(e)) => {
                    warn!(session_id, error = %e, "Reply generation failed");
                    return ReplyOutcome::Failed(ProtocolError::GenerationFailed(e.to_string()));
                }
                None if self.cancel.is_cancelled() => return ReplyOutcome::Cancelled,
                None => {
                    return ReplyOutcome::Failed(ProtocolError::GenerationFailed(
                        "reply stream ended unexpectedly".into(),
                    ));
                }
            }
        }
    }
}
