//! End-to-end tests for Tandem.
//!
//! These exercise the whole pipeline against the SQLite store: an owner is
//! created, a session is started through the lifecycle service, and a
//! client talks to the companion through the gateway's connection handler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_agent::prompt::{FIRST_SESSION, NO_RELEVANT_CONTEXT, NOT_YET_SHARED};
use tandem_agent::{
    ContextAssembler, ContextSettings, GenerationGateway, LifecycleError, SessionService,
};
use tandem_config::AppConfig;
use tandem_core::error::ProviderError;
use tandem_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use tandem_core::{
    ChatHistory, EventBus, MemoryCategory, MemoryItem, MemoryStore, Owner, OwnerDirectory, Role,
    SessionStore,
};
use tandem_gateway::{Connection, Outbound, ServerContext, ServerMessage};
use tandem_store::{SqliteStore, TokenIssuer};
use tokio::sync::mpsc;

// ── Mock Provider ────────────────────────────────────────────────────────

/// Greets with a fixed line and streams a fixed reply, recording every
/// streaming request it receives.
struct RecordingProvider {
    greeting: &'static str,
    reply: Vec<&'static str>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl RecordingProvider {
    fn new(greeting: &'static str, reply: &[&'static str]) -> Self {
        Self {
            greeting,
            reply: reply.to_vec(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            content: self.greeting.to_string(),
            usage: None,
            model: request.model,
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let reply = self.reply.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for piece in reply {
                let _ = tx.send(Ok(StreamChunk::text(piece))).await;
            }
            let _ = tx
                .send(Ok(StreamChunk::done(Some(Usage {
                    prompt_tokens: 100,
                    completion_tokens: 12,
                    total_tokens: 112,
                }))))
                .await;
        });
        Ok(rx)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

struct World {
    store: Arc<SqliteStore>,
    provider: Arc<RecordingProvider>,
    service: SessionService,
    ctx: Arc<ServerContext>,
}

async fn world(provider: RecordingProvider) -> World {
    let store = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
    let provider = Arc::new(provider);
    let config = AppConfig::default();
    let generation = Arc::new(GenerationGateway::from_config(provider.clone(), &config));
    let events = Arc::new(EventBus::default());

    let service = SessionService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        generation.clone(),
        events.clone(),
    );
    let ctx = Arc::new(ServerContext::from_store(
        store.clone(),
        generation,
        events,
        &config,
    ));

    World {
        store,
        provider,
        service,
        ctx,
    }
}

async fn next(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Outbound::Message(message))) => message,
        other => panic!("expected a server message, got {other:?}"),
    }
}

async fn connect(world: &World, token: &str) -> (Connection, mpsc::Receiver<Outbound>) {
    let (tx, mut rx) = mpsc::channel(64);
    let conn = Connection::open(world.ctx.clone(), Some(token), tx)
        .await
        .unwrap();
    assert!(matches!(
        next(&mut rx).await,
        ServerMessage::Authenticated { .. }
    ));
    (conn, rx)
}

/// Send a turn and collect frames up to and including its terminal frame.
async fn exchange(
    conn: &Connection,
    rx: &mut mpsc::Receiver<Outbound>,
    content: &str,
) -> Vec<ServerMessage> {
    conn.handle_frame(&serde_json::json!({"type": "message", "content": content}).to_string())
        .await;
    let mut frames = Vec::new();
    loop {
        let frame = next(rx).await;
        let terminal = matches!(
            frame,
            ServerMessage::StreamEnd { .. } | ServerMessage::Error { .. }
        );
        frames.push(frame);
        if terminal {
            return frames;
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_focus_session_with_personal_context() {
    let w = world(RecordingProvider::new(
        "Welcome back, Ada! Let's get that report moving.",
        &["Start ", "with the ", "outline."],
    ))
    .await;

    let owner = w
        .store
        .create_owner(
            Owner::new("Ada", "ada@example.com")
                .with_work_context("Analyst at a fintech startup")
                .with_interests(vec!["climbing".into(), "chess".into()]),
        )
        .await
        .unwrap();
    let token = w.store.issue_token(&owner.id, None).await.unwrap();

    for (category, content, importance) in [
        (MemoryCategory::Project, "Quarterly report for the finance team", 5),
        (MemoryCategory::Challenge, "Slack notifications derail deep work", 4),
        (MemoryCategory::Win, "Shipped the onboarding flow early", 3),
    ] {
        w.store
            .add_memory(MemoryItem::new(&owner.id, category, content, importance))
            .await
            .unwrap();
    }

    let started = w
        .service
        .start_session(&owner.id, "Draft the quarterly report", 45, 15)
        .await
        .unwrap();
    assert_eq!(
        started.greeting,
        "Welcome back, Ada! Let's get that report moving."
    );

    let (conn, mut rx) = connect(&w, &token).await;
    conn.handle_frame(&format!(
        r#"{{"type":"join","sessionId":"{}"}}"#,
        started.session.id
    ))
    .await;
    assert_eq!(
        next(&mut rx).await,
        ServerMessage::Joined {
            session_id: started.session.id.clone()
        }
    );

    let frames = exchange(&conn, &mut rx, "Where should I begin?").await;
    assert_eq!(frames.first(), Some(&ServerMessage::StreamStart));
    assert_eq!(
        frames.last(),
        Some(&ServerMessage::StreamEnd {
            content: "Start with the outline.".into()
        })
    );

    // Greeting, user turn, streamed reply: in that order, each exactly once.
    let turns = w.store.list_turns(&started.session.id).await.unwrap();
    let transcript: Vec<_> = turns
        .iter()
        .map(|t| (t.role, t.content.as_str()))
        .collect();
    assert_eq!(
        transcript,
        vec![
            (
                Role::Assistant,
                "Welcome back, Ada! Let's get that report moving."
            ),
            (Role::User, "Where should I begin?"),
            (Role::Assistant, "Start with the outline."),
        ]
    );

    // The prompt carried the profile and the task-relevant memory.
    let request = w.provider.requests().pop().unwrap();
    let system = request.system.unwrap();
    assert!(system.contains("Name: Ada"));
    assert!(system.contains("Work: Analyst at a fintech startup"));
    assert!(system.contains("Interests: climbing, chess"));
    assert!(system.contains("Task: Draft the quarterly report"));
    assert!(system.contains("- [project] Quarterly report for the finance team"));
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[0].role, Role::Assistant);
    assert_eq!(request.messages[1].content, "Where should I begin?");

    // Every item fit in its category bucket, so every item was touched.
    let memories = w.store.list_memories(&owner.id).await.unwrap();
    assert!(memories.iter().all(|m| m.last_referenced_at.is_some()));

    // The next turn sees the previous reply in its history window.
    exchange(&conn, &mut rx, "Done with the outline").await;
    let request = w.provider.requests().pop().unwrap();
    assert_eq!(request.messages.len(), 4);
    assert_eq!(request.messages[2].content, "Start with the outline.");

    conn.close().await;
    let ended = w
        .service
        .end_session(&owner.id, &started.session.id, Some("Outline and intro done"))
        .await
        .unwrap();
    assert!(ended.ended_at.is_some());

    let recent = w
        .store
        .recent_completed_sessions(&owner.id, None, 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].outcome.as_deref(), Some("Outline and intro done"));
}

#[tokio::test]
async fn e2e_first_session_renders_fallbacks() {
    let w = world(RecordingProvider::new("Hi!", &["Let's go."])).await;
    let owner = w
        .store
        .create_owner(Owner::new("Sam", "sam@example.com"))
        .await
        .unwrap();
    let token = w.store.issue_token(&owner.id, None).await.unwrap();
    let started = w
        .service
        .start_session(&owner.id, "Inbox zero", 25, 10)
        .await
        .unwrap();

    let (conn, mut rx) = connect(&w, &token).await;
    conn.handle_frame(&format!(
        r#"{{"type":"join","sessionId":"{}"}}"#,
        started.session.id
    ))
    .await;
    next(&mut rx).await;
    exchange(&conn, &mut rx, "ok, starting").await;

    let system = w.provider.requests().pop().unwrap().system.unwrap();
    assert!(system.contains(&format!("Work: {NOT_YET_SHARED}")));
    assert!(system.contains(&format!("Interests: {NOT_YET_SHARED}")));
    assert!(system.contains(FIRST_SESSION));
    assert!(system.contains(NO_RELEVANT_CONTEXT));
    for category in MemoryCategory::ALL {
        assert!(system.contains(&format!("### {}\n{NOT_YET_SHARED}", category.heading())));
    }
}

#[tokio::test]
async fn e2e_single_active_session_per_owner() {
    let w = world(RecordingProvider::new("Hi!", &[])).await;
    let owner = w
        .store
        .create_owner(Owner::new("Ada", "ada@example.com"))
        .await
        .unwrap();

    let first = w
        .service
        .start_session(&owner.id, "Write tests", 25, 10)
        .await
        .unwrap();
    assert!(matches!(
        w.service
            .start_session(&owner.id, "Something else", 25, 10)
            .await,
        Err(LifecycleError::SessionAlreadyActive { .. })
    ));

    w.service
        .abandon_session(&owner.id, &first.session.id)
        .await
        .unwrap();
    let second = w
        .service
        .start_session(&owner.id, "Something else", 25, 10)
        .await
        .unwrap();

    assert!(matches!(
        w.service
            .reactivate_session(&owner.id, &first.session.id)
            .await,
        Err(LifecycleError::SessionAlreadyActive { .. })
    ));
    let active = w.store.active_session(&owner.id).await.unwrap().unwrap();
    assert_eq!(active.id, second.session.id);
}

#[tokio::test]
async fn e2e_tight_budget_drops_and_records() {
    let w = world(RecordingProvider::new("Hi!", &[])).await;
    let owner = w
        .store
        .create_owner(Owner::new("Ada", "ada@example.com"))
        .await
        .unwrap();
    for i in 0..20 {
        w.store
            .add_memory(MemoryItem::new(
                &owner.id,
                MemoryCategory::Insight,
                format!("Insight number {i} about writing reports in the morning"),
                3,
            ))
            .await
            .unwrap();
    }
    let session = w
        .service
        .start_session(&owner.id, "Write reports", 25, 10)
        .await
        .unwrap()
        .session;

    let roomy = ContextAssembler::new(w.store.clone(), w.store.clone(), w.store.clone())
        .with_settings(ContextSettings {
            token_budget: 100_000,
            ..ContextSettings::default()
        });
    let full = roomy.assemble(&session).await.unwrap();
    assert!(full.metadata.drops.is_empty());

    let tight = ContextAssembler::new(w.store.clone(), w.store.clone(), w.store.clone())
        .with_settings(ContextSettings {
            token_budget: full.metadata.fixed_tokens + 30,
            ..ContextSettings::default()
        });
    let trimmed = tight.assemble(&session).await.unwrap();

    assert!(!trimmed.metadata.drops.is_empty());
    assert!(trimmed.metadata.total_tokens <= trimmed.metadata.budget);
    assert!(trimmed.text.len() < full.text.len());
}

#[tokio::test]
async fn e2e_health_endpoint() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let w = world(RecordingProvider::new("Hi!", &[])).await;
    let app = tandem_gateway::build_router(w.ctx.clone());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn e2e_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
default_provider = "openai"

[gateway]
port = 9000

[context]
relevance_top_k = 3
token_budget = 2000
"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path).unwrap();
    assert_eq!(config.default_provider, "openai");
    assert_eq!(config.gateway.port, 9000);
    assert_eq!(config.context.relevance_top_k, 3);
    assert_eq!(config.context.bucket_size, 5);

    let router = tandem_providers::build_from_config(&config);
    assert_eq!(router.default().unwrap().name(), "openai");
}
