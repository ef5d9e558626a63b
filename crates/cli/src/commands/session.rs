//! `tandem session` — Focus session lifecycle.

use std::sync::Arc;

use clap::Subcommand;
use tandem_agent::{GenerationGateway, SessionService};
use tandem_config::AppConfig;
use tandem_core::{EventBus, FocusSession, SessionStore};
use tandem_store::SqliteStore;

use super::CmdResult;

#[derive(Subcommand)]
pub enum SessionAction {
    /// Start a focus session and print the opening greeting
    Start {
        owner_id: String,
        /// What you're going to work on
        #[arg(long)]
        task: String,
        /// Planned duration in minutes
        #[arg(long, default_value_t = 25)]
        minutes: i64,
        /// Check-in cadence in minutes
        #[arg(long, default_value_t = 10)]
        checkin: i64,
    },

    /// Complete a session
    End {
        owner_id: String,
        session_id: String,
        /// How it went
        #[arg(long)]
        outcome: Option<String>,
    },

    /// Abandon a session
    Abandon { owner_id: String, session_id: String },

    /// Bring a finished session back to active
    Reactivate { owner_id: String, session_id: String },

    /// Show the owner's active session and recent history
    Show { owner_id: String },
}

fn service(
    config: &AppConfig,
    store: Arc<SqliteStore>,
) -> Result<SessionService, Box<dyn std::error::Error>> {
    let provider = tandem_providers::build_from_config(config)
        .default()
        .ok_or_else(|| format!("Provider '{}' is not configured", config.default_provider))?;
    let generation = Arc::new(GenerationGateway::from_config(provider, config));

    Ok(SessionService::new(
        store.clone(),
        store.clone(),
        store,
        generation,
        Arc::new(EventBus::default()),
    )
    .with_limits(config.input_limits()))
}

pub async fn run(action: SessionAction) -> CmdResult {
    let config = super::load_config()?;
    let store = super::open_store(&config).await?;

    match action {
        SessionAction::Start {
            owner_id,
            task,
            minutes,
            checkin,
        } => {
            let started = service(&config, store)?
                .start_session(&owner_id, &task, minutes, checkin)
                .await?;
            println!("✅ Session started: {}", started.session.id);
            println!(
                "   Task: {} ({} min, check-in every {} min)",
                started.session.task,
                started.session.planned_minutes,
                started.session.checkin_minutes
            );
            println!("\n💬 {}", started.greeting);
            println!(
                "\nJoin it over ws://{}:{}/ws?token=<token> with {{\"type\":\"join\",\"sessionId\":\"{}\"}}",
                config.gateway.host, config.gateway.port, started.session.id
            );
        }
        SessionAction::End {
            owner_id,
            session_id,
            outcome,
        } => {
            let session = service(&config, store)?
                .end_session(&owner_id, &session_id, outcome.as_deref())
                .await?;
            print_session("✅ Completed", &session);
        }
        SessionAction::Abandon {
            owner_id,
            session_id,
        } => {
            let session = service(&config, store)?
                .abandon_session(&owner_id, &session_id)
                .await?;
            print_session("🛑 Abandoned", &session);
        }
        SessionAction::Reactivate {
            owner_id,
            session_id,
        } => {
            let session = service(&config, store)?
                .reactivate_session(&owner_id, &session_id)
                .await?;
            print_session("🔁 Reactivated", &session);
        }
        SessionAction::Show { owner_id } => {
            match store.active_session(&owner_id).await? {
                Some(session) => print_session("▶️  Active", &session),
                None => println!("No active session."),
            }

            let recent = store
                .recent_completed_sessions(&owner_id, None, config.context.recent_sessions)
                .await?;
            if !recent.is_empty() {
                println!("\nRecent sessions:");
                for summary in recent {
                    println!(
                        "  {}  {} ({} min){}",
                        summary.date.format("%Y-%m-%d"),
                        summary.task,
                        summary.duration_minutes,
                        summary
                            .outcome
                            .map(|o| format!(" — {o}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_session(label: &str, session: &FocusSession) {
    println!("{label}: {} [{}]", session.task, session.id);
    if let Some(outcome) = &session.outcome {
        println!("   Outcome: {outcome}");
    }
}
