//! Tandem CLI — the main entry point.
//!
//! Commands:
//! - `onboard`  — Initialize config & database
//! - `serve`    — Start the WebSocket gateway
//! - `user`     — Create owners and issue access tokens
//! - `session`  — Start, end, abandon or reactivate focus sessions
//! - `memory`   — Add, list and remove memories
//! - `status`   — Show system status

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Tandem — a body-doubling focus companion",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and database
    Onboard,

    /// Start the WebSocket gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage owners and their access tokens
    User {
        #[command(subcommand)]
        action: commands::user::UserAction,
    },

    /// Manage focus sessions
    Session {
        #[command(subcommand)]
        action: commands::session::SessionAction,
    },

    /// Manage an owner's memories
    Memory {
        #[command(subcommand)]
        action: commands::memory::MemoryAction,
    },

    /// Show system status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::User { action } => commands::user::run(action).await?,
        Commands::Session { action } => commands::session::run(action).await?,
        Commands::Memory { action } => commands::memory::run(action).await?,
        Commands::Status => commands::status::run().await?,
    }

    Ok(())
}
