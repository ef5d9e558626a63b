//! `tandem user` — Owners and access tokens.

use chrono::{Duration, Utc};
use clap::Subcommand;
use tandem_core::{Owner, OwnerDirectory};
use tandem_store::TokenIssuer;

use super::CmdResult;

#[derive(Subcommand)]
pub enum UserAction {
    /// Create an owner and print a fresh access token
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// What they do, in a sentence or two
        #[arg(long)]
        work: Option<String>,
        /// Comma-separated interests
        #[arg(long, value_delimiter = ',')]
        interests: Vec<String>,
        /// Token lifetime in days (never expires if omitted)
        #[arg(long)]
        expires_days: Option<i64>,
    },

    /// Issue another access token for an existing owner
    Token {
        owner_id: String,
        #[arg(long)]
        expires_days: Option<i64>,
    },
}

pub async fn run(action: UserAction) -> CmdResult {
    let config = super::load_config()?;
    let store = super::open_store(&config).await?;

    match action {
        UserAction::Create {
            name,
            email,
            work,
            interests,
            expires_days,
        } => {
            if name.trim().is_empty() || email.trim().is_empty() {
                return Err("name and email must not be empty".into());
            }
            let mut owner = Owner::new(name.trim(), email.trim()).with_interests(
                interests
                    .into_iter()
                    .map(|i| i.trim().to_string())
                    .filter(|i| !i.is_empty())
                    .collect(),
            );
            if let Some(work) = work.filter(|w| !w.trim().is_empty()) {
                owner = owner.with_work_context(work.trim());
            }

            let owner = store.create_owner(owner).await?;
            let token = store.issue_token(&owner.id, expiry(expires_days)).await?;

            println!("✅ Created {} <{}>", owner.name, owner.email);
            println!("   Owner id: {}", owner.id);
            println!("   Token:    {token}");
            println!("   (the token is shown once; only its digest is stored)");
        }
        UserAction::Token {
            owner_id,
            expires_days,
        } => {
            let token = store.issue_token(&owner_id, expiry(expires_days)).await?;
            println!("{token}");
        }
    }

    Ok(())
}

fn expiry(days: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    days.map(|d| Utc::now() + Duration::days(d))
}
