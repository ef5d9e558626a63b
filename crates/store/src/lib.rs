//! Persistence for Tandem.
//!
//! Two backends implement every storage trait from `tandem-core`
//! (`OwnerDirectory`, `IdentityValidator`, `SessionStore`, `ChatHistory`,
//! `MemoryStore`):
//! - **InMemoryStore**: a single lock over plain collections, for tests
//!   and ephemeral runs
//! - **SqliteStore**: a WAL-mode SQLite file via `sqlx`
//!
//! Access tokens are opaque strings handed to the owner once; only their
//! SHA-256 digest is stored.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tandem_core::StoreError;

const TOKEN_PREFIX: &str = "tdm_";

/// Mints access tokens for an owner.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Returns the plaintext token. `expires_at = None` never expires.
    async fn issue_token(
        &self,
        owner_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError>;
}

/// A fresh random bearer token.
pub fn generate_token() -> String {
    format!(
        "{TOKEN_PREFIX}{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// The at-rest form of a token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
