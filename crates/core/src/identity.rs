//! Owners and authenticated identities.
//!
//! An `Owner` is the full profile used to personalize prompts; an
//! `Identity` is the minimal projection a connection learns after
//! authenticating. Token issuance and cryptography live behind
//! `IdentityValidator`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// The account that sessions and memories belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Free-text description of what the owner does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_context: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            work_context: None,
            interests: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_work_context(mut self, work_context: impl Into<String>) -> Self {
        self.work_context = Some(work_context.into());
        self
    }

    pub fn with_interests(mut self, interests: Vec<String>) -> Self {
        self.interests = interests;
        self
    }
}

/// Who a connection is, once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl From<&Owner> for Identity {
    fn from(owner: &Owner) -> Self {
        Self {
            id: owner.id.clone(),
            name: owner.name.clone(),
            email: owner.email.clone(),
        }
    }
}

/// Resolves an access token to an identity.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// `Ok(None)` for unknown or expired tokens.
    async fn validate(&self, token: &str) -> Result<Option<Identity>, StoreError>;
}

/// Owner profile lookup.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn create_owner(&self, owner: Owner) -> Result<Owner, StoreError>;

    async fn find_owner(&self, owner_id: &str) -> Result<Option<Owner>, StoreError>;
}
