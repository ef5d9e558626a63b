//! # Tandem Core
//!
//! Domain types, capability traits, and error definitions for the Tandem
//! focus companion. This crate has **no framework dependencies**: it defines
//! the domain model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (storage, identity validation, text
//! generation) is a trait here. Implementations live in their own crates.
//! This enables:
//! - Swapping the SQLite store for the in-memory one in tests
//! - Scripted providers instead of a real model
//! - A clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod identity;
pub mod memory;
pub mod message;
pub mod provider;
pub mod session;
pub mod validate;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, StoreError, ValidationError};
pub use event::{DomainEvent, EventBus};
pub use identity::{Identity, IdentityValidator, Owner, OwnerDirectory};
pub use memory::{MemoryCategory, MemoryItem, MemoryStore};
pub use message::{ChatHistory, ChatTurn, Message, Role};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use session::{FocusSession, SessionStatus, SessionStore, SessionSummary, TransitionError};
pub use validate::InputLimits;
