//! The companion's brain: what to say and what to remember while saying it.
//!
//! 1. **Relevance** ranks an owner's memories against the declared task
//! 2. **Context assembly** renders profile, memories and past sessions into
//!    a bounded system prompt
//! 3. **Generation** streams the reply through the configured provider
//! 4. **Lifecycle** opens and closes focus sessions, greeting the owner on
//!    the way in

pub mod context;
pub mod generation;
pub mod lifecycle;
pub mod prompt;
pub mod relevance;

pub use context::{
    AssemblyError, AssemblyMetadata, ContextAssembler, ContextInputs, ContextSettings, DropInfo,
    RenderedContext, SectionStats, conversation_window,
};
pub use generation::{GenerationError, GenerationEvent, GenerationGateway};
pub use lifecycle::{LifecycleError, SessionService, SessionStart};
pub use relevance::{RelevanceEngine, ScoredMemory};
