//! Prompt-context assembly.
//!
//! The assembler turns an owner's profile, recent sessions and memories
//! into one bounded system prompt per turn. Sections are filled in
//! priority order under a token budget:
//!
//! | Section | Source | Trim Strategy |
//! |---------|--------|---------------|
//! | Profile + session | Owner, FocusSession | Never trimmed |
//! | Relevant context | Relevance engine | Lowest-ranked dropped |
//! | Category buckets | Memory store | Least important dropped |
//! | Recent sessions | Session store | Oldest dropped |

pub mod assembler;
pub mod token;

pub use assembler::{
    AssemblyError, AssemblyMetadata, ContextAssembler, ContextInputs, ContextSettings, DropInfo,
    RenderedContext, SectionStats, conversation_window,
};
