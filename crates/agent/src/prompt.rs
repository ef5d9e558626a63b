//! Prompt templates.
//!
//! The per-turn system prompt is a fixed template with one slot per
//! section. Callers hand over already-rendered section bodies; a section
//! that has nothing to say gets its fallback text here, so no slot is
//! ever empty.

use tandem_core::{FocusSession, Message, Owner};

pub const NOT_YET_SHARED: &str = "Not yet shared";
pub const FIRST_SESSION: &str = "This is your first session together.";
pub const NO_RELEVANT_CONTEXT: &str = "No specific context for this task yet";

/// Section bodies for one system prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptSections {
    pub name: Option<String>,
    pub work_context: Option<String>,
    pub interests: Option<String>,
    pub task: String,
    pub planned_minutes: u32,
    pub checkin_minutes: u32,
    pub relevant: Option<String>,
    /// One entry per category, in render order: (heading, body).
    pub buckets: Vec<(&'static str, Option<String>)>,
    pub recent_sessions: Option<String>,
}

fn or_fallback<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    match value {
        Some(v) if !v.trim().is_empty() => v.as_str(),
        _ => fallback,
    }
}

/// Render the system prompt for a chat turn.
pub fn render_system_prompt(sections: &PromptSections) -> String {
    let buckets = sections
        .buckets
        .iter()
        .map(|(heading, body)| format!("### {heading}\n{}", or_fallback(body, NOT_YET_SHARED)))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are Tandem, a calm body-doubling companion. You sit alongside the person \
below while they work through a focus session. Keep replies short and warm, steer \
gently back to the task when they drift, and never lecture.

## Who you're working with
Name: {name}
Work: {work}
Interests: {interests}

## This session
Task: {task}
Planned duration: {planned} minutes
Check-in cadence: every {checkin} minutes

## Relevant context for this task
{relevant}

## What you know about them
{buckets}

## Recent sessions
{recent}

## How to help
- Refer to what you know only when it helps with the task at hand.
- Celebrate progress briefly and specifically.
- If they seem stuck, suggest one small next step.",
        name = or_fallback(&sections.name, NOT_YET_SHARED),
        work = or_fallback(&sections.work_context, NOT_YET_SHARED),
        interests = or_fallback(&sections.interests, NOT_YET_SHARED),
        task = sections.task,
        planned = sections.planned_minutes,
        checkin = sections.checkin_minutes,
        relevant = or_fallback(&sections.relevant, NO_RELEVANT_CONTEXT),
        buckets = buckets,
        recent = or_fallback(&sections.recent_sessions, FIRST_SESSION),
    )
}

/// The short ad hoc prompt used to open a session.
pub fn greeting_prompt(owner: &Owner, session: &FocusSession) -> (String, Vec<Message>) {
    let system = format!(
        "You are Tandem, a body-doubling companion. Greet {name} in one or two \
sentences as they start a {planned}-minute focus session. Mention the task, say \
you'll check in every {checkin} minutes, and keep it upbeat. No lists.",
        name = owner.name,
        planned = session.planned_minutes,
        checkin = session.checkin_minutes,
    );
    let messages = vec![Message::user(format!("My task: {}", session.task))];
    (system, messages)
}

/// Used when the greeting cannot be generated.
pub fn fallback_greeting(owner: &Owner, session: &FocusSession) -> String {
    format!(
        "Hi {}! Let's get going on \"{}\". I'm right here with you for the next {} minutes \
and I'll check in every {} minutes.",
        owner.name, session.task, session.planned_minutes, session.checkin_minutes
    )
}
