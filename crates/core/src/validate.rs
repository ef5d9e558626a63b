//! Input ceilings shared by every entry point that accepts user text.

use crate::error::ValidationError;

/// Length ceilings for user-supplied text, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    pub max_task_chars: usize,
    pub max_message_chars: usize,
    pub max_memory_chars: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_task_chars: 500,
            max_message_chars: 4000,
            max_memory_chars: 2000,
        }
    }
}

impl InputLimits {
    /// A declared task: non-blank, within the task ceiling.
    pub fn check_task(&self, task: &str) -> Result<(), ValidationError> {
        check_text("task", task, self.max_task_chars)
    }

    /// A chat turn's content.
    pub fn check_message(&self, content: &str) -> Result<(), ValidationError> {
        check_text("message", content, self.max_message_chars)
    }

    /// Memory content.
    pub fn check_memory(&self, content: &str) -> Result<(), ValidationError> {
        check_text("memory content", content, self.max_memory_chars)
    }
}

fn check_text(field: &'static str, text: &str, max: usize) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    let actual = text.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong { field, max, actual });
    }
    Ok(())
}

/// Memory importance must sit in `1..=5`.
pub fn check_importance(importance: i64) -> Result<u8, ValidationError> {
    if !(1..=5).contains(&importance) {
        return Err(ValidationError::OutOfRange {
            field: "importance",
            min: 1,
            max: 5,
            value: importance,
        });
    }
    Ok(importance as u8)
}

/// Planned duration and check-in cadence are whole minutes, at least one.
pub fn check_minutes(field: &'static str, minutes: i64) -> Result<u32, ValidationError> {
    if !(1..=24 * 60).contains(&minutes) {
        return Err(ValidationError::OutOfRange {
            field,
            min: 1,
            max: 24 * 60,
            value: minutes,
        });
    }
    Ok(minutes as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_message_rejected() {
        let limits = InputLimits::default();
        assert_eq!(
            limits.check_message("   \n"),
            Err(ValidationError::Empty { field: "message" })
        );
    }

    #[test]
    fn oversized_task_rejected() {
        let limits = InputLimits {
            max_task_chars: 5,
            ..InputLimits::default()
        };
        assert!(matches!(
            limits.check_task("Write docs"),
            Err(ValidationError::TooLong { max: 5, actual: 10, .. })
        ));
        assert!(limits.check_task("Docs").is_ok());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let limits = InputLimits {
            max_message_chars: 3,
            ..InputLimits::default()
        };
        assert!(limits.check_message("héé").is_ok());
    }

    #[test]
    fn importance_bounds() {
        assert_eq!(check_importance(1), Ok(1));
        assert_eq!(check_importance(5), Ok(5));
        assert!(check_importance(0).is_err());
        assert!(check_importance(6).is_err());
    }

    #[test]
    fn minutes_must_be_positive() {
        assert_eq!(check_minutes("duration", 25), Ok(25));
        assert!(check_minutes("duration", 0).is_err());
    }
}
