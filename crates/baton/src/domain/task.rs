use std::time::SystemTime;

use uuid::Uuid;

/// Maximum characters shown when a task is previewed in queue cards.
const PREVIEW_MAX_CHARS: usize = 60;

/// Distinguishes data-plane prompts from control-plane command payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    Prompt,
    Command,
}

impl TaskKind {
    /// Returns the wire label used for logging and diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::Prompt => "prompt",
            TaskKind::Command => "command",
        }
    }
}

/// One unit of work queued against a session. Immutable after creation.
#[derive(Clone, Debug)]
pub struct Task {
    /// Stable task identifier.
    pub id: Uuid,
    /// Whether the payload is a prompt or a command.
    pub kind: TaskKind,
    /// Raw user text forwarded to the agent.
    pub content: String,
    /// Creation timestamp.
    pub created_at: SystemTime,
}

impl Task {
    /// Creates a task with a fresh identifier.
    pub fn new(kind: TaskKind, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content,
            created_at: SystemTime::now(),
        }
    }

    /// Returns a single-line preview of the task content for queue cards.
    pub fn preview(&self) -> String {
        let flattened = self.content.replace('\n', " ");
        let trimmed = flattened.trim();
        if trimmed.chars().count() <= PREVIEW_MAX_CHARS {
            return trimmed.to_string();
        }

        let clipped: String = trimmed.chars().take(PREVIEW_MAX_CHARS).collect();

        format!("{clipped}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_labels() {
        // Arrange & Act & Assert
        assert_eq!(TaskKind::Prompt.label(), "prompt");
        assert_eq!(TaskKind::Command.label(), "command");
    }

    #[test]
    fn test_new_assigns_unique_ids() {
        // Arrange & Act
        let first = Task::new(TaskKind::Prompt, "a".to_string());
        let second = Task::new(TaskKind::Prompt, "a".to_string());

        // Assert
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_preview_keeps_short_content() {
        // Arrange
        let task = Task::new(TaskKind::Prompt, "list the repo files".to_string());

        // Act
        let preview = task.preview();

        // Assert
        assert_eq!(preview, "list the repo files");
    }

    #[test]
    fn test_preview_flattens_newlines_and_clips_long_content() {
        // Arrange
        let long_line = "x".repeat(100);
        let task = Task::new(TaskKind::Prompt, format!("first\n{long_line}"));

        // Act
        let preview = task.preview();

        // Assert
        assert!(preview.starts_with("first x"));
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), 61);
    }
}
