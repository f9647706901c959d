use std::collections::VecDeque;
use std::fmt;
use std::path::Path;

use super::task::Task;

/// Conversation key segment used when a chat has no thread/channel context.
pub const DEFAULT_CONTEXT: &str = "__default__";

/// High-level lifecycle state for one session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    WaitingConfirm,
    Stopped,
}

impl SessionState {
    /// Returns whether a transition to `next` is valid.
    ///
    /// Any state may transition to `Stopped`; `Stopped` is only left by
    /// destroying the session.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Running)
                | (SessionState::Running, SessionState::WaitingConfirm | SessionState::Idle)
                | (
                    SessionState::WaitingConfirm,
                    SessionState::Running | SessionState::Idle
                )
                | (_, SessionState::Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running => write!(f, "running"),
            SessionState::WaitingConfirm => write!(f, "waiting_confirm"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-session FIFO of pending tasks plus the in-flight one.
#[derive(Default)]
pub struct TaskQueue {
    /// Task currently executing against the agent, when any.
    pub current: Option<Task>,
    /// Tasks waiting for their turn, in enqueue order.
    pub pending: VecDeque<Task>,
}

impl TaskQueue {
    /// Removes one pending task by id. Returns whether a task was removed.
    pub fn remove_pending(&mut self, task_id: &str) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|task| task.id.to_string() != task_id);

        self.pending.len() != before
    }
}

/// Derives the conversation key indexing the per-conversation repo cursor.
pub fn conversation_key(user_id: &str, context_id: Option<&str>) -> String {
    let context = context_id.filter(|context| !context.is_empty());

    format!("{user_id}:{}", context.unwrap_or(DEFAULT_CONTEXT))
}

/// Derives the session key indexing the session table.
///
/// The project path is part of the key, so switching a conversation's repo
/// yields a different session instead of mutating the existing one.
pub fn session_key(user_id: &str, context_id: Option<&str>, project_path: &Path) -> String {
    let path = project_path.display();
    match context_id.filter(|context| !context.is_empty()) {
        Some(context) => format!("{user_id}:{context}:{path}"),
        None => format!("{user_id}:{path}"),
    }
}
