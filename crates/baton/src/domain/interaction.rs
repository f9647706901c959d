//! Suspended agent-to-user questions and the selection grammar that resolves
//! them.
//!
//! An [`Interaction`] is a one-shot rendezvous: the side awaiting the answer
//! holds the [`tokio::sync::oneshot::Receiver`], the chat surface resolves or
//! rejects it exactly once. Selections accept numeric indexes (0-based takes
//! precedence, 1-based as fallback) or case-insensitive option ids/names.

use std::fmt;
use std::time::SystemTime;

use tokio::sync::oneshot;

/// Kinds of questions a session can park while waiting for a user reply.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InteractionKind {
    Permission,
    RepoSelection,
    ModeSelection,
    ModelSelection,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionKind::Permission => write!(f, "permission"),
            InteractionKind::RepoSelection => write!(f, "repo_selection"),
            InteractionKind::ModeSelection => write!(f, "mode_selection"),
            InteractionKind::ModelSelection => write!(f, "model_selection"),
        }
    }
}

/// One selectable answer presented to the user.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InteractionOption {
    /// Stable identifier sent back to the awaiting side.
    pub id: String,
    /// Human-readable label rendered by adapters.
    pub name: String,
}

impl InteractionOption {
    /// Creates an option from id and display name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A pending question registered on a session.
pub struct Interaction {
    /// What kind of question is being asked.
    pub kind: InteractionKind,
    /// Short title rendered above the options.
    pub title: String,
    /// Answers the user may pick from.
    pub options: Vec<InteractionOption>,
    /// Registration timestamp.
    pub created_at: SystemTime,
    resolver: Option<oneshot::Sender<String>>,
}

impl Interaction {
    /// Creates an interaction and the receiver the awaiting side listens on.
    pub fn new(
        kind: InteractionKind,
        title: String,
        options: Vec<InteractionOption>,
    ) -> (Self, oneshot::Receiver<String>) {
        let (resolver, receiver) = oneshot::channel();
        let interaction = Self {
            kind,
            title,
            options,
            created_at: SystemTime::now(),
            resolver: Some(resolver),
        };

        (interaction, receiver)
    }

    /// Resolves the interaction with the chosen option id.
    ///
    /// Sending can only fail when the awaiting side is gone, which is fine:
    /// mode/model/repo selections have no listener and act on resolution
    /// through the session manager instead.
    pub fn resolve(mut self, option_id: &str) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(option_id.to_string());
        }
    }

    /// Rejects the interaction; the awaiting side observes a closed channel.
    pub fn reject(mut self, reason: &str) {
        tracing::debug!(kind = %self.kind, reason, "rejecting pending interaction");
        self.resolver.take();
    }
}

/// Returns whether `input` plausibly addresses one of `options`.
///
/// Numeric input is always plausible (even out of range, so the user gets an
/// instructive error instead of having the text enqueued as a prompt);
/// otherwise the input must match an option id or name.
pub fn is_plausible_selection(options: &[InteractionOption], input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.parse::<usize>().is_ok() {
        return true;
    }

    match_selection(options, trimmed).is_some()
}

/// Maps user input to a concrete option id.
///
/// Numeric input `k` is tried as a 0-based index first (legacy behavior),
/// then as 1-based. Non-numeric input matches case-insensitively against
/// option ids, then names.
pub fn match_selection(options: &[InteractionOption], input: &str) -> Option<String> {
    let trimmed = input.trim();
    if let Ok(index) = trimmed.parse::<usize>() {
        if let Some(option) = options.get(index) {
            return Some(option.id.clone());
        }
        if index >= 1
            && let Some(option) = options.get(index - 1)
        {
            return Some(option.id.clone());
        }

        return None;
    }

    options
        .iter()
        .find(|option| {
            option.id.eq_ignore_ascii_case(trimmed) || option.name.eq_ignore_ascii_case(trimmed)
        })
        .map(|option| option.id.clone())
}

/// Builds the instructive message shown when a selection input is invalid.
pub fn invalid_selection_message(options: &[InteractionOption]) -> String {
    let ids: Vec<&str> = options.iter().map(|option| option.id.as_str()).collect();
    let max_index = options.len().saturating_sub(1);

    format!(
        "Invalid selection. Reply with an index (0-{max_index}) or one of: {}",
        ids.join(", ")
    )
}
