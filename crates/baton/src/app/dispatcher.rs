//! Stateless parsing of inbound chat text into control-plane commands or
//! data-plane prompts, and their dispatch onto the session manager and the
//! queue engine.

use uuid::Uuid;

use crate::domain::interaction::InteractionKind;
use crate::domain::task::TaskKind;

use super::GatewayResponse;
use super::queue::TaskQueueEngine;
use super::session_manager::SessionManager;

/// Recognized control-plane commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlashCommand {
    Repo(Option<String>),
    Current,
    Stop(Option<String>),
    Reset,
    Mode(Option<String>),
    Model(Option<String>),
    Help,
}

/// One parsed inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedMessage {
    Command(SlashCommand),
    Prompt(String),
}

/// Splits the leading token against the fixed command table; anything else,
/// including unknown text starting with `/`, is a prompt.
pub fn parse_message(text: &str) -> ParsedMessage {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return ParsedMessage::Prompt(trimmed.to_string());
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or_default();
    let rest = parts
        .next()
        .map(str::trim)
        .filter(|rest| !rest.is_empty())
        .map(ToString::to_string);

    match head {
        "/repo" => ParsedMessage::Command(SlashCommand::Repo(rest)),
        "/current" => ParsedMessage::Command(SlashCommand::Current),
        "/stop" => ParsedMessage::Command(SlashCommand::Stop(rest)),
        "/reset" | "/new" => ParsedMessage::Command(SlashCommand::Reset),
        "/mode" => ParsedMessage::Command(SlashCommand::Mode(rest)),
        "/model" => ParsedMessage::Command(SlashCommand::Model(rest)),
        "/help" => ParsedMessage::Command(SlashCommand::Help),
        _ => ParsedMessage::Prompt(trimmed.to_string()),
    }
}

/// Routes parsed messages to the session manager and queue engine.
#[derive(Clone)]
pub struct CommandDispatcher {
    sessions: SessionManager,
    queue: TaskQueueEngine,
}

impl CommandDispatcher {
    /// Creates a dispatcher over the gateway's manager and queue engine.
    pub fn new(sessions: SessionManager, queue: TaskQueueEngine) -> Self {
        Self { sessions, queue }
    }

    /// Handles one inbound chat message.
    ///
    /// The returned message may be empty (fast-path enqueue): the adapter is
    /// expected to wait for the completion callback instead.
    pub async fn dispatch(
        &self,
        user_id: &str,
        context_id: Option<&str>,
        text: &str,
    ) -> GatewayResponse {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return GatewayResponse::failure("Empty message.");
        }

        match parse_message(trimmed) {
            ParsedMessage::Command(command) => self.run_command(user_id, context_id, command).await,
            ParsedMessage::Prompt(prompt) => self.run_prompt(user_id, context_id, &prompt).await,
        }
    }

    /// Resolves an inbound interactive selection (button click, numbered
    /// reply routed by an adapter) and restarts a parked queue if needed.
    pub async fn resolve_selection(
        &self,
        session_id: Uuid,
        request_id: &str,
        input: &str,
    ) -> GatewayResponse {
        let response = self
            .sessions
            .resolve_interaction(session_id, request_id, input)
            .await;
        if response.success
            && let Some(session) = self.sessions.find_session(session_id)
        {
            self.queue.resume(&session).await;
        }

        response
    }

    async fn run_prompt(
        &self,
        user_id: &str,
        context_id: Option<&str>,
        prompt: &str,
    ) -> GatewayResponse {
        let session = self.sessions.session(user_id, context_id);

        // A prompt that plausibly answers the pending interaction resolves
        // it instead of being enqueued; anything else is enqueued and the
        // interaction stays live.
        if let Some(response) = self.sessions.try_resolve_interaction(&session, prompt).await {
            if response.success {
                self.queue.resume(&session).await;
            }

            return response;
        }

        if let Err(error) = self.sessions.ensure_agent(&session).await {
            return GatewayResponse::failure(format!("Failed to start the agent: {error}"));
        }

        let outcome = self
            .queue
            .enqueue(&session, prompt.to_string(), TaskKind::Prompt)
            .await;

        GatewayResponse {
            success: outcome.success,
            message: outcome.message,
        }
    }

    async fn run_command(
        &self,
        user_id: &str,
        context_id: Option<&str>,
        command: SlashCommand,
    ) -> GatewayResponse {
        match command {
            SlashCommand::Repo(arg) => {
                self.sessions
                    .repo_command(user_id, context_id, arg.as_deref())
            }
            SlashCommand::Current => self.sessions.queue_status(user_id, context_id),
            SlashCommand::Stop(arg) => {
                self.sessions
                    .stop_task(user_id, context_id, arg.as_deref())
                    .await
            }
            SlashCommand::Reset => self.sessions.reset_session(user_id, context_id).await,
            SlashCommand::Mode(arg) => {
                self.sessions
                    .switch_capability(
                        user_id,
                        context_id,
                        InteractionKind::ModeSelection,
                        arg.as_deref(),
                    )
                    .await
            }
            SlashCommand::Model(arg) => {
                self.sessions
                    .switch_capability(
                        user_id,
                        context_id,
                        InteractionKind::ModelSelection,
                        arg.as_deref(),
                    )
                    .await
            }
            SlashCommand::Help => GatewayResponse::ok(help_text()),
        }
    }
}

fn help_text() -> String {
    [
        "🤖 Baton commands:",
        "/repo [id|name] — list repositories or switch this conversation",
        "/current — session status",
        "/stop [id|all] — cancel the current task, drop a queued one, or stop everything",
        "/reset (or /new) — destroy the session and start fresh",
        "/mode [name] — switch the agent mode",
        "/model [name] — switch the agent model",
        "/help — this message",
        "Anything else is sent to the agent as a prompt.",
        "Selections: reply with an option index (0-based; 1-based accepted when out of range) or the option name.",
    ]
    .join("\n")
}
