//! Transport adapter contract and the built-in CLI adapter.
//!
//! Platform adapters (Feishu, Telegram, WhatsApp, Slack, Discord) live
//! outside the core: each reduces to delivering inbound messages and
//! selections into the [`crate::app::dispatcher::CommandDispatcher`] and
//! rendering responses back to a chat thread through this trait. The CLI
//! adapter is the reference implementation and powers `--mode cli`.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::app::GatewayResponse;
use crate::app::dispatcher::CommandDispatcher;
use crate::app::session_manager::{GatewayEvent, SessionManager};

/// User id assigned to the interactive CLI conversation.
const CLI_USER: &str = "cli";

/// One chat thread on an external platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationRef {
    pub user_id: String,
    pub context_id: Option<String>,
}

/// Outbound surface an adapter must provide.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Renders a response (card or text) to the chat thread.
    ///
    /// # Errors
    /// Returns an error when the platform delivery fails; the gateway logs
    /// and drops it.
    async fn render_response(
        &self,
        conversation: &ConversationRef,
        response: &GatewayResponse,
    ) -> Result<(), String>;
}

/// Terminal-backed adapter for local use.
pub struct CliTransport;

#[async_trait]
impl ChatTransport for CliTransport {
    #[allow(clippy::print_stdout)]
    async fn render_response(
        &self,
        _conversation: &ConversationRef,
        response: &GatewayResponse,
    ) -> Result<(), String> {
        let marker = if response.success { "🤖" } else { "⚠️" };
        println!("{marker} {}", response.message);

        Ok(())
    }
}

/// Runs the interactive CLI loop until stdin closes or the user exits.
///
/// # Errors
/// Returns an error when reading stdin fails.
#[allow(clippy::print_stdout)]
pub async fn run_cli(dispatcher: CommandDispatcher, sessions: SessionManager) -> io::Result<()> {
    let mut events = sessions.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    println!("baton {} — type /help for commands, exit to quit", env!("CARGO_PKG_VERSION"));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" {
            break;
        }

        let response = dispatcher.dispatch(CLI_USER, None, trimmed).await;
        if !response.message.is_empty() {
            let marker = if response.success { "🤖" } else { "⚠️" };
            println!("{marker} {}", response.message);
        }
    }
    tracing::info!("cli loop finished");

    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::PermissionRequest { title, options, .. } => {
            println!("🔐 {title}");
            for (index, option) in options.iter().enumerate() {
                println!("  {index}. {}", option.name);
            }
            println!("Reply with an index or name.");
        }
        GatewayEvent::SelectionPrompt { title, options, .. } => {
            println!("📋 {title}");
            for (index, option) in options.iter().enumerate() {
                println!("  {index}. {}", option.name);
            }
            println!("Reply with an index or name.");
        }
    }
}
