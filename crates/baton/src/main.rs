use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use baton::acp::AcpConnector;
use baton::app::GatewayResponse;
use baton::app::dispatcher::CommandDispatcher;
use baton::app::queue::{CompletionCallback, TaskQueueEngine};
use baton::app::session_manager::SessionManager;
use baton::domain::repo::RepoInventory;
use baton::infra::config::Config;
use baton::transport::{ChatTransport, CliTransport, ConversationRef, run_cli};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Chat-to-ACP gateway: one supervised coding agent per conversation.
#[derive(Parser)]
#[command(name = "baton", version, about)]
struct Cli {
    /// Run mode: auto, cli, feishu, telegram, whatsapp, slack, discord.
    #[arg(value_name = "MODE")]
    mode_arg: Option<String>,

    /// Default working directory holding the repositories.
    #[arg(value_name = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// Run mode (same values as the positional form).
    #[arg(long)]
    mode: Option<String>,

    /// Default working directory (same as the positional form).
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Explicit config file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// UI language: en or zh-CN.
    #[arg(long)]
    lang: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RunMode {
    Auto,
    Cli,
    Feishu,
    Telegram,
    Whatsapp,
    Slack,
    Discord,
}

impl RunMode {
    fn from_platform(platform: &str) -> Self {
        platform.parse().unwrap_or(RunMode::Cli)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(RunMode::Auto),
            "cli" => Ok(RunMode::Cli),
            "feishu" => Ok(RunMode::Feishu),
            "telegram" => Ok(RunMode::Telegram),
            "whatsapp" => Ok(RunMode::Whatsapp),
            "slack" => Ok(RunMode::Slack),
            "discord" => Ok(RunMode::Discord),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Auto => write!(f, "auto"),
            RunMode::Cli => write!(f, "cli"),
            RunMode::Feishu => write!(f, "feishu"),
            RunMode::Telegram => write!(f, "telegram"),
            RunMode::Whatsapp => write!(f, "whatsapp"),
            RunMode::Slack => write!(f, "slack"),
            RunMode::Discord => write!(f, "discord"),
        }
    }
}

#[allow(clippy::print_stderr, clippy::exit)]
fn fatal(message: &str) -> ! {
    let _ = writeln!(io::stderr(), "Error: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let start_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let config = match Config::load(cli.config.as_deref(), &start_dir) {
        Ok(config) => config,
        Err(error) => fatal(&error.to_string()),
    };

    let mode = match cli.mode_arg.as_deref().or(cli.mode.as_deref()) {
        Some(text) => match text.parse::<RunMode>() {
            Ok(mode) => mode,
            Err(error) => fatal(&error),
        },
        None => RunMode::Auto,
    };
    let mode = if mode == RunMode::Auto {
        config
            .first_configured_platform()
            .map_or(RunMode::Cli, RunMode::from_platform)
    } else {
        mode
    };

    let project_root = cli
        .workdir
        .clone()
        .or_else(|| cli.dir.clone())
        .or_else(|| config.project.path.clone())
        .unwrap_or_else(|| start_dir.clone());
    let project_root = std::fs::canonicalize(&project_root).unwrap_or(project_root);
    let project_name = config.project.name.clone().unwrap_or_else(|| {
        project_root
            .file_name()
            .map_or_else(|| "project".to_string(), |name| {
                name.to_string_lossy().to_string()
            })
    });
    let language = cli.lang.clone().or_else(|| config.language.clone());
    tracing::info!(
        %mode,
        project = %project_root.display(),
        language = language.as_deref().unwrap_or("en"),
        "starting baton"
    );

    let repos = RepoInventory::scan(&project_root);
    tracing::info!(repo_count = repos.entries().len(), "repository inventory built");

    let connector = Arc::new(AcpConnector::new(config.executor(), config.acp.clone()));
    let sessions = SessionManager::new(
        connector,
        repos,
        (project_root, project_name),
        config.permission_timeout(),
    );

    let transport: Arc<dyn ChatTransport> = Arc::new(CliTransport);
    let render_transport = Arc::clone(&transport);
    let callback: CompletionCallback = Arc::new(move |completion| {
        let transport = Arc::clone(&render_transport);
        Box::pin(async move {
            let conversation = ConversationRef {
                user_id: completion.user_id.clone(),
                context_id: completion.context_id.clone(),
            };
            let response = GatewayResponse {
                success: completion.response.success,
                message: completion.response.message.clone(),
            };
            if let Err(error) = transport.render_response(&conversation, &response).await {
                tracing::warn!(%error, "failed to render task response");
            }
        })
    });
    let queue = TaskQueueEngine::new(callback);
    let dispatcher = CommandDispatcher::new(sessions.clone(), queue);

    match mode {
        RunMode::Cli => run_cli(dispatcher, sessions).await?,
        other => fatal(&format!(
            "the {other} adapter is not bundled with this binary; run the matching adapter process against this gateway"
        )),
    }

    Ok(())
}
