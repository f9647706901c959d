use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use super::AcpError;

/// Built-in ACP agent executors and their launch command lines.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AgentExecutor {
    #[default]
    Opencode,
    ClaudeCode,
    Codex,
}

impl AgentExecutor {
    /// Returns the built-in command and arguments for this executor.
    pub fn command_line(self) -> (&'static str, &'static [&'static str]) {
        match self {
            AgentExecutor::Opencode => ("opencode", &["acp"]),
            AgentExecutor::ClaudeCode => ("claude-code-acp", &[]),
            AgentExecutor::Codex => ("codex-acp", &[]),
        }
    }
}

impl fmt::Display for AgentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentExecutor::Opencode => write!(f, "opencode"),
            AgentExecutor::ClaudeCode => write!(f, "claude-code"),
            AgentExecutor::Codex => write!(f, "codex"),
        }
    }
}

impl FromStr for AgentExecutor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opencode" => Ok(AgentExecutor::Opencode),
            "claude-code" => Ok(AgentExecutor::ClaudeCode),
            "codex" => Ok(AgentExecutor::Codex),
            other => Err(format!("unknown agent executor: {other}")),
        }
    }
}

/// Optional explicit launch override; explicit values win over the executor
/// mapping.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub executor: Option<String>,
}

/// Fully resolved agent command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Resolves the effective launch command for a session.
///
/// Explicit `command` wins over the executor mapping. The working directory
/// defaults to the session's project path; an explicit relative cwd is
/// resolved against the project path.
pub fn resolve_launch(
    project_path: &Path,
    executor: AgentExecutor,
    config: &LaunchConfig,
) -> ResolvedLaunch {
    let (command, args) = match &config.command {
        Some(command) => (command.clone(), config.args.clone().unwrap_or_default()),
        None => {
            let (command, args) = executor.command_line();
            (
                command.to_string(),
                args.iter().map(ToString::to_string).collect(),
            )
        }
    };

    let cwd = match &config.cwd {
        Some(cwd) if cwd.is_absolute() => cwd.clone(),
        Some(cwd) => project_path.join(cwd),
        None => project_path.to_path_buf(),
    };

    let env = config
        .env
        .as_ref()
        .map(|env| {
            let mut pairs: Vec<(String, String)> = env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            pairs.sort();
            pairs
        })
        .unwrap_or_default();

    ResolvedLaunch {
        command,
        args,
        cwd,
        env,
    }
}

/// Spawns the agent child process with piped stdio.
///
/// # Errors
/// Returns [`AcpError::Spawn`] when the process cannot be started or its
/// stdio pipes cannot be captured.
pub fn spawn_agent(
    launch: &ResolvedLaunch,
) -> Result<
    (
        tokio::process::Child,
        tokio::process::ChildStdin,
        tokio::process::ChildStdout,
    ),
    AcpError,
> {
    let mut command = tokio::process::Command::new(&launch.command);
    command
        .args(&launch.args)
        .current_dir(&launch.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    for (key, value) in &launch.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|error| AcpError::Spawn(format!("failed to start `{}`: {error}", launch.command)))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AcpError::Spawn("failed to capture agent stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AcpError::Spawn("failed to capture agent stdout".to_string()))?;

    Ok((child, stdin, stdout))
}
