//! Gateway configuration: JSON file discovery plus environment overrides.
//!
//! Precedence is environment > file > defaults. Platform credential blocks
//! are kept as raw JSON: they belong to the external transport adapters;
//! the core only probes them to pick the `auto` run mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::acp::{AgentExecutor, LaunchConfig};

/// Config file names probed in order, in each directory walked.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["baton.config.json", ".batonrc.json", "baton.json"];

/// How many parent directories the discovery walk may climb.
const MAX_PARENT_DEPTH: usize = 5;

/// Platform adapters probed by `auto` mode, in priority order.
pub const PLATFORMS: [&str; 5] = ["feishu", "telegram", "whatsapp", "slack", "discord"];

/// Errors raised while loading configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
}

/// Default project block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
}

/// Full gateway configuration document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub project: ProjectConfig,
    /// `en` or `zh-CN`.
    pub language: Option<String>,
    pub acp: LaunchConfig,
    pub permission_timeout_ms: Option<u64>,
    pub dedup_ttl_ms: Option<u64>,
    pub feishu: Option<Value>,
    pub telegram: Option<Value>,
    pub whatsapp: Option<Value>,
    pub slack: Option<Value>,
    pub discord: Option<Value>,
}

impl Config {
    /// Loads configuration from an explicit file or by discovery, then
    /// applies environment overrides.
    ///
    /// Without an explicit path, a missing file is not an error: defaults
    /// plus environment apply.
    ///
    /// # Errors
    /// Returns an error when an explicit file is missing or any file fails
    /// to read or parse.
    pub fn load(explicit: Option<&Path>, start_dir: &Path) -> Result<Self, ConfigError> {
        let file = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                Some(path.to_path_buf())
            }
            None => discover(start_dir),
        };

        let mut config = match file {
            Some(path) => parse_file(&path)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut config, std::env::vars().collect());

        Ok(config)
    }

    /// Effective permission timeout (default 300 s).
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms.unwrap_or(300_000))
    }

    /// Effective dedup TTL (default 5 min).
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms.unwrap_or(300_000))
    }

    /// Effective agent executor, defaulting to opencode.
    pub fn executor(&self) -> AgentExecutor {
        self.acp
            .executor
            .as_deref()
            .and_then(|executor| executor.parse().ok())
            .unwrap_or_default()
    }

    /// Returns whether the named platform has its required credentials.
    pub fn platform_credentials_present(&self, platform: &str) -> bool {
        match platform {
            "feishu" => has_keys(self.feishu.as_ref(), &["appId", "appSecret"]),
            "telegram" => has_keys(self.telegram.as_ref(), &["botToken"]),
            "whatsapp" => self
                .whatsapp
                .as_ref()
                .is_some_and(|block| block.get("accessToken").is_some() || block.get("wacli").is_some()),
            "slack" => has_keys(self.slack.as_ref(), &["botToken", "signingSecret"]),
            "discord" => has_keys(self.discord.as_ref(), &["botToken", "publicKey"]),
            _ => false,
        }
    }

    /// Picks the first platform with credentials for `auto` mode.
    pub fn first_configured_platform(&self) -> Option<&'static str> {
        PLATFORMS
            .into_iter()
            .find(|platform| self.platform_credentials_present(platform))
    }
}

fn has_keys(block: Option<&Value>, keys: &[&str]) -> bool {
    block.is_some_and(|block| {
        keys.iter().all(|key| {
            block
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|value| !value.is_empty())
        })
    })
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Walks `start_dir` and up to five parents looking for a config file.
fn discover(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(start_dir.to_path_buf());
    for _ in 0..=MAX_PARENT_DEPTH {
        let current = dir?;
        for name in CONFIG_FILE_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent().map(Path::to_path_buf);
    }

    None
}

/// Applies `BATON_*` environment overrides on top of the file values.
fn apply_env_overrides(config: &mut Config, vars: HashMap<String, String>) {
    if let Some(path) = non_empty(&vars, "BATON_PROJECT_PATH") {
        config.project.path = Some(PathBuf::from(path));
    }
    if let Some(name) = non_empty(&vars, "BATON_PROJECT_NAME") {
        config.project.name = Some(name);
    }
    if let Some(language) = non_empty(&vars, "BATON_LANGUAGE") {
        config.language = Some(language);
    }
    if let Some(command) = non_empty(&vars, "BATON_ACP_COMMAND") {
        config.acp.command = Some(command);
    }
    if let Some(executor) = non_empty(&vars, "BATON_ACP_EXECUTOR") {
        config.acp.executor = Some(executor);
    }
    if let Some(timeout) = non_empty(&vars, "BATON_PERMISSION_TIMEOUT_MS") {
        config.permission_timeout_ms = timeout.parse().ok().or(config.permission_timeout_ms);
    }
    if let Some(ttl) = non_empty(&vars, "BATON_DEDUP_TTL_MS") {
        config.dedup_ttl_ms = ttl.parse().ok().or(config.dedup_ttl_ms);
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .filter(|value| !value.is_empty())
        .cloned()
}
