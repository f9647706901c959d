//! Agent Client Protocol: one supervised child process per session, spoken
//! to over NDJSON JSON-RPC on stdin/stdout.

pub mod client;
pub mod fs;
pub mod launch;
pub mod terminal;
pub mod wire;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::plan::PlanSnapshot;

pub use client::AcpClient;
pub use launch::{AgentExecutor, LaunchConfig};

/// Errors raised while starting or talking to the agent subprocess.
#[derive(Debug, Error)]
pub enum AcpError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),
    #[error("agent handshake failed: {0}")]
    Handshake(String),
    #[error("agent connection lost: {0}")]
    Disconnected(String),
}

/// Final result of one prompt or command sent to the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentResponse {
    pub success: bool,
    pub message: String,
}

impl AgentResponse {
    /// Creates a successful response.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Creates a failed response.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Liveness snapshot of the agent subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentStatus {
    pub pid: Option<u32>,
    pub running: bool,
}

/// One selectable mode or model advertised by the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityOption {
    pub id: String,
    pub name: String,
}

/// Cached agent capability view (modes or models).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityState {
    pub available: Vec<CapabilityOption>,
    pub current: Option<String>,
}

/// One option offered by an agent permission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionOption {
    pub id: String,
    pub name: String,
    pub kind: Option<String>,
}

/// A permission question raised by the agent during a prompt.
#[derive(Clone, Debug)]
pub struct PermissionRequest {
    pub title: String,
    pub options: Vec<PermissionOption>,
}

/// Boxed async result used by the permission handler.
pub type PermissionFuture = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

/// Callback mediating agent permission requests through the chat surface.
///
/// Returns the selected option id; errors make the client fall back to the
/// safest option (a "deny"-named one when present, the first otherwise).
pub type PermissionHandler = Arc<dyn Fn(PermissionRequest) -> PermissionFuture + Send + Sync>;

/// Per-session agent operations consumed by the queue engine and the
/// session manager.
///
/// The trait is object-safe so sessions can hold `Arc<dyn AgentSession>`
/// and tests can script agents without spawning subprocesses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Sends one prompt turn and waits for the final response.
    async fn send_prompt(&self, text: &str) -> AgentResponse;

    /// Sends one command payload; identical semantics to prompts.
    async fn send_command(&self, text: &str) -> AgentResponse;

    /// Cancels the in-flight prompt, resolving it locally as cancelled.
    async fn cancel(&self);

    /// Switches the agent session mode.
    async fn set_mode(&self, mode_id: &str) -> AgentResponse;

    /// Switches the agent session model.
    async fn set_model(&self, model_id: &str) -> AgentResponse;

    /// Returns the subprocess liveness snapshot.
    fn agent_status(&self) -> AgentStatus;

    /// Returns a copy of the cached plan, when the agent has sent one.
    fn plan_status(&self) -> Option<PlanSnapshot>;

    /// Returns the cached mode capability view.
    fn mode_state(&self) -> CapabilityState;

    /// Returns the cached model capability view.
    fn model_state(&self) -> CapabilityState;

    /// Kills the child process and clears the connection.
    async fn stop(&self);
}

/// Creates connected agent sessions; the production implementation spawns
/// one ACP subprocess per call.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Spawns and hand-shakes an agent for the given project root.
    ///
    /// # Errors
    /// Returns an error when the process cannot be spawned or the ACP
    /// handshake fails.
    async fn connect(
        &self,
        project_path: &Path,
        handler: PermissionHandler,
    ) -> Result<Arc<dyn AgentSession>, AcpError>;
}

/// Production connector backed by [`AcpClient`].
pub struct AcpConnector {
    executor: AgentExecutor,
    launch: LaunchConfig,
}

impl AcpConnector {
    /// Creates a connector with the configured executor and launch override.
    pub fn new(executor: AgentExecutor, launch: LaunchConfig) -> Self {
        Self { executor, launch }
    }
}

#[async_trait]
impl AgentConnector for AcpConnector {
    async fn connect(
        &self,
        project_path: &Path,
        handler: PermissionHandler,
    ) -> Result<Arc<dyn AgentSession>, AcpError> {
        let client = AcpClient::new(
            project_path.to_path_buf(),
            handler,
            self.executor,
            self.launch.clone(),
        );
        client.start().await?;

        Ok(Arc::new(client))
    }
}
