//! Scripted in-process agents for gateway tests; no subprocesses involved.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::acp::{
    AcpError, AgentConnector, AgentResponse, AgentSession, AgentStatus, CapabilityOption,
    CapabilityState, PermissionHandler, PermissionOption, PermissionRequest,
};
use crate::domain::plan::PlanSnapshot;

/// Prompt content that makes [`FakeAgent`] raise a permission request.
pub(crate) const TRIGGER_PERMISSION: &str = "trigger_permission";

/// In-process agent with echo semantics and an optional permission dance.
pub(crate) struct FakeAgent {
    delay: Duration,
    prompts: Mutex<Vec<String>>,
    plan: Mutex<Option<PlanSnapshot>>,
    cancelled: AtomicBool,
    stopped: AtomicBool,
    handler: Mutex<Option<PermissionHandler>>,
    modes: Mutex<CapabilityState>,
    models: Mutex<CapabilityState>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::with_delay(Duration::ZERO)
    }
}

impl FakeAgent {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            prompts: Mutex::new(Vec::new()),
            plan: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            handler: Mutex::new(None),
            modes: Mutex::new(CapabilityState {
                available: vec![
                    CapabilityOption {
                        id: "ask".to_string(),
                        name: "Ask".to_string(),
                    },
                    CapabilityOption {
                        id: "code".to_string(),
                        name: "Code".to_string(),
                    },
                ],
                current: Some("ask".to_string()),
            }),
            models: Mutex::new(CapabilityState {
                available: vec![
                    CapabilityOption {
                        id: "fast".to_string(),
                        name: "Fast".to_string(),
                    },
                    CapabilityOption {
                        id: "smart".to_string(),
                        name: "Smart".to_string(),
                    },
                ],
                current: Some("fast".to_string()),
            }),
        }
    }

    pub(crate) fn set_handler(&self, handler: PermissionHandler) {
        *lock(&self.handler) = Some(handler);
    }

    pub(crate) fn set_plan(&self, plan: PlanSnapshot) {
        *lock(&self.plan) = Some(plan);
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn run(&self, text: &str) -> AgentResponse {
        lock(&self.prompts).push(text.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if text == TRIGGER_PERMISSION {
            let handler = lock(&self.handler).clone();
            let Some(handler) = handler else {
                return AgentResponse::failure("no permission handler installed");
            };
            let request = PermissionRequest {
                title: "Delete".to_string(),
                options: vec![
                    PermissionOption {
                        id: "allow".to_string(),
                        name: "Allow".to_string(),
                        kind: Some("allow_once".to_string()),
                    },
                    PermissionOption {
                        id: "deny".to_string(),
                        name: "Deny".to_string(),
                        kind: Some("reject_once".to_string()),
                    },
                ],
            };

            return match handler(request).await {
                Ok(option_id) => AgentResponse::ok(format!("permission:{option_id}")),
                Err(error) => AgentResponse::failure(format!("permission failed: {error}")),
            };
        }

        AgentResponse::ok(format!("echo: {text}"))
    }
}

#[async_trait]
impl AgentSession for FakeAgent {
    async fn send_prompt(&self, text: &str) -> AgentResponse {
        self.run(text).await
    }

    async fn send_command(&self, text: &str) -> AgentResponse {
        self.run(text).await
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    async fn set_mode(&self, mode_id: &str) -> AgentResponse {
        lock(&self.modes).current = Some(mode_id.to_string());

        AgentResponse::ok(format!("switched to {mode_id}"))
    }

    async fn set_model(&self, model_id: &str) -> AgentResponse {
        lock(&self.models).current = Some(model_id.to_string());

        AgentResponse::ok(format!("switched to {model_id}"))
    }

    fn agent_status(&self) -> AgentStatus {
        AgentStatus {
            pid: Some(4242),
            running: !self.stopped.load(Ordering::SeqCst),
        }
    }

    fn plan_status(&self) -> Option<PlanSnapshot> {
        lock(&self.plan).clone()
    }

    fn mode_state(&self) -> CapabilityState {
        lock(&self.modes).clone()
    }

    fn model_state(&self) -> CapabilityState {
        lock(&self.models).clone()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeAgent`]s and recording every connection.
#[derive(Default)]
pub(crate) struct FakeConnector {
    delay: Duration,
    created: Mutex<Vec<Arc<FakeAgent>>>,
}

impl FakeConnector {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakeAgent>> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(
        &self,
        _project_path: &Path,
        handler: PermissionHandler,
    ) -> Result<Arc<dyn AgentSession>, AcpError> {
        let agent = Arc::new(FakeAgent::with_delay(self.delay));
        agent.set_handler(handler);
        lock(&self.created).push(Arc::clone(&agent));

        Ok(agent)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
