//! Session table, conversation cursor, and interactive-prompt mediation.
//!
//! Sessions are created lazily per `(user, context, project)` triple; the
//! agent subprocess is spawned on first use. Permission requests raised by
//! the agent are parked as pending interactions, surfaced to adapters
//! through [`GatewayEvent`]s, and resolved by user replies or a timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::acp::{AcpError, AgentConnector, CapabilityState, PermissionHandler, PermissionRequest};
use crate::domain::interaction::{
    Interaction, InteractionKind, InteractionOption, invalid_selection_message, is_plausible_selection,
    match_selection,
};
use crate::domain::repo::{RepoEntry, RepoInventory};
use crate::domain::session::{SessionState, conversation_key, session_key};

use super::GatewayResponse;
use super::state::SessionHandle;

/// Default permission timeout: five minutes.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Events emitted towards transport adapters.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// The agent asked for permission; the user must pick an option.
    PermissionRequest {
        session_id: Uuid,
        request_id: String,
        user_id: String,
        context_id: Option<String>,
        title: String,
        options: Vec<InteractionOption>,
    },
    /// The gateway asks the user to pick a repo, mode, or model.
    SelectionPrompt {
        session_id: Uuid,
        request_id: String,
        user_id: String,
        context_id: Option<String>,
        kind: InteractionKind,
        title: String,
        options: Vec<InteractionOption>,
    },
}

struct ManagerInner {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    cursor: Mutex<HashMap<String, (PathBuf, String)>>,
    repos: RepoInventory,
    connector: Arc<dyn AgentConnector>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<GatewayEvent>>>,
    permission_timeout: Duration,
    default_project: (PathBuf, String),
    request_seq: AtomicU64,
}

impl ManagerInner {
    fn emit(&self, event: GatewayEvent) {
        lock(&self.listeners).retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn next_request_id(&self) -> String {
        format!("req-{}", self.request_seq.fetch_add(1, Ordering::SeqCst))
    }
}

/// Owns all sessions of the gateway; cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Creates a manager over the given connector and repo inventory.
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        repos: RepoInventory,
        default_project: (PathBuf, String),
        permission_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: Mutex::new(HashMap::new()),
                cursor: Mutex::new(HashMap::new()),
                repos,
                connector,
                listeners: Mutex::new(Vec::new()),
                permission_timeout,
                default_project,
                request_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Registers an adapter listener for gateway events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).push(sender);

        receiver
    }

    /// Returns the project the conversation currently points at.
    pub fn project_for(&self, user_id: &str, context_id: Option<&str>) -> (PathBuf, String) {
        let key = conversation_key(user_id, context_id);

        lock(&self.inner.cursor)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.inner.default_project.clone())
    }

    /// Returns the session for the conversation's current project, creating
    /// the table entry when absent. The agent is NOT spawned here.
    pub fn session(&self, user_id: &str, context_id: Option<&str>) -> Arc<SessionHandle> {
        let (project_path, repo_name) = self.project_for(user_id, context_id);
        let key = session_key(user_id, context_id, &project_path);

        let mut sessions = lock(&self.inner.sessions);
        if let Some(session) = sessions.get(&key) {
            return Arc::clone(session);
        }

        let session = Arc::new(SessionHandle::new(
            user_id.to_string(),
            context_id.map(ToString::to_string),
            project_path,
            repo_name,
        ));
        tracing::info!(
            session_id = %session.id,
            user_id,
            project = %session.project_path.display(),
            "session created"
        );
        sessions.insert(key, Arc::clone(&session));

        session
    }

    /// Returns the conversation's session without creating one.
    pub fn existing_session(
        &self,
        user_id: &str,
        context_id: Option<&str>,
    ) -> Option<Arc<SessionHandle>> {
        let (project_path, _) = self.project_for(user_id, context_id);
        let key = session_key(user_id, context_id, &project_path);

        lock(&self.inner.sessions).get(&key).cloned()
    }

    /// Finds a session by id with a best-effort linear scan.
    pub fn find_session(&self, session_id: Uuid) -> Option<Arc<SessionHandle>> {
        lock(&self.inner.sessions)
            .values()
            .find(|session| session.id == session_id)
            .cloned()
    }

    /// Spawns and hand-shakes the session's agent when not yet attached.
    ///
    /// # Errors
    /// Propagates spawn and handshake failures; the triggering enqueue then
    /// fails with a user-visible error.
    pub async fn ensure_agent(&self, session: &Arc<SessionHandle>) -> Result<(), AcpError> {
        if session.agent().is_some() {
            return Ok(());
        }

        let _gate = session.gate.lock().await;
        if session.agent().is_some() {
            return Ok(());
        }

        let handler = self.permission_handler(session);
        let agent = self
            .inner
            .connector
            .connect(&session.project_path, handler)
            .await?;
        session.set_agent(agent);
        tracing::info!(session_id = %session.id, "agent attached");

        Ok(())
    }

    /// Builds the permission handler injected into the session's agent.
    ///
    /// Weak references break the `manager → session → agent → handler`
    /// cycle.
    fn permission_handler(&self, session: &Arc<SessionHandle>) -> PermissionHandler {
        let inner = Arc::downgrade(&self.inner);
        let session = Arc::downgrade(session);

        Arc::new(move |request: PermissionRequest| {
            let inner = Weak::clone(&inner);
            let session = Weak::clone(&session);

            Box::pin(async move {
                let Some(inner) = inner.upgrade() else {
                    return Err("gateway is shutting down".to_string());
                };
                let Some(session) = session.upgrade() else {
                    return Err("session destroyed".to_string());
                };

                mediate_permission(&inner, &session, request).await
            })
        })
    }

    /// Resolves a pending interaction addressed by session id.
    pub async fn resolve_interaction(
        &self,
        session_id: Uuid,
        request_id: &str,
        input: &str,
    ) -> GatewayResponse {
        let Some(session) = self.find_session(session_id) else {
            return GatewayResponse::failure("Unknown session.");
        };

        self.resolve_on_session(&session, request_id, input).await
    }

    /// Attempts to interpret `text` as an answer to the session's pending
    /// interaction. Returns `None` when nothing is pending or the text does
    /// not look like a selection, in which case it should be enqueued as a
    /// regular prompt and the interaction stays live.
    pub async fn try_resolve_interaction(
        &self,
        session: &Arc<SessionHandle>,
        text: &str,
    ) -> Option<GatewayResponse> {
        let (request_id, options) = session.first_interaction()?;
        if !is_plausible_selection(&options, text) {
            return None;
        }

        Some(self.resolve_on_session(session, &request_id, text).await)
    }

    async fn resolve_on_session(
        &self,
        session: &Arc<SessionHandle>,
        request_id: &str,
        input: &str,
    ) -> GatewayResponse {
        let Some((kind, options)) = session.interaction_view(request_id) else {
            return GatewayResponse::failure("No pending interaction.");
        };
        let Some(option_id) = match_selection(&options, input) else {
            // Interaction stays pending; the user gets an instructive error.
            return GatewayResponse::failure(invalid_selection_message(&options));
        };
        let Some(interaction) = session.take_interaction(request_id) else {
            return GatewayResponse::failure("No pending interaction.");
        };

        // Restore the state BEFORE resolving: the continuation of a blocked
        // prompt may run process-next immediately, and it must not observe a
        // stale WaitingConfirm.
        session.restore_state_after_interaction();

        match kind {
            InteractionKind::RepoSelection => {
                let ident = option_id.strip_prefix("repo:").unwrap_or(&option_id);
                match self.inner.repos.find(ident).cloned() {
                    Some(repo) => {
                        self.set_cursor(&session.user_id, session.context_id.as_deref(), &repo);
                        interaction.resolve(&option_id);

                        GatewayResponse::ok(format!(
                            "📁 Switched to {} ({}).\nFuture sessions in this conversation will use it.",
                            repo.name,
                            repo.path.display()
                        ))
                    }
                    None => {
                        interaction.reject("unknown repo");

                        GatewayResponse::failure(format!("Unknown repo: {ident}"))
                    }
                }
            }
            InteractionKind::ModeSelection => {
                interaction.resolve(&option_id);
                match session.agent() {
                    Some(agent) => into_gateway_response(agent.set_mode(&option_id).await),
                    None => GatewayResponse::failure("agent not initialized"),
                }
            }
            InteractionKind::ModelSelection => {
                interaction.resolve(&option_id);
                match session.agent() {
                    Some(agent) => into_gateway_response(agent.set_model(&option_id).await),
                    None => GatewayResponse::failure("agent not initialized"),
                }
            }
            InteractionKind::Permission => {
                let name = options
                    .iter()
                    .find(|option| option.id == option_id)
                    .map_or(option_id.clone(), |option| option.name.clone());
                interaction.resolve(&option_id);

                GatewayResponse::ok(format!("✅ Selected {name}."))
            }
        }
    }

    /// `/repo`: lists repos (as a selection card) or switches the cursor.
    pub fn repo_command(&self, user_id: &str, context_id: Option<&str>, arg: Option<&str>) -> GatewayResponse {
        match arg {
            Some(ident) => match self.inner.repos.find(ident).cloned() {
                Some(repo) => {
                    self.set_cursor(user_id, context_id, &repo);

                    GatewayResponse::ok(format!(
                        "📁 Switched to {} ({}).\nIn-flight tasks keep their repo; new sessions use it.",
                        repo.name,
                        repo.path.display()
                    ))
                }
                None => GatewayResponse::failure(format!(
                    "Unknown repo `{ident}`. Send /repo to list repositories."
                )),
            },
            None => {
                let session = self.session(user_id, context_id);
                let options: Vec<InteractionOption> = self
                    .inner
                    .repos
                    .entries()
                    .iter()
                    .map(|repo| {
                        InteractionOption::new(
                            format!("repo:{}", repo.index),
                            format!("{} ({})", repo.name, repo.path.display()),
                        )
                    })
                    .collect();

                self.open_selection(
                    &session,
                    InteractionKind::RepoSelection,
                    "Select a repository",
                    options,
                )
            }
        }
    }

    /// `/mode` and `/model`: direct switch or a selection card.
    pub async fn switch_capability(
        &self,
        user_id: &str,
        context_id: Option<&str>,
        kind: InteractionKind,
        arg: Option<&str>,
    ) -> GatewayResponse {
        let session = self.session(user_id, context_id);
        if let Err(error) = self.ensure_agent(&session).await {
            return GatewayResponse::failure(format!("Failed to start the agent: {error}"));
        }
        let Some(agent) = session.agent() else {
            return GatewayResponse::failure("agent not initialized");
        };
        let (label, state): (&str, CapabilityState) = match kind {
            InteractionKind::ModelSelection => ("model", agent.model_state()),
            _ => ("mode", agent.mode_state()),
        };
        if state.available.is_empty() {
            return GatewayResponse::failure(format!("The agent does not support {label}s."));
        }

        match arg {
            Some(arg) => {
                let matched = state.available.iter().find(|option| {
                    option.id.eq_ignore_ascii_case(arg) || option.name.eq_ignore_ascii_case(arg)
                });
                match matched {
                    Some(option) => {
                        let response = match kind {
                            InteractionKind::ModelSelection => agent.set_model(&option.id).await,
                            _ => agent.set_mode(&option.id).await,
                        };

                        into_gateway_response(response)
                    }
                    None => {
                        let names: Vec<&str> = state
                            .available
                            .iter()
                            .map(|option| option.id.as_str())
                            .collect();

                        GatewayResponse::failure(format!(
                            "Unknown {label} `{arg}`. Available: {}",
                            names.join(", ")
                        ))
                    }
                }
            }
            None => {
                let options: Vec<InteractionOption> = state
                    .available
                    .iter()
                    .map(|option| {
                        let name = if state.current.as_deref() == Some(option.id.as_str()) {
                            format!("{} (current)", option.name)
                        } else {
                            option.name.clone()
                        };

                        InteractionOption::new(option.id.clone(), name)
                    })
                    .collect();
                let title = format!("Select a {label}");

                self.open_selection(&session, kind, &title, options)
            }
        }
    }

    /// `/reset`: destroys the conversation's session and its agent.
    pub async fn reset_session(&self, user_id: &str, context_id: Option<&str>) -> GatewayResponse {
        let (project_path, _) = self.project_for(user_id, context_id);
        let key = session_key(user_id, context_id, &project_path);
        let Some(session) = lock(&self.inner.sessions).remove(&key) else {
            return GatewayResponse::ok("No active session for this conversation.");
        };

        if let Some(agent) = session.take_agent() {
            agent.cancel().await;
            agent.stop().await;
        }
        let rejected = session.drain_interactions();
        let rejected_count = rejected.len();
        for interaction in rejected {
            interaction.reject("Session reset");
        }
        let (cleared_pending, had_current) = {
            let mut cell = session.scheduling();
            let cleared = cell.queue.pending.len();
            let had_current = cell.queue.current.is_some();
            cell.queue.pending.clear();
            cell.queue.current = None;
            cell.is_processing = false;
            (cleared, had_current)
        };
        tracing::info!(session_id = %session.id, "session destroyed");

        GatewayResponse::ok(format!(
            "♻️ Session reset for {}.\n- cancelled in-flight task: {}\n- cleared pending tasks: {}\n- rejected interactions: {}",
            session.repo_name,
            if had_current { "yes" } else { "no" },
            cleared_pending,
            rejected_count
        ))
    }

    /// `/stop`: cancels the current task, removes one queued task, or
    /// stops the whole queue.
    pub async fn stop_task(
        &self,
        user_id: &str,
        context_id: Option<&str>,
        target: Option<&str>,
    ) -> GatewayResponse {
        let Some(session) = self.existing_session(user_id, context_id) else {
            return GatewayResponse::ok("No active session for this conversation.");
        };

        match target {
            Some("all") => {
                let cleared = {
                    let mut cell = session.scheduling();
                    cell.transition(SessionState::Stopped);
                    let cleared = cell.queue.pending.len();
                    cell.queue.pending.clear();
                    cleared
                };
                if let Some(agent) = session.agent() {
                    agent.cancel().await;
                }

                GatewayResponse::ok(format!(
                    "🛑 Stopped. Cancelled the current task and cleared {cleared} pending task(s).\nSend /reset to start fresh."
                ))
            }
            Some(task_id) => {
                let removed = session.scheduling().queue.remove_pending(task_id);
                if removed {
                    GatewayResponse::ok(format!("Removed task {task_id} from the queue."))
                } else {
                    GatewayResponse::failure(format!("No pending task with id {task_id}."))
                }
            }
            None => {
                if let Some(agent) = session.agent() {
                    agent.cancel().await;
                }

                GatewayResponse::ok("Cancelled the current task.")
            }
        }
    }

    /// `/current`: diagnostic snapshot of the conversation's session.
    pub fn queue_status(&self, user_id: &str, context_id: Option<&str>) -> GatewayResponse {
        let Some(session) = self.existing_session(user_id, context_id) else {
            return GatewayResponse::ok("No active session for this conversation.");
        };

        let mut message = format!(
            "📊 {} ({})",
            session.repo_name,
            session.project_path.display()
        );
        {
            let cell = session.scheduling();
            message.push_str(&format!("\nState: {}", cell.state));
            if let Some(current) = &cell.queue.current {
                message.push_str(&format!("\nCurrent: {}", current.preview()));
            }
            if !cell.queue.pending.is_empty() {
                message.push_str(&format!("\nPending ({}):", cell.queue.pending.len()));
                for (index, task) in cell.queue.pending.iter().enumerate() {
                    message.push_str(&format!("\n{}. {}", index + 1, task.preview()));
                }
            }
        }
        if let Some(agent) = session.agent() {
            let status = agent.agent_status();
            message.push_str(&format!(
                "\nAgent: pid {}, {}",
                status.pid.map_or("?".to_string(), |pid| pid.to_string()),
                if status.running { "running" } else { "stopped" }
            ));
            if let Some(plan) = agent.plan_status() {
                message.push_str(&format!("\nPlan: {}", plan.summary));
            }
        } else {
            message.push_str("\nAgent: not started");
        }

        GatewayResponse::ok(message)
    }

    fn open_selection(
        &self,
        session: &Arc<SessionHandle>,
        kind: InteractionKind,
        title: &str,
        options: Vec<InteractionOption>,
    ) -> GatewayResponse {
        if options.is_empty() {
            return GatewayResponse::failure("Nothing to select from.");
        }

        for stale in session.drain_interactions() {
            stale.reject("replaced by new interaction");
        }
        let request_id = self.inner.next_request_id();
        // The receiver is intentionally dropped: selections act through the
        // resolution path, not a waiting future.
        let (interaction, _receiver) = Interaction::new(kind, title.to_string(), options.clone());
        session.insert_interaction(&request_id, interaction);
        {
            let mut cell = session.scheduling();
            if cell.state == SessionState::Running {
                cell.transition(SessionState::WaitingConfirm);
            }
        }
        self.inner.emit(GatewayEvent::SelectionPrompt {
            session_id: session.id,
            request_id,
            user_id: session.user_id.clone(),
            context_id: session.context_id.clone(),
            kind,
            title: title.to_string(),
            options: options.clone(),
        });

        let mut message = format!("{title}:");
        for (index, option) in options.iter().enumerate() {
            message.push_str(&format!("\n{index}. {}", option.name));
        }
        message.push_str("\nReply with an index or name.");

        GatewayResponse::ok(message)
    }

    fn set_cursor(&self, user_id: &str, context_id: Option<&str>, repo: &RepoEntry) {
        let key = conversation_key(user_id, context_id);
        lock(&self.inner.cursor).insert(key, (repo.path.clone(), repo.name.clone()));
    }
}

/// Parks a permission request as a pending interaction and waits for the
/// user's reply or the timeout.
async fn mediate_permission(
    inner: &Arc<ManagerInner>,
    session: &Arc<SessionHandle>,
    request: PermissionRequest,
) -> Result<String, String> {
    let request_id = inner.next_request_id();
    let options: Vec<InteractionOption> = request
        .options
        .iter()
        .map(|option| InteractionOption::new(option.id.clone(), option.name.clone()))
        .collect();

    for stale in session.drain_interactions() {
        stale.reject("replaced by new interaction");
    }
    let (interaction, receiver) =
        Interaction::new(InteractionKind::Permission, request.title.clone(), options.clone());
    session.insert_interaction(&request_id, interaction);
    session.scheduling().transition(SessionState::WaitingConfirm);
    inner.emit(GatewayEvent::PermissionRequest {
        session_id: session.id,
        request_id: request_id.clone(),
        user_id: session.user_id.clone(),
        context_id: session.context_id.clone(),
        title: request.title.clone(),
        options: options.clone(),
    });
    tracing::info!(
        session_id = %session.id,
        %request_id,
        title = %request.title,
        "permission requested"
    );

    tokio::select! {
        resolved = receiver => match resolved {
            Ok(option_id) => Ok(option_id),
            Err(_) => Err("interaction rejected".to_string()),
        },
        () = tokio::time::sleep(inner.permission_timeout) => {
            if let Some(stale) = session.take_interaction(&request_id) {
                stale.reject("permission timed out");
            }
            session.restore_state_after_interaction();
            let fallback = timeout_fallback(&options);
            tracing::warn!(
                session_id = %session.id,
                %request_id,
                %fallback,
                "permission timed out; using fallback option"
            );

            Ok(fallback)
        }
    }
}

/// Fallback option used when a permission request times out: an option named
/// like "deny"/"cancel" wins, then the first option, then the literal
/// `deny`.
fn timeout_fallback(options: &[InteractionOption]) -> String {
    options
        .iter()
        .find(|option| {
            let name = option.name.to_lowercase();
            name.contains("deny") || name.contains("cancel")
        })
        .or_else(|| options.first())
        .map_or_else(|| "deny".to_string(), |option| option.id.clone())
}

fn into_gateway_response(response: crate::acp::AgentResponse) -> GatewayResponse {
    GatewayResponse {
        success: response.success,
        message: response.message,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::acp::AgentSession;
    use crate::app::testing::{FakeConnector, TRIGGER_PERMISSION};

    use super::*;

    fn manager_with(
        connector: Arc<FakeConnector>,
        timeout: Duration,
    ) -> (SessionManager, tempfile::TempDir) {
        let dir = tempdir().expect("failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("alpha/.git")).expect("failed to create repo");
        std::fs::create_dir_all(dir.path().join("beta/.git")).expect("failed to create repo");
        let repos = RepoInventory::scan(dir.path());
        let default = repos.entries()[0].clone();
        let manager = SessionManager::new(
            connector,
            repos,
            (default.path, default.name),
            timeout,
        );

        (manager, dir)
    }

    #[tokio::test]
    async fn test_session_is_created_lazily_and_reused() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);

        // Act
        let first = manager.session("u1", None);
        let second = manager.session("u1", None);

        // Assert: same table entry, and no agent spawned yet.
        assert_eq!(first.id, second.id);
        assert!(connector.created().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_agent_connects_once() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);

        // Act
        manager.ensure_agent(&session).await.expect("connect failed");
        manager.ensure_agent(&session).await.expect("connect failed");

        // Assert
        assert_eq!(connector.created().len(), 1);
        assert!(session.agent().is_some());
    }

    #[tokio::test]
    async fn test_permission_timeout_falls_back_to_deny_and_restores_state() {
        // Arrange: 100 ms timeout, nobody answers.
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), Duration::from_millis(100));
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");
        let agent = connector.created()[0].clone();
        let mut events = manager.subscribe();

        // Act: the fake agent raises a permission request and blocks on the
        // handler; the timeout resolves it.
        let response = agent.send_prompt(TRIGGER_PERMISSION).await;
        let event = events.recv().await.expect("no event emitted");

        // Assert
        assert!(matches!(event, GatewayEvent::PermissionRequest { .. }));
        assert!(response.success);
        assert_eq!(response.message, "permission:deny");
        assert!(!session.has_interactions());
        assert_eq!(session.scheduling().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_resolving_permission_restores_running_with_current_task() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");
        let agent = connector.created()[0].clone();
        {
            use crate::domain::task::{Task, TaskKind};
            let mut cell = session.scheduling();
            cell.transition(SessionState::Running);
            cell.queue.current = Some(Task::new(TaskKind::Prompt, "work".to_string()));
        }
        let mut events = manager.subscribe();

        // Act: resolve with the 0-based index while the prompt is blocked.
        let prompt = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.send_prompt(TRIGGER_PERMISSION).await }
        });
        let event = events.recv().await.expect("no event emitted");
        let GatewayEvent::PermissionRequest {
            session_id,
            request_id,
            ..
        } = event
        else {
            unreachable!("expected a permission request");
        };
        assert_eq!(session.scheduling().state, SessionState::WaitingConfirm);
        let resolution = manager
            .resolve_interaction(session_id, &request_id, "0")
            .await;
        let prompt_response = prompt.await.expect("prompt task panicked");

        // Assert
        assert!(resolution.success);
        assert!(resolution.message.contains("Allow"));
        assert_eq!(prompt_response.message, "permission:allow");
        assert_eq!(session.scheduling().state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_invalid_selection_keeps_interaction_pending() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");
        let agent = connector.created()[0].clone();
        let mut events = manager.subscribe();

        let prompt = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.send_prompt(TRIGGER_PERMISSION).await }
        });
        let GatewayEvent::PermissionRequest {
            session_id,
            request_id,
            ..
        } = events.recv().await.expect("no event emitted")
        else {
            unreachable!("expected a permission request");
        };

        // Act: out-of-range index.
        let bad = manager
            .resolve_interaction(session_id, &request_id, "9")
            .await;

        // Assert: instructive failure, interaction still pending.
        assert!(!bad.success);
        assert!(bad.message.contains("0-1"));
        assert!(session.has_interactions());

        // Cleanup: resolve by name.
        let good = manager
            .resolve_interaction(session_id, &request_id, "deny")
            .await;
        assert!(good.success);
        assert_eq!(
            prompt.await.expect("prompt task panicked").message,
            "permission:deny"
        );
    }

    #[tokio::test]
    async fn test_new_interaction_replaces_existing_one() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");
        let agent = connector.created()[0].clone();
        let mut events = manager.subscribe();

        // Act: two permission requests back to back; the first is replaced.
        let first = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.send_prompt(TRIGGER_PERMISSION).await }
        });
        let _ = events.recv().await.expect("no event emitted");
        let second = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.send_prompt(TRIGGER_PERMISSION).await }
        });
        let GatewayEvent::PermissionRequest {
            session_id,
            request_id,
            ..
        } = events.recv().await.expect("no second event")
        else {
            unreachable!("expected a permission request");
        };
        let first_response = first.await.expect("first prompt panicked");
        manager
            .resolve_interaction(session_id, &request_id, "allow")
            .await;
        let second_response = second.await.expect("second prompt panicked");

        // Assert: the replaced one fell back through the rejection path.
        assert!(first_response.message.contains("permission failed"));
        assert_eq!(second_response.message, "permission:allow");
    }

    #[tokio::test]
    async fn test_repo_switch_moves_cursor_without_touching_session() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let original = manager.session("u1", None);

        // Act
        let response = manager.repo_command("u1", None, Some("beta"));
        let after_switch = manager.session("u1", None);

        // Assert: the cursor moved, the old session is untouched, and the
        // new conversation project yields a different session.
        assert!(response.success);
        assert_ne!(original.id, after_switch.id);
        assert_eq!(after_switch.repo_name, "beta");
        assert_eq!(original.repo_name, "alpha");
    }

    #[tokio::test]
    async fn test_repo_selection_card_resolution_switches_cursor() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let mut events = manager.subscribe();

        // Act: /repo without args opens a selection; answer with index 1.
        let card = manager.repo_command("u1", None, None);
        let GatewayEvent::SelectionPrompt {
            session_id,
            request_id,
            kind,
            ..
        } = events.recv().await.expect("no selection event")
        else {
            unreachable!("expected a selection prompt");
        };
        let resolution = manager
            .resolve_interaction(session_id, &request_id, "1")
            .await;

        // Assert
        assert!(card.success);
        assert!(card.message.contains("alpha"));
        assert_eq!(kind, InteractionKind::RepoSelection);
        assert!(resolution.success);
        assert!(resolution.message.contains("beta"));
        let (path, name) = manager.project_for("u1", None);
        assert_eq!(name, "beta");
        assert!(path.ends_with("beta"));
    }

    #[tokio::test]
    async fn test_mode_selection_card_applies_choice_to_agent() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let mut events = manager.subscribe();

        // Act
        let card = manager
            .switch_capability("u1", None, InteractionKind::ModeSelection, None)
            .await;
        let GatewayEvent::SelectionPrompt {
            session_id,
            request_id,
            ..
        } = events.recv().await.expect("no selection event")
        else {
            unreachable!("expected a selection prompt");
        };
        let resolution = manager
            .resolve_interaction(session_id, &request_id, "code")
            .await;

        // Assert
        assert!(card.message.contains("Select a mode"));
        assert!(resolution.success);
        let agent = connector.created()[0].clone();
        assert_eq!(agent.mode_state().current.as_deref(), Some("code"));
    }

    #[tokio::test]
    async fn test_direct_mode_switch_by_name() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);

        // Act
        let response = manager
            .switch_capability("u1", None, InteractionKind::ModeSelection, Some("Code"))
            .await;

        // Assert
        assert!(response.success);
        let agent = connector.created()[0].clone();
        assert_eq!(agent.mode_state().current.as_deref(), Some("code"));
    }

    #[tokio::test]
    async fn test_stop_all_parks_queue_and_reset_destroys_session() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");
        let agent = connector.created()[0].clone();

        // Act
        let stop = manager.stop_task("u1", None, Some("all")).await;
        let reset = manager.reset_session("u1", None).await;

        // Assert
        assert!(stop.success);
        assert!(agent.was_cancelled());
        assert!(reset.success);
        assert!(agent.was_stopped());
        assert!(manager.existing_session("u1", None).is_none());
    }

    #[tokio::test]
    async fn test_queue_status_reports_state_and_agent() {
        // Arrange
        let connector = Arc::new(FakeConnector::default());
        let (manager, _dir) = manager_with(Arc::clone(&connector), DEFAULT_PERMISSION_TIMEOUT);
        let session = manager.session("u1", None);
        manager.ensure_agent(&session).await.expect("connect failed");

        // Act
        let status = manager.queue_status("u1", None);

        // Assert
        assert!(status.success);
        assert!(status.message.contains("State: idle"));
        assert!(status.message.contains("pid 4242"));
    }

    #[test]
    fn test_timeout_fallback_prefers_deny_then_cancel_then_first() {
        // Arrange
        let deny = vec![
            InteractionOption::new("a", "Approve"),
            InteractionOption::new("d", "Deny once"),
        ];
        let cancel = vec![
            InteractionOption::new("a", "Approve"),
            InteractionOption::new("c", "Cancel"),
        ];
        let neither = vec![InteractionOption::new("x", "First")];

        // Act & Assert
        assert_eq!(timeout_fallback(&deny), "d");
        assert_eq!(timeout_fallback(&cancel), "c");
        assert_eq!(timeout_fallback(&neither), "x");
        assert_eq!(timeout_fallback(&[]), "deny");
    }
}
