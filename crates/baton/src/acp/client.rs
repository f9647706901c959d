//! ACP connection management: one child process per session, NDJSON
//! JSON-RPC on its stdio, and the client-side callbacks the agent invokes.
//!
//! A background reader task routes inbound lines: responses resolve pending
//! request waiters, `session/update` notifications feed the message buffer
//! and capability caches, and agent-initiated requests (permission, fs,
//! terminal) are served on spawned tasks so a minutes-long permission prompt
//! never stalls the loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::sync::oneshot;

use crate::domain::plan::{PlanEntry, PlanEntryStatus, PlanSnapshot};

use super::launch::{self, AgentExecutor, LaunchConfig};
use super::terminal::TerminalRegistry;
use super::wire::{self, methods};
use super::{
    AcpError, AgentResponse, AgentSession, AgentStatus, CapabilityOption, CapabilityState,
    PermissionHandler, PermissionOption, PermissionRequest, fs,
};

/// Timeout for the initialize/new-session handshake.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Watchdog for one prompt turn; on expiry the buffered partial output is
/// returned instead of hanging the queue.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// ACP protocol version spoken by this client.
const PROTOCOL_VERSION: u64 = 1;

/// How one in-flight prompt finished.
enum PromptOutcome {
    Completed,
    Cancelled,
    Error(String),
    TimedOut,
}

struct PromptSlot {
    request_id: String,
    waiter: oneshot::Sender<AgentResponse>,
}

/// Connection state shared between the public client and the reader task.
struct Shared {
    project_path: PathBuf,
    permission_handler: PermissionHandler,
    connected: AtomicBool,
    pid: Mutex<Option<u32>>,
    next_request_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>,
    session_id: Mutex<Option<String>>,
    message_buffer: Mutex<String>,
    prompt_slot: Mutex<Option<PromptSlot>>,
    plan: Mutex<Option<PlanSnapshot>>,
    modes: Mutex<CapabilityState>,
    models: Mutex<CapabilityState>,
    terminals: TerminalRegistry,
}

/// Client side of one ACP agent connection.
pub struct AcpClient {
    project_path: PathBuf,
    executor: AgentExecutor,
    launch: LaunchConfig,
    prompt_timeout: Duration,
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl AcpClient {
    /// Creates an unstarted client for one project root.
    pub fn new(
        project_path: PathBuf,
        handler: PermissionHandler,
        executor: AgentExecutor,
        launch: LaunchConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            project_path: project_path.clone(),
            permission_handler: handler,
            connected: AtomicBool::new(false),
            pid: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
            message_buffer: Mutex::new(String::new()),
            prompt_slot: Mutex::new(None),
            plan: Mutex::new(None),
            modes: Mutex::new(CapabilityState::default()),
            models: Mutex::new(CapabilityState::default()),
            terminals: TerminalRegistry::default(),
        });

        Self {
            project_path,
            executor,
            launch,
            prompt_timeout: PROMPT_TIMEOUT,
            shared,
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Overrides the prompt watchdog; used by tests.
    #[must_use]
    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    /// Spawns the agent process and performs the ACP handshake.
    ///
    /// # Errors
    /// Returns an error when the spawn or handshake fails; the child is torn
    /// down before the error is returned.
    pub async fn start(&self) -> Result<(), AcpError> {
        let resolved = launch::resolve_launch(&self.project_path, self.executor, &self.launch);
        let (child, stdin, stdout) = launch::spawn_agent(&resolved)?;
        *lock(&self.shared.pid) = child.id();
        *self.child.lock().await = Some(child);
        tracing::info!(
            command = %resolved.command,
            cwd = %resolved.cwd.display(),
            "agent process spawned"
        );

        let started = self.start_with_streams(stdin, BufReader::new(stdout)).await;
        if started.is_err() {
            self.shutdown().await;
        }

        started
    }

    /// Attaches the client to pre-connected stream halves and hand-shakes.
    ///
    /// Production uses the child's stdio; tests drive the agent side of a
    /// [`tokio::io::duplex`] pair.
    ///
    /// # Errors
    /// Returns an error when the handshake fails.
    pub async fn start_with_streams<W, R>(&self, writer: W, reader: R) -> Result<(), AcpError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        {
            let mut guard = self.shared.writer.lock().await;
            *guard = Some(Box::new(writer));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_reader(shared, reader).await;
        });

        self.handshake().await
    }

    async fn handshake(&self) -> Result<(), AcpError> {
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {"name": "baton", "version": env!("CARGO_PKG_VERSION")},
            "clientCapabilities": {
                "fs": {"readTextFile": true, "writeTextFile": true},
                "terminal": true
            }
        });
        let init = self
            .handshake_request(methods::INITIALIZE, init_params)
            .await?;
        tracing::info!(
            protocol_version = ?init.get("protocolVersion"),
            "agent initialized"
        );
        self.shared
            .write_payload(&wire::notification_payload(
                methods::INITIALIZED,
                serde_json::json!({}),
            ))
            .await
            .map_err(AcpError::Handshake)?;

        let new_session = self
            .handshake_request(
                methods::SESSION_NEW,
                serde_json::json!({
                    "cwd": self.project_path,
                    "mcpServers": []
                }),
            )
            .await?;
        let session_id = new_session
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AcpError::Handshake("`session/new` response missing `sessionId`".to_string())
            })?;
        *lock(&self.shared.session_id) = Some(session_id.to_string());
        *lock(&self.shared.modes) = parse_capability_state(
            new_session.get("modes"),
            "currentModeId",
            "availableModes",
        );
        *lock(&self.shared.models) = parse_capability_state(
            new_session.get("models"),
            "currentModelId",
            "availableModels",
        );
        tracing::info!(session_id, "agent session created");

        Ok(())
    }

    async fn handshake_request(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        tokio::time::timeout(STARTUP_TIMEOUT, self.shared.request(method, params))
            .await
            .map_err(|_| {
                AcpError::Handshake(format!(
                    "timed out waiting for `{method}` after {} seconds",
                    STARTUP_TIMEOUT.as_secs()
                ))
            })?
            .map_err(AcpError::Handshake)
    }

    /// Sends one turn and waits for the completion, the watchdog, or a
    /// cancellation: whichever resolves first.
    async fn run_turn(&self, text: &str) -> AgentResponse {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return AgentResponse::failure("agent not initialized");
        }
        let Some(session_id) = lock(&self.shared.session_id).clone() else {
            return AgentResponse::failure("agent not initialized");
        };

        let request_id = self.shared.next_id();
        let (waiter, mut receiver) = oneshot::channel();
        {
            let mut slot = lock(&self.shared.prompt_slot);
            if slot.is_some() {
                tracing::warn!("replacing an in-flight prompt waiter");
            }
            *slot = Some(PromptSlot {
                request_id: request_id.clone(),
                waiter,
            });
        }
        lock(&self.shared.message_buffer).clear();

        let params = serde_json::json!({
            "sessionId": session_id,
            "prompt": [{"type": "text", "text": text}]
        });
        let payload = wire::request_payload(&request_id, methods::SESSION_PROMPT, params);
        if let Err(error) = self.shared.write_payload(&payload).await {
            self.shared.complete_prompt(PromptOutcome::Error(error));
        }

        tokio::select! {
            response = &mut receiver => {
                response.unwrap_or_else(|_| AgentResponse::failure("agent connection closed"))
            }
            () = tokio::time::sleep(self.prompt_timeout) => {
                tracing::warn!("prompt watchdog fired; returning buffered output");
                self.shared.complete_prompt(PromptOutcome::TimedOut);
                receiver
                    .await
                    .unwrap_or_else(|_| AgentResponse::failure("prompt timed out"))
            }
        }
    }

    async fn switch_capability(
        &self,
        method: &'static str,
        param_key: &'static str,
        target: &Mutex<CapabilityState>,
        id: &str,
    ) -> AgentResponse {
        if lock(target).available.is_empty() {
            return AgentResponse::failure("not supported");
        }
        let Some(session_id) = lock(&self.shared.session_id).clone() else {
            return AgentResponse::failure("agent not initialized");
        };

        let mut params = serde_json::Map::new();
        params.insert("sessionId".to_string(), Value::String(session_id));
        params.insert(param_key.to_string(), Value::String(id.to_string()));
        let params = Value::Object(params);
        match tokio::time::timeout(STARTUP_TIMEOUT, self.shared.request(method, params)).await {
            Ok(Ok(_)) => {
                lock(target).current = Some(id.to_string());
                AgentResponse::ok(format!("switched to {id}"))
            }
            Ok(Err(error)) => AgentResponse::failure(error),
            Err(_) => AgentResponse::failure(format!("`{method}` timed out")),
        }
    }

    async fn shutdown(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        {
            // Dropping the writer closes the child's stdin, which signals a
            // clean exit.
            let mut guard = self.shared.writer.lock().await;
            *guard = None;
        }
        self.shared.fail_inflight("agent stopped");
        self.shared.terminals.kill_all();

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(1), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

#[async_trait]
impl AgentSession for AcpClient {
    async fn send_prompt(&self, text: &str) -> AgentResponse {
        self.run_turn(text).await
    }

    async fn send_command(&self, text: &str) -> AgentResponse {
        self.run_turn(text).await
    }

    async fn cancel(&self) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let session_id = lock(&self.shared.session_id).clone();
        if let Some(session_id) = session_id {
            let payload = wire::notification_payload(
                methods::SESSION_CANCEL,
                serde_json::json!({"sessionId": session_id}),
            );
            if let Err(error) = self.shared.write_payload(&payload).await {
                tracing::warn!(%error, "failed to send cancel notification");
            }
        }
        self.shared.complete_prompt(PromptOutcome::Cancelled);
    }

    async fn set_mode(&self, mode_id: &str) -> AgentResponse {
        self.switch_capability(
            methods::SESSION_SET_MODE,
            "modeId",
            &self.shared.modes,
            mode_id,
        )
        .await
    }

    async fn set_model(&self, model_id: &str) -> AgentResponse {
        self.switch_capability(
            methods::SESSION_SET_MODEL,
            "modelId",
            &self.shared.models,
            model_id,
        )
        .await
    }

    fn agent_status(&self) -> AgentStatus {
        AgentStatus {
            pid: *lock(&self.shared.pid),
            running: self.shared.connected.load(Ordering::SeqCst),
        }
    }

    fn plan_status(&self) -> Option<PlanSnapshot> {
        lock(&self.shared.plan).clone()
    }

    fn mode_state(&self) -> CapabilityState {
        lock(&self.shared.modes).clone()
    }

    fn model_state(&self) -> CapabilityState {
        lock(&self.shared.models).clone()
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

impl Shared {
    fn next_id(&self) -> String {
        format!("baton-{}", self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_payload(&self, payload: &Value) -> Result<(), String> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err("agent not initialized".to_string());
        };

        wire::write_json_line(writer, payload).await
    }

    /// Sends one request and waits for the matching response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id();
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), sender);

        let payload = wire::request_payload(&id, method, params);
        if let Err(error) = self.write_payload(&payload).await {
            lock(&self.pending).remove(&id);
            return Err(error);
        }

        receiver
            .await
            .map_err(|_| "agent connection closed".to_string())?
    }

    /// Resolves the in-flight prompt waiter; no-op when none is pending, so
    /// racing completions (cancel vs. response) stay safe.
    fn complete_prompt(&self, outcome: PromptOutcome) {
        let Some(slot) = lock(&self.prompt_slot).take() else {
            return;
        };
        let buffered = std::mem::take(&mut *lock(&self.message_buffer));
        let response = match outcome {
            PromptOutcome::Completed => AgentResponse::ok(buffered),
            PromptOutcome::Cancelled => {
                let message = if buffered.is_empty() {
                    "[Completed: cancelled]".to_string()
                } else {
                    format!("{buffered}\n[Completed: cancelled]")
                };
                AgentResponse::ok(message)
            }
            PromptOutcome::Error(error) => {
                let message = if buffered.is_empty() {
                    error
                } else {
                    format!("{buffered}\n[Error: {error}]")
                };
                AgentResponse::failure(message)
            }
            PromptOutcome::TimedOut => {
                let message = if buffered.is_empty() {
                    "[No response from agent before timeout]".to_string()
                } else {
                    buffered
                };
                AgentResponse::failure(message)
            }
        };
        let _ = slot.waiter.send(response);
    }

    fn fail_inflight(&self, reason: &str) {
        let waiters: Vec<oneshot::Sender<Result<Value, String>>> =
            lock(&self.pending).drain().map(|(_, sender)| sender).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(reason.to_string()));
        }
        self.complete_prompt(PromptOutcome::Error(reason.to_string()));
    }

    fn handle_disconnect(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(reason, "agent connection lost");
        self.fail_inflight(reason);
        self.terminals.kill_all();
    }

    fn route(shared: &Arc<Self>, value: Value) {
        if let Some(method) = value
            .get("method")
            .and_then(Value::as_str)
            .map(ToString::to_string)
        {
            if value.get("id").is_some() {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    shared.handle_agent_request(&method, value).await;
                });
            } else {
                shared.handle_notification(&method, &value);
            }

            return;
        }

        if let Some(id) = response_id(&value) {
            let is_prompt_response = lock(&shared.prompt_slot)
                .as_ref()
                .is_some_and(|slot| slot.request_id == id);
            if is_prompt_response {
                shared.finish_prompt(&value);
                return;
            }

            if let Some(sender) = lock(&shared.pending).remove(&id) {
                let result = match wire::extract_error_message(&value) {
                    Some(message) => Err(message),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = sender.send(result);
            } else {
                tracing::debug!(%id, "response with no matching waiter");
            }
        }
    }

    fn finish_prompt(&self, value: &Value) {
        if let Some(message) = wire::extract_error_message(value) {
            self.complete_prompt(PromptOutcome::Error(message));
            return;
        }

        let stop_reason = value
            .get("result")
            .and_then(|result| result.get("stopReason"))
            .and_then(Value::as_str)
            .unwrap_or("end_turn");
        tracing::debug!(stop_reason, "prompt completed");
        match stop_reason {
            "cancelled" => self.complete_prompt(PromptOutcome::Cancelled),
            "error" => self.complete_prompt(PromptOutcome::Error(
                "agent reported stopReason=error".to_string(),
            )),
            _ => self.complete_prompt(PromptOutcome::Completed),
        }
    }

    fn handle_notification(&self, method: &str, value: &Value) {
        if method != methods::SESSION_UPDATE {
            tracing::debug!(method, "ignoring notification");
            return;
        }

        let Some(params) = value.get("params") else {
            return;
        };
        let expected = lock(&self.session_id).clone();
        let received = params.get("sessionId").and_then(Value::as_str);
        if let (Some(expected), Some(received)) = (expected, received)
            && expected != received
        {
            return;
        }
        let Some(update) = params.get("update") else {
            return;
        };
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match kind {
            "agent_message_chunk" => {
                if let Some(text) = update.get("content").and_then(extract_text) {
                    lock(&self.message_buffer).push_str(&text);
                }
            }
            "plan" => {
                let entries = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|entries| entries.iter().map(parse_plan_entry).collect())
                    .unwrap_or_default();
                *lock(&self.plan) = Some(PlanSnapshot::from_entries(entries, SystemTime::now()));
            }
            "current_mode_update" => {
                if let Some(mode_id) = update.get("currentModeId").and_then(Value::as_str) {
                    lock(&self.modes).current = Some(mode_id.to_string());
                }
            }
            "tool_call" | "tool_call_update" => {
                tracing::debug!(
                    title = update.get("title").and_then(serde_json::Value::as_str).unwrap_or(""),
                    kind,
                    "tool activity"
                );
            }
            _ => {
                tracing::trace!(kind, "ignoring session update");
            }
        }
    }

    async fn handle_agent_request(&self, method: &str, value: Value) {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        let outcome: Result<Value, (i64, String)> = match method {
            methods::SESSION_REQUEST_PERMISSION => {
                let request = parse_permission_request(&params);
                let choice = (self.permission_handler)(request.clone()).await;

                Ok(permission_outcome_payload(&request.options, choice))
            }
            methods::FS_READ_TEXT_FILE => self.read_text_file(&params).await,
            methods::FS_WRITE_TEXT_FILE => self.write_text_file(&params).await,
            methods::TERMINAL_CREATE => self.create_terminal(&params),
            methods::TERMINAL_OUTPUT => match required_str(&params, "terminalId") {
                Ok(terminal_id) => self
                    .terminals
                    .output(terminal_id)
                    .map(|snapshot| {
                        let exit_status = snapshot.exit.map(|exit| {
                            serde_json::json!({
                                "exitCode": exit.exit_code,
                                "signal": exit.signal
                            })
                        });

                        serde_json::json!({
                            "output": snapshot.output,
                            "truncated": false,
                            "exitStatus": exit_status
                        })
                    })
                    .map_err(|message| (wire::INVALID_PARAMS, message)),
                Err(error) => Err(error),
            },
            methods::TERMINAL_WAIT_FOR_EXIT => match required_str(&params, "terminalId") {
                Ok(terminal_id) => self
                    .terminals
                    .wait_for_exit(terminal_id)
                    .await
                    .map(|exit| {
                        serde_json::json!({
                            "exitCode": exit.exit_code,
                            "signal": exit.signal
                        })
                    })
                    .map_err(|message| (wire::INVALID_PARAMS, message)),
                Err(error) => Err(error),
            },
            methods::TERMINAL_RELEASE => match required_str(&params, "terminalId") {
                Ok(terminal_id) => self
                    .terminals
                    .release(terminal_id)
                    .map(|()| serde_json::json!({}))
                    .map_err(|message| (wire::INVALID_PARAMS, message)),
                Err(error) => Err(error),
            },
            methods::TERMINAL_KILL => match required_str(&params, "terminalId") {
                Ok(terminal_id) => self
                    .terminals
                    .kill(terminal_id)
                    .map(|()| serde_json::json!({}))
                    .map_err(|message| (wire::INVALID_PARAMS, message)),
                Err(error) => Err(error),
            },
            other => Err((wire::METHOD_NOT_FOUND, format!("unknown method: {other}"))),
        };

        let payload = match outcome {
            Ok(result) => wire::response_payload(&id, result),
            Err((code, message)) => wire::error_payload(&id, code, &message),
        };
        if let Err(error) = self.write_payload(&payload).await {
            tracing::warn!(%error, method, "failed to answer agent request");
        }
    }

    async fn read_text_file(&self, params: &Value) -> Result<Value, (i64, String)> {
        let path = required_str(params, "path")?.to_string();
        let line = params.get("line").and_then(Value::as_u64);
        let limit = params.get("limit").and_then(Value::as_u64);
        let root = self.project_path.clone();

        let content = tokio::task::spawn_blocking(move || fs::read_text_file(&root, &path))
            .await
            .map_err(|error| (wire::INTERNAL_ERROR, error.to_string()))?
            .map_err(|message| (wire::INVALID_PARAMS, message))?;

        Ok(serde_json::json!({"content": slice_lines(&content, line, limit)}))
    }

    async fn write_text_file(&self, params: &Value) -> Result<Value, (i64, String)> {
        let path = required_str(params, "path")?.to_string();
        let content = required_str(params, "content")?.to_string();
        let root = self.project_path.clone();

        tokio::task::spawn_blocking(move || fs::write_text_file(&root, &path, &content))
            .await
            .map_err(|error| (wire::INTERNAL_ERROR, error.to_string()))?
            .map_err(|message| (wire::INVALID_PARAMS, message))?;

        Ok(serde_json::json!({}))
    }

    fn create_terminal(&self, params: &Value) -> Result<Value, (i64, String)> {
        let command = required_str(params, "command")?;
        let args: Vec<String> = params
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let cwd = params
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        let env = parse_env(params.get("env"));

        self.terminals
            .create(command, &args, cwd.as_deref(), &env, &self.project_path)
            .map(|terminal_id| serde_json::json!({"terminalId": terminal_id}))
            .map_err(|message| (wire::INTERNAL_ERROR, message))
    }
}

async fn run_reader<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => Shared::route(&shared, value),
                    Err(error) => {
                        tracing::warn!(%error, "skipping unparseable agent line");
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "agent stdout read failed");
                break;
            }
        }
    }

    shared.handle_disconnect("agent process closed its output stream");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn response_id(value: &Value) -> Option<String> {
    match value.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

fn required_str<'value>(
    params: &'value Value,
    key: &str,
) -> Result<&'value str, (i64, String)> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| (wire::INVALID_PARAMS, format!("missing `{key}`")))
}

/// Extracts text from ACP content values: plain strings, `{text}` objects,
/// arrays of parts, or nested `parts`.
fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let combined: String = parts.iter().filter_map(extract_text).collect();
            if combined.is_empty() { None } else { Some(combined) }
        }
        Value::Object(_) => content
            .get("text")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| content.get("parts").and_then(extract_text)),
        _ => None,
    }
}

fn parse_plan_entry(entry: &Value) -> PlanEntry {
    PlanEntry {
        content: entry
            .get("content")
            .and_then(extract_text)
            .unwrap_or_default(),
        status: PlanEntryStatus::parse(
            entry.get("status").and_then(Value::as_str).unwrap_or_default(),
        ),
        priority: entry
            .get("priority")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_capability_state(
    block: Option<&Value>,
    current_key: &str,
    available_key: &str,
) -> CapabilityState {
    let Some(block) = block else {
        return CapabilityState::default();
    };

    CapabilityState {
        current: block
            .get(current_key)
            .and_then(Value::as_str)
            .map(ToString::to_string),
        available: block
            .get(available_key)
            .and_then(Value::as_array)
            .map(|options| options.iter().filter_map(parse_capability_option).collect())
            .unwrap_or_default(),
    }
}

fn parse_capability_option(value: &Value) -> Option<CapabilityOption> {
    let id = value
        .get("id")
        .or_else(|| value.get("modeId"))
        .or_else(|| value.get("modelId"))
        .and_then(Value::as_str)?;
    let name = value.get("name").and_then(Value::as_str).unwrap_or(id);

    Some(CapabilityOption {
        id: id.to_string(),
        name: name.to_string(),
    })
}

fn parse_permission_request(params: &Value) -> PermissionRequest {
    let title = params
        .get("toolCall")
        .and_then(|tool_call| tool_call.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("Permission request")
        .to_string();
    let options = params
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| {
                    let id = option.get("optionId").and_then(Value::as_str)?;
                    let name = option.get("name").and_then(Value::as_str).unwrap_or(id);

                    Some(PermissionOption {
                        id: id.to_string(),
                        name: name.to_string(),
                        kind: option
                            .get("kind")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    PermissionRequest { title, options }
}

/// Builds the `session/request_permission` result, validating the handler's
/// choice and falling back to a "deny"-named option (or the first one) on
/// unknown ids and handler errors.
fn permission_outcome_payload(
    options: &[PermissionOption],
    choice: Result<String, String>,
) -> Value {
    let validated = match &choice {
        Ok(id) if options.iter().any(|option| option.id == *id) => Some(id.clone()),
        Ok(id) => {
            tracing::warn!(%id, "permission handler returned an unknown option id");
            fallback_option(options)
        }
        Err(error) => {
            tracing::warn!(%error, "permission handler failed");
            fallback_option(options)
        }
    };

    match validated {
        Some(option_id) => serde_json::json!({
            "outcome": {"outcome": "selected", "optionId": option_id}
        }),
        None => serde_json::json!({"outcome": {"outcome": "cancelled"}}),
    }
}

fn fallback_option(options: &[PermissionOption]) -> Option<String> {
    options
        .iter()
        .find(|option| option.name.to_lowercase().contains("deny"))
        .or_else(|| options.first())
        .map(|option| option.id.clone())
}

fn parse_env(env: Option<&Value>) -> Vec<(String, String)> {
    match env {
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name").and_then(Value::as_str)?;
                let value = entry.get("value").and_then(Value::as_str)?;

                Some((name.to_string(), value.to_string()))
            })
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_str()
                    .map(|value| (key.clone(), value.to_string()))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn slice_lines(content: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }

    let skip = usize::try_from(line.unwrap_or(1).saturating_sub(1)).unwrap_or(usize::MAX);
    let lines = content.lines().skip(skip);
    match limit.and_then(|limit| usize::try_from(limit).ok()) {
        Some(limit) => lines.take(limit).collect::<Vec<_>>().join("\n"),
        None => lines.collect::<Vec<_>>().join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    struct FakeAgentIo {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeAgentIo {
        async fn next_value(&mut self) -> Value {
            loop {
                let line = self
                    .lines
                    .next_line()
                    .await
                    .expect("agent side read failed")
                    .expect("client closed the stream");
                if line.trim().is_empty() {
                    continue;
                }

                return serde_json::from_str(&line).expect("client wrote invalid JSON");
            }
        }

        async fn expect_method(&mut self, method: &str) -> Value {
            let value = self.next_value().await;
            assert_eq!(
                value.get("method").and_then(Value::as_str),
                Some(method),
                "unexpected message: {value}"
            );

            value
        }

        async fn send(&mut self, value: Value) {
            wire::write_json_line(&mut self.writer, &value)
                .await
                .expect("agent side write failed");
        }

        /// Serves the initialize / initialized / session-new exchange.
        async fn handshake(&mut self) {
            let init = self.expect_method(methods::INITIALIZE).await;
            let init_id = init["id"].clone();
            self.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": init_id,
                "result": {"protocolVersion": 1}
            }))
            .await;
            self.expect_method(methods::INITIALIZED).await;
            let new_session = self.expect_method(methods::SESSION_NEW).await;
            let new_id = new_session["id"].clone();
            self.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": new_id,
                "result": {
                    "sessionId": "sess-1",
                    "modes": {
                        "currentModeId": "ask",
                        "availableModes": [
                            {"id": "ask", "name": "Ask"},
                            {"id": "code", "name": "Code"}
                        ]
                    },
                    "models": {
                        "currentModelId": "fast",
                        "availableModels": [{"modelId": "fast", "name": "Fast"}]
                    }
                }
            }))
            .await;
        }

        async fn send_chunk(&mut self, text: &str) {
            self.send(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "sess-1",
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": text}
                    }
                }
            }))
            .await;
        }

        async fn send_prompt_completion(&mut self, prompt_id: &Value, stop_reason: &str) {
            self.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": prompt_id,
                "result": {"stopReason": stop_reason}
            }))
            .await;
        }
    }

    fn allow_handler() -> PermissionHandler {
        Arc::new(|_request| Box::pin(async { Ok("allow".to_string()) }))
    }

    async fn started_client(
        project_path: &Path,
        handler: PermissionHandler,
    ) -> (AcpClient, FakeAgentIo) {
        let client = AcpClient::new(
            project_path.to_path_buf(),
            handler,
            AgentExecutor::Opencode,
            LaunchConfig::default(),
        );
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let mut io = FakeAgentIo {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };

        let (started, ()) = tokio::join!(
            client.start_with_streams(client_write, BufReader::new(client_read)),
            io.handshake()
        );
        started.expect("handshake failed");

        (client, io)
    }

    #[tokio::test]
    async fn test_handshake_populates_session_and_capabilities() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");

        // Act
        let (client, _io) = started_client(dir.path(), allow_handler()).await;

        // Assert
        let modes = client.mode_state();
        assert_eq!(modes.current.as_deref(), Some("ask"));
        assert_eq!(modes.available.len(), 2);
        let models = client.model_state();
        assert_eq!(models.current.as_deref(), Some("fast"));
        assert!(client.agent_status().running);
    }

    #[tokio::test]
    async fn test_send_prompt_concatenates_chunks() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, mut io) = started_client(dir.path(), allow_handler()).await;

        // Act
        let agent = async {
            let prompt = io.expect_method(methods::SESSION_PROMPT).await;
            assert_eq!(
                prompt["params"]["sessionId"].as_str(),
                Some("sess-1")
            );
            io.send_chunk("Hi ").await;
            io.send_chunk("there").await;
            io.send_prompt_completion(&prompt["id"], "end_turn").await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("hello"), agent);

        // Assert
        assert!(response.success);
        assert_eq!(response.message, "Hi there");
    }

    #[tokio::test]
    async fn test_send_prompt_error_stop_reason_fails() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, mut io) = started_client(dir.path(), allow_handler()).await;

        // Act
        let agent = async {
            let prompt = io.expect_method(methods::SESSION_PROMPT).await;
            io.send_prompt_completion(&prompt["id"], "error").await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("boom"), agent);

        // Assert
        assert!(!response.success);
        assert!(response.message.contains("stopReason=error"));
    }

    #[tokio::test]
    async fn test_permission_request_delegates_to_handler() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let handler: PermissionHandler = Arc::new(|request| {
            Box::pin(async move {
                assert_eq!(request.title, "Delete file");
                Ok("allow-once".to_string())
            })
        });
        let (client, mut io) = started_client(dir.path(), handler).await;

        // Act
        let agent = async {
            let prompt = io.expect_method(methods::SESSION_PROMPT).await;
            io.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "perm-1",
                "method": "session/request_permission",
                "params": {
                    "sessionId": "sess-1",
                    "toolCall": {"toolCallId": "tc-1", "title": "Delete file"},
                    "options": [
                        {"optionId": "allow-once", "name": "Allow once", "kind": "allow_once"},
                        {"optionId": "reject-once", "name": "Deny", "kind": "reject_once"}
                    ]
                }
            }))
            .await;
            let permission_response = io.next_value().await;
            assert_eq!(permission_response["id"].as_str(), Some("perm-1"));
            assert_eq!(
                permission_response["result"]["outcome"]["optionId"].as_str(),
                Some("allow-once")
            );
            io.send_chunk("done").await;
            io.send_prompt_completion(&prompt["id"], "end_turn").await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("trigger"), agent);

        // Assert
        assert!(response.success);
        assert_eq!(response.message, "done");
    }

    #[tokio::test]
    async fn test_permission_invalid_choice_falls_back_to_deny_named_option() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let handler: PermissionHandler =
            Arc::new(|_request| Box::pin(async { Ok("bogus".to_string()) }));
        let (client, mut io) = started_client(dir.path(), handler).await;

        // Act
        let agent = async {
            let prompt = io.expect_method(methods::SESSION_PROMPT).await;
            io.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "perm-2",
                "method": "session/request_permission",
                "params": {
                    "sessionId": "sess-1",
                    "options": [
                        {"optionId": "ok", "name": "Approve"},
                        {"optionId": "no", "name": "Deny"}
                    ]
                }
            }))
            .await;
            let permission_response = io.next_value().await;
            assert_eq!(
                permission_response["result"]["outcome"]["optionId"].as_str(),
                Some("no")
            );
            io.send_prompt_completion(&prompt["id"], "end_turn").await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("trigger"), agent);

        // Assert
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_cancel_synthesizes_local_completion() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, mut io) = started_client(dir.path(), allow_handler()).await;

        // Act
        let agent = async {
            let _prompt = io.expect_method(methods::SESSION_PROMPT).await;
            io.send_chunk("partial").await;
            // Give the chunk a moment to land before cancelling.
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.cancel().await;
            io.expect_method(methods::SESSION_CANCEL).await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("long task"), agent);

        // Assert
        assert!(response.success);
        assert!(response.message.contains("[Completed: cancelled]"));
        assert!(response.message.contains("partial"));
    }

    #[tokio::test]
    async fn test_watchdog_returns_partial_buffer() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let client = AcpClient::new(
            dir.path().to_path_buf(),
            allow_handler(),
            AgentExecutor::Opencode,
            LaunchConfig::default(),
        )
        .with_prompt_timeout(Duration::from_millis(200));
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let mut io = FakeAgentIo {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        let (started, ()) = tokio::join!(
            client.start_with_streams(client_write, BufReader::new(client_read)),
            io.handshake()
        );
        started.expect("handshake failed");

        // Act: the agent streams a chunk but never completes the prompt.
        let agent = async {
            let _prompt = io.expect_method(methods::SESSION_PROMPT).await;
            io.send_chunk("partial output").await;
        };
        let (response, ()) = tokio::join!(client.send_prompt("hang"), agent);

        // Assert
        assert!(!response.success);
        assert_eq!(response.message, "partial output");
    }

    #[tokio::test]
    async fn test_fs_read_is_sandboxed_to_project_root() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        std::fs::write(dir.path().join("README.md"), "readme body")
            .expect("failed to write file");
        let (_client, mut io) = started_client(dir.path(), allow_handler()).await;
        let inside = dir.path().join("README.md").display().to_string();

        // Act: in-root read succeeds.
        io.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "fs-1",
            "method": "fs/read_text_file",
            "params": {"sessionId": "sess-1", "path": inside}
        }))
        .await;
        let in_root = io.next_value().await;

        // Out-of-root read is denied.
        io.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "fs-2",
            "method": "fs/read_text_file",
            "params": {"sessionId": "sess-1", "path": "/etc/passwd"}
        }))
        .await;
        let outside = io.next_value().await;

        // Assert
        assert_eq!(in_root["result"]["content"].as_str(), Some("readme body"));
        assert!(outside.get("error").is_some());
        assert!(
            outside["error"]["message"]
                .as_str()
                .unwrap_or_default()
                .contains("outside the project root")
        );
    }

    #[tokio::test]
    async fn test_plan_updates_are_cached_and_copied() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, mut io) = started_client(dir.path(), allow_handler()).await;

        // Act
        io.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "sess-1",
                "update": {
                    "sessionUpdate": "plan",
                    "entries": [
                        {"content": "step one", "status": "completed", "priority": "high"},
                        {"content": "step two", "status": "in_progress", "priority": "low"}
                    ]
                }
            }
        }))
        .await;
        let plan = {
            let mut plan = client.plan_status();
            for _ in 0..50 {
                if plan.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                plan = client.plan_status();
            }
            plan.expect("plan was never cached")
        };

        // Assert
        assert_eq!(plan.counts.total, 2);
        assert_eq!(plan.current.as_deref(), Some("step two"));
        assert_eq!(plan.summary, "总计 2 步，完成 1，进行中 1，待处理 0");
    }

    #[tokio::test]
    async fn test_set_mode_without_capability_is_not_supported() {
        // Arrange: handshake without a modes block.
        let dir = tempdir().expect("failed to create temp dir");
        let client = AcpClient::new(
            dir.path().to_path_buf(),
            allow_handler(),
            AgentExecutor::Opencode,
            LaunchConfig::default(),
        );
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let mut io = FakeAgentIo {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        let serve = async {
            let init = io.expect_method(methods::INITIALIZE).await;
            io.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {"protocolVersion": 1}
            }))
            .await;
            io.expect_method(methods::INITIALIZED).await;
            let new_session = io.expect_method(methods::SESSION_NEW).await;
            io.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": new_session["id"],
                "result": {"sessionId": "sess-1"}
            }))
            .await;
        };
        let (started, ()) = tokio::join!(
            client.start_with_streams(client_write, BufReader::new(client_read)),
            serve
        );
        started.expect("handshake failed");

        // Act
        let response = client.set_mode("code").await;

        // Assert
        assert_eq!(response, AgentResponse::failure("not supported"));
    }

    #[tokio::test]
    async fn test_set_mode_updates_cached_current() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, mut io) = started_client(dir.path(), allow_handler()).await;

        // Act
        let agent = async {
            let set_mode = io.expect_method(methods::SESSION_SET_MODE).await;
            assert_eq!(set_mode["params"]["modeId"].as_str(), Some("code"));
            io.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": set_mode["id"],
                "result": {}
            }))
            .await;
        };
        let (response, ()) = tokio::join!(client.set_mode("code"), agent);

        // Assert
        assert!(response.success);
        assert_eq!(client.mode_state().current.as_deref(), Some("code"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_subsequent_prompts() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let (client, io) = started_client(dir.path(), allow_handler()).await;

        // Act: dropping the agent side closes the stream.
        drop(io);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = client.send_prompt("anyone there?").await;

        // Assert
        assert!(!response.success);
        assert_eq!(response.message, "agent not initialized");
        assert!(!client.agent_status().running);
    }

    #[test]
    fn test_slice_lines_applies_line_and_limit() {
        // Arrange
        let content = "a\nb\nc\nd";

        // Act & Assert
        assert_eq!(slice_lines(content, None, None), "a\nb\nc\nd");
        assert_eq!(slice_lines(content, Some(2), None), "b\nc\nd");
        assert_eq!(slice_lines(content, Some(2), Some(2)), "b\nc");
        assert_eq!(slice_lines(content, None, Some(1)), "a");
    }

    #[test]
    fn test_permission_outcome_empty_options_is_cancelled() {
        // Arrange & Act
        let payload = permission_outcome_payload(&[], Ok("anything".to_string()));

        // Assert
        assert_eq!(payload["outcome"]["outcome"].as_str(), Some("cancelled"));
    }

    #[test]
    fn test_fallback_prefers_deny_named_option() {
        // Arrange
        let options = vec![
            PermissionOption {
                id: "a".to_string(),
                name: "Approve".to_string(),
                kind: None,
            },
            PermissionOption {
                id: "d".to_string(),
                name: "Deny once".to_string(),
                kind: None,
            },
        ];

        // Act & Assert
        assert_eq!(fallback_option(&options), Some("d".to_string()));
    }
}
