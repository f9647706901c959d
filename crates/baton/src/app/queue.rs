//! Per-session FIFO execution with inter-session parallelism.
//!
//! The engine holds no session state of its own: it mutates the scheduling
//! cell of the session passed in, always under that session's gate. Exactly
//! one `process_task` body runs per session at a time, and the completion
//! callback for task *n* is awaited before task *n + 1* starts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use uuid::Uuid;

use crate::acp::AgentResponse;
use crate::domain::plan::{PROGRESS_HEADER, render_progress_prefix};
use crate::domain::session::SessionState;
use crate::domain::task::{Task, TaskKind};

use super::state::SessionHandle;

/// How many pending tasks a queued-position message previews.
const QUEUE_PREVIEW_LIMIT: usize = 5;

/// Payload handed to the completion callback after each task.
pub struct TaskCompletion {
    pub session_id: Uuid,
    pub user_id: String,
    pub context_id: Option<String>,
    pub task: Task,
    pub response: AgentResponse,
}

/// Boxed async result used by the completion callback.
pub type CompletionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked after every task, in enqueue order per session.
pub type CompletionCallback = Arc<dyn Fn(TaskCompletion) -> CompletionFuture + Send + Sync>;

/// Result of one enqueue call.
pub struct EnqueueOutcome {
    pub success: bool,
    /// Empty on the fast path: the adapter waits for the completion
    /// callback instead.
    pub message: String,
    pub queued: Option<QueuedTask>,
}

/// Queue placement details for tasks that did not take the fast path.
pub struct QueuedTask {
    pub task_id: Uuid,
    pub position: usize,
}

/// The gateway-wide queue engine; cheap to clone.
#[derive(Clone)]
pub struct TaskQueueEngine {
    callback: CompletionCallback,
}

impl TaskQueueEngine {
    /// Creates an engine invoking `callback` after every task.
    pub fn new(callback: CompletionCallback) -> Self {
        Self { callback }
    }

    /// Atomically enqueues one task on the session.
    ///
    /// When the session is idle with nothing in flight and no pending
    /// interaction, the task starts immediately and the returned message is
    /// empty. Otherwise the task is appended and the message reports its
    /// position plus a snapshot of the queue.
    pub async fn enqueue(
        &self,
        session: &Arc<SessionHandle>,
        content: String,
        kind: TaskKind,
    ) -> EnqueueOutcome {
        let _gate = session.gate.lock().await;
        let has_interactions = session.has_interactions();
        let task = Task::new(kind, content);

        let mut cell = session.scheduling();
        let fast_path = cell.state == SessionState::Idle
            && !cell.is_processing
            && cell.queue.current.is_none()
            && cell.queue.pending.is_empty()
            && !has_interactions;
        if fast_path {
            cell.queue.current = Some(task.clone());
            cell.is_processing = true;
            cell.transition(SessionState::Running);
            drop(cell);
            self.spawn_task(Arc::clone(session), task);

            return EnqueueOutcome {
                success: true,
                message: String::new(),
                queued: None,
            };
        }

        cell.queue.pending.push_back(task.clone());
        let position = cell.queue.pending.len();
        let message = queued_message(&cell, position);

        EnqueueOutcome {
            success: true,
            message,
            queued: Some(QueuedTask {
                task_id: task.id,
                position,
            }),
        }
    }

    /// Restarts an idle queue after an interaction resolution left tasks
    /// parked in the pending list.
    pub async fn resume(&self, session: &Arc<SessionHandle>) {
        let _gate = session.gate.lock().await;
        let mut cell = session.scheduling();
        let can_resume = cell.state == SessionState::Idle
            && !cell.is_processing
            && cell.queue.current.is_none()
            && !cell.queue.pending.is_empty();
        if !can_resume {
            return;
        }

        if let Some(next) = cell.queue.pending.pop_front() {
            cell.queue.current = Some(next.clone());
            cell.is_processing = true;
            cell.transition(SessionState::Running);
            drop(cell);
            self.spawn_task(Arc::clone(session), next);
        }
    }

    fn spawn_task(&self, session: Arc<SessionHandle>, task: Task) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.process_task(&session, task).await;
        });
    }

    /// Executes one task, invokes the completion callback, and advances the
    /// queue. The callback and `process_next` run on every exit path.
    async fn process_task(&self, session: &Arc<SessionHandle>, task: Task) {
        tracing::info!(
            session_id = %session.id,
            task_id = %task.id,
            kind = task.kind.label(),
            "task started"
        );

        let response = match session.agent() {
            None => AgentResponse::failure("agent not initialized"),
            Some(agent) => match task.kind {
                TaskKind::Prompt => agent.send_prompt(&task.content).await,
                TaskKind::Command => agent.send_command(&task.content).await,
            },
        };
        let response = attach_plan_progress_prefix(session, response);

        let completion = TaskCompletion {
            session_id: session.id,
            user_id: session.user_id.clone(),
            context_id: session.context_id.clone(),
            task,
            response,
        };
        (self.callback)(completion).await;

        self.process_next(session).await;
    }

    /// Advances the session queue after a task finished.
    async fn process_next(&self, session: &Arc<SessionHandle>) {
        let _gate = session.gate.lock().await;
        let mut cell = session.scheduling();
        match cell.state {
            SessionState::WaitingConfirm => {
                return;
            }
            SessionState::Stopped => {
                cell.queue.current = None;
                cell.is_processing = false;

                return;
            }
            SessionState::Idle | SessionState::Running => {}
        }

        if let Some(next) = cell.queue.pending.pop_front() {
            cell.queue.current = Some(next.clone());
            cell.transition(SessionState::Running);
            cell.is_processing = true;
            drop(cell);
            self.spawn_task(Arc::clone(session), next);
        } else {
            cell.queue.current = None;
            cell.transition(SessionState::Idle);
            cell.is_processing = false;
        }
    }
}

/// Prepends a compact plan-progress block when the agent has plan entries.
/// Idempotent: responses already carrying the block are left untouched.
pub fn attach_plan_progress_prefix(
    session: &SessionHandle,
    response: AgentResponse,
) -> AgentResponse {
    let Some(agent) = session.agent() else {
        return response;
    };
    let Some(plan) = agent.plan_status() else {
        return response;
    };
    if plan.entries.is_empty() || response.message.starts_with(PROGRESS_HEADER) {
        return response;
    }

    AgentResponse {
        success: response.success,
        message: format!("{}\n{}", render_progress_prefix(&plan), response.message),
    }
}

fn queued_message(cell: &super::state::SchedulingCell, position: usize) -> String {
    let mut message = format!("⏸️ Task queued at position {position}.");
    match cell.state {
        SessionState::WaitingConfirm => {
            message.push_str("\nWaiting for confirmation; the queue will auto-resume.");
        }
        SessionState::Stopped => {
            message.push_str("\nQueue is stopped; send /reset to start fresh.");
        }
        SessionState::Idle | SessionState::Running => {}
    }
    if let Some(current) = &cell.queue.current {
        message.push_str(&format!("\nCurrent: {}", current.preview()));
    }
    for (index, task) in cell.queue.pending.iter().take(QUEUE_PREVIEW_LIMIT).enumerate() {
        message.push_str(&format!("\n{}. {}", index + 1, task.preview()));
    }
    if cell.queue.pending.len() > QUEUE_PREVIEW_LIMIT {
        message.push_str(&format!(
            "\n… and {} more",
            cell.queue.pending.len() - QUEUE_PREVIEW_LIMIT
        ));
    }

    message
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    use tokio::sync::mpsc;

    use crate::app::testing::FakeAgent;
    use crate::domain::plan::{PlanEntry, PlanEntryStatus, PlanSnapshot};

    use super::*;

    fn session_with_agent(agent: Arc<FakeAgent>) -> Arc<SessionHandle> {
        let session = Arc::new(SessionHandle::new(
            "u1".to_string(),
            None,
            PathBuf::from("/work/repo"),
            "repo".to_string(),
        ));
        session.set_agent(agent);

        session
    }

    fn collecting_engine() -> (TaskQueueEngine, mpsc::UnboundedReceiver<TaskCompletion>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback: CompletionCallback = Arc::new(move |completion| {
            let sender = sender.clone();
            Box::pin(async move {
                let _ = sender.send(completion);
            })
        });

        (TaskQueueEngine::new(callback), receiver)
    }

    async fn recv_completion(
        receiver: &mut mpsc::UnboundedReceiver<TaskCompletion>,
    ) -> TaskCompletion {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("completion channel closed")
    }

    #[tokio::test]
    async fn test_fast_path_returns_empty_message_and_completes() {
        // Arrange
        let agent = Arc::new(FakeAgent::default());
        let session = session_with_agent(Arc::clone(&agent));
        let (engine, mut completions) = collecting_engine();

        // Act
        let outcome = engine
            .enqueue(&session, "hello".to_string(), TaskKind::Prompt)
            .await;
        let completion = recv_completion(&mut completions).await;

        // Assert
        assert!(outcome.success);
        assert!(outcome.message.is_empty());
        assert!(outcome.queued.is_none());
        assert_eq!(completion.response.message, "echo: hello");
        // Queue drains back to idle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.scheduling().state, SessionState::Idle);
        assert!(session.scheduling().queue.current.is_none());
    }

    #[tokio::test]
    async fn test_queue_positions_count_from_the_current_executor() {
        // Arrange: a slow agent keeps the first task in flight.
        let agent = Arc::new(FakeAgent::with_delay(Duration::from_millis(300)));
        let session = session_with_agent(agent);
        let (engine, mut completions) = collecting_engine();

        // Act
        let first = engine
            .enqueue(&session, "A".to_string(), TaskKind::Prompt)
            .await;
        let second = engine
            .enqueue(&session, "B".to_string(), TaskKind::Prompt)
            .await;
        let third = engine
            .enqueue(&session, "C".to_string(), TaskKind::Prompt)
            .await;

        // Assert
        assert!(first.message.is_empty());
        assert_eq!(second.queued.as_ref().map(|queued| queued.position), Some(1));
        assert!(second.message.contains("position 1"));
        assert!(second.message.contains("Current: A"));
        assert_eq!(third.queued.as_ref().map(|queued| queued.position), Some(2));
        assert!(third.message.contains("position 2"));

        // Drain all three completions so the test ends clean.
        for _ in 0..3 {
            recv_completion(&mut completions).await;
        }
    }

    #[tokio::test]
    async fn test_fifo_order_and_callback_before_next_task() {
        // Arrange
        let agent = Arc::new(FakeAgent::with_delay(Duration::from_millis(50)));
        let session = session_with_agent(Arc::clone(&agent));
        let (engine, mut completions) = collecting_engine();

        // Act
        engine
            .enqueue(&session, "A".to_string(), TaskKind::Prompt)
            .await;
        engine
            .enqueue(&session, "B".to_string(), TaskKind::Prompt)
            .await;
        let first = recv_completion(&mut completions).await;
        let second = recv_completion(&mut completions).await;

        // Assert: completions arrive in enqueue order and the agent saw the
        // prompts serially in that order.
        assert_eq!(first.task.content, "A");
        assert_eq!(second.task.content, "B");
        assert_eq!(agent.prompts(), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_enqueue_without_agent_fails_but_advances() {
        // Arrange
        let session = Arc::new(SessionHandle::new(
            "u1".to_string(),
            None,
            PathBuf::from("/work/repo"),
            "repo".to_string(),
        ));
        let (engine, mut completions) = collecting_engine();

        // Act
        engine
            .enqueue(&session, "hello".to_string(), TaskKind::Prompt)
            .await;
        let completion = recv_completion(&mut completions).await;

        // Assert
        assert!(!completion.response.success);
        assert!(completion.response.message.contains("agent not initialized"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.scheduling().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stopped_session_parks_enqueues() {
        // Arrange
        let agent = Arc::new(FakeAgent::default());
        let session = session_with_agent(agent);
        session.scheduling().transition(SessionState::Stopped);
        let (engine, mut completions) = collecting_engine();

        // Act
        let outcome = engine
            .enqueue(&session, "parked".to_string(), TaskKind::Prompt)
            .await;

        // Assert: the task is queued but never executed.
        assert_eq!(outcome.queued.map(|queued| queued.position), Some(1));
        assert!(outcome.message.contains("stopped"));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), completions.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_resume_drains_parked_tasks() {
        // Arrange: a task parked behind a pending interaction.
        let agent = Arc::new(FakeAgent::default());
        let session = session_with_agent(agent);
        {
            use crate::domain::interaction::{Interaction, InteractionKind, InteractionOption};
            let (interaction, _receiver) = Interaction::new(
                InteractionKind::ModeSelection,
                "Select".to_string(),
                vec![InteractionOption::new("a", "A")],
            );
            session.insert_interaction("req-1", interaction);
        }
        let (engine, mut completions) = collecting_engine();
        let outcome = engine
            .enqueue(&session, "parked".to_string(), TaskKind::Prompt)
            .await;
        assert_eq!(
            outcome.queued.as_ref().map(|queued| queued.position),
            Some(1)
        );

        // Act: interaction resolved elsewhere; resume kicks the queue.
        session.take_interaction("req-1");
        engine.resume(&session).await;
        let completion = recv_completion(&mut completions).await;

        // Assert
        assert_eq!(completion.task.content, "parked");
    }

    #[tokio::test]
    async fn test_attach_plan_progress_prefix_is_idempotent() {
        // Arrange
        let agent = Arc::new(FakeAgent::default());
        let entries = vec![PlanEntry {
            content: "step".to_string(),
            status: PlanEntryStatus::InProgress,
            priority: "high".to_string(),
        }];
        agent.set_plan(PlanSnapshot::from_entries(entries, SystemTime::now()));
        let session = session_with_agent(agent);

        // Act
        let once = attach_plan_progress_prefix(&session, AgentResponse::ok("done"));
        let twice = attach_plan_progress_prefix(&session, once.clone());

        // Assert
        assert!(once.message.starts_with(PROGRESS_HEADER));
        assert!(once.message.contains("done"));
        assert_eq!(once, twice);
    }
}
