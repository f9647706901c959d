//! Shared runtime state for one live session.
//!
//! Scheduling data lives in a plain mutex cell; the async `gate` mutex
//! serializes enqueue and process-next decisions and is never held across an
//! agent call or the completion callback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::acp::AgentSession;
use crate::domain::interaction::{Interaction, InteractionKind, InteractionOption};
use crate::domain::session::{SessionState, TaskQueue};

/// Mutable scheduling cell guarded by one mutex so check-and-mutate stays
/// atomic under the session gate.
#[derive(Default)]
pub struct SchedulingCell {
    pub state: SessionState,
    pub is_processing: bool,
    pub queue: TaskQueue,
}

impl SchedulingCell {
    /// Applies a state transition when the state machine allows it.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;

            return true;
        }
        tracing::warn!(from = %self.state, to = %next, "rejected state transition");

        false
    }
}

/// One live session: identity, agent handle, scheduling cell, and the
/// pending-interaction map.
pub struct SessionHandle {
    /// Stable session identifier.
    pub id: Uuid,
    /// Chat user owning this session.
    pub user_id: String,
    /// Chat thread/channel context; `None` for direct chats.
    pub context_id: Option<String>,
    /// Project root the agent is bound to; immutable for the session.
    pub project_path: PathBuf,
    /// Repository display name.
    pub repo_name: String,
    /// Serializes enqueue and process-next decisions.
    pub gate: tokio::sync::Mutex<()>,
    scheduling: Mutex<SchedulingCell>,
    agent: Mutex<Option<Arc<dyn AgentSession>>>,
    interactions: Mutex<HashMap<String, Interaction>>,
}

impl SessionHandle {
    /// Creates an idle session with no agent attached yet.
    pub fn new(
        user_id: String,
        context_id: Option<String>,
        project_path: PathBuf,
        repo_name: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            context_id,
            project_path,
            repo_name,
            gate: tokio::sync::Mutex::new(()),
            scheduling: Mutex::new(SchedulingCell::default()),
            agent: Mutex::new(None),
            interactions: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the scheduling cell.
    pub fn scheduling(&self) -> MutexGuard<'_, SchedulingCell> {
        self.scheduling.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the attached agent, when one has been spawned.
    pub fn agent(&self) -> Option<Arc<dyn AgentSession>> {
        self.lock_agent().clone()
    }

    /// Attaches a freshly connected agent.
    pub fn set_agent(&self, agent: Arc<dyn AgentSession>) {
        *self.lock_agent() = Some(agent);
    }

    /// Detaches the agent for teardown.
    pub fn take_agent(&self) -> Option<Arc<dyn AgentSession>> {
        self.lock_agent().take()
    }

    /// Returns whether any interaction is pending.
    pub fn has_interactions(&self) -> bool {
        !self.lock_interactions().is_empty()
    }

    /// Registers a pending interaction under its request id.
    pub fn insert_interaction(&self, request_id: &str, interaction: Interaction) {
        self.lock_interactions()
            .insert(request_id.to_string(), interaction);
    }

    /// Removes and returns one pending interaction.
    pub fn take_interaction(&self, request_id: &str) -> Option<Interaction> {
        self.lock_interactions().remove(request_id)
    }

    /// Removes and returns every pending interaction.
    pub fn drain_interactions(&self) -> Vec<Interaction> {
        self.lock_interactions()
            .drain()
            .map(|(_, interaction)| interaction)
            .collect()
    }

    /// Returns the request id and options of one pending interaction, when
    /// any. With the at-most-one invariant this is "the" pending question.
    pub fn first_interaction(&self) -> Option<(String, Vec<InteractionOption>)> {
        self.lock_interactions()
            .iter()
            .next()
            .map(|(request_id, interaction)| (request_id.clone(), interaction.options.clone()))
    }

    /// Returns kind and options of one pending interaction by request id.
    pub fn interaction_view(
        &self,
        request_id: &str,
    ) -> Option<(InteractionKind, Vec<InteractionOption>)> {
        self.lock_interactions()
            .get(request_id)
            .map(|interaction| (interaction.kind, interaction.options.clone()))
    }

    /// Restores the state after an interaction leaves the pending map:
    /// `WaitingConfirm` becomes `Running` when a task is in flight, `Idle`
    /// otherwise.
    pub fn restore_state_after_interaction(&self) {
        let mut cell = self.scheduling();
        if cell.state != SessionState::WaitingConfirm {
            return;
        }
        let next = if cell.queue.current.is_some() {
            SessionState::Running
        } else {
            SessionState::Idle
        };
        cell.transition(next);
    }

    fn lock_agent(&self) -> MutexGuard<'_, Option<Arc<dyn AgentSession>>> {
        self.agent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_interactions(&self) -> MutexGuard<'_, HashMap<String, Interaction>> {
        self.interactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
