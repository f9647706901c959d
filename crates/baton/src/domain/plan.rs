//! Normalization and display of the agent's self-reported plan.
//!
//! Agents report plan entries with free-form status and priority strings;
//! this module folds them into five stable buckets and renders the compact
//! progress block prepended to task responses.

use std::time::SystemTime;

/// Marker line starting every rendered progress block; also used to keep
/// prefix attachment idempotent.
pub const PROGRESS_HEADER: &str = "📋 Plan progress";

/// How many entries the progress block lists before the "… and N more" tail.
const PROGRESS_ENTRY_LIMIT: usize = 3;

/// Normalized plan entry status bucket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PlanEntryStatus {
    Completed,
    InProgress,
    Pending,
    Other,
}

impl PlanEntryStatus {
    /// Folds a raw agent-reported status string into a stable bucket.
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "completed" | "done" => PlanEntryStatus::Completed,
            "in_progress" | "in-progress" | "running" | "active" => PlanEntryStatus::InProgress,
            "pending" | "todo" | "not_started" | "not-started" => PlanEntryStatus::Pending,
            _ => PlanEntryStatus::Other,
        }
    }

    /// Returns the emoji rendered for this status bucket.
    pub fn emoji(self) -> &'static str {
        match self {
            PlanEntryStatus::Completed => "✅",
            PlanEntryStatus::InProgress => "🚧",
            PlanEntryStatus::Pending => "⏳",
            PlanEntryStatus::Other => "❔",
        }
    }
}

/// Returns the emoji rendered for a raw priority string.
pub fn priority_emoji(raw: &str) -> &'static str {
    match raw.to_lowercase().as_str() {
        "high" => "🔥",
        "medium" => "⚖️",
        "low" => "🧊",
        _ => "📌",
    }
}

/// One normalized plan entry.
#[derive(Clone, Debug)]
pub struct PlanEntry {
    /// Entry description as reported by the agent.
    pub content: String,
    /// Normalized status bucket.
    pub status: PlanEntryStatus,
    /// Raw priority string as reported by the agent.
    pub priority: String,
}

/// Per-bucket entry counts for one plan snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanCounts {
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub other: usize,
    pub total: usize,
}

/// Copied view of the cached plan; consumers never see the live cache.
#[derive(Clone, Debug)]
pub struct PlanSnapshot {
    /// Normalized entries in agent-reported order.
    pub entries: Vec<PlanEntry>,
    /// When the plan was last replaced.
    pub updated_at: SystemTime,
    /// Per-bucket counts.
    pub counts: PlanCounts,
    /// Content of the first in-progress entry, when any.
    pub current: Option<String>,
    /// Human-readable one-line summary.
    pub summary: String,
}

impl PlanSnapshot {
    /// Builds a snapshot from normalized entries.
    pub fn from_entries(entries: Vec<PlanEntry>, updated_at: SystemTime) -> Self {
        let mut counts = PlanCounts {
            total: entries.len(),
            ..PlanCounts::default()
        };
        for entry in &entries {
            match entry.status {
                PlanEntryStatus::Completed => counts.completed += 1,
                PlanEntryStatus::InProgress => counts.in_progress += 1,
                PlanEntryStatus::Pending => counts.pending += 1,
                PlanEntryStatus::Other => counts.other += 1,
            }
        }
        let current = entries
            .iter()
            .find(|entry| entry.status == PlanEntryStatus::InProgress)
            .map(|entry| entry.content.clone());
        let summary = format!(
            "总计 {} 步，完成 {}，进行中 {}，待处理 {}",
            counts.total, counts.completed, counts.in_progress, counts.pending
        );

        Self {
            entries,
            updated_at,
            counts,
            current,
            summary,
        }
    }
}

/// Renders the compact progress block prepended to task responses.
///
/// Lists the first three entries with status and priority emoji and a
/// "… and N more" tail when the plan is longer.
pub fn render_progress_prefix(snapshot: &PlanSnapshot) -> String {
    let mut block = format!("{PROGRESS_HEADER}\n{}\n", snapshot.summary);
    for entry in snapshot.entries.iter().take(PROGRESS_ENTRY_LIMIT) {
        block.push_str(&format!(
            "{} {} {}\n",
            entry.status.emoji(),
            priority_emoji(&entry.priority),
            entry.content
        ));
    }
    if snapshot.entries.len() > PROGRESS_ENTRY_LIMIT {
        block.push_str(&format!(
            "… and {} more\n",
            snapshot.entries.len() - PROGRESS_ENTRY_LIMIT
        ));
    }

    block
}
