use chrono::{DateTime, Utc};
use ensemble_core::{Prioritized, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Administrative state of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleState {
    /// Constructed but not yet started.
    Initializing,
    /// Started and accepting messages.
    Active,
    /// At the concurrent-task limit.
    Busy,
    /// Started with no queued or running work.
    Idle,
    /// Startup or handler failure left the role unusable.
    Error,
    /// Stopped; no longer registered on the bus.
    Shutdown,
}

impl std::fmt::Display for RoleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleState::Initializing => "initializing",
            RoleState::Active => "active",
            RoleState::Busy => "busy",
            RoleState::Idle => "idle",
            RoleState::Error => "error",
            RoleState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Being executed by a worker.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Abandoned after a cancellation request.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of role-local work, distinct from a message.
///
/// Created when a role's handler enqueues work; mutated only by the worker
/// executing it; removed from the active index once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// Free-form kind discriminator interpreted by the role.
    pub kind: String,
    /// Input payload.
    pub payload: HashMap<String, serde_json::Value>,
    /// Scheduling priority, same semantics as message priority.
    pub priority: Priority,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Result payload of a completed task.
    pub result: Option<serde_json::Value>,
    /// Error text of a failed task.
    pub error: Option<String>,
}

impl Task {
    /// Creates a pending task.
    pub fn new(
        kind: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
        }
    }

    /// Marks the task in progress with a start timestamp.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Marks the task completed with its result.
    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.progress = 1.0;
    }

    /// Marks the task failed with an error text.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Marks the task cancelled.
    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Sets the completion fraction, clamped to `[0, 1]`.
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
    }
}

impl Prioritized for Task {
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Counters accumulated over a role's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct RoleStats {
    /// Tasks that completed successfully.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Tasks abandoned after a cancellation request.
    pub tasks_cancelled: u64,
    /// Messages this role pushed onto the bus.
    pub messages_sent: u64,
    /// Messages delivered to this role.
    pub messages_received: u64,
    /// When the role started.
    pub started_at: DateTime<Utc>,
}

/// Point-in-time status snapshot of a role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    /// Role id as registered on the bus.
    pub role_id: String,
    /// Human-readable role name.
    pub role_name: String,
    /// Effective state (`busy`/`idle` derived from the task load).
    pub state: RoleState,
    /// Instant of the last handled message.
    pub last_activity: DateTime<Utc>,
    /// Tasks currently in progress.
    pub current_task_count: usize,
    /// Tasks waiting in the scheduler queue.
    pub queue_size: usize,
    /// Lifetime counters.
    pub stats: RoleStats,
}
