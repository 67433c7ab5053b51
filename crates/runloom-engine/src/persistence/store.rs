//! WorkflowStore trait definition and persisted domain types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Queue item not found
    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// Worker not found
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// A run with this id already exists
    #[error("run already exists: {0}")]
    RunExists(Uuid),

    /// Queue item is not (or no longer) claimed by the caller
    #[error("queue item {item_id} is not claimed by worker {worker_id}")]
    StaleClaim { item_id: Uuid, worker_id: String },

    /// Disallowed run status transition (terminal statuses are final)
    #[error("invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not started
    Pending,

    /// Run is executing steps
    Running,

    /// New dispatch is suspended; in-flight steps drain
    Paused,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed transitions of the run state machine. A status may always
    /// "transition" to itself (idempotent re-dispatch).
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Cancelled | Self::Failed
            ),
            Self::Running => matches!(
                next,
                Self::Paused
                    | Self::Completed
                    | Self::Failed
                    | Self::Cancelled
                    // orphaned-run recovery resets running runs for re-dispatch
                    | Self::Pending
            ),
            Self::Paused => matches!(next, Self::Running | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Kind of work a queue item schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    StartRun,
    ExecuteStep,
    RetryStep,
    CompleteRun,
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartRun => write!(f, "start_run"),
            Self::ExecuteStep => write!(f, "execute_step"),
            Self::RetryStep => write!(f, "retry_step"),
            Self::CompleteRun => write!(f, "complete_run"),
        }
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Draining => write!(f, "draining"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Checkpoint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    PreExecution,
    PostExecution,
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreExecution => write!(f, "pre_execution"),
            Self::PostExecution => write!(f, "post_execution"),
        }
    }
}

/// Opaque payload container passed into and out of node execution.
///
/// The engine treats envelope contents as bytes; node executors parse them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(pub serde_json::Map<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self(serde_json::Map::new())
    }

    /// Wrap an arbitrary JSON value. Non-object values land under a
    /// `"value"` key so the envelope stays a key-value map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge another envelope into this one. Keys from `other` win.
    pub fn merge(&mut self, other: Envelope) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }
}

/// One execution of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Option<Uuid>,
    pub trigger_id: Option<Uuid>,
    pub status: RunStatus,
    pub input: Envelope,
    pub variables: Envelope,
    pub output: Option<Envelope>,
    pub error: Option<Value>,
    pub timeout_seconds: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
}

impl Run {
    /// A fresh pending run for the given workflow.
    pub fn new(workflow_id: Uuid, input: Envelope) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version_id: None,
            trigger_id: None,
            status: RunStatus::Pending,
            input,
            variables: Envelope::new(),
            output: None,
            error: None,
            timeout_seconds: None,
            retry_policy: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
        }
    }
}

/// One node's execution within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub step_number: i32,
    pub status: StepStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub input: Option<Envelope>,
    pub output: Option<Envelope>,
    pub node_config: Value,
    pub error_details: Option<Value>,
    pub assigned_worker_id: Option<String>,
    pub worker_heartbeat: Option<DateTime<Utc>>,
    /// Step ids within the same run that must be completed first
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(run_id: Uuid, node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            step_number: 0,
            status: StepStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            input: None,
            output: None,
            node_config: Value::Object(serde_json::Map::new()),
            error_details: None,
            assigned_worker_id: None,
            worker_heartbeat: None,
            depends_on: vec![],
            created_at: Utc::now(),
        }
    }
}

/// A scheduled unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub queue_type: QueueType,
    /// Lower is more urgent
    pub priority: i32,
    /// Invisible to claimers until this instant
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub payload: Value,
}

impl QueueItem {
    pub fn new(run_id: Uuid, queue_type: QueueType, priority: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id: None,
            queue_type,
            priority,
            available_at: Utc::now(),
            created_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
            attempt_count: 0,
            max_attempts: 5,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }
}

/// Worker registration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    pub pid: Option<i32>,
    pub version: Option<String>,
    /// Node types this worker accepts; `*` accepts anything
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub max_concurrent_steps: i32,
    pub current_step_count: i32,
    pub total_steps_executed: i64,
    pub total_steps_failed: i64,
}

/// Per-step execution snapshot, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: Uuid, step_id: Uuid, checkpoint_type: CheckpointType, context: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id,
            checkpoint_type,
            context,
            created_at: Utc::now(),
        }
    }
}

/// Outcome a worker reports for a claimed queue item.
///
/// Consumed by the atomic complete: the item is deleted, `next_steps` are
/// enqueued as `execute_step` items, a retry item is enqueued when
/// `should_retry`, a `complete_run` item when `run_completed`, and the run is
/// failed when the result is a terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub success: bool,
    pub error: Option<String>,
    pub output: Option<Envelope>,
    /// Step ids to enqueue as `execute_step` items at priority 5
    #[serde(default)]
    pub next_steps: Vec<Uuid>,
    #[serde(default)]
    pub should_retry: bool,
    /// Delay before the retry item becomes visible
    pub retry_delay_ms: Option<u64>,
    /// All steps of the run are finished; enqueue a `complete_run` item
    #[serde(default)]
    pub run_completed: bool,
}

impl WorkResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            output: None,
            next_steps: vec![],
            should_retry: false,
            retry_delay_ms: None,
            run_completed: false,
        }
    }

    pub fn success_with_next(next_steps: Vec<Uuid>) -> Self {
        Self {
            next_steps,
            ..Self::success()
        }
    }

    pub fn retry(delay: Duration) -> Self {
        Self {
            success: false,
            should_retry: true,
            retry_delay_ms: Some(delay.as_millis() as u64),
            ..Self::success()
        }
    }

    pub fn retry_with_error(delay: Duration, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::retry(delay)
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            output: None,
            next_steps: vec![],
            should_retry: false,
            retry_delay_ms: None,
            run_completed: false,
        }
    }

    pub fn with_output(mut self, output: Envelope) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_run_completed(mut self) -> Self {
        self.run_completed = true;
        self
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }
}

/// Transactional store for runs, steps, the work queue, workers, and
/// checkpoints.
///
/// Every method is a single transactional operation. Implementations must be
/// thread-safe and support concurrent access; in particular `claim_batch`
/// must never hand the same unclaimed item to two callers.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Run operations
    // =========================================================================

    /// Persist a new run. Fails with `RunExists` on a duplicate id.
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    /// Transition a run, validating the state machine (terminal statuses are
    /// final). Moving to `running` stamps `started_at`; terminal statuses
    /// stamp `completed_at`. Output and error are only written when provided.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<Value>,
    ) -> Result<(), StoreError>;

    /// Cancel a run in one transaction: status -> cancelled with
    /// `completed_at`, unclaimed queue items for the run deleted, pending and
    /// retrying steps marked skipped. Claimed items are left to drain.
    async fn cancel_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Reset `running` runs whose steps have all gone quiet for longer than
    /// `timeout` back to `pending`, enqueuing a `start_run` item at priority
    /// 7 for each. Returns the number of runs recovered.
    async fn recover_failed_runs(&self, timeout: Duration) -> Result<u64, StoreError>;

    /// Fail running runs whose `started_at + timeout_seconds` has elapsed.
    /// Returns the number of runs failed.
    async fn fail_timed_out_runs(&self) -> Result<u64, StoreError>;

    // =========================================================================
    // Step operations
    // =========================================================================

    /// Insert step rows for a run and refresh the run's `total_steps`.
    /// Existing `(run_id, node_id)` rows are left untouched so start-run
    /// dispatch stays idempotent under recovery re-delivery.
    async fn insert_steps(&self, steps: &[Step]) -> Result<(), StoreError>;

    async fn get_step(&self, step_id: Uuid) -> Result<Step, StoreError>;

    /// All steps of a run, ordered by step number.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError>;

    /// Move a step to `running`, assigning the worker and stamping its
    /// heartbeat.
    async fn update_step_running(&self, step_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Move a step to `completed` with its output and bump the run's
    /// completed-step counter.
    async fn update_step_completed(&self, step_id: Uuid, output: Envelope)
        -> Result<(), StoreError>;

    /// Move a step to `failed` with error details, incrementing
    /// `attempt_count` and the run's failed-step counter.
    async fn update_step_failed(&self, step_id: Uuid, error: Value) -> Result<(), StoreError>;

    /// Bare status flip (retrying -> pending, pending -> retrying, ...).
    async fn update_step_status(&self, step_id: Uuid, status: StepStatus)
        -> Result<(), StoreError>;

    /// True when every step in the step's `depends_on` set is completed.
    async fn dependencies_satisfied(&self, step_id: Uuid) -> Result<bool, StoreError>;

    /// Pending steps of the run that depend on the completed step and whose
    /// dependencies are now all satisfied.
    async fn pending_dependents(
        &self,
        run_id: Uuid,
        completed_step_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Steps of the run not yet in a terminal status.
    async fn unfinished_step_count(&self, run_id: Uuid) -> Result<i64, StoreError>;

    // =========================================================================
    // Queue operations
    // =========================================================================

    async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// Atomically claim up to `max` items: unclaimed, visible, with retry
    /// budget left, and whose run is not paused, cancelled, or failed.
    /// Ordered by `(priority ASC, created_at ASC)`. Two concurrent claimers
    /// never receive the same item.
    async fn claim_batch(&self, worker_id: &str, max: usize)
        -> Result<Vec<QueueItem>, StoreError>;

    /// Delete a claimed item, returning its run id. Fails with `StaleClaim`
    /// when the item is claimed by someone else.
    async fn delete_claimed(&self, item_id: Uuid, worker_id: &str) -> Result<Uuid, StoreError>;

    /// The atomic complete: in one transaction delete the claimed item,
    /// enqueue `execute_step` items at priority 5 for `next_steps`, enqueue a
    /// `retry_step` item at priority 8 carrying the original run id when
    /// `should_retry`, enqueue a `complete_run` item when `run_completed`,
    /// and fail the run on a terminal failure. Returns the run id.
    async fn complete_work(
        &self,
        worker_id: &str,
        item_id: Uuid,
        result: &WorkResult,
    ) -> Result<Uuid, StoreError>;

    /// Release claimed items whose `claimed_at` is older than `timeout` and
    /// which still have retry budget, incrementing their `attempt_count`.
    /// Returns the number of items released.
    async fn release_expired(&self, timeout: Duration) -> Result<u64, StoreError>;

    /// Revert `running` steps with a stale `worker_heartbeat` to `pending`,
    /// clearing the worker assignment. Returns the number of steps reset.
    async fn reset_stale_running_steps(&self, timeout: Duration) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker registry operations
    // =========================================================================

    /// Upsert a worker by id, resetting its heartbeat.
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError>;

    /// Refresh a worker's heartbeat and load, and the heartbeat of every
    /// running step assigned to it.
    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        current_step_count: i32,
    ) -> Result<(), StoreError>;

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError>;

    async fn get_worker(&self, worker_id: &str) -> Result<WorkerInfo, StoreError>;

    /// Mark workers whose heartbeat is older than `timeout` offline.
    async fn mark_stale_workers_offline(&self, timeout: Duration) -> Result<u64, StoreError>;

    // =========================================================================
    // Checkpoint operations
    // =========================================================================

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn list_checkpoints(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;
}
