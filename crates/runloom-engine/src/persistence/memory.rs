//! In-memory implementation of WorkflowStore
//!
//! Primarily for testing and embedding. Implements the full store
//! semantics, including claim ordering, timestamps, and recovery, so the
//! engine and worker can be exercised without PostgreSQL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::*;

/// All tables behind one lock: `complete_work` and `cancel_run` mutate
/// several entities and must observe a consistent snapshot, the way a
/// database transaction would.
#[derive(Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    steps: HashMap<Uuid, Step>,
    queue: HashMap<Uuid, QueueItem>,
    workers: HashMap<String, WorkerInfo>,
    checkpoints: Vec<Checkpoint>,
}

/// In-memory WorkflowStore.
///
/// # Example
///
/// ```
/// use runloom_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unclaimed, visible queue items
    pub fn pending_item_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .read()
            .queue
            .values()
            .filter(|i| i.claimed_by.is_none() && i.available_at <= now)
            .count()
    }

    /// All queue items for a run, claimed or not
    pub fn items_for_run(&self, run_id: Uuid) -> Vec<QueueItem> {
        self.state
            .read()
            .queue
            .values()
            .filter(|i| i.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Steps of a run ordered by step number
    pub fn steps_for_run(&self, run_id: Uuid) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .state
            .read()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        steps
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = State::default();
    }

    /// Backdate an item's claim timestamp (test support for recovery paths)
    pub fn backdate_claim(&self, item_id: Uuid, age: Duration) {
        if let Some(item) = self.state.write().queue.get_mut(&item_id) {
            item.claimed_at =
                Some(Utc::now() - chrono::Duration::from_std(age).unwrap_or_default());
        }
    }

    /// Backdate a step's worker heartbeat (test support for recovery paths)
    pub fn backdate_step_heartbeat(&self, step_id: Uuid, age: Duration) {
        if let Some(step) = self.state.write().steps.get_mut(&step_id) {
            step.worker_heartbeat =
                Some(Utc::now() - chrono::Duration::from_std(age).unwrap_or_default());
        }
    }

    /// Backdate a run's `started_at` (test support for timeout/recovery paths)
    pub fn backdate_run_start(&self, run_id: Uuid, age: Duration) {
        if let Some(run) = self.state.write().runs.get_mut(&run_id) {
            run.started_at =
                Some(Utc::now() - chrono::Duration::from_std(age).unwrap_or_default());
        }
    }

    fn cutoff(timeout: Duration) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default()
    }

    fn deps_completed(state: &State, deps: &[Uuid]) -> bool {
        deps.iter().all(|dep| {
            state
                .steps
                .get(dep)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Insert the follow-up items a completed result calls for. Shared by
    /// `complete_work`; runs under the write lock.
    fn apply_result(state: &mut State, item: &QueueItem, result: &WorkResult) {
        let now = Utc::now();

        for next_step in &result.next_steps {
            let next = QueueItem {
                id: Uuid::now_v7(),
                run_id: item.run_id,
                step_id: Some(*next_step),
                queue_type: QueueType::ExecuteStep,
                priority: 5,
                available_at: now,
                created_at: now,
                claimed_at: None,
                claimed_by: None,
                attempt_count: 0,
                max_attempts: item.max_attempts,
                payload: Value::Object(serde_json::Map::new()),
            };
            state.queue.insert(next.id, next);
        }

        if result.should_retry {
            let delay = result.retry_delay().unwrap_or_default();
            let retry = QueueItem {
                id: Uuid::now_v7(),
                // Always the original item's run id
                run_id: item.run_id,
                step_id: item.step_id,
                queue_type: QueueType::RetryStep,
                priority: 8,
                available_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
                created_at: now,
                claimed_at: None,
                claimed_by: None,
                attempt_count: 0,
                max_attempts: item.max_attempts,
                payload: Value::Object(serde_json::Map::new()),
            };
            state.queue.insert(retry.id, retry);
        }

        if result.run_completed {
            let finalize = QueueItem::new(item.run_id, QueueType::CompleteRun, 5);
            state.queue.insert(finalize.id, finalize);
        }

        if !result.success && !result.should_retry {
            if let Some(run) = state.runs.get_mut(&item.run_id) {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Failed;
                    run.completed_at = Some(now);
                    run.error = Some(serde_json::json!({
                        "error": result.error.clone().unwrap_or_else(|| "step failed".to_string()),
                    }));
                }
            }
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::RunExists(run.id));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.state
            .read()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: run.status,
                to: status,
            });
        }

        run.status = status;
        if let Some(output) = output {
            run.output = Some(output);
        }
        if let Some(error) = error {
            run.error = Some(error);
        }
        match status {
            RunStatus::Running => {
                if run.started_at.is_none() {
                    run.started_at = Some(Utc::now());
                }
            }
            RunStatus::Pending => {
                // recovery reset; a fresh start_run dispatch re-stamps this
                run.started_at = None;
            }
            s if s.is_terminal() => {
                if run.completed_at.is_none() {
                    run.completed_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if !run.status.can_transition_to(RunStatus::Cancelled) {
            return Err(StoreError::InvalidTransition {
                from: run.status,
                to: RunStatus::Cancelled,
            });
        }

        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());

        state
            .queue
            .retain(|_, item| !(item.run_id == run_id && item.claimed_by.is_none()));

        for step in state.steps.values_mut() {
            if step.run_id == run_id
                && matches!(step.status, StepStatus::Pending | StepStatus::Retrying)
            {
                step.status = StepStatus::Skipped;
            }
        }
        Ok(())
    }

    async fn recover_failed_runs(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Self::cutoff(timeout);
        let mut state = self.state.write();

        let abandoned: Vec<Uuid> = state
            .runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Running
                    && run.started_at.map(|t| t < cutoff).unwrap_or(false)
                    && !state.steps.values().any(|s| {
                        s.run_id == run.id
                            && s.status == StepStatus::Running
                            && s.worker_heartbeat.map(|t| t >= cutoff).unwrap_or(false)
                    })
            })
            .map(|run| run.id)
            .collect();

        for run_id in &abandoned {
            if let Some(run) = state.runs.get_mut(run_id) {
                run.status = RunStatus::Pending;
                run.started_at = None;
            }
            let restart = QueueItem::new(*run_id, QueueType::StartRun, 7);
            state.queue.insert(restart.id, restart);
        }

        Ok(abandoned.len() as u64)
    }

    async fn fail_timed_out_runs(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut failed = 0u64;

        for run in state.runs.values_mut() {
            if run.status != RunStatus::Running {
                continue;
            }
            let (Some(started_at), Some(timeout)) = (run.started_at, run.timeout_seconds) else {
                continue;
            };
            if started_at + chrono::Duration::seconds(timeout) < now {
                run.status = RunStatus::Failed;
                run.completed_at = Some(now);
                run.error = Some(serde_json::json!({"error": "run timed out"}));
                failed += 1;
            }
        }

        Ok(failed)
    }

    async fn insert_steps(&self, steps: &[Step]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for step in steps {
            let exists = state
                .steps
                .values()
                .any(|s| s.run_id == step.run_id && s.node_id == step.node_id);
            if !exists {
                state.steps.insert(step.id, step.clone());
            }
        }
        if let Some(run_id) = steps.first().map(|s| s.run_id) {
            let total = state.steps.values().filter(|s| s.run_id == run_id).count() as i32;
            if let Some(run) = state.runs.get_mut(&run_id) {
                run.total_steps = total;
            }
        }
        Ok(())
    }

    async fn get_step(&self, step_id: Uuid) -> Result<Step, StoreError> {
        self.state
            .read()
            .steps
            .get(&step_id)
            .cloned()
            .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        Ok(self.steps_for_run(run_id))
    }

    async fn update_step_running(&self, step_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Running;
        step.assigned_worker_id = Some(worker_id.to_string());
        step.worker_heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn update_step_completed(
        &self,
        step_id: Uuid,
        output: Envelope,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Completed;
        step.output = Some(output);
        let run_id = step.run_id;
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.completed_steps += 1;
        }
        Ok(())
    }

    async fn update_step_failed(&self, step_id: Uuid, error: Value) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Failed;
        step.error_details = Some(error);
        step.attempt_count += 1;
        let run_id = step.run_id;
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.failed_steps += 1;
        }
        Ok(())
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        status: StepStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.status = status;
        if status == StepStatus::Pending {
            step.assigned_worker_id = None;
            step.worker_heartbeat = None;
        }
        Ok(())
    }

    async fn dependencies_satisfied(&self, step_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.read();
        let step = state
            .steps
            .get(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        Ok(Self::deps_completed(&state, &step.depends_on))
    }

    async fn pending_dependents(
        &self,
        run_id: Uuid,
        completed_step_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        Ok(state
            .steps
            .values()
            .filter(|s| {
                s.run_id == run_id
                    && s.status == StepStatus::Pending
                    && s.depends_on.contains(&completed_step_id)
                    && Self::deps_completed(&state, &s.depends_on)
            })
            .map(|s| s.id)
            .collect())
    }

    async fn unfinished_step_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .state
            .read()
            .steps
            .values()
            .filter(|s| s.run_id == run_id && !s.status.is_terminal())
            .count() as i64)
    }

    async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.state.write().queue.insert(item.id, item.clone());
        Ok(())
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();

        let mut eligible: Vec<(i32, DateTime<Utc>, Uuid)> = state
            .queue
            .values()
            .filter(|item| {
                item.claimed_by.is_none()
                    && item.available_at <= now
                    && item.attempt_count < item.max_attempts
                    && state
                        .runs
                        .get(&item.run_id)
                        .map(|run| {
                            !matches!(
                                run.status,
                                RunStatus::Paused | RunStatus::Cancelled | RunStatus::Failed
                            )
                        })
                        .unwrap_or(false)
            })
            .map(|item| (item.priority, item.created_at, item.id))
            .collect();

        eligible.sort();
        eligible.truncate(max);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, item_id) in eligible {
            if let Some(item) = state.queue.get_mut(&item_id) {
                item.claimed_by = Some(worker_id.to_string());
                item.claimed_at = Some(now);
                claimed.push(item.clone());
            }
        }

        Ok(claimed)
    }

    async fn delete_claimed(&self, item_id: Uuid, worker_id: &str) -> Result<Uuid, StoreError> {
        let mut state = self.state.write();
        let claimed_by = state
            .queue
            .get(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?
            .claimed_by
            .clone();
        if claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::StaleClaim {
                item_id,
                worker_id: worker_id.to_string(),
            });
        }
        let item = state
            .queue
            .remove(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?;
        Ok(item.run_id)
    }

    async fn complete_work(
        &self,
        worker_id: &str,
        item_id: Uuid,
        result: &WorkResult,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.write();
        let claimed_by = state
            .queue
            .get(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?
            .claimed_by
            .clone();
        if claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::StaleClaim {
                item_id,
                worker_id: worker_id.to_string(),
            });
        }

        let item = state
            .queue
            .remove(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?;
        Self::apply_result(&mut state, &item, result);
        Ok(item.run_id)
    }

    async fn release_expired(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Self::cutoff(timeout);
        let mut state = self.state.write();
        let mut released = 0u64;

        for item in state.queue.values_mut() {
            if item.claimed_by.is_some()
                && item.claimed_at.map(|t| t < cutoff).unwrap_or(false)
                && item.attempt_count < item.max_attempts
            {
                item.claimed_by = None;
                item.claimed_at = None;
                item.attempt_count += 1;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn reset_stale_running_steps(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Self::cutoff(timeout);
        let mut state = self.state.write();
        let mut reset = 0u64;

        for step in state.steps.values_mut() {
            if step.status == StepStatus::Running
                && step.worker_heartbeat.map(|t| t < cutoff).unwrap_or(true)
            {
                step.status = StepStatus::Pending;
                step.assigned_worker_id = None;
                step.worker_heartbeat = None;
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let mut worker = worker.clone();
        worker.last_heartbeat = Utc::now();
        state.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        current_step_count: i32,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.last_heartbeat = now;
        worker.current_step_count = current_step_count;

        for step in state.steps.values_mut() {
            if step.status == StepStatus::Running
                && step.assigned_worker_id.as_deref() == Some(worker_id)
            {
                step.worker_heartbeat = Some(now);
            }
        }
        Ok(())
    }

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.status = status;
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<WorkerInfo, StoreError> {
        self.state
            .read()
            .workers
            .get(worker_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))
    }

    async fn mark_stale_workers_offline(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = Self::cutoff(timeout);
        let mut state = self.state.write();
        let mut marked = 0u64;

        for worker in state.workers.values_mut() {
            if worker.status != WorkerStatus::Offline && worker.last_heartbeat < cutoff {
                worker.status = WorkerStatus::Offline;
                marked += 1;
            }
        }

        Ok(marked)
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.state.write().checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .state
            .read()
            .checkpoints
            .iter()
            .filter(|c| c.step_id == step_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }
}
