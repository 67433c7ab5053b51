//! Engine: stateless orchestration over the WorkflowStore
//!
//! The engine holds no durable state. Any number of instances may run
//! against one store; identity is the configured worker id, used when the
//! engine executes steps itself (engine-embedded mode).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    Checkpoint, CheckpointType, Envelope, QueueItem, QueueType, Run, RunStatus, Step, StepStatus,
    StoreError, WorkResult, WorkerInfo, WorkerStatus, WorkflowStore,
};

use super::registry::{ExecutionContext, NodeRegistry};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker id recorded on steps the engine executes itself
    pub worker_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("engine-{}", Uuid::now_v7()),
        }
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller passed a malformed or incomplete argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A run with this id already exists
    #[error("run already exists: {0}")]
    AlreadyExists(Uuid),

    /// The queue item is not (or no longer) claimed by this worker
    #[error("stale claim on item {0}")]
    StaleClaim(Uuid),

    /// A dependency of the step is not completed yet
    #[error("dependencies not ready for step {0}")]
    DependenciesNotReady(Uuid),

    /// No node implementation registered under this type
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// The node executor returned an error
    #[error("node execution failed: {message}")]
    NodeExecution { message: String, retryable: bool },

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Summary of one orphaned-work recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queue items whose claim expired and was released
    pub items_released: u64,

    /// Running steps reverted to pending
    pub steps_reset: u64,

    /// Workers marked offline
    pub workers_offline: u64,
}

/// Stateless orchestrator over a WorkflowStore
///
/// # Example
///
/// ```ignore
/// use runloom_engine::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowStore::new());
/// let registry = Arc::new(NodeRegistry::new());
/// let engine = Engine::new(store, registry, EngineConfig::default());
///
/// let run_id = engine.start_run(Run::new(workflow_id, input)).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<NodeRegistry>,
    worker_id: String,
}

impl Engine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            worker_id: config.worker_id,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Persist a pending run and enqueue its `start_run` item at priority 5.
    #[instrument(skip(self, run), fields(run_id = %run.id, workflow_id = %run.workflow_id))]
    pub async fn start_run(&self, run: Run) -> Result<Uuid, EngineError> {
        if run.id.is_nil() {
            return Err(EngineError::InvalidArgument("run id is required".to_string()));
        }
        if run.workflow_id.is_nil() {
            return Err(EngineError::InvalidArgument(
                "workflow id is required".to_string(),
            ));
        }
        if run.status != RunStatus::Pending {
            return Err(EngineError::InvalidArgument(format!(
                "new runs must be pending, got {}",
                run.status
            )));
        }

        let run_id = run.id;
        self.store.insert_run(&run).await.map_err(|e| match e {
            StoreError::RunExists(id) => EngineError::AlreadyExists(id),
            other => EngineError::Store(other),
        })?;

        self.store
            .enqueue(&QueueItem::new(run_id, QueueType::StartRun, 5))
            .await?;

        info!(%run_id, "started run");
        Ok(run_id)
    }

    pub async fn run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn step(&self, step_id: Uuid) -> Result<Step, EngineError> {
        Ok(self.store.get_step(step_id).await?)
    }

    /// Cooperative pause: running steps continue, new dispatch stops because
    /// the claim predicate filters paused runs.
    #[instrument(skip(self))]
    pub async fn pause_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.store
            .update_run_status(run_id, RunStatus::Paused, None, None)
            .await?;
        info!(%run_id, "paused run");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await?;
        info!(%run_id, "resumed run");
        Ok(())
    }

    /// Hard cancel: unclaimed items are deleted and pending/retrying steps
    /// are skipped in one transaction; claimed items drain with their worker.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.store.cancel_run(run_id).await?;
        info!(%run_id, "cancelled run");
        Ok(())
    }

    // =========================================================================
    // Work protocol
    // =========================================================================

    /// Claim up to `max` queue items for a worker.
    pub async fn claim_work(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.store.claim_batch(worker_id, max).await?)
    }

    /// Report the outcome of a claimed item. The store applies the atomic
    /// complete; a claim held by someone else surfaces as `StaleClaim`.
    #[instrument(skip(self, result), fields(success = result.success))]
    pub async fn complete_work(
        &self,
        worker_id: &str,
        item_id: Uuid,
        result: &WorkResult,
    ) -> Result<Uuid, EngineError> {
        self.store
            .complete_work(worker_id, item_id, result)
            .await
            .map_err(|e| match e {
                StoreError::StaleClaim { item_id, .. } => EngineError::StaleClaim(item_id),
                other => EngineError::Store(other),
            })
    }

    /// Execute one step to completion or failure.
    ///
    /// Moves the step to running under this engine's worker id, writes a
    /// pre-execution checkpoint, runs the node, and records the outcome.
    /// Fails with `DependenciesNotReady` (leaving the step untouched) when
    /// any `depends_on` step is not completed; the caller requeues with a
    /// delay. Never retries internally: retry is a queue-level decision made
    /// by the caller from the returned error.
    #[instrument(skip(self, input))]
    pub async fn execute_step(
        &self,
        step_id: Uuid,
        input: Envelope,
    ) -> Result<Envelope, EngineError> {
        let step = self.store.get_step(step_id).await?;
        let run = self.store.get_run(step.run_id).await?;

        if !self.store.dependencies_satisfied(step_id).await? {
            return Err(EngineError::DependenciesNotReady(step_id));
        }

        self.store.update_step_running(step_id, &self.worker_id).await?;

        let attempt = step.attempt_count as u32 + 1;
        self.store
            .insert_checkpoint(&Checkpoint::new(
                step.run_id,
                step.id,
                CheckpointType::PreExecution,
                json!({
                    "node_id": step.node_id,
                    "node_type": step.node_type,
                    "attempt": attempt,
                    "input": input.as_value(),
                    "variables": run.variables.as_value(),
                }),
            ))
            .await?;

        let Some(node) = self.registry.find(&step.node_type) else {
            self.store
                .update_step_failed(
                    step_id,
                    json!({"error": "unknown_node_type", "node_type": step.node_type.clone()}),
                )
                .await?;
            return Err(EngineError::UnknownNodeType(step.node_type));
        };

        let ctx = ExecutionContext::new(
            step.run_id,
            step.id,
            step.node_id.clone(),
            attempt,
            step.max_attempts as u32,
            run.variables.clone(),
        );

        match node.execute(&ctx, &step.node_config, input).await {
            Ok(output) => {
                self.store
                    .update_step_completed(step_id, output.clone())
                    .await?;
                self.store
                    .insert_checkpoint(&Checkpoint::new(
                        step.run_id,
                        step.id,
                        CheckpointType::PostExecution,
                        json!({
                            "node_id": step.node_id,
                            "attempt": attempt,
                            "output": output.as_value(),
                        }),
                    ))
                    .await?;
                Ok(output)
            }
            Err(e) => {
                warn!(%step_id, node_type = %step.node_type, error = %e, "node execution failed");
                self.store
                    .update_step_failed(
                        step_id,
                        json!({
                            "error": e.message.clone(),
                            "retryable": e.retryable,
                            "attempt": attempt,
                        }),
                    )
                    .await?;
                Err(EngineError::NodeExecution {
                    message: e.message,
                    retryable: e.retryable,
                })
            }
        }
    }

    /// Re-enqueue a failed step as a delayed `retry_step` item at priority 8.
    ///
    /// Returns false when the step's attempt budget is exhausted; an
    /// exhausted step is never re-enqueued.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, step_id: Uuid) -> Result<bool, EngineError> {
        let step = self.store.get_step(step_id).await?;
        let run = self.store.get_run(step.run_id).await?;

        let attempts = step.attempt_count.max(0) as u32;
        if attempts >= step.max_attempts.max(0) as u32 {
            return Ok(false);
        }

        let policy = run.retry_policy.unwrap_or_default();
        let delay = policy.calculate_delay(attempts.max(1));

        self.store
            .update_step_status(step_id, StepStatus::Retrying)
            .await?;
        self.store
            .enqueue(
                &QueueItem::new(step.run_id, QueueType::RetryStep, 8)
                    .with_step(step_id)
                    .with_delay(delay),
            )
            .await?;

        info!(%step_id, ?delay, "enqueued step retry");
        Ok(true)
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    pub async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), EngineError> {
        self.store.register_worker(worker).await?;
        Ok(())
    }

    /// Unregistering marks the worker offline; the row stays for
    /// diagnostics.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<(), EngineError> {
        self.store
            .set_worker_status(worker_id, WorkerStatus::Offline)
            .await?;
        Ok(())
    }

    pub async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        current_step_count: i32,
    ) -> Result<(), EngineError> {
        self.store
            .heartbeat_worker(worker_id, current_step_count)
            .await?;
        Ok(())
    }

    pub async fn worker(&self, worker_id: &str) -> Result<WorkerInfo, EngineError> {
        Ok(self.store.get_worker(worker_id).await?)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Both §-recovery sweeps plus the stale-worker sweep. Idempotent; any
    /// worker may run this on any schedule.
    #[instrument(skip(self))]
    pub async fn recover_orphaned_work(
        &self,
        timeout: Duration,
    ) -> Result<RecoveryReport, EngineError> {
        let report = RecoveryReport {
            items_released: self.store.release_expired(timeout).await?,
            steps_reset: self.store.reset_stale_running_steps(timeout).await?,
            workers_offline: self.store.mark_stale_workers_offline(timeout).await?,
        };

        if report != RecoveryReport::default() {
            info!(
                items = report.items_released,
                steps = report.steps_reset,
                workers = report.workers_offline,
                "recovered orphaned work"
            );
        }
        Ok(report)
    }

    /// Reset abandoned running runs to pending and re-enqueue them at
    /// priority 7.
    #[instrument(skip(self))]
    pub async fn recover_failed_runs(&self, timeout: Duration) -> Result<u64, EngineError> {
        let recovered = self.store.recover_failed_runs(timeout).await?;
        if recovered > 0 {
            info!(recovered, "re-enqueued abandoned runs");
        }
        Ok(recovered)
    }

    /// Fail running runs whose per-run timeout has elapsed.
    #[instrument(skip(self))]
    pub async fn fail_timed_out_runs(&self) -> Result<u64, EngineError> {
        let failed = self.store.fail_timed_out_runs().await?;
        if failed > 0 {
            warn!(failed, "failed timed-out runs");
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{NodeDefinition, NodeError, NoopNode};
    use crate::persistence::InMemoryWorkflowStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingNode {
        calls: AtomicU32,
        retryable: bool,
    }

    impl FailingNode {
        fn new(retryable: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                retryable,
            }
        }
    }

    #[async_trait]
    impl NodeDefinition for FailingNode {
        fn node_type(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _config: &Value,
            _input: Envelope,
        ) -> Result<Envelope, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.retryable {
                Err(NodeError::retryable("downstream unavailable"))
            } else {
                Err(NodeError::non_retryable("bad node config"))
            }
        }
    }

    fn test_engine() -> (Engine, Arc<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.register(Arc::new(NoopNode));
        let engine = Engine::new(
            store.clone(),
            registry,
            EngineConfig {
                worker_id: "engine-test".to_string(),
            },
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_start_run_persists_pending_and_enqueues() {
        let (engine, store) = test_engine();
        let run = Run::new(
            Uuid::now_v7(),
            Envelope::from_value(json!({"test": "basic"})),
        );
        let run_id = engine.start_run(run).await.unwrap();

        let stored = engine.run(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Pending);
        assert_eq!(stored.input.get("test"), Some(&json!("basic")));

        let items = store.items_for_run(run_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].queue_type, QueueType::StartRun);
        assert_eq!(items[0].priority, 5);
    }

    #[tokio::test]
    async fn test_start_run_duplicate_id() {
        let (engine, _store) = test_engine();
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        engine.start_run(run.clone()).await.unwrap();

        let result = engine.start_run(run).await;
        assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_start_run_missing_workflow_id() {
        let (engine, _store) = test_engine();
        let run = Run::new(Uuid::nil(), Envelope::new());

        let result = engine.start_run(run).await;
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_lifecycle() {
        let (engine, store) = test_engine();
        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();
        store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        engine.pause_run(run_id).await.unwrap();
        assert_eq!(engine.run(run_id).await.unwrap().status, RunStatus::Paused);

        engine.resume_run(run_id).await.unwrap();
        assert_eq!(engine.run(run_id).await.unwrap().status, RunStatus::Running);

        engine.cancel_run(run_id).await.unwrap();
        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let (engine, _store) = test_engine();
        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();

        let result = engine.pause_run(run_id).await;
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::InvalidTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn test_execute_step_success_writes_checkpoints() {
        let (engine, store) = test_engine();
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();

        let step = Step::new(run_id, "a", "noop");
        store.insert_steps(&[step.clone()]).await.unwrap();

        let input = Envelope::from_value(json!({"payload": 1}));
        let output = engine.execute_step(step.id, input.clone()).await.unwrap();
        assert_eq!(output, input);

        let stored = engine.step(step.id).await.unwrap();
        assert_eq!(stored.status, StepStatus::Completed);
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("engine-test"));
        assert_eq!(stored.output, Some(input));

        let checkpoints = store.list_checkpoints(step.id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].checkpoint_type, CheckpointType::PreExecution);
        assert_eq!(checkpoints[1].checkpoint_type, CheckpointType::PostExecution);
    }

    #[tokio::test]
    async fn test_execute_step_failure_increments_attempts() {
        let (engine, store) = test_engine();
        engine.registry().register(Arc::new(FailingNode::new(true)));

        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();
        let step = Step::new(run_id, "a", "failing");
        store.insert_steps(&[step.clone()]).await.unwrap();

        let result = engine.execute_step(step.id, Envelope::new()).await;
        assert!(matches!(
            result,
            Err(EngineError::NodeExecution { retryable: true, .. })
        ));

        let stored = engine.step(step.id).await.unwrap();
        assert_eq!(stored.status, StepStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.error_details.unwrap()["error"], "downstream unavailable");
    }

    #[tokio::test]
    async fn test_execute_step_requires_completed_dependencies() {
        let (engine, store) = test_engine();
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();

        let a = Step::new(run_id, "a", "noop");
        let mut b = Step::new(run_id, "b", "noop");
        b.depends_on = vec![a.id];
        store.insert_steps(&[a.clone(), b.clone()]).await.unwrap();

        let result = engine.execute_step(b.id, Envelope::new()).await;
        assert!(
            matches!(result, Err(EngineError::DependenciesNotReady(id)) if id == b.id)
        );
        // The step was not touched
        assert_eq!(engine.step(b.id).await.unwrap().status, StepStatus::Pending);

        store
            .update_step_completed(a.id, Envelope::new())
            .await
            .unwrap();
        assert!(engine.execute_step(b.id, Envelope::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_step_unknown_node_type() {
        let (engine, store) = test_engine();
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();
        let step = Step::new(run_id, "a", "does-not-exist");
        store.insert_steps(&[step.clone()]).await.unwrap();

        let result = engine.execute_step(step.id, Envelope::new()).await;
        assert!(matches!(result, Err(EngineError::UnknownNodeType(_))));

        let stored = engine.step(step.id).await.unwrap();
        assert_eq!(stored.status, StepStatus::Failed);
        assert_eq!(stored.error_details.unwrap()["error"], "unknown_node_type");
    }

    #[tokio::test]
    async fn test_retry_step_respects_budget() {
        let (engine, store) = test_engine();
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();

        let mut step = Step::new(run_id, "a", "noop");
        step.max_attempts = 2;
        store.insert_steps(&[step.clone()]).await.unwrap();

        store
            .update_step_failed(step.id, json!({"error": "x"}))
            .await
            .unwrap();
        assert!(engine.retry_step(step.id).await.unwrap());
        assert_eq!(
            engine.step(step.id).await.unwrap().status,
            StepStatus::Retrying
        );

        store
            .update_step_failed(step.id, json!({"error": "x"}))
            .await
            .unwrap();
        // Two failures against max_attempts=2: never re-enqueued
        assert!(!engine.retry_step(step.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_and_complete_roundtrip() {
        let (engine, store) = test_engine();
        let run_id = engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();

        let claimed = engine.claim_work("w1", 5).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Someone else reporting the result is a stale claim
        let stale = engine
            .complete_work("w2", claimed[0].id, &WorkResult::success())
            .await;
        assert!(matches!(stale, Err(EngineError::StaleClaim(_))));

        let returned = engine
            .complete_work("w1", claimed[0].id, &WorkResult::success())
            .await
            .unwrap();
        assert_eq!(returned, run_id);
        assert!(store.items_for_run(run_id).is_empty());
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent_without_claims() {
        let (engine, _store) = test_engine();

        let first = engine
            .recover_orphaned_work(Duration::from_secs(300))
            .await
            .unwrap();
        let second = engine
            .recover_orphaned_work(Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(first, RecoveryReport::default());
        assert_eq!(second, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_unregister_marks_offline() {
        let (engine, _store) = test_engine();
        let worker = WorkerInfo {
            id: "w1".to_string(),
            hostname: "host".to_string(),
            pid: None,
            version: None,
            capabilities: vec!["*".to_string()],
            status: WorkerStatus::Idle,
            started_at: chrono::Utc::now(),
            last_heartbeat: chrono::Utc::now(),
            max_concurrent_steps: 10,
            current_step_count: 0,
            total_steps_executed: 0,
            total_steps_failed: 0,
        };
        engine.register_worker(&worker).await.unwrap();
        engine.unregister_worker("w1").await.unwrap();

        assert_eq!(
            engine.worker("w1").await.unwrap().status,
            WorkerStatus::Offline
        );
    }
}
