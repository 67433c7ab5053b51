//! Dispatch of claimed queue items by type
//!
//! The dispatcher turns a claimed item into a `WorkResult` for the atomic
//! complete. It never completes items itself; an `Err` means the item is
//! left claimed for orphan recovery to release (store outage path).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineError};
use crate::graph::GraphProvider;
use crate::persistence::{
    Envelope, QueueItem, QueueType, Run, RunStatus, Step, StepStatus, StoreError, WorkResult,
    WorkflowStore,
};

/// Safety-net requeue delay when an `execute_step` item arrives before its
/// dependencies are done. The primary path is `pending_dependents` on the
/// dependency's completion.
pub(crate) const DEPS_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Requeue delay when this worker's capability tags do not cover the node
/// type. Filtering is advisory; another worker picks the item up.
pub(crate) const CAPABILITY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Handles claimed queue items for one worker
pub struct Dispatcher {
    engine: Engine,
    graphs: Arc<dyn GraphProvider>,
    capabilities: Vec<String>,
}

impl Dispatcher {
    pub fn new(engine: Engine, graphs: Arc<dyn GraphProvider>, capabilities: Vec<String>) -> Self {
        Self {
            engine,
            graphs,
            capabilities,
        }
    }

    fn covers(&self, node_type: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == "*" || c == node_type)
    }

    /// Process one claimed item into the result to report.
    #[instrument(skip(self, item), fields(item_id = %item.id, queue_type = %item.queue_type))]
    pub async fn dispatch(&self, item: &QueueItem) -> Result<WorkResult, EngineError> {
        match item.queue_type {
            QueueType::StartRun => self.handle_start_run(item).await,
            QueueType::ExecuteStep | QueueType::RetryStep => self.handle_execute_step(item).await,
            QueueType::CompleteRun => self.handle_complete_run(item).await,
        }
    }

    /// Load the graph, create the step rows, flip the run to running, and
    /// hand back the entry-point steps.
    async fn handle_start_run(&self, item: &QueueItem) -> Result<WorkResult, EngineError> {
        let run = match self.engine.run(item.run_id).await {
            Ok(run) => run,
            Err(EngineError::Store(StoreError::RunNotFound(_))) => {
                // The run is gone (cascade delete); nothing to start
                return Ok(WorkResult::success());
            }
            Err(e) => return Err(e),
        };

        if run.status.is_terminal() {
            return Ok(WorkResult::success());
        }

        let graph = match self.graphs.graph(run.workflow_id, run.workflow_version_id).await {
            Ok(graph) => graph,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "graph resolution failed");
                return Ok(WorkResult::failure(e.to_string()));
            }
        };
        if let Err(e) = graph.validate() {
            return Ok(WorkResult::failure(e.to_string()));
        }

        let steps = build_steps(&run, &graph);
        self.engine.store().insert_steps(&steps).await?;

        self.engine
            .store()
            .update_run_status(run.id, RunStatus::Running, None, None)
            .await?;

        // Read back: under recovery re-delivery the rows that exist win over
        // the ones we just built
        let stored = self.engine.store().list_steps(run.id).await?;
        if stored.is_empty() {
            // Empty graph: nothing to execute
            return Ok(WorkResult::success().with_run_completed());
        }

        let entry_steps: Vec<Uuid> = stored
            .iter()
            .filter(|s| s.depends_on.is_empty() && s.status == StepStatus::Pending)
            .map(|s| s.id)
            .collect();

        debug!(run_id = %run.id, steps = stored.len(), entries = entry_steps.len(), "run started");
        Ok(WorkResult::success_with_next(entry_steps))
    }

    /// Verify dependencies, execute the node, and report dependents.
    async fn handle_execute_step(&self, item: &QueueItem) -> Result<WorkResult, EngineError> {
        let Some(step_id) = item.step_id else {
            return Ok(WorkResult::failure("queue item carries no step id"));
        };

        let step = match self.engine.step(step_id).await {
            Ok(step) => step,
            Err(EngineError::Store(StoreError::StepNotFound(_))) => {
                return Ok(WorkResult::failure(format!("step {step_id} not found")));
            }
            Err(e) => return Err(e),
        };
        let run = self.engine.run(step.run_id).await?;

        if run.status.is_terminal() {
            return Ok(WorkResult::success());
        }
        match step.status {
            // Duplicate delivery; the owning worker or a prior item already
            // handled this step
            StepStatus::Completed | StepStatus::Running | StepStatus::Skipped => {
                return Ok(WorkResult::success());
            }
            StepStatus::Failed => {
                // Terminal failure already recorded; drop the straggler
                return Ok(WorkResult::success());
            }
            StepStatus::Pending | StepStatus::Retrying => {}
        }

        if !self.covers(&step.node_type) {
            debug!(node_type = %step.node_type, "node type outside capability tags, re-releasing");
            return Ok(WorkResult::retry(CAPABILITY_RETRY_DELAY));
        }

        let input = self.build_input(&run, &step).await?;

        match self.engine.execute_step(step_id, input).await {
            Ok(output) => {
                let next_steps = self
                    .engine
                    .store()
                    .pending_dependents(run.id, step_id)
                    .await?;
                let unfinished = self.engine.store().unfinished_step_count(run.id).await?;

                let mut result = WorkResult::success_with_next(next_steps).with_output(output);
                if unfinished == 0 {
                    result = result.with_run_completed();
                }
                Ok(result)
            }
            Err(EngineError::DependenciesNotReady(_)) => {
                debug!(%step_id, "dependencies not ready, requeuing");
                Ok(WorkResult::retry(DEPS_RETRY_DELAY))
            }
            Err(EngineError::NodeExecution { message, retryable }) => {
                self.decide_retry(&run, &step, message, retryable).await
            }
            Err(EngineError::UnknownNodeType(node_type)) => Ok(WorkResult::failure(format!(
                "unknown_node_type: {node_type}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Retry with backoff while the budget and policy allow; terminal
    /// failure otherwise, which fails the run in the atomic complete.
    async fn decide_retry(
        &self,
        run: &Run,
        step: &Step,
        message: String,
        retryable: bool,
    ) -> Result<WorkResult, EngineError> {
        // execute_step incremented the count when it recorded the failure
        let attempts = step.attempt_count as u32 + 1;
        let policy = run
            .retry_policy
            .clone()
            .unwrap_or_default()
            .with_max_attempts(step.max_attempts.max(0) as u32);

        if !retryable || !policy.is_retryable(&message, attempts) {
            warn!(step_id = %step.id, attempts, "step failed terminally: {message}");
            return Ok(WorkResult::failure(message));
        }

        let delay = policy.calculate_delay(attempts);
        self.engine
            .store()
            .update_step_status(step.id, StepStatus::Retrying)
            .await?;

        debug!(step_id = %step.id, attempts, ?delay, "step will retry");
        Ok(WorkResult::retry_with_error(delay, message))
    }

    /// Entry steps run on the run input; dependent steps run on the merged
    /// outputs of their dependencies (later dependencies win on key
    /// collisions).
    async fn build_input(&self, run: &Run, step: &Step) -> Result<Envelope, EngineError> {
        if step.depends_on.is_empty() {
            return Ok(step.input.clone().unwrap_or_else(|| run.input.clone()));
        }

        let mut input = Envelope::new();
        for dep_id in &step.depends_on {
            let dep = self.engine.step(*dep_id).await?;
            if let Some(output) = dep.output {
                input.merge(output);
            }
        }
        Ok(input)
    }

    async fn handle_complete_run(&self, item: &QueueItem) -> Result<WorkResult, EngineError> {
        let run = self.engine.run(item.run_id).await?;
        if run.status.is_terminal() {
            return Ok(WorkResult::success());
        }

        let output = if run.variables.is_empty() {
            None
        } else {
            Some(run.variables.clone())
        };
        self.engine
            .store()
            .update_run_status(run.id, RunStatus::Completed, output, None)
            .await?;

        debug!(run_id = %run.id, "run completed");
        Ok(WorkResult::success())
    }
}

fn build_steps(run: &Run, graph: &crate::graph::WorkflowGraph) -> Vec<Step> {
    let default_attempts = run
        .retry_policy
        .as_ref()
        .map(|p| p.max_attempts as i32)
        .unwrap_or(3);

    let ids: std::collections::HashMap<&str, Uuid> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Uuid::now_v7()))
        .collect();

    graph
        .nodes
        .iter()
        .enumerate()
        .map(|(number, node)| {
            let mut step = Step::new(run.id, node.id.clone(), node.node_type.clone());
            step.id = ids[node.id.as_str()];
            step.step_number = number as i32;
            step.node_config = node.config.clone();
            step.max_attempts = node.max_attempts.unwrap_or(default_attempts);
            step.depends_on = node
                .depends_on
                .iter()
                .filter_map(|dep| ids.get(dep.as_str()).copied())
                .collect();
            if node.depends_on.is_empty() {
                step.input = Some(run.input.clone());
            }
            step
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, NodeRegistry, NoopNode};
    use crate::graph::{NodeSpec, StaticGraphProvider, WorkflowGraph};
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use crate::retry::RetryPolicy;
    use serde_json::json;

    struct Harness {
        dispatcher: Dispatcher,
        engine: Engine,
        store: Arc<InMemoryWorkflowStore>,
        graphs: Arc<StaticGraphProvider>,
    }

    fn harness(capabilities: Vec<&str>) -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.register(Arc::new(NoopNode));
        let engine = Engine::new(
            store.clone(),
            registry,
            EngineConfig {
                worker_id: "dispatch-test".to_string(),
            },
        );
        let graphs = Arc::new(StaticGraphProvider::new());
        let dispatcher = Dispatcher::new(
            engine.clone(),
            graphs.clone(),
            capabilities.iter().map(|c| c.to_string()).collect(),
        );
        Harness {
            dispatcher,
            engine,
            store,
            graphs,
        }
    }

    fn chain_graph(workflow_id: Uuid) -> WorkflowGraph {
        WorkflowGraph::new(
            workflow_id,
            vec![
                NodeSpec::new("first", "noop"),
                NodeSpec::new("second", "noop").depends_on(&["first"]),
            ],
        )
    }

    async fn claim_one(h: &Harness) -> QueueItem {
        let mut items = h.engine.claim_work("dispatch-test", 1).await.unwrap();
        assert_eq!(items.len(), 1, "expected exactly one claimable item");
        items.remove(0)
    }

    #[tokio::test]
    async fn test_start_run_creates_steps_and_returns_entries() {
        let h = harness(vec!["*"]);
        let workflow_id = Uuid::now_v7();
        h.graphs.insert(chain_graph(workflow_id));

        let run_id = h
            .engine
            .start_run(Run::new(
                workflow_id,
                Envelope::from_value(json!({"order": 7})),
            ))
            .await
            .unwrap();

        let item = claim_one(&h).await;
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(result.success);
        assert_eq!(result.next_steps.len(), 1);

        let run = h.engine.run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.total_steps, 2);

        let steps = h.store.list_steps(run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        let first = steps.iter().find(|s| s.node_id == "first").unwrap();
        let second = steps.iter().find(|s| s.node_id == "second").unwrap();
        assert_eq!(result.next_steps, vec![first.id]);
        assert_eq!(second.depends_on, vec![first.id]);
        assert_eq!(first.input.as_ref().unwrap().get("order"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_start_run_unknown_graph_is_terminal() {
        let h = harness(vec!["*"]);
        h.engine
            .start_run(Run::new(Uuid::now_v7(), Envelope::new()))
            .await
            .unwrap();

        let item = claim_one(&h).await;
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(!result.success);
        assert!(!result.should_retry);
    }

    #[tokio::test]
    async fn test_execute_step_deps_not_ready_requeues() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();

        let a = Step::new(run_id, "a", "noop");
        let mut b = Step::new(run_id, "b", "noop");
        b.depends_on = vec![a.id];
        h.store.insert_steps(&[a.clone(), b.clone()]).await.unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(b.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();

        assert!(result.should_retry);
        assert_eq!(result.retry_delay(), Some(DEPS_RETRY_DELAY));
        // The step was not touched
        assert_eq!(
            h.engine.step(b.id).await.unwrap().status,
            StepStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_execute_step_success_reports_dependents() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::from_value(json!({"k": 1})));
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let mut a = Step::new(run_id, "a", "noop");
        a.input = Some(run.input.clone());
        let mut b = Step::new(run_id, "b", "noop");
        b.depends_on = vec![a.id];
        h.store.insert_steps(&[a.clone(), b.clone()]).await.unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(a.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();

        assert!(result.success);
        assert_eq!(result.next_steps, vec![b.id]);
        assert!(!result.run_completed, "b is still pending");
    }

    #[tokio::test]
    async fn test_last_step_signals_run_completed() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let only = Step::new(run_id, "only", "noop");
        h.store.insert_steps(&[only.clone()]).await.unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(only.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();

        assert!(result.success);
        assert!(result.run_completed);
        assert!(result.next_steps.is_empty());
    }

    #[tokio::test]
    async fn test_dependent_input_is_merged_dependency_outputs() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let a = Step::new(run_id, "a", "noop");
        let b = Step::new(run_id, "b", "noop");
        let mut join = Step::new(run_id, "join", "noop");
        join.depends_on = vec![a.id, b.id];
        h.store
            .insert_steps(&[a.clone(), b.clone(), join.clone()])
            .await
            .unwrap();
        h.store
            .update_step_completed(a.id, Envelope::from_value(json!({"a": 1})))
            .await
            .unwrap();
        h.store
            .update_step_completed(b.id, Envelope::from_value(json!({"b": 2})))
            .await
            .unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(join.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();

        assert!(result.success);
        // Noop echoes its input: the merged dependency outputs
        let output = result.output.unwrap();
        assert_eq!(output.get("a"), Some(&json!(1)));
        assert_eq!(output.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_capability_mismatch_re_releases() {
        let h = harness(vec!["payments"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let step = Step::new(run_id, "a", "noop");
        h.store.insert_steps(&[step.clone()]).await.unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();

        assert!(result.should_retry);
        assert_eq!(result.retry_delay(), Some(CAPABILITY_RETRY_DELAY));
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_exhausts() {
        let h = harness(vec!["*"]);
        let mut run = Run::new(Uuid::now_v7(), Envelope::new());
        run.retry_policy = Some(RetryPolicy::default().with_max_attempts(3));
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        // No implementation registered under this type on purpose would be
        // terminal, so register a failing node instead
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl crate::engine::NodeDefinition for AlwaysFails {
            fn node_type(&self) -> &str {
                "flaky"
            }
            async fn execute(
                &self,
                _ctx: &crate::engine::ExecutionContext,
                _config: &serde_json::Value,
                _input: Envelope,
            ) -> Result<Envelope, crate::engine::NodeError> {
                Err(crate::engine::NodeError::retryable("transient outage"))
            }
        }
        h.engine.registry().register(Arc::new(AlwaysFails));

        let step = Step::new(run_id, "a", "flaky");
        h.store.insert_steps(&[step.clone()]).await.unwrap();

        // Failure 1: retry after 1s
        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(result.should_retry);
        assert_eq!(result.retry_delay(), Some(Duration::from_secs(1)));
        assert_eq!(
            h.engine.step(step.id).await.unwrap().status,
            StepStatus::Retrying
        );

        // Failure 2: retry after 2s
        let item = QueueItem::new(run_id, QueueType::RetryStep, 8).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(result.should_retry);
        assert_eq!(result.retry_delay(), Some(Duration::from_secs(2)));

        // Failure 3: budget exhausted, terminal
        let item = QueueItem::new(run_id, QueueType::RetryStep, 8).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(!result.success);
        assert!(!result.should_retry);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        struct BadConfig;
        #[async_trait::async_trait]
        impl crate::engine::NodeDefinition for BadConfig {
            fn node_type(&self) -> &str {
                "bad"
            }
            async fn execute(
                &self,
                _ctx: &crate::engine::ExecutionContext,
                _config: &serde_json::Value,
                _input: Envelope,
            ) -> Result<Envelope, crate::engine::NodeError> {
                Err(crate::engine::NodeError::non_retryable("config rejected"))
            }
        }
        h.engine.registry().register(Arc::new(BadConfig));

        let step = Step::new(run_id, "a", "bad");
        h.store.insert_steps(&[step.clone()]).await.unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(!result.success);
        assert!(!result.should_retry);
        assert_eq!(result.error.as_deref(), Some("config rejected"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_for_completed_step_is_dropped() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let step = Step::new(run_id, "a", "noop");
        h.store.insert_steps(&[step.clone()]).await.unwrap();
        h.store
            .update_step_completed(step.id, Envelope::new())
            .await
            .unwrap();

        let item = QueueItem::new(run_id, QueueType::ExecuteStep, 5).with_step(step.id);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(result.success);
        assert!(result.next_steps.is_empty());
    }

    #[tokio::test]
    async fn test_complete_run_finalises() {
        let h = harness(vec!["*"]);
        let run = Run::new(Uuid::now_v7(), Envelope::new());
        let run_id = run.id;
        h.store.insert_run(&run).await.unwrap();
        h.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await
            .unwrap();

        let item = QueueItem::new(run_id, QueueType::CompleteRun, 5);
        let result = h.dispatcher.dispatch(&item).await.unwrap();
        assert!(result.success);

        let run = h.engine.run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }
}
