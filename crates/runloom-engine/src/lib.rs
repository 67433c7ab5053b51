//! # Runloom Engine
//!
//! A PostgreSQL-backed durable workflow execution engine. Workflows are
//! directed graphs of nodes; runs execute across a pool of stateless
//! workers and survive worker crashes, network partitions, and process
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (start/pause/cancel runs, claim & complete work, recover)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL: workflow_runs, steps, queue, workers)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │  (polls for items, dispatches steps, heartbeats, recovers)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every run, step, queue item, and worker heartbeat is persisted; the
//! work-claim protocol guarantees at-most-one execution per claim via
//! `SELECT ... FOR UPDATE SKIP LOCKED`, and dependency-gated dispatch
//! ensures a step only runs once all of its `depends_on` steps completed.
//!
//! ## Example
//!
//! ```ignore
//! use runloom_engine::prelude::*;
//!
//! let pool = sqlx::PgPool::connect(&dsn).await?;
//! let store = Arc::new(PostgresWorkflowStore::new(pool));
//! store.migrate().await?;
//!
//! let registry = Arc::new(NodeRegistry::new());
//! registry.register(Arc::new(MyNode));
//!
//! let engine = Engine::new(store, registry, EngineConfig::default());
//! let worker = Worker::new(engine.clone(), graphs, WorkerConfig::default());
//! worker.start().await?;
//!
//! let run_id = engine.start_run(Run::new(workflow_id, input)).await?;
//! ```

pub mod engine;
pub mod graph;
pub mod persistence;
pub mod retry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        Engine, EngineConfig, EngineError, ExecutionContext, NodeDefinition, NodeError,
        NodeRegistry, NoopNode, RecoveryReport,
    };
    pub use crate::graph::{GraphProvider, NodeSpec, StaticGraphProvider, WorkflowGraph};
    pub use crate::persistence::{
        Envelope, InMemoryWorkflowStore, PostgresWorkflowStore, QueueItem, QueueType, Run,
        RunStatus, Step, StepStatus, StoreError, WorkResult, WorkerInfo, WorkerStatus,
        WorkflowStore,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
}

// Re-export key types at crate root
pub use engine::{
    Engine, EngineConfig, EngineError, ExecutionContext, NodeDefinition, NodeError, NodeRegistry,
    NoopNode, RecoveryReport,
};
pub use graph::{GraphError, GraphProvider, NodeSpec, StaticGraphProvider, WorkflowGraph};
pub use persistence::{
    Checkpoint, CheckpointType, Envelope, InMemoryWorkflowStore, PostgresWorkflowStore, QueueItem,
    QueueType, Run, RunStatus, Step, StepStatus, StoreError, WorkResult, WorkerInfo, WorkerStatus,
    WorkflowStore,
};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerState};
