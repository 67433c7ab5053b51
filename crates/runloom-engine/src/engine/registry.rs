//! Node registry: the seam between the engine and per-node business logic
//!
//! Node implementations live outside the engine. They are registered under a
//! string `node_type` and looked up once per execution; everything crossing
//! the seam is an opaque envelope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::persistence::Envelope;

/// Error returned by node execution
///
/// Nodes flag whether a failure is worth retrying; the retry policy has the
/// final word on whether a retry actually happens.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
    pub retryable: bool,
}

impl NodeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Context provided to a node during execution
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ExecutionContext, config: &Value, input: Envelope)
///     -> Result<Envelope, NodeError>
/// {
///     for chunk in chunks {
///         if ctx.is_cancelled() {
///             return Err(NodeError::retryable("cancelled"));
///         }
///         process(chunk).await?;
///     }
///     Ok(output)
/// }
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub node_id: String,
    /// Current attempt number (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
    /// Run-scoped variables, mutable between steps
    pub variables: Envelope,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        step_id: Uuid,
        node_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        variables: Envelope,
    ) -> Self {
        Self {
            run_id,
            step_id,
            node_id: node_id.into(),
            attempt,
            max_attempts,
            variables,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a handle that can cancel this execution
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an in-flight node execution
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// A node implementation, registered under its `node_type`
#[async_trait]
pub trait NodeDefinition: Send + Sync + 'static {
    /// Registry key this node is looked up by
    fn node_type(&self) -> &str;

    /// Execute the node against its config and input envelope
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<Envelope, NodeError>;
}

/// Registry mapping node types to implementations
///
/// Shared via `Arc`; registration is expected at startup but is safe at any
/// time.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<dyn NodeDefinition>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<dyn NodeDefinition>) {
        let node_type = node.node_type().to_string();
        tracing::info!(%node_type, "registered node type");
        self.nodes.write().insert(node_type, node);
    }

    pub fn find(&self, node_type: &str) -> Option<Arc<dyn NodeDefinition>> {
        self.nodes.read().get(node_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }
}

/// Pass-through node: echoes its input envelope. Useful as a placeholder in
/// graphs and in tests.
pub struct NoopNode;

#[async_trait]
impl NodeDefinition for NoopNode {
    fn node_type(&self) -> &str {
        "noop"
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        input: Envelope,
    ) -> Result<Envelope, NodeError> {
        Ok(input)
    }
}
