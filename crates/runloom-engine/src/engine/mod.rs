//! Engine: orchestration over the store plus the node-registry seam

mod executor;
mod registry;

pub use executor::{Engine, EngineConfig, EngineError, RecoveryReport};
pub use registry::{
    CancellationHandle, ExecutionContext, NodeDefinition, NodeError, NodeRegistry, NoopNode,
};
