//! Workflow graphs and the provider seam
//!
//! Graph authoring lives outside the engine; the worker only needs to
//! resolve a workflow id to a dependency graph when it dispatches a
//! `start_run` item. `StaticGraphProvider` covers tests and embedded use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Graph resolution error
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("workflow graph not found: {0}")]
    NotFound(Uuid),

    #[error("invalid workflow graph: {0}")]
    Invalid(String),
}

/// One node in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id, unique within the graph
    pub id: String,

    /// Registry key of the node implementation
    pub node_type: String,

    /// Opaque per-node configuration
    #[serde(default = "empty_object")]
    pub config: Value,

    /// Node ids that must complete before this node runs
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Overrides the run-level retry budget for this node
    pub max_attempts: Option<i32>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: empty_object(),
            depends_on: vec![],
            max_attempts: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A directed graph of nodes with dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub workflow_id: Uuid,
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowGraph {
    pub fn new(workflow_id: Uuid, nodes: Vec<NodeSpec>) -> Self {
        Self { workflow_id, nodes }
    }

    /// Nodes with no dependencies; where a run begins
    pub fn entry_nodes(&self) -> Vec<&NodeSpec> {
        self.nodes.iter().filter(|n| n.depends_on.is_empty()).collect()
    }

    /// Reject duplicate ids, dangling dependency references, and cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::Invalid(format!("duplicate node id: {}", node.id)));
            }
        }

        for node in &self.nodes {
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(GraphError::Invalid(format!(
                        "node {} depends on unknown node {dep}",
                        node.id
                    )));
                }
            }
        }

        // Kahn's algorithm; leftover nodes mean a cycle
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = ready.pop() {
            visited += 1;
            for node in &self.nodes {
                if node.depends_on.iter().any(|d| d == id) {
                    if let Some(degree) = in_degree.get_mut(node.id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(node.id.as_str());
                        }
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(GraphError::Invalid("dependency cycle detected".to_string()));
        }
        Ok(())
    }
}

/// Resolves a workflow id to its graph
#[async_trait]
pub trait GraphProvider: Send + Sync + 'static {
    async fn graph(
        &self,
        workflow_id: Uuid,
        workflow_version_id: Option<Uuid>,
    ) -> Result<WorkflowGraph, GraphError>;
}

/// In-memory graph provider for tests and embedded deployments
#[derive(Default)]
pub struct StaticGraphProvider {
    graphs: RwLock<HashMap<Uuid, WorkflowGraph>>,
}

impl StaticGraphProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: WorkflowGraph) {
        self.graphs.write().insert(graph.workflow_id, graph);
    }
}

#[async_trait]
impl GraphProvider for StaticGraphProvider {
    async fn graph(
        &self,
        workflow_id: Uuid,
        _workflow_version_id: Option<Uuid>,
    ) -> Result<WorkflowGraph, GraphError> {
        self.graphs
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(GraphError::NotFound(workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowGraph {
        WorkflowGraph::new(
            Uuid::now_v7(),
            vec![
                NodeSpec::new("a", "noop"),
                NodeSpec::new("b", "noop").depends_on(&["a"]),
                NodeSpec::new("c", "noop").depends_on(&["a"]),
                NodeSpec::new("d", "noop").depends_on(&["b", "c"]),
            ],
        )
    }

    #[test]
    fn test_entry_nodes() {
        let graph = diamond();
        let entries: Vec<&str> = graph.entry_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(entries, vec!["a"]);
    }

    #[test]
    fn test_validate_accepts_diamond() {
        assert!(diamond().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let graph = WorkflowGraph::new(
            Uuid::now_v7(),
            vec![NodeSpec::new("a", "noop"), NodeSpec::new("a", "noop")],
        );
        assert!(matches!(graph.validate(), Err(GraphError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_dangling_dependency() {
        let graph = WorkflowGraph::new(
            Uuid::now_v7(),
            vec![NodeSpec::new("a", "noop").depends_on(&["ghost"])],
        );
        assert!(matches!(graph.validate(), Err(GraphError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let graph = WorkflowGraph::new(
            Uuid::now_v7(),
            vec![
                NodeSpec::new("a", "noop").depends_on(&["b"]),
                NodeSpec::new("b", "noop").depends_on(&["a"]),
            ],
        );
        assert!(matches!(graph.validate(), Err(GraphError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticGraphProvider::new();
        let graph = diamond();
        let workflow_id = graph.workflow_id;
        provider.insert(graph);

        assert!(provider.graph(workflow_id, None).await.is_ok());
        assert!(matches!(
            provider.graph(Uuid::now_v7(), None).await,
            Err(GraphError::NotFound(_))
        ));
    }
}
