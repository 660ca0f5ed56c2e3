//! Compiled-graph registry using ArcSwap
//!
//! Every run needs the workflow's node/edge lists as an indexed graph with a
//! validated trigger root. Compiling is cheap but not free, so compiled graphs
//! are cached per workflow id and reused while `updated_at` is unchanged. The
//! cache map is swapped atomically, readers never block.

use crate::error::EngineError;
use crate::workflow::types::{Node, NodeKind, Workflow};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::{collections::HashMap, sync::Arc};

/// Edge weight: the editor's edge id, its branch handle and its list position
#[derive(Debug, Clone)]
pub struct EdgeRoute {
    pub id: String,
    pub handle: Option<String>,
    /// Index in the workflow's edge list; traversal follows edges in this order
    pub order: usize,
}

/// Workflow graph validated and indexed for traversal
#[derive(Debug)]
pub struct CompiledWorkflow {
    pub workflow_id: String,
    pub updated_at: DateTime<Utc>,
    graph: DiGraph<Node, EdgeRoute>,
    trigger: NodeIndex,
}

impl CompiledWorkflow {
    /// Build the petgraph representation and check structural rules
    ///
    /// - node ids are unique
    /// - there is exactly one trigger node, and nothing points at it
    /// - every edge references known nodes
    ///
    /// Cycles are allowed here; the executor bounds them with a visit budget.
    pub fn compile(workflow: &Workflow) -> Result<Self, EngineError> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        let mut triggers = Vec::new();

        for node in &workflow.nodes {
            if index.contains_key(node.id.as_str()) {
                return Err(EngineError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            let idx = graph.add_node(node.clone());
            index.insert(node.id.as_str(), idx);
            if matches!(node.kind, NodeKind::Trigger) {
                triggers.push(idx);
            }
        }

        let trigger = match triggers.as_slice() {
            [single] => *single,
            [] => {
                return Err(EngineError::InvalidGraph(
                    "workflow has no trigger node".to_string(),
                ))
            }
            many => {
                return Err(EngineError::InvalidGraph(format!(
                    "workflow has {} trigger nodes, expected exactly one",
                    many.len()
                )))
            }
        };

        for (order, edge) in workflow.edges.iter().enumerate() {
            let source = index.get(edge.source.as_str()).ok_or_else(|| {
                EngineError::InvalidGraph(format!(
                    "edge '{}' references unknown source node '{}'",
                    edge.id, edge.source
                ))
            })?;
            let target = index.get(edge.target.as_str()).ok_or_else(|| {
                EngineError::InvalidGraph(format!(
                    "edge '{}' references unknown target node '{}'",
                    edge.id, edge.target
                ))
            })?;
            if *target == trigger {
                return Err(EngineError::InvalidGraph(format!(
                    "edge '{}' points at the trigger node",
                    edge.id
                )));
            }
            graph.add_edge(
                *source,
                *target,
                EdgeRoute {
                    id: edge.id.clone(),
                    handle: edge.source_handle.clone(),
                    order,
                },
            );
        }

        tracing::debug!(
            workflow_id = %workflow.id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "🏗️ Compiled workflow graph"
        );

        Ok(Self {
            workflow_id: workflow.id.clone(),
            updated_at: workflow.updated_at,
            graph,
            trigger,
        })
    }

    pub fn trigger(&self) -> NodeIndex {
        self.trigger
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    /// Outgoing edges of a node in workflow edge-list order
    pub fn outgoing(&self, idx: NodeIndex) -> Vec<(NodeIndex, &EdgeRoute)> {
        let mut edges: Vec<(NodeIndex, &EdgeRoute)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| (edge.target(), edge.weight()))
            .collect();
        edges.sort_by_key(|(_, route)| route.order);
        edges
    }
}

/// Lock-free cache of compiled workflow graphs
#[derive(Debug, Default)]
pub struct GraphRegistry {
    /// Key: workflow id
    graphs: ArcSwap<HashMap<String, Arc<CompiledWorkflow>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self {
            graphs: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Return the cached graph for this revision of the workflow, compiling on a miss
    pub fn get_or_compile(&self, workflow: &Workflow) -> Result<Arc<CompiledWorkflow>, EngineError> {
        if let Some(compiled) = self.graphs.load().get(&workflow.id) {
            if compiled.updated_at == workflow.updated_at {
                return Ok(Arc::clone(compiled));
            }
        }

        let compiled = Arc::new(CompiledWorkflow::compile(workflow)?);

        // Clone current map, insert, swap
        let current = self.graphs.load();
        let mut next = (**current).clone();
        next.insert(workflow.id.clone(), Arc::clone(&compiled));
        self.graphs.store(Arc::new(next));

        Ok(compiled)
    }

    /// Drop a cached graph (after the workflow was saved)
    pub fn invalidate(&self, workflow_id: &str) {
        let current = self.graphs.load();
        if !current.contains_key(workflow_id) {
            return;
        }
        let mut next = (**current).clone();
        next.remove(workflow_id);
        self.graphs.store(Arc::new(next));
        tracing::debug!(workflow_id, "♻️ Invalidated compiled graph");
    }

    pub fn len(&self) -> usize {
        self.graphs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(nodes: serde_json::Value, edges: serde_json::Value) -> Workflow {
        serde_json::from_value(json!({
            "id": "wf-1",
            "workspaceId": "ws-1",
            "name": "test",
            "trigger": "order.created",
            "nodes": nodes,
            "edges": edges,
        }))
        .unwrap()
    }

    #[test]
    fn outgoing_edges_keep_list_order() {
        let wf = workflow(
            json!([
                { "id": "t", "type": "trigger" },
                { "id": "a", "type": "action", "data": { "action": "data.log" } },
                { "id": "b", "type": "action", "data": { "action": "data.log" } },
                { "id": "c", "type": "action", "data": { "action": "data.log" } }
            ]),
            json!([
                { "id": "e1", "source": "t", "target": "b" },
                { "id": "e2", "source": "t", "target": "a" },
                { "id": "e3", "source": "t", "target": "c" }
            ]),
        );
        let compiled = CompiledWorkflow::compile(&wf).unwrap();
        let ids: Vec<&str> = compiled
            .outgoing(compiled.trigger())
            .into_iter()
            .map(|(_, route)| route.id.as_str())
            .collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn rejects_missing_or_duplicate_trigger() {
        let none = workflow(json!([{ "id": "a", "type": "action", "data": {} }]), json!([]));
        assert!(matches!(
            CompiledWorkflow::compile(&none),
            Err(EngineError::InvalidGraph(msg)) if msg.contains("no trigger")
        ));

        let two = workflow(
            json!([{ "id": "t1", "type": "trigger" }, { "id": "t2", "type": "trigger" }]),
            json!([]),
        );
        assert!(CompiledWorkflow::compile(&two).is_err());
    }

    #[test]
    fn rejects_dangling_edges_and_edges_into_trigger() {
        let dangling = workflow(
            json!([{ "id": "t", "type": "trigger" }]),
            json!([{ "id": "e1", "source": "t", "target": "ghost" }]),
        );
        assert!(CompiledWorkflow::compile(&dangling).is_err());

        let into_trigger = workflow(
            json!([{ "id": "t", "type": "trigger" }, { "id": "a", "type": "action", "data": {} }]),
            json!([{ "id": "e1", "source": "a", "target": "t" }]),
        );
        assert!(CompiledWorkflow::compile(&into_trigger).is_err());
    }

    #[test]
    fn cycles_compile() {
        let cyclic = workflow(
            json!([
                { "id": "t", "type": "trigger" },
                { "id": "a", "type": "action", "data": {} },
                { "id": "b", "type": "action", "data": {} }
            ]),
            json!([
                { "id": "e1", "source": "t", "target": "a" },
                { "id": "e2", "source": "a", "target": "b" },
                { "id": "e3", "source": "b", "target": "a" }
            ]),
        );
        assert!(CompiledWorkflow::compile(&cyclic).is_ok());
    }

    #[test]
    fn registry_reuses_graph_until_workflow_changes() {
        let registry = GraphRegistry::new();
        let mut wf = workflow(json!([{ "id": "t", "type": "trigger" }]), json!([]));

        let first = registry.get_or_compile(&wf).unwrap();
        let second = registry.get_or_compile(&wf).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        wf.updated_at = wf.updated_at + chrono::Duration::seconds(1);
        let third = registry.get_or_compile(&wf).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(registry.len(), 1);

        registry.invalidate("wf-1");
        assert!(registry.is_empty());
    }
}
