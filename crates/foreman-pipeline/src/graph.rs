//! Dependency graph and scheduler.
//!
//! Builds an adjacency structure from a workflow's effective nodes and edges
//! and produces one deterministic execution order with Kahn's algorithm.
//! Ready nodes are taken in insertion order and successors are visited in
//! edge insertion order, so the same definition always yields the same
//! order. Nothing here executes anything.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::definition::Workflow;
use crate::error::{PipelineError, Result};

/// Node ids plus adjacency, indexed by insertion position.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build the graph of a workflow (either form).
    pub fn build(workflow: &Workflow) -> Result<Self> {
        let nodes = workflow.resolved_nodes().into_iter().map(|n| n.id);
        let edges = workflow
            .resolved_edges()
            .into_iter()
            .map(|e| (e.source, e.target));
        Self::from_parts(nodes, edges)
    }

    /// Build a graph from raw node ids and `(source, target)` edges.
    ///
    /// Duplicate edges are counted once. Edges naming unknown nodes and
    /// duplicate node ids are validation errors.
    pub fn from_parts<N, E>(nodes: N, edges: E) -> Result<Self>
    where
        N: IntoIterator<Item = String>,
        E: IntoIterator<Item = (String, String)>,
    {
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        };

        for id in nodes {
            if graph.index.contains_key(&id) {
                return Err(PipelineError::Validation(format!("Duplicate node id: {id}")));
            }
            graph.index.insert(id.clone(), graph.nodes.len());
            graph.nodes.push(id);
            graph.successors.push(Vec::new());
            graph.predecessors.push(Vec::new());
        }

        let mut seen = HashSet::new();
        for (source, target) in edges {
            let from = graph.position(&source).ok_or_else(|| {
                PipelineError::Validation(format!("Edge references unknown node '{source}'"))
            })?;
            let to = graph.position(&target).ok_or_else(|| {
                PipelineError::Validation(format!("Edge references unknown node '{target}'"))
            })?;
            if seen.insert((from, to)) {
                graph.successors[from].push(to);
                graph.predecessors[to].push(from);
            }
        }

        Ok(graph)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of `id`, in edge insertion order.
    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.position(id)
            .map(|i| {
                self.predecessors[i]
                    .iter()
                    .map(|&p| self.nodes[p].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of `id`, in edge insertion order.
    pub fn successors(&self, id: &str) -> Vec<String> {
        self.position(id)
            .map(|i| {
                self.successors[i]
                    .iter()
                    .map(|&s| self.nodes[s].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One valid execution order, or `CycleDetected` naming every node that
    /// never reached in-degree zero.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_front() {
            order.push(self.nodes[node].clone());
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() < self.nodes.len() {
            let nodes = (0..self.nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].clone())
                .collect();
            return Err(PipelineError::CycleDetected { nodes });
        }

        Ok(order)
    }

    /// Every transitive dependency of `id`.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        self.walk(id, &self.predecessors)
    }

    /// Every transitive dependent of `id`.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        self.walk(id, &self.successors)
    }

    fn walk(&self, id: &str, adjacency: &[Vec<usize>]) -> HashSet<String> {
        let mut found = HashSet::new();
        let Some(start) = self.position(id) else {
            return found;
        };
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            for &next in &adjacency[node] {
                if visited.insert(next) {
                    found.insert(self.nodes[next].clone());
                    stack.push(next);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> Result<ExecutionGraph> {
        ExecutionGraph::from_parts(
            nodes.iter().map(|n| n.to_string()),
            edges.iter().map(|(s, t)| (s.to_string(), t.to_string())),
        )
    }

    fn assert_respects_edges(order: &[String], edges: &[(&str, &str)]) {
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        for (s, t) in edges {
            assert!(pos(s) < pos(t), "{s} must precede {t} in {order:?}");
        }
    }

    #[test]
    fn test_linear_chain() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_order_is_stable() {
        let edges = [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")];
        let g = graph(&["a", "b", "c", "d"], &edges).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_respects_edges(&order, &edges);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let g = graph(&["z", "y", "x"], &[]).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["z", "y", "x"]);

        let g = graph(&["root", "late", "early"], &[("root", "early"), ("root", "late")]).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["root", "early", "late"]);
    }

    #[test]
    fn test_reverse_declared_edges() {
        let edges = [("c", "b"), ("b", "a")];
        let g = graph(&["a", "b", "c"], &edges).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_cycle_names_unreducible_nodes() {
        let g = graph(
            &["start", "b", "c", "after"],
            &[("start", "b"), ("b", "c"), ("c", "b"), ("c", "after")],
        )
        .unwrap();
        match g.topological_order() {
            Err(PipelineError::CycleDetected { nodes }) => {
                assert_eq!(nodes, vec!["b", "c", "after"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let g = graph(&["a"], &[("a", "a")]).unwrap();
        assert!(matches!(
            g.topological_order(),
            Err(PipelineError::CycleDetected { nodes }) if nodes == vec!["a"]
        ));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let g = graph(&["a", "b"], &[("a", "b"), ("a", "b")]).unwrap();
        assert_eq!(g.predecessors("b"), vec!["a"]);
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let err = graph(&["a"], &[("a", "missing")]).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let g = graph(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "c"), ("d", "c"), ("a", "e")],
        )
        .unwrap();
        let ancestors = g.ancestors("c");
        assert_eq!(ancestors.len(), 3);
        assert!(ancestors.contains("a") && ancestors.contains("b") && ancestors.contains("d"));
        assert!(!ancestors.contains("e"));

        let descendants = g.descendants("a");
        assert_eq!(descendants.len(), 3);
        assert!(descendants.contains("e"));
        assert!(g.ancestors("a").is_empty());
        assert!(g.ancestors("unknown").is_empty());
    }

    #[test]
    fn test_build_from_legacy_steps_keeps_input_order() {
        let ids = ["s5", "s1", "s4", "s2", "s3"];
        let mut wf = Workflow::new("w", "w");
        for id in ids {
            wf = wf.with_step(id, "shell", json!({}));
        }
        let order = ExecutionGraph::build(&wf).unwrap().topological_order().unwrap();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_order_is_deterministic_across_builds() {
        let wf = Workflow::new("w", "w")
            .with_node("fetch", "http", json!({}))
            .with_node("parse", "shell", json!({}))
            .with_node("audit", "shell", json!({}))
            .with_node("store", "shell", json!({}))
            .with_edge("fetch", "parse")
            .with_edge("fetch", "audit")
            .with_edge("parse", "store")
            .with_edge("audit", "store");
        let first = ExecutionGraph::build(&wf).unwrap().topological_order().unwrap();
        for _ in 0..10 {
            let again = ExecutionGraph::build(&wf).unwrap().topological_order().unwrap();
            assert_eq!(first, again);
        }
    }
}
