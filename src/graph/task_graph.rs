//! Two-phase task graph: a fixed head (producer, partition, consumer) built
//! up front, and a worker layer materialized later from the sealed plan.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::core::errors::{FanoutError, Result};
use crate::partition::PlanRecord;

/// Role of a node in the fan-out graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    Producer,
    Partition,
    Worker(usize),
    Consumer,
}

impl TaskKind {
    pub fn node_id(&self) -> String {
        match self {
            TaskKind::Producer => "collect".to_string(),
            TaskKind::Partition => "partition".to_string(),
            TaskKind::Worker(index) => format!("worker_{}", index),
            TaskKind::Consumer => "consume".to_string(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.node_id())
    }
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<TaskKind, ()>,
    indices: HashMap<TaskKind, NodeIndex>,
    partition: NodeIndex,
    consumer: NodeIndex,
    task_count: Option<usize>,
}

impl TaskGraph {
    /// Planning-phase graph: producer -> partition -> consumer, no workers yet
    ///
    /// The partition -> consumer edge keeps the consumer ordered after the
    /// partition even when the plan has zero workers.
    pub fn plan_phase() -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let producer = graph.add_node(TaskKind::Producer);
        let partition = graph.add_node(TaskKind::Partition);
        let consumer = graph.add_node(TaskKind::Consumer);
        indices.insert(TaskKind::Producer, producer);
        indices.insert(TaskKind::Partition, partition);
        indices.insert(TaskKind::Consumer, consumer);
        graph.add_edge(producer, partition, ());
        graph.add_edge(partition, consumer, ());

        Self {
            graph,
            indices,
            partition,
            consumer,
            task_count: None,
        }
    }

    /// Add one worker per planned task, each between partition and consumer
    ///
    /// Only a sealed plan can be materialized, and only once; materializing
    /// the same count again is a no-op.
    pub fn materialize(&mut self, plan: &PlanRecord) -> Result<()> {
        if !plan.sealed {
            return Err(FanoutError::InvalidGraph(
                "cannot materialize workers from an unsealed plan".to_string(),
            ));
        }
        match self.task_count {
            Some(existing) if existing == plan.task_count => return Ok(()),
            Some(existing) => {
                return Err(FanoutError::InvalidGraph(format!(
                    "graph already materialized with {} workers, plan has {}",
                    existing, plan.task_count
                )))
            }
            None => {}
        }

        for index in 0..plan.task_count {
            let kind = TaskKind::Worker(index);
            let node = self.graph.add_node(kind);
            self.indices.insert(kind, node);
            self.graph.add_edge(self.partition, node, ());
            self.graph.add_edge(node, self.consumer, ());
        }
        self.task_count = Some(plan.task_count);
        self.validate()?;

        debug!(workers = plan.task_count, nodes = self.graph.node_count(), "Materialized task graph");
        Ok(())
    }

    pub fn is_materialized(&self) -> bool {
        self.task_count.is_some()
    }

    /// Number of worker nodes, once materialized
    pub fn task_count(&self) -> Option<usize> {
        self.task_count
    }

    /// Worker kinds in index order
    pub fn workers(&self) -> Vec<TaskKind> {
        (0..self.task_count.unwrap_or(0)).map(TaskKind::Worker).collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.indices.contains_key(kind)
    }

    pub fn validate(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(FanoutError::InvalidGraph("task graph contains a cycle".to_string()));
        }
        Ok(())
    }

    /// Direct upstream tasks of `kind`, sorted
    pub fn dependencies_of(&self, kind: &TaskKind) -> Vec<TaskKind> {
        let Some(&node) = self.indices.get(kind) else {
            return Vec::new();
        };
        let mut kinds: Vec<TaskKind> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        kinds.sort();
        kinds
    }

    /// A valid execution order of every node
    pub fn topological_order(&self) -> Vec<TaskKind> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = topo.next(&self.graph) {
            order.push(self.graph[node]);
        }
        order
    }

    /// Graphviz rendering of the graph
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph FanoutRun {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5, ranksep=1.0];\n");
        dot.push_str("  node [shape=box, style=rounded, fontname=\"Helvetica\"];\n\n");

        let mut nodes: Vec<TaskKind> = self.graph.node_weights().copied().collect();
        nodes.sort();
        for kind in &nodes {
            dot.push_str(&format!("  \"{}\";\n", kind));
        }
        dot.push('\n');

        let mut edges: Vec<(TaskKind, TaskKind)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from], self.graph[to]))
            .collect();
        edges.sort();
        for (from, to) in edges {
            dot.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
        }
        dot.push_str("}\n");
        dot
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::plan_phase()
    }
}
