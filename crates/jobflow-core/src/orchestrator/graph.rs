//! Declared data dependencies between the tasks of one submission
//!
//! Task `j` depends on task `i` when an output of `i` is an input of `j`.

use crate::error::OrchestratorError;
use crate::task::TaskDescriptor;
use jobflow_artifact::ArtifactId;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;

/// Dependency graph over task indices
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraphMap<usize, ()>,
}

impl DependencyGraph {
    /// Build from tasks in declaration order
    #[must_use]
    pub fn build(tasks: &[TaskDescriptor]) -> Self {
        let mut graph = DiGraphMap::new();
        let mut producers: HashMap<&ArtifactId, Vec<usize>> = HashMap::new();

        for (idx, task) in tasks.iter().enumerate() {
            graph.add_node(idx);
            for output in task.outputs() {
                producers.entry(output.id()).or_default().push(idx);
            }
        }

        for (consumer, task) in tasks.iter().enumerate() {
            for input in task.inputs() {
                for &producer in producers.get(input.id()).into_iter().flatten() {
                    graph.add_edge(producer, consumer, ());
                }
            }
        }

        Self { graph }
    }

    /// Reject cycles, including a task reading its own output
    ///
    /// # Errors
    /// `OrchestratorError::CyclicDependency` naming a task on the cycle
    pub fn check_acyclic(&self, tasks: &[TaskDescriptor]) -> Result<(), OrchestratorError> {
        let cyclic = |idx: usize| OrchestratorError::CyclicDependency(tasks[idx].id().clone());

        if let Some((idx, _, _)) = self.graph.all_edges().find(|(from, to, _)| from == to) {
            return Err(cyclic(idx));
        }

        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| cyclic(cycle.node_id()))
    }

    /// Number of dependency edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
