use super::definition::{validate_slug, StepSpec, WorkflowDefinition};
use crate::error::DefinitionError;
use crate::types::StepSlug;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Validated DAG view of a workflow definition.
///
/// Only used at registration and run initialization; at run time the edges
/// live on as per-step counters in the state store.
pub struct WorkflowDag {
    graph: DiGraph<StepSpec, ()>,
    step_indices: HashMap<StepSlug, NodeIndex>,
}

impl WorkflowDag {
    /// Build and validate a DAG from a workflow definition
    pub fn from_definition(workflow: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        validate_slug(workflow.slug.as_str())?;
        if workflow.steps.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        // Add all steps as nodes
        for step in &workflow.steps {
            step.validate()?;
            if step_indices.contains_key(&step.slug) {
                return Err(DefinitionError::DuplicateStep(step.slug.0.clone()));
            }
            let node = graph.add_node(step.clone());
            step_indices.insert(step.slug.clone(), node);
        }

        // Edge from dependency to dependent (dep -> step)
        for step in &workflow.steps {
            let step_idx = step_indices[&step.slug];
            for dep in &step.depends_on {
                let dep_idx = step_indices.get(dep).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        step: step.slug.0.clone(),
                        dependency: dep.0.clone(),
                    }
                })?;
                graph.add_edge(*dep_idx, step_idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(DefinitionError::Cycle);
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    /// Steps that depend directly on the given step, in definition order
    pub fn dependents(&self, slug: &StepSlug) -> Vec<StepSlug> {
        let Some(node) = self.step_indices.get(slug) else {
            return Vec::new();
        };

        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(*node, Direction::Outgoing)
            .collect();
        deps.sort();
        deps.into_iter()
            .map(|n| self.graph[n].slug.clone())
            .collect()
    }

    /// Number of incoming edges, i.e. the initial `remaining_deps`
    pub fn dependency_count(&self, slug: &StepSlug) -> u32 {
        self.step_indices
            .get(slug)
            .map(|node| {
                self.graph
                    .neighbors_directed(*node, Direction::Incoming)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Steps with no dependencies, in definition order. These are activated
    /// when a run starts.
    pub fn entry_steps(&self) -> Vec<&StepSpec> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| &self.graph[n])
            .collect()
    }
}
