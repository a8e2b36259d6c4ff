//! Dependency graph over a feature's work units.
//!
//! Validation is a pure function run before any readiness computation: an
//! invalid graph (self-dependency, unknown reference, cycle) is rejected as
//! a whole; there is no partial scheduling on a broken graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use uuid::Uuid;

use crate::models::{Lane, WorkUnit};

/// Why a declared dependency graph is invalid.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
pub enum GraphError {
    #[error("unit {unit} depends on itself")]
    SelfDependency { unit: Uuid },

    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: Uuid, dependency: Uuid },

    /// The specific edges participating in the cycle, in walk order.
    #[error("dependency cycle: {}", format_cycle(edges))]
    Cycle { edges: Vec<(Uuid, Uuid)> },
}

impl GraphError {
    pub fn detail(&self) -> serde_json::Value {
        match self {
            Self::SelfDependency { unit } => {
                serde_json::json!({ "kind": "self_dependency", "unit_id": unit })
            }
            Self::UnknownDependency { unit, dependency } => serde_json::json!({
                "kind": "unknown_dependency",
                "unit_id": unit,
                "dependency": dependency,
            }),
            Self::Cycle { edges } => serde_json::json!({
                "kind": "cycle",
                "edges": edges
                    .iter()
                    .map(|(from, to)| serde_json::json!({ "from": from, "to": to }))
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

fn format_cycle(edges: &[(Uuid, Uuid)]) -> String {
    edges
        .iter()
        .map(|(from, to)| format!("{from} → {to}"))
        .collect::<Vec<_>>()
        .join(", ")
}

struct Node {
    lane: Lane,
    held: bool,
    depends_on: Vec<Uuid>,
}

/// Immutable view of one feature's dependency structure.
///
/// Keyed on `BTreeMap` so every traversal order is deterministic: queries
/// return the same answer no matter which workspace computed them.
pub struct DependencyGraph {
    nodes: BTreeMap<Uuid, Node>,
}

impl DependencyGraph {
    pub fn build(units: &[WorkUnit]) -> Self {
        let nodes = units
            .iter()
            .map(|u| {
                (
                    u.id,
                    Node {
                        lane: u.lane,
                        held: u.hold.is_some(),
                        depends_on: u.depends_on.clone(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    /// Validate the graph and return a topological order.
    ///
    /// Detects self-dependencies, references to unknown units, and cycles.
    /// A cycle is reported as its participating edge set, not just "cycle
    /// found". Ties in the order are broken by unit id so the result is
    /// stable across processes.
    pub fn validate(&self) -> Result<Vec<Uuid>, GraphError> {
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                if dep == id {
                    return Err(GraphError::SelfDependency { unit: *id });
                }
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        unit: *id,
                        dependency: *dep,
                    });
                }
            }
        }

        // Iterative DFS, three-color. A back edge onto the active stack
        // yields the cycle's edge list straight off the stack slice.
        let mut state: BTreeMap<Uuid, Color> =
            self.nodes.keys().map(|id| (*id, Color::White)).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<Uuid> = Vec::new();

        for start in self.nodes.keys() {
            if state[start] != Color::White {
                continue;
            }
            self.dfs(*start, &mut state, &mut stack, &mut order)?;
        }

        // Edges point at dependencies, so DFS postorder already lists every
        // dependency before its dependents.
        Ok(order)
    }

    fn dfs(
        &self,
        start: Uuid,
        state: &mut BTreeMap<Uuid, Color>,
        stack: &mut Vec<Uuid>,
        order: &mut Vec<Uuid>,
    ) -> Result<(), GraphError> {
        // Frames carry an index into the dependency list so the walk is
        // iterative; unit graphs are small, but recursion depth should not
        // depend on authoring style.
        let mut frames: Vec<(Uuid, usize)> = vec![(start, 0)];
        state.insert(start, Color::Gray);
        stack.push(start);

        while let Some((id, next_dep)) = frames.pop() {
            let deps = &self.nodes[&id].depends_on;
            if next_dep < deps.len() {
                frames.push((id, next_dep + 1));
                let dep = deps[next_dep];
                match state[&dep] {
                    Color::White => {
                        state.insert(dep, Color::Gray);
                        stack.push(dep);
                        frames.push((dep, 0));
                    }
                    Color::Gray => {
                        let from = stack
                            .iter()
                            .position(|s| *s == dep)
                            .expect("gray node is on the stack");
                        let mut edges: Vec<(Uuid, Uuid)> = stack[from..]
                            .windows(2)
                            .map(|w| (w[0], w[1]))
                            .collect();
                        edges.push((id, dep));
                        return Err(GraphError::Cycle { edges });
                    }
                    Color::Black => {}
                }
            } else {
                state.insert(id, Color::Black);
                stack.pop();
                order.push(id);
            }
        }
        Ok(())
    }

    /// Units currently in `planned`, not held, whose dependencies are all
    /// `done`.
    pub fn ready(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.lane == Lane::Planned && !node.held)
            .filter(|(_, node)| {
                node.depends_on
                    .iter()
                    .all(|dep| self.nodes.get(dep).is_some_and(|d| d.lane == Lane::Done))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Total order consistent with dependencies; used for display and for
    /// sequencing merge operations.
    pub fn topological_order(&self) -> Result<Vec<Uuid>, GraphError> {
        self.validate()
    }

    /// Units unreachable from any dependency-free root. Signals a likely
    /// authoring error (e.g. all dependencies unknown) rather than a hard
    /// failure.
    pub fn orphans(&self) -> Vec<Uuid> {
        let roots: Vec<Uuid> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.depends_on.is_empty())
            .map(|(id, _)| *id)
            .collect();

        // Reverse-edge BFS: a unit is reachable if some dependency chain
        // bottoms out in a root.
        let mut dependents: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                dependents.entry(*dep).or_default().push(*id);
            }
        }

        let mut reachable: BTreeSet<Uuid> = roots.iter().copied().collect();
        let mut queue: VecDeque<Uuid> = roots.into();
        while let Some(id) = queue.pop_front() {
            for dependent in dependents.get(&id).into_iter().flatten() {
                if reachable.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }

        self.nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect()
    }

    /// Dependencies of `unit` that are not yet `done`, with their current
    /// lane, the material for a guard-violation message.
    pub fn unmet_dependencies(&self, unit: Uuid) -> Vec<(Uuid, Lane)> {
        let Some(node) = self.nodes.get(&unit) else {
            return Vec::new();
        };
        node.depends_on
            .iter()
            .filter_map(|dep| {
                let lane = self.nodes.get(dep).map(|d| d.lane)?;
                (lane != Lane::Done).then_some((*dep, lane))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}
