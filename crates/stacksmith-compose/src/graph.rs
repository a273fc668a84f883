//! Dependency graph management using `petgraph`.
//!
//! Builds a directed graph from catalog dependency declarations and
//! resolves the merge order with an explicit stack-based depth-first walk.
//! The walk is post-order, so dependencies always precede their dependents,
//! and branch order follows declaration/request order rather than any map
//! iteration order.

use std::collections::HashMap;

use petgraph::graph::{Graph, NodeIndex};

use crate::error::{ComposeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Visiting,
    Done,
}

struct Frame {
    node: NodeIndex,
    deps: Vec<NodeIndex>,
    cursor: usize,
}

/// A dependency graph of catalog entries.
///
/// Nodes referenced only as dependency targets stay undefined until
/// [`add_service`](Self::add_service) is called for them; reaching an
/// undefined node during resolution fails with
/// [`ComposeError::UnknownService`]. This keeps resolution lazy: a dangling
/// reference is only an error when the walk actually needs it.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: Graph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    defined: HashMap<NodeIndex, bool>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.indices.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_owned());
        let _ = self.indices.insert(name.to_owned(), idx);
        let _ = self.defined.insert(idx, false);
        idx
    }

    /// Adds a defined catalog entry node.
    pub fn add_service(&mut self, name: &str) {
        let idx = self.intern(name);
        let _ = self.defined.insert(idx, true);
    }

    /// Adds a dependency edge: `dependent` depends on `dependency`.
    ///
    /// The edge points from the dependent to its dependency; the post-order
    /// walk emits dependencies first.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let from = self.intern(dependent);
        let to = self.intern(dependency);
        let _ = self.graph.add_edge(from, to, ());
    }

    /// Dependencies of a node in declaration order.
    ///
    /// `petgraph` iterates neighbors most-recently-added first, so the
    /// collected list is reversed back to insertion order.
    fn dependencies_of(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        deps.reverse();
        deps
    }

    fn name_of(&self, node: NodeIndex) -> String {
        self.graph
            .node_weight(node)
            .cloned()
            .unwrap_or_default()
    }

    fn check_defined(&self, node: NodeIndex) -> Result<()> {
        if self.defined.get(&node).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(ComposeError::UnknownService {
                name: self.name_of(node),
            })
        }
    }

    fn cycle_path(&self, stack: &[Frame], reentered: NodeIndex) -> Vec<String> {
        let start = stack
            .iter()
            .position(|frame| frame.node == reentered)
            .unwrap_or(0);
        let mut path: Vec<String> = stack[start..]
            .iter()
            .map(|frame| self.name_of(frame.node))
            .collect();
        path.push(self.name_of(reentered));
        path
    }

    /// Resolves the dependency-closed merge order for the requested roots.
    ///
    /// Post-order depth-first walk with a visiting/visited tri-state per
    /// node: every root and transitive dependency appears exactly once,
    /// dependencies precede dependents, and branch order follows the
    /// first-encountered order of the request list.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownService`] when a root or a traversed
    /// dependency is undefined, and [`ComposeError::CyclicDependency`] with
    /// the full cycle path when the walk re-enters an in-progress node.
    pub fn resolution_order(&self, roots: &[String]) -> Result<Vec<String>> {
        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        let mut order = Vec::new();

        for root in roots {
            let &start = self
                .indices
                .get(root)
                .ok_or_else(|| ComposeError::UnknownService { name: root.clone() })?;
            if marks.get(&start) == Some(&Mark::Done) {
                continue;
            }
            self.check_defined(start)?;

            let mut stack = vec![Frame {
                node: start,
                deps: self.dependencies_of(start),
                cursor: 0,
            }];
            let _ = marks.insert(start, Mark::Visiting);

            while let Some(frame) = stack.last_mut() {
                if frame.cursor < frame.deps.len() {
                    let next = frame.deps[frame.cursor];
                    frame.cursor += 1;
                    match marks.get(&next).copied().unwrap_or(Mark::New) {
                        Mark::Done => {}
                        Mark::Visiting => {
                            return Err(ComposeError::CyclicDependency {
                                path: self.cycle_path(&stack, next),
                            });
                        }
                        Mark::New => {
                            self.check_defined(next)?;
                            let _ = marks.insert(next, Mark::Visiting);
                            stack.push(Frame {
                                node: next,
                                deps: self.dependencies_of(next),
                                cursor: 0,
                            });
                        }
                    }
                } else {
                    let node = frame.node;
                    let _ = marks.insert(node, Mark::Done);
                    order.push(self.name_of(node));
                    let _ = stack.pop();
                }
            }
        }

        Ok(order)
    }
}
