use std::collections::HashMap;

use crate::core::ArcStr;
use crate::error::CycleError;
use crate::graph::DependencyGraph;
use crate::graph::cycle::{Color, cycle_from_stack};

/// A build order in which every file comes after all of its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    order: Vec<ArcStr>,
    index: HashMap<ArcStr, usize>,
}

impl Ordering {
    pub fn as_slice(&self) -> &[ArcStr] {
        &self.order
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ArcStr> {
        self.order.iter()
    }

    pub fn position(&self, path: &str) -> Option<usize> {
        self.index.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Computes a topological order by depth-first postorder.
///
/// Roots and dependents are entered in reverse lexical order, so reversing
/// the postorder leaves independent files in lexical order and the output is
/// the same on every run. Meeting a node which is still in progress means the
/// graph has a cycle; the sort then fails instead of returning a partial
/// order.
pub fn sort(graph: &DependencyGraph) -> Result<Ordering, CycleError> {
    let mut color: HashMap<&str, Color> = HashMap::with_capacity(graph.len());
    let mut postorder: Vec<&ArcStr> = Vec::with_capacity(graph.len());

    for root in graph.paths().rev() {
        if color.contains_key(&**root) {
            continue;
        }

        color.insert(root, Color::Gray);
        let mut stack = vec![(root, graph.dependents_of(root).rev())];

        while let Some((node, dependents)) = stack.last_mut() {
            let node: &ArcStr = *node;

            match dependents.next() {
                Some(next) => match color.get(&**next) {
                    None => {
                        color.insert(next, Color::Gray);
                        stack.push((next, graph.dependents_of(next).rev()));
                    }
                    Some(Color::Gray) => {
                        let cycle = cycle_from_stack(stack.iter().map(|(n, _)| *n), next);
                        return Err(CycleError(cycle));
                    }
                    Some(Color::Black) => {}
                },
                None => {
                    color.insert(node, Color::Black);
                    postorder.push(node);
                    stack.pop();
                }
            }
        }
    }

    let order: Vec<ArcStr> = postorder.into_iter().rev().cloned().collect();
    let index = order
        .iter()
        .enumerate()
        .map(|(i, path)| (path.clone(), i))
        .collect();

    Ok(Ordering { order, index })
}
