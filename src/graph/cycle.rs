use std::collections::HashMap;
use std::fmt;

use crate::core::ArcStr;
use crate::graph::DependencyGraph;

/// A dependency cycle, reported as the path walked by the detector.
///
/// The first and last element are the same node, so `a -> b -> c -> a`
/// means `b` depends on `a`, `c` on `b` and `a` on `c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub path: Vec<ArcStr>,
}

impl Cycle {
    /// The edge that closed the cycle, as `(dependency, dependent)`.
    pub fn back_edge(&self) -> (&str, &str) {
        let n = self.path.len();
        (&self.path[n - 2], &self.path[n - 1])
    }

    /// Distinct nodes taking part in the cycle.
    pub fn nodes(&self) -> &[ArcStr] {
        &self.path[..self.path.len() - 1]
    }

    pub fn contains(&self, path: &str) -> bool {
        self.path.iter().any(|p| &**p == path)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(node)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Gray,
    Black,
}

/// Cuts the cycle closed by `target` out of the current DFS stack.
pub(crate) fn cycle_from_stack<'g, I>(stack: I, target: &'g ArcStr) -> Cycle
where
    I: IntoIterator<Item = &'g ArcStr>,
{
    let stack: Vec<&ArcStr> = stack.into_iter().collect();
    let start = stack.iter().position(|n| *n == target).unwrap_or(0);

    let mut path: Vec<ArcStr> = stack[start..].iter().map(|n| (*n).clone()).collect();
    path.push(target.clone());

    Cycle { path }
}

/// Looks for a cycle using a depth-first search with white/gray/black coloring.
///
/// Roots are tried in lexical order and every node is entered exactly once,
/// so disconnected components are all covered. The first edge reaching a
/// node still on the DFS stack ends the search.
pub fn find_cycle(graph: &DependencyGraph) -> Option<Cycle> {
    // absent = white
    let mut color: HashMap<&str, Color> = HashMap::with_capacity(graph.len());

    for root in graph.paths() {
        if color.contains_key(&**root) {
            continue;
        }

        color.insert(root, Color::Gray);
        let mut stack = vec![(root, graph.dependents_of(root))];

        while let Some((node, dependents)) = stack.last_mut() {
            let node: &ArcStr = *node;

            match dependents.next() {
                Some(next) => match color.get(&**next) {
                    None => {
                        color.insert(next, Color::Gray);
                        stack.push((next, graph.dependents_of(next)));
                    }
                    Some(Color::Gray) => {
                        let cycle = cycle_from_stack(stack.iter().map(|(n, _)| *n), next);
                        tracing::debug!(%cycle, "Found dependency cycle");
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                },
                None => {
                    color.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::graph_of;
    use proptest::prelude::*;

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        let graph = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["b", "a"]), ("d", &[])]);
        assert_eq!(find_cycle(&graph), None);
    }

    #[test]
    fn test_three_cycle_reports_full_path() {
        // a -> b -> c -> a, as dependency -> dependent
        let graph = graph_of(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let cycle = find_cycle(&graph).expect("cycle");

        assert_eq!(cycle.to_string(), "a -> b -> c -> a");
        assert_eq!(cycle.back_edge(), ("c", "a"));
        assert_eq!(cycle.nodes().len(), 3);
    }

    #[test]
    fn test_cycle_in_second_component() {
        let graph = graph_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]);
        let cycle = find_cycle(&graph).expect("cycle");

        assert!(cycle.contains("x"));
        assert!(cycle.contains("y"));
        assert!(!cycle.contains("a"));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let graph = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert_eq!(find_cycle(&graph), None);
    }

    fn edges_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..10).prop_flat_map(|n| (Just(n), prop::collection::vec((0..n, 0..n), 0..25)))
    }

    fn build(n: usize, edges: &[(usize, usize)]) -> DependencyGraph {
        let names: Vec<String> = (0..n).map(|i| format!("n{i:02}")).collect();
        let spec: Vec<(String, Vec<String>)> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let deps = edges
                    .iter()
                    .filter(|(from, _)| *from == i)
                    .map(|(_, to)| names[*to].clone())
                    .collect();
                (name.clone(), deps)
            })
            .collect();

        let borrowed: Vec<(&str, Vec<&str>)> = spec
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        let borrowed: Vec<(&str, &[&str])> = borrowed
            .iter()
            .map(|(name, deps)| (*name, deps.as_slice()))
            .collect();

        graph_of(&borrowed)
    }

    fn is_cyclic(graph: &DependencyGraph) -> bool {
        let mut oracle = petgraph::graphmap::DiGraphMap::<&str, ()>::new();
        for path in graph.paths() {
            oracle.add_node(path);
        }
        for edge in graph.edges() {
            oracle.add_edge(edge.dependency, edge.dependent, ());
        }
        petgraph::algo::is_cyclic_directed(&oracle)
    }

    proptest! {
        #[test]
        fn prop_cycle_found_iff_not_dag((n, edges) in edges_strategy()) {
            let graph = build(n, &edges);
            let found = find_cycle(&graph);

            prop_assert_eq!(found.is_some(), is_cyclic(&graph));

            if let Some(cycle) = found {
                // every consecutive pair is a real edge
                for pair in cycle.path.windows(2) {
                    let node = graph.node(&pair[0]).unwrap();
                    prop_assert!(node.dependents.contains(&pair[1]));
                }
                prop_assert_eq!(cycle.path.first(), cycle.path.last());
            }
        }

        #[test]
        fn prop_forward_edges_never_cycle((n, edges) in edges_strategy()) {
            // only keep edges to a lower index: always a DAG
            let forward: Vec<_> = edges.into_iter().filter(|(a, b)| b < a).collect();
            let graph = build(n, &forward);
            prop_assert!(find_cycle(&graph).is_none());
        }
    }
}
