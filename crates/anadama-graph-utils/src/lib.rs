//! Additional utilities to be used with `petgraph`: a dependency-ordered
//! async walker, transitive closures over task graphs, and the cycle
//! checks run at task-registration time.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;

pub use walker::{Start, WalkMessage, Walker, Walking};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected involving `{0}`")]
    CyclicDependency(String),
    #[error("`{0}` depends on itself")]
    SelfDependency(String),
}

/// All nodes reachable from `indices` in the given direction, including
/// the starting nodes themselves. `Outgoing` collects descendants
/// (consumers), `Incoming` collects ancestors (producers).
pub fn transitive_closure<N: Hash + Eq + PartialEq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Whether `to` is reachable from `from`. Used before adding the edge
/// `producer -> consumer`: if the producer is already reachable from the
/// consumer the new edge would close a cycle.
pub fn has_path<N, E>(graph: &Graph<N, E>, from: NodeIndex, to: NodeIndex) -> bool {
    petgraph::algo::has_path_connecting(graph, from, to, None)
}

/// Reject graphs with cycles or self-dependencies, naming an offending
/// node. Registration-time edge checks should make this unreachable; it
/// backstops imported graphs.
pub fn validate_graph<N: Display + Clone + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    petgraph::algo::toposort(graph, None)
        .map(|_| ())
        .map_err(|cycle| {
            let node = graph
                .node_weight(cycle.node_id())
                .expect("cycle node should be present");
            Error::CyclicDependency(node.to_string())
        })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn diamond() -> (Graph<&'static str, ()>, [NodeIndex; 4]) {
        // a -> b -> d, a -> c -> d
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, d, ());
        g.add_edge(c, d, ());
        (g, [a, b, c, d])
    }

    #[test]
    fn closure_follows_direction() {
        let (g, [a, b, _c, d]) = diamond();

        let descendants = transitive_closure(&g, [b], Direction::Outgoing);
        assert_eq!(descendants, ["b", "d"].iter().collect());

        let ancestors = transitive_closure(&g, [d], Direction::Incoming);
        assert_eq!(ancestors.len(), 4);

        let roots = transitive_closure(&g, [a], Direction::Incoming);
        assert_eq!(roots, ["a"].iter().collect());
    }

    #[test]
    fn path_detection() {
        let (g, [a, _b, c, d]) = diamond();
        assert!(has_path(&g, a, d));
        assert!(!has_path(&g, d, a));
        assert!(!has_path(&g, c, a));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());
        g.add_edge(b, a, ());
        assert!(matches!(
            validate_graph(&g),
            Err(Error::CyclicDependency(_))
        ));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        assert!(matches!(validate_graph(&g), Err(Error::SelfDependency(_))));
    }

    #[test]
    fn acyclic_graph_passes() {
        let (g, _) = diamond();
        assert!(validate_graph(&g).is_ok());
    }
}
