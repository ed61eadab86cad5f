// SPDX-License-Identifier: MIT OR Apache-2.0

//! Graph functions for reachability and closure computation over group and item hierarchies.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use tessera_store::Timestamp;

/// Return `true` if a directed path exists in the graph between `from` and `to`.
///
/// Every node has a (trivial) path to itself.
pub fn has_path<N, E>(graph: &DiGraphMap<N, E>, from: N, to: N) -> bool
where
    N: Copy + Ord + Hash,
{
    if from == to {
        return true;
    }

    if !graph.contains_node(from) {
        return false;
    }

    let mut dfs = Dfs::new(graph, from);
    while let Some(node) = dfs.next(graph) {
        if node == to {
            return true;
        }
    }
    false
}

/// Expiry of a closure entry, `None` meaning it never expires.
///
/// Ordered so that a later expiry is "wider" than an earlier one and `None` is the widest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Reach {
    Until(Timestamp),
    Forever,
}

impl From<Option<Timestamp>> for Reach {
    fn from(value: Option<Timestamp>) -> Self {
        match value {
            Some(timestamp) => Reach::Until(timestamp),
            None => Reach::Forever,
        }
    }
}

impl From<Reach> for Option<Timestamp> {
    fn from(value: Reach) -> Self {
        match value {
            Reach::Until(timestamp) => Some(timestamp),
            Reach::Forever => None,
        }
    }
}

/// Computes every node reachable from `source` together with the expiry of the reachability.
///
/// A path expires at the earliest expiry of its edges, the entry for a reachable node carries the
/// latest expiry across all paths leading to it. The source itself is always included and never
/// expires.
///
/// Implemented as a worklist walk which only re-visits a node when a wider path to it was found,
/// which terminates on any graph since expiries only ever grow and are bounded.
pub fn reachable_with_expiry<N>(
    graph: &DiGraphMap<N, Option<Timestamp>>,
    source: N,
) -> BTreeMap<N, Option<Timestamp>>
where
    N: Copy + Ord + Hash,
{
    let mut best: HashMap<N, Reach> = HashMap::new();
    best.insert(source, Reach::Forever);

    let mut queue = VecDeque::from([source]);
    while let Some(node) = queue.pop_front() {
        if !graph.contains_node(node) {
            continue;
        }

        let reach = best[&node];
        for (_, next, expires_at) in graph.edges(node) {
            let candidate = reach.min(Reach::from(*expires_at));
            let improved = match best.get(&next) {
                Some(current) => candidate > *current,
                None => true,
            };
            if improved {
                best.insert(next, candidate);
                queue.push_back(next);
            }
        }
    }

    best.into_iter()
        .map(|(node, reach)| (node, reach.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use petgraph::graphmap::DiGraphMap;
    use tessera_store::Timestamp;

    use super::{has_path, reachable_with_expiry};

    fn ts(millis: i64) -> Option<Timestamp> {
        Some(Timestamp::from_millis(millis))
    }

    #[test]
    fn paths() {
        let mut graph: DiGraphMap<i64, ()> = DiGraphMap::new();
        graph.add_edge(1, 2, ());
        graph.add_edge(2, 3, ());
        graph.add_node(4);

        assert!(has_path(&graph, 1, 3));
        assert!(!has_path(&graph, 3, 1));
        assert!(!has_path(&graph, 1, 4));
        assert!(has_path(&graph, 5, 5));
        assert!(!has_path(&graph, 5, 1));
    }

    #[test]
    fn linear_chain_takes_earliest_expiry() {
        let mut graph = DiGraphMap::new();
        graph.add_edge(1, 2, None);
        graph.add_edge(2, 3, ts(100));
        graph.add_edge(3, 4, ts(50));

        let reach = reachable_with_expiry(&graph, 1);
        assert_eq!(reach[&1], None);
        assert_eq!(reach[&2], None);
        assert_eq!(reach[&3], ts(100));
        assert_eq!(reach[&4], ts(50));
    }

    #[test]
    fn diamond_takes_widest_path() {
        //     1
        //   /   \
        //  2     3
        //   \   /
        //     4
        let mut graph = DiGraphMap::new();
        graph.add_edge(1, 2, ts(10));
        graph.add_edge(1, 3, ts(30));
        graph.add_edge(2, 4, None);
        graph.add_edge(3, 4, ts(20));

        let reach = reachable_with_expiry(&graph, 1);
        assert_eq!(reach[&4], ts(20));

        // A path without any expiry wins over everything.
        graph.add_edge(1, 4, None);
        let reach = reachable_with_expiry(&graph, 1);
        assert_eq!(reach[&4], None);
    }

    #[test]
    fn unreachable_nodes_are_absent() {
        let mut graph = DiGraphMap::new();
        graph.add_edge(1, 2, None);
        graph.add_edge(3, 2, None);

        let reach = reachable_with_expiry(&graph, 1);
        assert_eq!(reach.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        // Unknown sources only reach themselves.
        let reach = reachable_with_expiry(&graph, 9);
        assert_eq!(reach.keys().copied().collect::<Vec<_>>(), vec![9]);
    }
}
