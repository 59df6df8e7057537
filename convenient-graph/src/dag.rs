//! Deterministic directed acyclic graph.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node identifier in the DAG.
///
/// Identifiers are handed out in insertion order and that order is the
/// tie-breaker of [`DAG::topological_sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in insertion order.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Error types for DAG operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Adding an edge would close a cycle, or the graph is cyclic.
    #[error("Cycle detected in graph: {0}")]
    CycleDetected(String),

    /// Node not found
    #[error("Node {0} not found in graph")]
    NodeNotFound(NodeId),
}

/// Result type for DAG operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Node<N> {
    data: N,
    outgoing: BTreeSet<NodeId>,
    incoming: BTreeSet<NodeId>,
}

/// Generic directed acyclic graph.
///
/// Edges express precedence: `add_edge(a, b, ..)` means `a` comes before `b`.
/// All adjacency is kept in ordered collections so that every query and the
/// topological order are reproducible for the same sequence of insertions.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(bound(
        serialize = "N: Serialize, E: Serialize",
        deserialize = "N: Deserialize<'de>, E: Deserialize<'de>"
    ))
)]
pub struct DAG<N, E> {
    nodes: BTreeMap<NodeId, Node<N>>,
    #[cfg_attr(feature = "serde", serde(with = "edge_list"))]
    edges: BTreeMap<(NodeId, NodeId), E>,
    next_id: usize,
}

impl<N, E> Default for DAG<N, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N, E> DAG<N, E> {
    /// Create a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Add a node to the graph and return its ID.
    pub fn add_node(&mut self, data: N) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let _ = self.nodes.insert(
            id,
            Node {
                data,
                outgoing: BTreeSet::new(),
                incoming: BTreeSet::new(),
            },
        );
        id
    }

    /// Add a directed edge from `from` to `to` with associated data.
    ///
    /// Adding an edge that already exists replaces its data.
    ///
    /// # Errors
    ///
    /// - `GraphError::NodeNotFound` if either node doesn't exist
    /// - `GraphError::CycleDetected` if the edge would close a cycle; the
    ///   graph is left unchanged
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, data: E) -> GraphResult<()> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::NodeNotFound(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(GraphError::NodeNotFound(to));
        }
        if self.can_reach(to, from) {
            return Err(GraphError::CycleDetected(format!(
                "Adding edge {from} -> {to} would create a cycle"
            )));
        }

        let _ = self.edges.insert((from, to), data);
        if let Some(from_node) = self.nodes.get_mut(&from) {
            let _ = from_node.outgoing.insert(to);
        }
        if let Some(to_node) = self.nodes.get_mut(&to) {
            let _ = to_node.incoming.insert(from);
        }
        Ok(())
    }

    /// Check if there's a path from `start` to `end`.
    #[must_use]
    pub fn can_reach(&self, start: NodeId, end: NodeId) -> bool {
        if start == end {
            return true;
        }

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if current == end {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.outgoing.iter().filter(|n| !visited.contains(*n)));
            }
        }
        false
    }

    /// Get a reference to a node's data.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn node(&self, id: NodeId) -> GraphResult<&N> {
        self.nodes
            .get(&id)
            .map(|node| &node.data)
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Get the data attached to the edge `from -> to`, if present.
    #[must_use]
    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<&E> {
        self.edges.get(&(from, to))
    }

    /// Get the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Direct predecessors of a node, in id order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependencies(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.nodes
            .get(&id)
            .map(|node| node.incoming.iter().copied().collect())
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Direct successors of a node, in id order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NodeNotFound` if the node doesn't exist.
    pub fn dependents(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        self.nodes
            .get(&id)
            .map(|node| node.outgoing.iter().copied().collect())
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Topological sort using Kahn's algorithm.
    ///
    /// Among the nodes whose predecessors are all emitted, the one inserted
    /// first is emitted next, so the result only depends on the order of
    /// insertion.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` if the graph contains a cycle.
    pub fn topological_sort(&self) -> GraphResult<Vec<NodeId>> {
        let mut in_degree: BTreeMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.incoming.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node_id)) = ready.pop() {
            result.push(node_id);
            if let Some(node) = self.nodes.get(&node_id) {
                for neighbor in &node.outgoing {
                    if let Some(degree) = in_degree.get_mut(neighbor) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(Reverse(*neighbor));
                        }
                    }
                }
            }
        }

        if result.len() == self.nodes.len() {
            Ok(result)
        } else {
            Err(GraphError::CycleDetected(
                "Graph contains a cycle".to_string(),
            ))
        }
    }
}

/// Edges as a list of `((from, to), data)` pairs; formats such as JSON only
/// accept string-like map keys.
#[cfg(feature = "serde")]
mod edge_list {
    use super::NodeId;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub(super) fn serialize<E, S>(
        edges: &BTreeMap<(NodeId, NodeId), E>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        E: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(edges.iter())
    }

    pub(super) fn deserialize<'de, E, D>(
        deserializer: D,
    ) -> Result<BTreeMap<(NodeId, NodeId), E>, D::Error>
    where
        E: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Vec::<((NodeId, NodeId), E)>::deserialize(deserializer)
            .map(|edges| edges.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_round_trip_keeps_edges_and_order() {
        let mut dag = DAG::<String, u32>::new();
        let compile = dag.add_node("compile".to_string());
        let test = dag.add_node("test".to_string());
        let jar = dag.add_node("jar".to_string());
        dag.add_edge(compile, jar, 1).unwrap();
        dag.add_edge(compile, test, 2).unwrap();

        let json = serde_json::to_string(&dag).unwrap();
        let mut restored: DAG<String, u32> = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.node(jar).unwrap(), "jar");
        assert_eq!(restored.edge(compile, test), Some(&2));
        assert_eq!(
            restored.topological_sort().unwrap(),
            dag.topological_sort().unwrap()
        );
        // Ids keep counting from where the original left off
        assert_eq!(restored.add_node("docs".to_string()).index(), 3);
        assert!(restored.add_edge(jar, compile, 0).is_err());
    }

    #[test]
    fn test_create_empty_dag() {
        let dag = DAG::<String, ()>::new();
        assert_eq!(dag.node_count(), 0);
        assert_eq!(dag.edge_count(), 0);
    }

    #[test]
    fn test_edge_closing_cycle_is_rejected() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");

        dag.add_edge(a, b, ()).unwrap();
        dag.add_edge(b, c, ()).unwrap();

        let result = dag.add_edge(c, a, ());
        assert!(matches!(result, Err(GraphError::CycleDetected(_))));
        assert_eq!(dag.edge_count(), 2);
        assert!(dag.dependents(c).unwrap().is_empty());
    }

    #[test]
    fn test_self_edge_is_rejected() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        assert!(dag.add_edge(a, a, ()).is_err());
    }

    #[test]
    fn test_topological_sort_prefers_insertion_order() {
        let mut dag = DAG::<&str, ()>::new();
        let jar = dag.add_node("jar");
        let test = dag.add_node("test");
        let compile = dag.add_node("compile");

        dag.add_edge(compile, jar, ()).unwrap();
        dag.add_edge(compile, test, ()).unwrap();

        // compile is the only root, then jar (id 0) before test (id 1)
        assert_eq!(dag.topological_sort().unwrap(), vec![compile, jar, test]);
        // repeated sorting yields the same order
        assert_eq!(dag.topological_sort().unwrap(), vec![compile, jar, test]);
    }

    #[test]
    fn test_edge_data_and_adjacency() {
        let mut dag = DAG::<&str, &str>::new();
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");

        dag.add_edge(a, c, "dependency").unwrap();
        dag.add_edge(b, c, "should").unwrap();

        assert_eq!(dag.edge(a, c), Some(&"dependency"));
        assert_eq!(dag.edge(c, a), None);
        assert_eq!(dag.dependencies(c).unwrap(), vec![a, b]);
        assert_eq!(dag.dependents(a).unwrap(), vec![c]);
        assert!(dag.can_reach(a, c));
        assert!(!dag.can_reach(c, a));
    }

    #[test]
    fn test_complex_dag() {
        let mut dag = DAG::<&str, ()>::new();
        let root = dag.add_node("root");
        let a = dag.add_node("a");
        let b = dag.add_node("b");
        let c = dag.add_node("c");
        let d = dag.add_node("d");

        dag.add_edge(root, a, ()).unwrap();
        dag.add_edge(root, b, ()).unwrap();
        dag.add_edge(a, c, ()).unwrap();
        dag.add_edge(b, c, ()).unwrap();
        dag.add_edge(c, d, ()).unwrap();

        let order = dag.topological_sort().unwrap();
        assert_eq!(order, vec![root, a, b, c, d]);
    }

    #[test]
    fn test_unknown_node() {
        let mut dag = DAG::<&str, ()>::new();
        let a = dag.add_node("a");
        let mut other = DAG::<&str, ()>::new();
        let _ = other.add_node("x");
        let missing = other.add_node("y");
        assert!(matches!(
            dag.add_edge(a, missing, ()),
            Err(GraphError::NodeNotFound(_))
        ));
        assert!(dag.node(missing).is_err());
    }
}
