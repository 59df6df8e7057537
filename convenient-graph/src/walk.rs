//! Depth-first walks over graphs described by a successor function.
//!
//! Both walks are iterative, so deep task chains cannot overflow the stack,
//! and both visit successors in the order the successor function yields
//! them.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::vec;

/// Result of [`walk_acyclic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkOutcome<N> {
    /// No cycle is reachable. Holds every reachable node, successors before
    /// the nodes that reach them.
    Ordered(Vec<N>),
    /// The walk re-entered this node while it was still being visited.
    Cycle(N),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Three-colour depth-first walk from `roots`.
///
/// A node is unvisited until first reached, visiting while its successors
/// are explored and visited afterwards. Reaching a visiting node means a
/// cycle; the walk stops there and reports that node.
pub fn walk_acyclic<N, I, F, S>(roots: I, mut successors: F) -> WalkOutcome<N>
where
    N: Copy + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(N) -> S,
    S: IntoIterator<Item = N>,
{
    let mut marks: HashMap<N, Mark> = HashMap::new();
    let mut ordered = Vec::new();

    for root in roots {
        if marks.contains_key(&root) {
            continue;
        }
        let _ = marks.insert(root, Mark::Visiting);
        let mut stack: Vec<(N, vec::IntoIter<N>)> = vec![(root, collect(&mut successors, root))];

        while let Some((node, next)) = stack
            .last_mut()
            .map(|(node, pending)| (*node, pending.next()))
        {
            match next {
                Some(next) => match marks.get(&next) {
                    Some(Mark::Visiting) => return WalkOutcome::Cycle(next),
                    Some(Mark::Visited) => {}
                    None => {
                        let _ = marks.insert(next, Mark::Visiting);
                        stack.push((next, collect(&mut successors, next)));
                    }
                },
                None => {
                    let _ = marks.insert(node, Mark::Visited);
                    ordered.push(node);
                    let _ = stack.pop();
                }
            }
        }
    }

    WalkOutcome::Ordered(ordered)
}

/// Find the cycles reachable from `roots`.
///
/// Returns every strongly connected component that contains a cycle (more
/// than one node, or a single node with an edge to itself). Each component
/// starts with the first of its nodes reached by the walk, followed by the
/// others in discovery order.
pub fn find_cycles<N, I, F, S>(roots: I, successors: F) -> Vec<Vec<N>>
where
    N: Copy + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(N) -> S,
    S: IntoIterator<Item = N>,
{
    let mut tarjan = Tarjan {
        successors,
        index: HashMap::new(),
        low_link: HashMap::new(),
        on_stack: HashSet::new(),
        component_stack: Vec::new(),
        self_loops: HashSet::new(),
        next_index: 0,
        cycles: Vec::new(),
    };
    for root in roots {
        if !tarjan.index.contains_key(&root) {
            tarjan.run(root);
        }
    }
    tarjan.cycles
}

fn collect<N, F, S>(successors: &mut F, node: N) -> vec::IntoIter<N>
where
    F: FnMut(N) -> S,
    S: IntoIterator<Item = N>,
{
    successors(node).into_iter().collect::<Vec<_>>().into_iter()
}

struct Tarjan<N, F> {
    successors: F,
    index: HashMap<N, usize>,
    low_link: HashMap<N, usize>,
    on_stack: HashSet<N>,
    component_stack: Vec<N>,
    self_loops: HashSet<N>,
    next_index: usize,
    cycles: Vec<Vec<N>>,
}

impl<N, F, S> Tarjan<N, F>
where
    N: Copy + Eq + Hash,
    F: FnMut(N) -> S,
    S: IntoIterator<Item = N>,
{
    fn enter(&mut self, node: N) -> (N, vec::IntoIter<N>) {
        let _ = self.index.insert(node, self.next_index);
        let _ = self.low_link.insert(node, self.next_index);
        self.next_index += 1;
        self.component_stack.push(node);
        let _ = self.on_stack.insert(node);
        (node, collect(&mut self.successors, node))
    }

    fn low(&self, node: N) -> usize {
        self.low_link.get(&node).copied().unwrap_or(usize::MAX)
    }

    fn lower_to(&mut self, node: N, value: usize) {
        if value < self.low(node) {
            let _ = self.low_link.insert(node, value);
        }
    }

    fn run(&mut self, root: N) {
        let mut frames = vec![self.enter(root)];

        while let Some((node, next)) = frames
            .last_mut()
            .map(|(node, pending)| (*node, pending.next()))
        {
            if let Some(next) = next {
                if next == node {
                    let _ = self.self_loops.insert(node);
                }
                if let Some(&next_index) = self.index.get(&next) {
                    if self.on_stack.contains(&next) {
                        self.lower_to(node, next_index);
                    }
                } else {
                    frames.push(self.enter(next));
                }
                continue;
            }

            let _ = frames.pop();
            let node_low = self.low(node);
            if let Some((parent, _)) = frames.last() {
                let parent = *parent;
                self.lower_to(parent, node_low);
            }
            if self.index.get(&node) == Some(&node_low) {
                self.close_component(node);
            }
        }
    }

    fn close_component(&mut self, root: N) {
        let mut component = Vec::new();
        while let Some(member) = self.component_stack.pop() {
            let _ = self.on_stack.remove(&member);
            component.push(member);
            if member == root {
                break;
            }
        }
        component.reverse();
        if component.len() > 1 || self.self_loops.contains(&root) {
            self.cycles.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &'static [(u32, u32)]) -> impl FnMut(u32) -> Vec<u32> {
        move |n| {
            pairs
                .iter()
                .filter(|(from, _)| *from == n)
                .map(|(_, to)| *to)
                .collect()
        }
    }

    #[test]
    fn test_walk_orders_successors_first() {
        let outcome = walk_acyclic([1], edges(&[(1, 2), (1, 3), (2, 3)]));
        assert_eq!(outcome, WalkOutcome::Ordered(vec![3, 2, 1]));
    }

    #[test]
    fn test_walk_shared_successor_is_not_a_cycle() {
        // diamond: 1 -> {2, 3} -> 4
        let outcome = walk_acyclic([1], edges(&[(1, 2), (1, 3), (2, 4), (3, 4)]));
        assert_eq!(outcome, WalkOutcome::Ordered(vec![4, 2, 3, 1]));
    }

    #[test]
    fn test_walk_reports_cycle_from_any_root() {
        let cyclic: &[(u32, u32)] = &[(1, 2), (2, 3), (3, 1)];
        for root in [1, 2, 3] {
            match walk_acyclic([root], edges(cyclic)) {
                WalkOutcome::Cycle(node) => assert_eq!(node, root),
                WalkOutcome::Ordered(order) => panic!("expected cycle, got {order:?}"),
            }
        }
    }

    #[test]
    fn test_find_cycles_returns_whole_component() {
        let graph: &[(u32, u32)] = &[(1, 2), (2, 3), (3, 1), (3, 4)];
        let cycles = find_cycles([2], edges(graph));
        assert_eq!(cycles, vec![vec![2, 3, 1]]);
    }

    #[test]
    fn test_find_cycles_self_loop_and_acyclic() {
        assert_eq!(find_cycles([7], edges(&[(7, 7)])), vec![vec![7]]);
        assert!(find_cycles([1], edges(&[(1, 2), (2, 3)])).is_empty());
    }

    #[test]
    fn test_find_cycles_separate_components() {
        let graph: &[(u32, u32)] = &[(1, 2), (2, 1), (2, 3), (3, 4), (4, 3)];
        let cycles = find_cycles([1], edges(graph));
        assert_eq!(cycles, vec![vec![3, 4], vec![1, 2]]);
    }
}
