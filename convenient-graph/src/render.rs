//! Tree rendering of a directed graph.

use std::collections::HashSet;
use std::fmt::Write;
use std::hash::Hash;

/// Renders a node and everything reachable from it as an indented tree.
///
/// A node that was already expanded is printed again with a `(*)` marker and
/// not expanded a second time, which keeps the output finite for cyclic
/// graphs:
///
/// ```text
/// :a
/// \--- :b
///      \--- :c
///           \--- :a (*)
///
/// (*) - details omitted (listed previously)
/// ```
pub struct GraphRenderer<L, S> {
    label: L,
    successors: S,
}

impl<L, S> GraphRenderer<L, S> {
    /// Create a renderer from a labelling and a successor function.
    pub fn new(label: L, successors: S) -> Self {
        Self { label, successors }
    }

    /// Render the tree rooted at `root`.
    pub fn render<N>(&mut self, root: N) -> String
    where
        N: Copy + Eq + Hash,
        L: FnMut(N) -> String,
        S: FnMut(N) -> Vec<N>,
    {
        let mut out = String::new();
        let mut seen = HashSet::new();
        let mut omitted = false;

        let _ = writeln!(out, "{}", (self.label)(root));
        let _ = seen.insert(root);

        // (node, prefix for its children)
        let mut stack: Vec<(N, String)> = Vec::new();
        let mut pending: Vec<Vec<(N, bool)>> = Vec::new();
        stack.push((root, String::new()));
        pending.push(self.children(root));

        while let Some(children) = pending.last_mut() {
            let Some((child, last)) = children.pop() else {
                let _ = pending.pop();
                let _ = stack.pop();
                continue;
            };
            let prefix = stack.last().map(|(_, p)| p.clone()).unwrap_or_default();
            let connector = if last { "\\--- " } else { "+--- " };
            let already_seen = !seen.insert(child);
            let marker = if already_seen { " (*)" } else { "" };
            let _ = writeln!(out, "{prefix}{connector}{}{marker}", (self.label)(child));

            if already_seen {
                omitted = true;
                continue;
            }
            let child_prefix = format!("{prefix}{}", if last { "     " } else { "|    " });
            stack.push((child, child_prefix));
            let grandchildren = self.children(child);
            pending.push(grandchildren);
        }

        if omitted {
            out.push_str("\n(*) - details omitted (listed previously)\n");
        }
        out
    }

    /// Children in reverse order (so `pop` yields the first), each flagged
    /// with whether it is the last sibling.
    fn children<N>(&mut self, node: N) -> Vec<(N, bool)>
    where
        S: FnMut(N) -> Vec<N>,
    {
        let children = (self.successors)(node);
        let count = children.len();
        children
            .into_iter()
            .enumerate()
            .map(|(i, child)| (child, i + 1 == count))
            .rev()
            .collect()
    }
}
