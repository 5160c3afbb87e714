//! Work-set traversal for the manifest reference graph.
//!
//! Manifests reference blobs, and a blob digest may itself name another
//! manifest. Walks over that graph are driven by the caller, which pops a
//! node, looks up its neighbours (usually with a query), and feeds them
//! back. Each node is yielded at most once, so cycles terminate.

use std::collections::BTreeSet;

/// A fixed-point traversal over nodes of type `T`.
#[derive(Debug, Clone)]
pub struct Walk<T> {
    visited: BTreeSet<T>,
    pending: Vec<T>,
}

impl<T: Ord + Clone> Walk<T> {
    /// Start a walk from `start`.
    pub fn new(start: impl IntoIterator<Item = T>) -> Self {
        let mut walk = Self {
            visited: BTreeSet::new(),
            pending: Vec::new(),
        };
        walk.extend(start);
        walk
    }

    /// Mark `node` as already seen without ever yielding it.
    pub fn exclude(&mut self, node: T) {
        self.visited.insert(node);
    }

    /// Queue nodes which have not been seen yet.
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = T>) {
        for node in nodes {
            if self.visited.insert(node.clone()) {
                self.pending.push(node);
            }
        }
    }

    /// The next unexplored node, or `None` once the closure is complete.
    pub fn next_pending(&mut self) -> Option<T> {
        self.pending.pop()
    }

    /// Every node seen so far, including excluded ones.
    pub fn visited(&self) -> &BTreeSet<T> {
        &self.visited
    }

    /// Finish the walk, returning everything seen.
    pub fn into_visited(self) -> BTreeSet<T> {
        self.visited
    }
}
