use smallvec::SmallVec;

use crate::{
    alloc::NodeAllocator,
    node::{node_ref, NodePtr},
    path::MAX_DEPTH,
    repr::Key,
    tree::RankTree,
};

/// In-order iterator over a tree's keys.
///
/// Holds a shared borrow of the tree for its whole lifetime, so the borrow
/// checker rejects any mutation while it is alive — the stack of node
/// positions below can never go stale.
pub struct Iter<'tree, K: Key, C, A: NodeAllocator> {
    _tree: &'tree RankTree<K, C, A>,
    // (node, next slot to visit); leaves at the top.
    stack: SmallVec<[(NodePtr<K>, usize); MAX_DEPTH]>,
}

impl<'tree, K: Key, C, A: NodeAllocator> Iter<'tree, K, C, A> {
    pub(crate) fn new(tree: &'tree RankTree<K, C, A>) -> Self {
        let mut iter = Iter {
            _tree: tree,
            stack: SmallVec::new(),
        };
        if let Some(root) = tree.root {
            iter.descend_first(root);
        }
        iter
    }

    fn descend_first(&mut self, mut ptr: NodePtr<K>) {
        loop {
            self.stack.push((ptr, 0));
            // Safety: nodes reachable from the borrowed tree are live, and
            // the shared borrow keeps them unaliased by writers.
            let node = unsafe { node_ref(ptr) };
            if node.is_leaf() {
                return;
            }
            ptr = node.child(0);
        }
    }
}

impl<K: Key, C, A: NodeAllocator> Iterator for Iter<'_, K, C, A> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        loop {
            let (ptr, pos) = *self.stack.last()?;
            let node = unsafe { node_ref(ptr) };
            if node.is_leaf() {
                if pos < node.num_items() {
                    self.stack.last_mut().unwrap().1 += 1;
                    return Some(node.key(pos));
                }
                self.stack.pop();
            } else if pos < node.num_items() {
                // The subtree left of this separator is exhausted: yield it,
                // then walk down the subtree to its right.
                self.stack.last_mut().unwrap().1 += 1;
                let key = node.key(pos);
                self.descend_first(node.child(pos + 1));
                return Some(key);
            } else {
                self.stack.pop();
            }
        }
    }
}

impl<K: Key, C, A: NodeAllocator> std::iter::FusedIterator for Iter<'_, K, C, A> {}
