use std::{cmp::Ordering, fmt};

use smallvec::SmallVec;

use crate::{
    alloc::{HeapAllocator, NodeAllocator},
    cursor::Iter,
    error::Error,
    node::{node_mut, node_ref, Node, NodePtr},
    path::{Path, MAX_DEPTH},
    repr::{Key, NodeLayout},
};

/// Total order over keys.
///
/// The comparator may look at only part of the key (e.g. the score half of a
/// packed score+member pair); [`RankTree::get`] returns the stored key so
/// callers can recover the rest. The order must be total and consistent
/// between calls; a misbehaving comparator leaves the tree unusable but
/// memory safe.
pub trait KeyComparator<K> {
    /// Three-way comparison between a probe `a` and a stored key `b`.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Comparator that defers to the key's `Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// In-memory rank-augmented B+tree of small trivially-copyable keys.
///
/// Keys live packed inside fixed 256-byte nodes, so per-item overhead is a
/// few bits. Besides the usual ordered-set operations the tree answers
/// [`rank`](Self::rank) and [`at_rank`](Self::at_rank) in O(log N) thanks to
/// per-node subtree counts.
///
/// A tree is single-threaded by design: one instance belongs to one shard
/// and is only touched by that shard's task. It is `Send`, never `Sync`.
pub struct RankTree<K: Key, C = OrdComparator, A: NodeAllocator = HeapAllocator> {
    pub(crate) root: Option<NodePtr<K>>,
    len: u64,
    height: u32,
    cmp: C,
    alloc: A,
}

// Safety: the tree exclusively owns every node it points to; moving the tree
// moves sole access to them.
unsafe impl<K: Key + Send, C: Send, A: NodeAllocator + Send> Send for RankTree<K, C, A> {}

impl<K: Key + Ord> RankTree<K> {
    /// Creates an empty tree ordered by the key's `Ord`.
    pub fn new() -> Self {
        Self::new_in(OrdComparator, HeapAllocator)
    }
}

impl<K: Key + Ord> Default for RankTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, C: KeyComparator<K>> RankTree<K, C> {
    /// Creates an empty tree ordered by `cmp`.
    pub fn with_comparator(cmp: C) -> Self {
        Self::new_in(cmp, HeapAllocator)
    }
}

impl<K: Key, C, A: NodeAllocator> RankTree<K, C, A> {
    /// Creates an empty tree ordered by `cmp` that draws nodes from `alloc`.
    pub fn new_in(cmp: C, alloc: A) -> Self {
        // Monomorphization-time check that this key size fits the node
        // geometry (7-bit count field, branching inner nodes).
        let _ = NodeLayout::<K>::VALID;
        RankTree {
            root: None,
            len: 0,
            height: 0,
            cmp,
            alloc,
        }
    }

    /// Number of keys in the tree.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the tree holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of node levels, 0 for an empty tree.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Removes every key and returns all nodes to the allocator.
    pub fn clear(&mut self) {
        fn recurse<K: Key, A: NodeAllocator>(alloc: &mut A, ptr: NodePtr<K>) {
            // Safety: post-order walk over exclusively owned nodes; each is
            // freed exactly once, after its children.
            let node = unsafe { node_ref(ptr) };
            if !node.is_leaf() {
                for i in 0..=node.num_items() {
                    recurse(alloc, node.child(i));
                }
            }
            unsafe { alloc.free_node(Node::release(ptr)) };
        }

        if let Some(root) = self.root.take() {
            recurse(&mut self.alloc, root);
            trace!("tree cleared");
        }
        self.len = 0;
        self.height = 0;
    }

    fn new_node(&mut self, leaf: bool) -> Result<NodePtr<K>, Error> {
        let block = self.alloc.allocate_node()?;
        Ok(Node::claim(block, leaf))
    }

    fn free_node(&mut self, node: NodePtr<K>) {
        // Safety: `node` came from this tree's allocator and is no longer
        // reachable from the tree.
        unsafe { self.alloc.free_node(Node::release(node)) };
    }
}

impl<K: Key, C: KeyComparator<K>, A: NodeAllocator> RankTree<K, C, A> {
    /// Whether a key equal to `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Returns the stored key equal to `key` under the tree's comparator.
    pub fn get(&self, key: &K) -> Option<K> {
        self.lookup(key)
    }

    fn lookup(&self, key: &K) -> Option<K> {
        let mut current = self.root?;
        loop {
            // Safety: nodes reachable from the root are live and this borrow
            // is the only one active.
            let node = unsafe { node_ref(current) };
            let res = node.search(key, &self.cmp);
            if res.found {
                return Some(node.key(res.index));
            }
            if node.is_leaf() {
                return None;
            }
            current = node.child(res.index);
        }
    }

    /// The smallest key.
    pub fn first(&self) -> Option<K> {
        let mut current = self.root?;
        loop {
            let node = unsafe { node_ref(current) };
            if node.is_leaf() {
                return Some(node.key(0));
            }
            current = node.child(0);
        }
    }

    /// The largest key.
    pub fn last(&self) -> Option<K> {
        let mut current = self.root?;
        loop {
            let node = unsafe { node_ref(current) };
            if node.is_leaf() {
                return Some(node.key(node.num_items() - 1));
            }
            current = node.child(node.num_items());
        }
    }

    /// 0-based position of `key` in sorted order, when present.
    pub fn rank(&self, key: &K) -> Option<u64> {
        let mut current = self.root?;
        let mut rank = 0u64;
        loop {
            let node = unsafe { node_ref(current) };
            let res = node.search(key, &self.cmp);
            if node.is_leaf() {
                return res.found.then(|| rank + res.index as u64);
            }
            for i in 0..res.index {
                rank += unsafe { node_ref(node.child(i)) }.tree_count();
            }
            rank += res.index as u64;
            if res.found {
                // Separator hit: everything in its left subtree precedes it.
                rank += unsafe { node_ref(node.child(res.index)) }.tree_count();
                return Some(rank);
            }
            current = node.child(res.index);
        }
    }

    /// The key at sorted position `rank` — the inverse of
    /// [`rank`](Self::rank).
    pub fn at_rank(&self, rank: u64) -> Option<K> {
        if rank >= self.len {
            return None;
        }
        let mut current = self.root?;
        let mut rank = rank;
        loop {
            let node = unsafe { node_ref(current) };
            if node.is_leaf() {
                debug_assert!(rank < node.num_items() as u64);
                return Some(node.key(rank as usize));
            }
            let mut i = 0;
            loop {
                let child = node.child(i);
                let sub = unsafe { node_ref(child) }.tree_count();
                if rank < sub {
                    current = child;
                    break;
                }
                rank -= sub;
                debug_assert!(i < node.num_items());
                if rank == 0 {
                    return Some(node.key(i));
                }
                rank -= 1;
                i += 1;
            }
        }
    }

    /// In-order iterator over the keys. Borrows the tree, so mutation while
    /// iterating is rejected at compile time.
    pub fn iter(&self) -> Iter<'_, K, C, A> {
        Iter::new(self)
    }

    /// Inserts `key`, returning `false` when an equal key is already
    /// present. An allocation failure is returned before the tree is
    /// modified.
    pub fn insert(&mut self, key: K) -> Result<bool, Error> {
        let Some(root) = self.root else {
            let node = self.new_node(true)?;
            unsafe { node_mut(node) }.init_single(key);
            self.root = Some(node);
            self.height = 1;
            self.len = 1;
            trace!("tree initialized with a root leaf");
            return Ok(true);
        };

        let mut path = Path::new();
        let mut current = root;
        let (leaf, pos) = loop {
            let node = unsafe { node_ref(current) };
            let res = node.search(&key, &self.cmp);
            if res.found {
                return Ok(false);
            }
            if node.is_leaf() {
                break (current, res.index);
            }
            path.push(current, res.index);
            current = node.child(res.index);
        };

        if unsafe { node_ref(leaf) }.free_slots() > 0 {
            unsafe { node_mut(leaf) }.leaf_insert(pos, key);
            for i in 0..path.depth() {
                unsafe { node_mut(path.node(i)) }.add_tree_count(1);
            }
        } else {
            self.insert_full_leaf(&path, leaf, pos, key)?;
        }
        self.len += 1;
        Ok(true)
    }

    /// Slow insert path: the target leaf is full. First tries to shed keys
    /// into a sibling through the parent; otherwise splits the leaf and
    /// propagates medians upward, splitting every full ancestor until one
    /// can take the promoted key (possibly after a sibling rebalance of its
    /// own) or a new root is made. Every block the split chain needs is
    /// allocated before anything is modified, so failure leaves the tree
    /// as it was.
    fn insert_full_leaf(
        &mut self,
        path: &Path<K>,
        leaf: NodePtr<K>,
        pos: usize,
        key: K,
    ) -> Result<(), Error> {
        if path.depth() > 0 {
            let (parent, child_pos) = path.last();
            let redirect =
                unsafe { node_mut(parent) }.rebalance_child_for_insert(child_pos, pos);
            if let Some((dest, dest_pos)) = redirect {
                trace!("full leaf relieved by sibling rebalance");
                unsafe { node_mut(dest) }.leaf_insert(dest_pos, key);
                for i in 0..path.depth() {
                    unsafe { node_mut(path.node(i)) }.add_tree_count(1);
                }
                return Ok(());
            }
        }

        // Walk up to find where the split chain can stop: the first ancestor
        // with a free slot, or one that gains a slot by shedding keys to a
        // sibling. `splits` counts the nodes that must split, leaf included.
        let mut splits = 1;
        let mut stop: Option<(NodePtr<K>, usize)> = None;
        let mut lvl = path.depth();
        while lvl > 0 {
            let anc = path.node(lvl - 1);
            if unsafe { node_ref(anc) }.free_slots() > 0 {
                stop = Some((anc, path.position(lvl - 1)));
                break;
            }
            if lvl >= 2 {
                let grand = path.node(lvl - 2);
                let anc_pos = path.position(lvl - 2);
                let key_slot = path.position(lvl - 1);
                let redirect =
                    unsafe { node_mut(grand) }.rebalance_child_for_insert(anc_pos, key_slot);
                if let Some((dest, dest_slot)) = redirect {
                    trace!("full inner node relieved by sibling rebalance");
                    stop = Some((dest, dest_slot));
                    break;
                }
            }
            splits += 1;
            lvl -= 1;
        }

        // Allocate the whole chain up front; on failure the tree is intact.
        let needed = splits + stop.is_none() as usize;
        let mut fresh = SmallVec::<[NodePtr<K>; MAX_DEPTH]>::new();
        for i in 0..needed {
            match self.alloc.allocate_node() {
                Ok(block) => fresh.push(Node::claim(block, i == 0)),
                Err(e) => {
                    for node in fresh {
                        // Safety: just allocated, never linked into the tree.
                        unsafe { self.alloc.free_node(Node::release(node)) };
                    }
                    return Err(e);
                }
            }
        }

        // Split the leaf and place the new key in the proper half.
        let right = fresh[0];
        let median = unsafe { node_mut(leaf) }.split(unsafe { node_mut(right) });
        let left_items = unsafe { node_ref(leaf) }.num_items();
        if pos <= left_items {
            unsafe { node_mut(leaf) }.leaf_insert(pos, key);
        } else {
            unsafe { node_mut(right) }.leaf_insert(pos - left_items - 1, key);
        }
        trace!("leaf split, propagating {} level(s)", splits - 1);

        // Split each full ancestor in turn, carrying (median, right child)
        // upward. The carried pair goes into whichever half its slot landed
        // in; the separator-slot and child-slot mappings agree, so the left
        // half of the lower split stays adjacent to the carried key.
        let mut carry_key = median;
        let mut carry_right = right;
        for s in 1..splits {
            let anc = path.node(path.depth() - s);
            let slot = path.position(path.depth() - s);
            let anc_right = fresh[s];
            let anc_node = unsafe { node_mut(anc) };
            let promoted = anc_node.split(unsafe { node_mut(anc_right) });
            let left_items = anc_node.num_items();
            if slot <= left_items {
                anc_node.inner_insert(slot, carry_key, carry_right);
                anc_node.fix_tree_count();
            } else {
                let right_node = unsafe { node_mut(anc_right) };
                right_node.inner_insert(slot - left_items - 1, carry_key, carry_right);
                right_node.fix_tree_count();
            }
            carry_key = promoted;
            carry_right = anc_right;
        }

        match stop {
            Some((dest, dest_slot)) => {
                let dest_node = unsafe { node_mut(dest) };
                dest_node.inner_insert(dest_slot, carry_key, carry_right);
                dest_node.fix_tree_count();
            }
            None => {
                let new_root = fresh[splits];
                let root_node = unsafe { node_mut(new_root) };
                root_node.set_child(0, self.root.unwrap());
                root_node.inner_insert(0, carry_key, carry_right);
                root_node.fix_tree_count();
                self.root = Some(new_root);
                self.height += 1;
                trace!("root split, height is now {}", self.height);
            }
        }

        // Ancestors above the stop level saw their subtree grow by one.
        for i in 0..path.depth().saturating_sub(splits) {
            unsafe { node_mut(path.node(i)) }.add_tree_count(1);
        }
        Ok(())
    }

    /// Removes `key`, returning whether it was present. Removal never
    /// allocates, so it cannot fail.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(root) = self.root else {
            return false;
        };

        let mut path = Path::new();
        let mut current = root;
        let found_at = loop {
            let node = unsafe { node_ref(current) };
            let res = node.search(key, &self.cmp);
            if res.found {
                break res.index;
            }
            if node.is_leaf() {
                return false;
            }
            path.push(current, res.index);
            current = node.child(res.index);
        };

        if unsafe { node_ref(current) }.is_leaf() {
            path.push(current, found_at);
            unsafe { node_mut(current) }.shift_left(found_at, false);
        } else {
            // Separator hit: overwrite it with its in-order predecessor (the
            // last key of the rightmost leaf in its left subtree) and delete
            // that key instead.
            path.push(current, found_at);
            path.dig_right();
            let (leaf, last) = path.last();
            let leaf_node = unsafe { node_mut(leaf) };
            debug_assert_eq!(last, leaf_node.num_items() - 1);
            let pred = leaf_node.key(last);
            unsafe { node_mut(current) }.set_key(found_at, pred);
            leaf_node.leaf_erase_last();
        }

        self.repair_after_remove(&mut path);
        self.len -= 1;
        true
    }

    /// Walks the recorded path back up after a deletion, repairing every
    /// node that fell below its minimum fill and refreshing subtree counts,
    /// then collapses the root if it emptied out.
    fn repair_after_remove(&mut self, path: &mut Path<K>) {
        let (mut child, _) = path.last();
        path.pop();
        while path.depth() > 0 {
            let (parent, pos) = path.last();
            path.pop();
            let child_node = unsafe { node_ref(child) };
            if child_node.num_items() < child_node.min_items() {
                if let Some(retired) = unsafe { node_mut(parent) }.merge_or_rebalance_child(pos) {
                    trace!("deficient node merged into a sibling");
                    self.free_node(retired);
                }
            }
            unsafe { node_mut(parent) }.fix_tree_count();
            child = parent;
        }

        // `child` is the root now.
        let root_node = unsafe { node_ref(child) };
        if root_node.num_items() == 0 {
            if root_node.is_leaf() {
                self.free_node(child);
                self.root = None;
                self.height = 0;
                trace!("tree emptied");
            } else {
                let only_child = root_node.child(0);
                self.free_node(child);
                self.root = Some(only_child);
                self.height -= 1;
                trace!("root collapsed, height is now {}", self.height);
            }
        }
    }

    /// Audits the whole tree: uniform leaf depth, fill bounds, strict
    /// in-node ordering, separator bounds and subtree-count agreement.
    #[cfg(any(test, fuzzing))]
    pub(crate) fn validate(&self) {
        let Some(root) = self.root else {
            assert_eq!((self.len, self.height), (0, 0));
            return;
        };
        assert!(self.height >= 1);
        let total = self.validate_node(root, self.height, None, None);
        assert_eq!(total, self.len);
    }

    #[cfg(any(test, fuzzing))]
    fn validate_node(
        &self,
        ptr: NodePtr<K>,
        levels_below: u32,
        lower: Option<K>,
        upper: Option<K>,
    ) -> u64 {
        let node = unsafe { node_ref(ptr) };
        let count = node.num_items();
        assert_eq!(node.is_leaf(), levels_below == 1, "leaves at uneven depth");
        assert!(count <= node.max_items());
        if ptr == self.root.unwrap() {
            assert!(count >= 1);
        } else {
            assert!(count >= node.min_items(), "node below minimum fill");
        }
        for i in 0..count {
            if i + 1 < count {
                assert_eq!(
                    self.cmp.compare(&node.key(i), &node.key(i + 1)),
                    Ordering::Less,
                    "keys not strictly increasing"
                );
            }
        }
        if let Some(lb) = lower {
            assert_eq!(self.cmp.compare(&lb, &node.key(0)), Ordering::Less);
        }
        if let Some(ub) = upper {
            assert_eq!(self.cmp.compare(&node.key(count - 1), &ub), Ordering::Less);
        }
        let mut total = count as u64;
        if !node.is_leaf() {
            for i in 0..=count {
                let lo = if i == 0 { lower } else { Some(node.key(i - 1)) };
                let hi = if i == count { upper } else { Some(node.key(i)) };
                total += self.validate_node(node.child(i), levels_below - 1, lo, hi);
            }
            assert_eq!(node.tree_count(), total, "stale subtree count");
        }
        total
    }
}

impl<K: Key, C, A: NodeAllocator> fmt::Debug for RankTree<K, C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankTree")
            .field("len", &self.len)
            .field("height", &self.height)
            .finish()
    }
}

impl<K: Key, C, A: NodeAllocator> Drop for RankTree<K, C, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node_ref;

    #[test]
    fn sequential_fill_stays_in_one_leaf() {
        let mut tree = RankTree::new();
        for key in 1..=31u64 {
            assert!(tree.insert(key).unwrap());
        }
        assert_eq!(tree.len(), 31);
        assert_eq!(tree.height(), 1);
        let root = unsafe { node_ref(tree.root.unwrap()) };
        assert!(root.is_leaf());
        assert_eq!(root.num_items(), 31);
        assert_eq!(tree.iter().collect::<Vec<_>>(), (1..=31).collect::<Vec<_>>());
        tree.validate();
    }

    #[test]
    fn first_overflow_splits_root_at_median() {
        let mut tree = RankTree::new();
        for key in 1..=31u64 {
            tree.insert(key).unwrap();
        }
        assert!(tree.insert(32).unwrap());

        assert_eq!(tree.height(), 2);
        let root = unsafe { node_ref(tree.root.unwrap()) };
        assert!(!root.is_leaf());
        assert_eq!(root.num_items(), 1);
        assert_eq!(root.key(0), 16);
        let left = unsafe { node_ref(root.child(0)) };
        let right = unsafe { node_ref(root.child(1)) };
        assert_eq!(left.num_items(), 15);
        assert_eq!(right.num_items(), 16);
        assert_eq!(root.tree_count(), 32);
        tree.validate();
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = RankTree::new();
        assert!(tree.insert(7u64).unwrap());
        assert!(!tree.insert(7).unwrap());
        assert_eq!(tree.len(), 1);
        tree.validate();
    }

    #[test]
    fn remove_down_to_single_key() {
        let mut tree = RankTree::new();
        tree.insert(1u64).unwrap();
        tree.insert(2).unwrap();
        assert!(tree.remove(&1));
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(tree.height(), 1);
        let root = unsafe { node_ref(tree.root.unwrap()) };
        assert!(root.is_leaf());
        assert_eq!(root.num_items(), 1);
        assert!(!tree.remove(&1));
        tree.validate();
    }

    #[test]
    fn remove_last_key_frees_root() {
        let mut tree = RankTree::new();
        tree.insert(5u64).unwrap();
        assert!(tree.remove(&5));
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert!(tree.root.is_none());
        tree.validate();
    }

    #[test]
    fn rank_and_select_round_trip() {
        let mut tree = RankTree::new();
        for key in [40u64, 10, 30, 20, 50] {
            tree.insert(key).unwrap();
        }
        assert_eq!(tree.rank(&10), Some(0));
        assert_eq!(tree.rank(&30), Some(2));
        assert_eq!(tree.rank(&50), Some(4));
        assert_eq!(tree.rank(&25), None);
        assert_eq!(tree.at_rank(0), Some(10));
        assert_eq!(tree.at_rank(3), Some(40));
        assert_eq!(tree.at_rank(5), None);
        assert_eq!(tree.first(), Some(10));
        assert_eq!(tree.last(), Some(50));
    }

    #[test]
    fn clear_resets_everything() {
        let mut tree = RankTree::new();
        for key in 0..200u64 {
            tree.insert(key).unwrap();
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert!(tree.iter().next().is_none());
        tree.insert(3).unwrap();
        assert_eq!(tree.len(), 1);
        tree.validate();
    }

    #[test]
    fn separator_removal_uses_predecessor() {
        let mut tree = RankTree::new();
        for key in 1..=32u64 {
            tree.insert(key).unwrap();
        }
        // 16 is the root separator after the first split.
        assert!(tree.remove(&16));
        assert!(!tree.contains(&16));
        assert_eq!(
            tree.iter().collect::<Vec<_>>(),
            (1..=32).filter(|k| *k != 16).collect::<Vec<_>>()
        );
        tree.validate();
    }
}
