use std::{cmp::Ordering, marker::PhantomData, mem::size_of, ptr::NonNull};

use zerocopy::{FromBytes, IntoBytes};

use crate::{
    alloc::NodeBlock,
    repr::{Key, NodeHeader, NodeLayout, NODE_BODY_SIZE, NODE_SIZE, PTR_SIZE},
    tree::KeyComparator,
};

pub(crate) type NodePtr<K> = NonNull<Node<K>>;

/// A single tree node inside a 256-byte block: the 8-byte header followed by
/// the packed key region and, for inner nodes, the child pointer array at a
/// fixed offset past the maximum key region.
///
/// Keys move by plain byte copies; child pointers are read and written
/// unaligned because the pointer region is only byte-aligned for odd key
/// sizes. The leaf flag is set when the block is claimed and never changes.
#[repr(C, align(8))]
pub(crate) struct Node<K> {
    header: NodeHeader,
    body: [u8; NODE_BODY_SIZE],
    _keys: PhantomData<K>,
}

const _: () = assert!(size_of::<Node<u64>>() == NODE_SIZE);
const _: () = assert!(std::mem::align_of::<Node<u64>>() == std::mem::align_of::<NodeBlock>());

/// Shared access to a node the tree owns.
///
/// # Safety
///
/// `ptr` must point at a live node of the tree being operated on, and no
/// exclusive reference to that node may be active.
#[inline]
pub(crate) unsafe fn node_ref<'a, K>(ptr: NodePtr<K>) -> &'a Node<K> {
    &*ptr.as_ptr()
}

/// Exclusive access to a node the tree owns.
///
/// # Safety
///
/// `ptr` must point at a live node of the tree being operated on, and no
/// other reference to that node may be active. The tree's single-ownership
/// discipline (every node reachable through exactly one parent) is what
/// makes the call sites sound.
#[inline]
pub(crate) unsafe fn node_mut<'a, K>(ptr: NodePtr<K>) -> &'a mut Node<K> {
    &mut *ptr.as_ptr()
}

/// Outcome of a node-local binary search: the smallest index whose key is
/// greater than or equal to the probe, and whether it is equal. When absent,
/// `index` doubles as the child slot the lookup descends into.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchResult {
    pub index: usize,
    pub found: bool,
}

impl<K: Key> Node<K> {
    const KEY_SIZE: usize = NodeLayout::<K>::KEY_SIZE;

    /// Claims a freshly allocated block as a node of the given kind.
    pub fn claim(block: NonNull<NodeBlock>, leaf: bool) -> NodePtr<K> {
        let ptr = block.cast::<Node<K>>();
        // Safety: NodeBlock and Node have identical size and alignment and
        // the block is exclusively ours; only the header needs stamping.
        unsafe { std::ptr::addr_of_mut!((*ptr.as_ptr()).header).write(NodeHeader::new(leaf)) };
        ptr
    }

    /// Gives the block back for [`crate::NodeAllocator::free_node`].
    pub fn release(ptr: NodePtr<K>) -> NonNull<NodeBlock> {
        ptr.cast()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    #[inline]
    pub fn num_items(&self) -> usize {
        self.header.num_items()
    }

    #[inline]
    fn set_num_items(&mut self, count: usize) {
        self.header.set_num_items(count);
    }

    #[inline]
    pub fn max_items(&self) -> usize {
        if self.is_leaf() {
            NodeLayout::<K>::MAX_LEAF_KEYS
        } else {
            NodeLayout::<K>::MAX_INNER_KEYS
        }
    }

    #[inline]
    pub fn min_items(&self) -> usize {
        if self.is_leaf() {
            NodeLayout::<K>::MIN_LEAF_KEYS
        } else {
            NodeLayout::<K>::MIN_INNER_KEYS
        }
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.max_items() - self.num_items()
    }

    /// Number of keys in the subtree rooted at this node.
    #[inline]
    pub fn tree_count(&self) -> u64 {
        if self.is_leaf() {
            self.num_items() as u64
        } else {
            self.header.subtree_count()
        }
    }

    /// Adjusts the stored subtree count of an inner node; no-op for leaves,
    /// whose subtree is their item count.
    #[inline]
    pub fn add_tree_count(&mut self, delta: i64) {
        if !self.is_leaf() {
            let count = self.header.subtree_count() as i64 + delta;
            debug_assert!(count >= 0);
            self.header.set_subtree_count(count as u64);
        }
    }

    /// Recomputes the stored subtree count from the children. The structural
    /// primitives below call this for every inner node they touch, so a
    /// node's count is correct whenever its children's counts are.
    pub fn fix_tree_count(&mut self) {
        if self.is_leaf() {
            return;
        }
        let mut total = self.num_items() as u64;
        for i in 0..=self.num_items() {
            // Safety: children of a live inner node are live and unaliased.
            total += unsafe { node_ref(self.child(i)) }.tree_count();
        }
        self.header.set_subtree_count(total);
    }

    #[inline]
    pub fn key(&self, index: usize) -> K {
        debug_assert!(index < self.num_items());
        K::read_from_bytes(&self.body[NodeLayout::<K>::key_range(index)]).unwrap()
    }

    #[inline]
    pub fn set_key(&mut self, index: usize, key: K) {
        debug_assert!(index < self.max_items());
        key.write_to(&mut self.body[NodeLayout::<K>::key_range(index)])
            .unwrap();
    }

    #[inline]
    pub fn child(&self, index: usize) -> NodePtr<K> {
        debug_assert!(!self.is_leaf());
        debug_assert!(index <= self.num_items());
        // Safety: in-bounds read of a pointer a mutation previously stored.
        unsafe {
            (self.body.as_ptr().add(NodeLayout::<K>::child_offset(index)) as *const NodePtr<K>)
                .read_unaligned()
        }
    }

    #[inline]
    pub fn set_child(&mut self, index: usize, child: NodePtr<K>) {
        debug_assert!(!self.is_leaf());
        debug_assert!(NodeLayout::<K>::child_offset(index) + PTR_SIZE <= NODE_BODY_SIZE);
        // Safety: in-bounds write, checked above.
        unsafe {
            (self.body.as_mut_ptr().add(NodeLayout::<K>::child_offset(index)) as *mut NodePtr<K>)
                .write_unaligned(child);
        }
    }

    /// Binary search over the live keys.
    pub fn search<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> SearchResult {
        let mut lo = 0;
        let mut hi = self.num_items();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(key, &self.key(mid)) {
                Ordering::Equal => return SearchResult { index: mid, found: true },
                Ordering::Less => hi = mid,
                // Slots up to mid hold keys strictly below the probe.
                Ordering::Greater => lo = mid + 1,
            }
        }
        SearchResult { index: lo, found: false }
    }

    /// First key of a fresh root leaf.
    pub fn init_single(&mut self, key: K) {
        debug_assert!(self.is_leaf() && self.num_items() == 0);
        self.set_key(0, key);
        self.set_num_items(1);
    }

    /// Opens a hole at `index`, moving keys `[index, count)` and, for inner
    /// nodes, child pointers `[index, count]` one slot right, then bumps the
    /// count. The caller fills the hole.
    pub fn shift_right(&mut self, index: usize) {
        let count = self.num_items();
        debug_assert!(index <= count && count < self.max_items());
        if count > index {
            let s = Self::KEY_SIZE;
            self.body.copy_within(index * s..count * s, (index + 1) * s);
            if !self.is_leaf() {
                let co = NodeLayout::<K>::CHILDREN_OFFSET;
                self.body.copy_within(
                    co + index * PTR_SIZE..co + (count + 1) * PTR_SIZE,
                    co + (index + 1) * PTR_SIZE,
                );
            }
        }
        self.set_num_items(count + 1);
    }

    /// Removes the key at `index` and drops the count. For inner nodes,
    /// `child_step_right` picks which adjacent child pointer goes with it:
    /// the child at `index` (false) or the one at `index + 1` (true).
    pub fn shift_left(&mut self, index: usize, child_step_right: bool) {
        let count = self.num_items();
        debug_assert!(index < count);
        let s = Self::KEY_SIZE;
        if count - index - 1 > 0 {
            self.body.copy_within((index + 1) * s..count * s, index * s);
        }
        if !self.is_leaf() {
            let drop_at = index + child_step_right as usize;
            if drop_at < count {
                let co = NodeLayout::<K>::CHILDREN_OFFSET;
                self.body.copy_within(
                    co + (drop_at + 1) * PTR_SIZE..co + (count + 1) * PTR_SIZE,
                    co + drop_at * PTR_SIZE,
                );
            }
        }
        self.set_num_items(count - 1);
    }

    /// Drops the last key of a leaf, used when a separator is replaced by
    /// its in-order predecessor.
    pub fn leaf_erase_last(&mut self) {
        debug_assert!(self.is_leaf() && self.num_items() > 0);
        self.set_num_items(self.num_items() - 1);
    }

    fn insert_item(&mut self, index: usize, key: K) {
        debug_assert!(index <= self.num_items());
        self.shift_right(index);
        self.set_key(index, key);
    }

    /// Inserts into a leaf with spare capacity; `index` must respect order.
    pub fn leaf_insert(&mut self, index: usize, key: K) {
        debug_assert!(self.is_leaf() && self.num_items() < self.max_items());
        self.insert_item(index, key);
    }

    /// Inserts a separator and the child to its right into an inner node
    /// with spare capacity. Does not refresh the subtree count; the caller
    /// fixes it once the whole mutation settled.
    pub fn inner_insert(&mut self, index: usize, key: K, child: NodePtr<K>) {
        debug_assert!(!self.is_leaf() && self.num_items() < self.max_items());
        self.insert_item(index, key);
        self.set_child(index + 1, child);
    }

    /// Splits a full node around its median, which is extracted (not
    /// duplicated) and returned for insertion into the parent. `right` must
    /// be freshly claimed; it becomes the same kind and receives keys
    /// `[mid + 1, count)` and children `[mid + 1, count]`.
    pub fn split(&mut self, right: &mut Node<K>) -> K {
        let count = self.num_items();
        let mid = count / 2;
        let median = self.key(mid);
        right.header = NodeHeader::new(self.is_leaf());
        let s = Self::KEY_SIZE;
        let moved = count - (mid + 1);
        right.body[..moved * s].copy_from_slice(&self.body[(mid + 1) * s..count * s]);
        if !self.is_leaf() {
            let co = NodeLayout::<K>::CHILDREN_OFFSET;
            right.body[co..co + (moved + 1) * PTR_SIZE].copy_from_slice(
                &self.body[co + (mid + 1) * PTR_SIZE..co + (count + 1) * PTR_SIZE],
            );
        }
        right.set_num_items(moved);
        self.set_num_items(mid);
        if !self.is_leaf() {
            right.fix_tree_count();
            self.fix_tree_count();
        }
        median
    }

    /// Appends the parent separator and the entire contents of `right`,
    /// leaving `right` empty for the caller to retire.
    /// Requires `count + 1 + right.count <= max`.
    pub fn merge_from_right(&mut self, sep: K, right: &mut Node<K>) {
        debug_assert_eq!(self.is_leaf(), right.is_leaf());
        debug_assert!(self.num_items() + 1 + right.num_items() <= self.max_items());
        let count = self.num_items();
        let right_count = right.num_items();
        self.set_key(count, sep);
        let s = Self::KEY_SIZE;
        self.body[(count + 1) * s..(count + 1 + right_count) * s]
            .copy_from_slice(&right.body[..right_count * s]);
        if !self.is_leaf() {
            let co = NodeLayout::<K>::CHILDREN_OFFSET;
            self.body[co + (count + 1) * PTR_SIZE..co + (count + 2 + right_count) * PTR_SIZE]
                .copy_from_slice(&right.body[co..co + (right_count + 1) * PTR_SIZE]);
        }
        self.set_num_items(count + 1 + right_count);
        right.set_num_items(0);
        if !self.is_leaf() {
            self.fix_tree_count();
        }
    }

    /// Moves `count` items from the child at `child_pos` into its left
    /// sibling: the separator drops to the end of the sibling, `count - 1`
    /// leading keys follow it, and the source's next key is promoted as the
    /// new separator. Children travel with their keys.
    pub fn rebalance_child_to_left(&mut self, child_pos: usize, count: usize) {
        debug_assert!(child_pos > 0);
        // Safety: the two siblings are distinct live children of this node.
        let src = unsafe { node_mut(self.child(child_pos)) };
        let dest = unsafe { node_mut(self.child(child_pos - 1)) };
        debug_assert!(count >= 1 && src.num_items() >= count);
        debug_assert!(dest.free_slots() >= count);

        let dest_items = dest.num_items();
        dest.set_key(dest_items, self.key(child_pos - 1));
        for i in 1..count {
            dest.set_key(dest_items + i, src.key(i - 1));
        }
        self.set_key(child_pos - 1, src.key(count - 1));
        for i in count..src.num_items() {
            src.set_key(i - count, src.key(i));
        }

        if !src.is_leaf() {
            for i in 0..count {
                dest.set_child(dest_items + 1 + i, src.child(i));
            }
            for i in count..=src.num_items() {
                src.set_child(i - count, src.child(i));
            }
        }

        dest.set_num_items(dest_items + count);
        src.set_num_items(src.num_items() - count);
        if !src.is_leaf() {
            dest.fix_tree_count();
            src.fix_tree_count();
        }
    }

    /// Mirror of [`Self::rebalance_child_to_left`]: right-shifts the
    /// destination by `count`, pushes the source's trailing keys plus the
    /// separator into the low end and promotes a new separator from the
    /// source's tail.
    pub fn rebalance_child_to_right(&mut self, child_pos: usize, count: usize) {
        debug_assert!(child_pos < self.num_items());
        // Safety: the two siblings are distinct live children of this node.
        let src = unsafe { node_mut(self.child(child_pos)) };
        let dest = unsafe { node_mut(self.child(child_pos + 1)) };
        debug_assert!(count >= 1 && src.num_items() >= count);
        debug_assert!(dest.free_slots() >= count);

        let src_items = src.num_items();
        let dest_items = dest.num_items();
        debug_assert!(dest_items > 0);
        for i in (0..dest_items).rev() {
            dest.set_key(i + count, dest.key(i));
        }
        let new_sep = src.key(src_items - count);
        for i in 1..count {
            dest.set_key(i - 1, src.key(src_items - count + i));
        }
        dest.set_key(count - 1, self.key(child_pos));
        self.set_key(child_pos, new_sep);

        if !src.is_leaf() {
            for i in (0..=dest_items).rev() {
                dest.set_child(i + count, dest.child(i));
            }
            for i in 0..count {
                dest.set_child(i, src.child(src_items - (count - 1) + i));
            }
        }

        dest.set_num_items(dest_items + count);
        src.set_num_items(src_items - count);
        if !src.is_leaf() {
            dest.fix_tree_count();
            src.fix_tree_count();
        }
    }

    /// Relieves the full child at `child_pos` ahead of an insert at
    /// `insert_pos` by shifting items into a sibling with spare capacity,
    /// preferring the left one. Returns the node and slot the insert was
    /// redirected to, or `None` when neither sibling has room and the caller
    /// must split.
    pub fn rebalance_child_for_insert(
        &mut self,
        child_pos: usize,
        insert_pos: usize,
    ) -> Option<(NodePtr<K>, usize)> {
        let child = self.child(child_pos);
        // Safety: child nodes are live; references are dropped before the
        // rebalance primitives re-borrow them.
        let child_items = unsafe { node_ref(child) }.num_items();

        if child_pos > 0 {
            let left = self.child(child_pos - 1);
            let dest_free = unsafe { node_ref(left) }.free_slots();
            if dest_free > 0 {
                // Inserting at the right edge packs the left sibling solid;
                // anywhere else moves half the spare capacity so follow-up
                // inserts near the same slot don't immediately rebalance
                // again.
                let to_move = if insert_pos == child_items {
                    dest_free
                } else if dest_free > 1 {
                    dest_free / 2
                } else {
                    0
                };
                if to_move > 0 {
                    debug_assert!(to_move < child_items);
                    let dest_old_items = unsafe { node_ref(left) }.num_items();
                    self.rebalance_child_to_left(child_pos, to_move);
                    if insert_pos < to_move {
                        // The slot moved with the items; one extra for the
                        // separator that rotated through this node.
                        return Some((left, dest_old_items + insert_pos + 1));
                    }
                    return Some((child, insert_pos - to_move));
                }
            }
        }

        if child_pos < self.num_items() {
            let right = self.child(child_pos + 1);
            let dest_free = unsafe { node_ref(right) }.free_slots();
            if dest_free > 0 {
                let to_move = if insert_pos == 0 {
                    dest_free
                } else if dest_free > 1 {
                    dest_free / 2
                } else {
                    0
                };
                if to_move > 0 {
                    debug_assert!(to_move < child_items);
                    self.rebalance_child_to_right(child_pos, to_move);
                    let remaining = unsafe { node_ref(child) }.num_items();
                    if insert_pos > remaining {
                        return Some((right, insert_pos - (remaining + 1)));
                    }
                    return Some((child, insert_pos));
                }
            }
        }

        None
    }

    /// Repairs the deficient child at `child_pos`: merges it with a sibling
    /// when the combined contents fit, otherwise redistributes half the
    /// imbalance. Returns the node a merge retired, which the caller frees.
    pub fn merge_or_rebalance_child(&mut self, child_pos: usize) -> Option<NodePtr<K>> {
        debug_assert!(self.num_items() >= 1);
        let child = self.child(child_pos);
        // Safety: child nodes are live; references are dropped before the
        // merge/rebalance primitives re-borrow them.
        let child_items = unsafe { node_ref(child) }.num_items();
        debug_assert!(child_items < unsafe { node_ref(child) }.min_items());

        if child_pos > 0 {
            let left = self.child(child_pos - 1);
            let left_node = unsafe { node_ref(left) };
            if left_node.num_items() + 1 + child_items <= left_node.max_items() {
                let sep = self.key(child_pos - 1);
                unsafe { node_mut(left) }.merge_from_right(sep, unsafe { node_mut(child) });
                self.shift_left(child_pos - 1, true);
                return Some(child);
            }
        }

        if child_pos < self.num_items() {
            let right = self.child(child_pos + 1);
            let right_items = unsafe { node_ref(right) }.num_items();
            if child_items + 1 + right_items <= unsafe { node_ref(right) }.max_items() {
                let sep = self.key(child_pos);
                unsafe { node_mut(child) }.merge_from_right(sep, unsafe { node_mut(right) });
                self.shift_left(child_pos, true);
                return Some(right);
            }

            // TODO: skip this when the deletion came off the child's front
            // and the child isn't empty; deletes marching through the low end
            // of the tree pay for a redistribution they get no benefit from.
            let to_move = (right_items - child_items) / 2;
            debug_assert!(to_move >= 1 && to_move < right_items);
            self.rebalance_child_to_left(child_pos + 1, to_move);
            return None;
        }

        let left = self.child(child_pos - 1);
        let left_items = unsafe { node_ref(left) }.num_items();
        let to_move = (left_items - child_items) / 2;
        debug_assert!(to_move >= 1 && to_move < left_items);
        self.rebalance_child_to_right(child_pos - 1, to_move);
        None
    }
}
