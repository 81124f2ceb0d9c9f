//! In-memory rank-augmented B+tree for ordered-set indexes.
//!
//! `ranktree` packs small, trivially-copyable keys into fixed 256-byte nodes
//! so that per-item metadata shrinks to a few bits, compared to the tens of
//! bytes a skip list spends per entry. It is meant to back the sorted-set
//! index of an in-memory database, where one tree lives inside one shard and
//! is only ever touched by that shard's thread.
//!
//! Design notes:
//!
//! * Nodes are raw 256-byte blocks. Nothing besides the 8-byte header is a
//!   declared field; key slots and the child pointer array are computed
//!   offsets, so the representation stays dense for any key size.
//! * No parent pointers. Mutations record their descent in a bounded path
//!   stack and repair the tree bottom-up from it, which keeps per-item
//!   overhead at zero and still bounds every walk at 16 levels.
//! * Every node header carries the size of its subtree, so `rank` and
//!   `at_rank` run in O(log N) without any auxiliary structure.
//! * Node storage is pluggable through [`NodeAllocator`], letting callers
//!   wire the tree into a pooled heap.
//!
//! ```
//! use ranktree::RankTree;
//!
//! let mut scores = RankTree::new();
//! for score in [30u64, 10, 20] {
//!     scores.insert(score).unwrap();
//! }
//! assert_eq!(scores.rank(&20), Some(1));
//! assert_eq!(scores.at_rank(2), Some(30));
//! assert!(scores.remove(&10));
//! assert_eq!(scores.iter().collect::<Vec<_>>(), vec![20, 30]);
//! ```
//!
//! The tree is not internally synchronized. It is `Send` (a shard may migrate
//! between executor threads) but deliberately not `Sync`.

#![warn(missing_docs)]

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod alloc;
mod cursor;
mod error;
mod node;
mod path;
mod repr;
mod tree;

#[cfg(test)]
mod tests;

pub use crate::{
    alloc::{HeapAllocator, NodeAllocator, NodeBlock, PooledAllocator},
    cursor::Iter,
    error::Error,
    repr::{Key, NODE_SIZE},
    tree::{KeyComparator, OrdComparator, RankTree},
};
