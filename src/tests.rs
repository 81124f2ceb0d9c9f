use crate::*;
use rand::prelude::*;
use std::{cell::Cell, cmp::Ordering, collections::BTreeSet, ptr::NonNull, rc::Rc};

fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| thread_rng().gen(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

#[test]
fn test_send() {
    fn assert_send<T: Send>() {}

    assert_send::<RankTree<u64>>();
    assert_send::<RankTree<u64, OrdComparator, PooledAllocator>>();
    assert_send::<Error>();
}

#[test]
fn model_random_operations() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    let mut tree = RankTree::new();
    let mut model = BTreeSet::new();

    for round in 0..4_000 {
        let key = rng.gen_range(0..600u64);
        if rng.gen_bool(0.6) {
            assert_eq!(tree.insert(key).unwrap(), model.insert(key), "insert {key}");
        } else {
            assert_eq!(tree.remove(&key), model.remove(&key), "remove {key}");
        }
        assert_eq!(tree.len(), model.len() as u64);
        if round % 64 == 0 {
            tree.validate();
            assert!(tree.iter().eq(model.iter().copied()));
            assert_eq!(tree.first(), model.first().copied());
            assert_eq!(tree.last(), model.last().copied());
        }
    }

    tree.validate();
    assert!(tree.iter().eq(model.iter().copied()));
    for (i, key) in model.iter().enumerate() {
        assert_eq!(tree.rank(key), Some(i as u64));
        assert_eq!(tree.at_rank(i as u64), Some(*key));
    }
}

#[test]
fn rank_matches_sorted_position() {
    let mut rng = get_rng();
    let mut keys: Vec<u64> = (1..=1000).collect();
    keys.shuffle(&mut rng);

    let mut tree = RankTree::new();
    for &key in &keys {
        assert!(tree.insert(key).unwrap());
    }
    tree.validate();

    for key in 1..=1000u64 {
        assert_eq!(tree.rank(&key), Some(key - 1));
        assert_eq!(tree.at_rank(key - 1), Some(key));
    }
    assert_eq!(tree.rank(&0), None);
    assert_eq!(tree.at_rank(1000), None);
}

#[test]
fn removing_front_half_shrinks_depth() {
    let mut tree = RankTree::new();
    for key in 1..=100u64 {
        tree.insert(key).unwrap();
    }
    for key in 1..=50u64 {
        assert!(tree.remove(&key));
        tree.validate();
    }
    assert!(tree.iter().eq(51..=100));
    assert!(tree.height() <= 2, "height {}", tree.height());
}

#[test]
fn removing_every_even_key() {
    let mut tree = RankTree::new();
    for key in 1..=500u64 {
        tree.insert(key).unwrap();
    }
    for key in (2..=500u64).step_by(2) {
        assert!(tree.remove(&key));
    }
    tree.validate();
    assert_eq!(tree.len(), 250);
    assert!(tree.iter().eq((1..=500).step_by(2)));
}

#[test]
fn ascending_inserts_pack_nodes() {
    let mut tree = RankTree::new();
    for key in 0..2_000u64 {
        tree.insert(key).unwrap();
        if key % 16 == 0 {
            tree.validate();
        }
    }
    tree.validate();
    assert!(tree.iter().eq(0..2_000));
}

#[test]
fn descending_inserts() {
    let mut tree = RankTree::new();
    for key in (0..2_000u64).rev() {
        tree.insert(key).unwrap();
        if key % 16 == 0 {
            tree.validate();
        }
    }
    tree.validate();
    assert!(tree.iter().eq(0..2_000));
}

#[test]
fn narrow_keys_use_wide_nodes() {
    // 2-byte keys: 124 keys per leaf, still under the 7-bit count limit.
    let mut tree = RankTree::new();
    for key in 0..3_000u16 {
        tree.insert(key).unwrap();
    }
    tree.validate();
    assert_eq!(tree.len(), 3_000);
    assert_eq!(tree.rank(&1_500), Some(1_500));
    for key in (0..3_000u16).step_by(3) {
        assert!(tree.remove(&key));
    }
    tree.validate();
    assert_eq!(tree.len(), 2_000);
}

#[test]
fn wide_keys_build_deeper_trees() {
    // 16-byte keys: 15 per leaf, so a few thousand keys force real depth.
    let mut rng = get_rng();
    let mut keys: Vec<u128> = (0..4_000).map(|i| (i as u128) << 64 | i as u128).collect();
    keys.shuffle(&mut rng);

    let mut tree = RankTree::new();
    for &key in &keys {
        tree.insert(key).unwrap();
    }
    tree.validate();
    assert!(tree.height() >= 3);
    keys.sort_unstable();
    assert!(tree.iter().eq(keys.iter().copied()));
    for &key in keys.iter().rev().take(2_000) {
        assert!(tree.remove(&key));
    }
    tree.validate();
    assert_eq!(tree.len(), 2_000);
}

#[test]
fn pooled_allocator_backs_a_tree() {
    let mut tree = RankTree::new_in(OrdComparator, PooledAllocator::new());
    let mut model = BTreeSet::new();
    let mut rng = get_rng();
    for _ in 0..2_000 {
        let key = rng.gen_range(0..400u64);
        if rng.gen_bool(0.5) {
            assert_eq!(tree.insert(key).unwrap(), model.insert(key));
        } else {
            assert_eq!(tree.remove(&key), model.remove(&key));
        }
    }
    tree.validate();
    assert!(tree.iter().eq(model.iter().copied()));
}

/// Orders packed (id, payload) keys by the id half only, the shape a
/// score-index comparator takes.
#[derive(Debug, Default, Clone, Copy)]
struct ByHigh;

impl KeyComparator<u64> for ByHigh {
    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        (a >> 32).cmp(&(b >> 32))
    }
}

#[test]
fn partial_view_comparator_get_returns_stored_key() {
    let mut tree = RankTree::with_comparator(ByHigh);
    for id in 0..300u64 {
        assert!(tree.insert(id << 32 | (id * 7 + 1)).unwrap());
    }
    tree.validate();
    // The probe's low half is ignored; the stored payload comes back.
    assert_eq!(tree.get(&(42 << 32)), Some(42 << 32 | (42 * 7 + 1)));
    assert!(!tree.insert(42 << 32 | 9999).unwrap());
    assert!(tree.remove(&(42 << 32)));
    assert_eq!(tree.get(&(42 << 32)), None);
    tree.validate();
}

#[derive(Debug, Default, Clone, Copy)]
struct Reverse;

impl KeyComparator<u64> for Reverse {
    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        b.cmp(a)
    }
}

#[test]
fn reverse_comparator_reverses_ranks() {
    let mut tree = RankTree::with_comparator(Reverse);
    for key in 0..500u64 {
        tree.insert(key).unwrap();
    }
    tree.validate();
    assert_eq!(tree.rank(&499), Some(0));
    assert_eq!(tree.rank(&0), Some(499));
    assert_eq!(tree.at_rank(0), Some(499));
    assert_eq!(tree.first(), Some(499));
    let descending: Vec<u64> = tree.iter().collect();
    assert!(descending.windows(2).all(|w| w[0] > w[1]));
}

/// Heap allocator with a shared budget, for exercising out-of-memory paths.
#[derive(Debug, Clone)]
struct BudgetAllocator {
    budget: Rc<Cell<usize>>,
}

impl NodeAllocator for BudgetAllocator {
    fn allocate_node(&mut self) -> Result<NonNull<NodeBlock>, Error> {
        if self.budget.get() == 0 {
            return Err(Error::OutOfMemory);
        }
        self.budget.set(self.budget.get() - 1);
        HeapAllocator.allocate_node()
    }

    unsafe fn free_node(&mut self, node: NonNull<NodeBlock>) {
        HeapAllocator.free_node(node);
    }
}

#[test]
fn failed_allocation_leaves_tree_intact() {
    let budget = Rc::new(Cell::new(1));
    let mut tree = RankTree::new_in(OrdComparator, BudgetAllocator { budget: budget.clone() });

    for key in 1..=31u64 {
        tree.insert(key).unwrap();
    }
    assert_eq!(budget.get(), 0);

    // The overflowing insert needs two blocks (right leaf + new root).
    // With none available, and with only one of the two available, it must
    // fail without touching the tree.
    for grant in [0, 1] {
        budget.set(grant);
        assert_eq!(tree.insert(32), Err(Error::OutOfMemory));
        assert_eq!(tree.len(), 31);
        assert!(!tree.contains(&32));
        tree.validate();
        assert!(tree.iter().eq(1..=31));
    }

    budget.set(2);
    assert!(tree.insert(32).unwrap());
    tree.validate();
    assert!(tree.iter().eq(1..=32));
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn insertion_idempotence(
            keys in prop::collection::btree_set(0u64..10_000, 1..400),
            pick in any::<prop::sample::Index>(),
        ) {
            let mut tree = RankTree::new();
            for &key in &keys {
                tree.insert(key).unwrap();
            }
            let keys_vec: Vec<u64> = keys.iter().copied().collect();
            let dup = keys_vec[pick.index(keys_vec.len())];
            prop_assert!(!tree.insert(dup).unwrap());
            prop_assert_eq!(tree.len(), keys.len() as u64);
            prop_assert!(tree.iter().eq(keys.iter().copied()));
            tree.validate();
        }

        #[test]
        fn insert_then_remove_restores_sequence(
            keys in prop::collection::btree_set(0u64..10_000, 0..300),
            extra in 10_000u64..20_000,
        ) {
            let mut tree = RankTree::new();
            for &key in &keys {
                tree.insert(key).unwrap();
            }
            prop_assert!(tree.insert(extra).unwrap());
            prop_assert!(tree.remove(&extra));
            tree.validate();
            prop_assert!(tree.iter().eq(keys.iter().copied()));
        }

        #[test]
        fn permutation_independence(
            keys in prop::collection::btree_set(0u64..5_000, 0..300)
                .prop_map(|s| s.into_iter().collect::<Vec<_>>())
                .prop_shuffle(),
        ) {
            let mut tree = RankTree::new();
            for &key in &keys {
                tree.insert(key).unwrap();
            }
            tree.validate();
            let sorted: BTreeSet<u64> = keys.iter().copied().collect();
            prop_assert!(tree.iter().eq(sorted.iter().copied()));
        }

        #[test]
        fn splits_then_reverse_deletions_roll_back(
            extras in prop::collection::btree_set(100u64..2_000, 50..400),
        ) {
            let start: Vec<u64> = (0..20).collect();
            let mut tree = RankTree::new();
            for &key in &start {
                tree.insert(key).unwrap();
            }
            let extras: Vec<u64> = extras.into_iter().collect();
            for &key in &extras {
                tree.insert(key).unwrap();
            }
            prop_assert!(tree.height() >= 2);

            for &key in extras.iter().rev() {
                prop_assert!(tree.remove(&key));
            }
            tree.validate();
            prop_assert_eq!(tree.height(), 1);
            prop_assert!(tree.iter().eq(start.iter().copied()));
        }
    }
}
