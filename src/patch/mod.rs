//! PACT: a persistent, 256-way byte-branching radix tree with cuckoo-hashed
//! branch buckets. `node` holds the tagged node taxonomy and the recursive
//! put/get/union/subset algorithms; `bytetable` holds the two-hash cuckoo
//! addressing scheme; `hash` holds the commutative structural hash; `cursor`
//! and `tree` build the public traversal and root-handle API on top of
//! `node`. Grounded on `src/patch.rs` + `src/patch/*.rs`, reworked as a safe
//! `Rc`-based persistent structure (DESIGN.md OQ-1).

pub mod bytetable;
pub mod cursor;
pub mod hash;
pub mod node;
pub mod tree;

use std::fmt::Debug;

pub use cursor::{Cursor, PaddedCursor};
pub use node::Node;
pub use tree::Tree;

/// Maps between a key's natural field layout and the byte order a
/// particular tree instance stores it in. `IdentityOrder` is the trivial
/// case; `TribleSet`'s six permutations (`src/trible.rs`) each implement
/// this to reorder `(E, A, V)` without copying the underlying PACT code.
pub trait KeyOrdering<const KEY_LEN: usize>: Copy + Clone + Debug {
    /// Given a position in tree-storage order, the position it occupies in
    /// the caller's natural key order.
    fn key_index(tree_index: usize) -> usize;
    /// The inverse of `key_index`.
    fn tree_index(key_index: usize) -> usize;

    fn tree_ordered(key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let mut new_key = [0u8; KEY_LEN];
        for (tree_i, slot) in new_key.iter_mut().enumerate() {
            *slot = key[Self::key_index(tree_i)];
        }
        new_key
    }

    fn key_ordered(tree_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let mut new_key = [0u8; KEY_LEN];
        for (key_i, slot) in new_key.iter_mut().enumerate() {
            *slot = tree_key[Self::tree_index(key_i)];
        }
        new_key
    }
}

/// Maps a key-order byte depth to a segment id, used by I9's selectivity
/// estimate (`Node::segment_count_at`) and `TribleConstraint::count_variable`.
pub trait KeySegmentation<const KEY_LEN: usize>: Copy + Clone + Debug {
    fn segment(at_depth: usize) -> usize;
}

/// The trivial ordering: tree order is key order.
#[derive(Copy, Clone, Debug)]
pub struct IdentityOrder {}

impl<const KEY_LEN: usize> KeyOrdering<KEY_LEN> for IdentityOrder {
    fn key_index(tree_index: usize) -> usize {
        tree_index
    }
    fn tree_index(key_index: usize) -> usize {
        key_index
    }
}

/// The trivial segmentation: the whole key is one segment.
#[derive(Copy, Clone, Debug)]
pub struct SingleSegmentation {}

impl<const KEY_LEN: usize> KeySegmentation<KEY_LEN> for SingleSegmentation {
    fn segment(_at_depth: usize) -> usize {
        0
    }
}
