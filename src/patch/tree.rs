//! The root handle. `Tree` owns one reference to a PACT root and exposes
//! the public put/get/union/subset surface (spec.md §6.1), translating
//! between the caller's natural key order and the tree's storage order via
//! `O: KeyOrdering`. Grounded on `src/patch.rs`'s `PATCH` struct (`insert`,
//! `get`, `union`, `intersect`, `len`, `branch`) reworked against the
//! persistent `Node` in `node.rs` rather than a mutable arena.

use std::fmt::Debug;
use std::marker::PhantomData;

use crate::patch::cursor::{Cursor, PaddedCursor, Padding};
use crate::patch::node::{self, Node, NodeIter};
use crate::patch::{KeyOrdering, KeySegmentation};

/// A persistent ordered map keyed by `[u8; K]`, backed by a PACT. Cloning a
/// `Tree` (or calling [`Tree::branch`]) is O(1): it only bumps the root
/// `Rc`'s refcount, producing an independent snapshot that shares structure
/// with the original until one of them is mutated again.
pub struct Tree<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V> {
    root: Node<K, V>,
    _ordering: PhantomData<O>,
    _segmentation: PhantomData<S>,
}

impl<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V> Clone for Tree<K, O, S, V> {
    fn clone(&self) -> Self {
        Tree {
            root: self.root.clone(),
            _ordering: PhantomData,
            _segmentation: PhantomData,
        }
    }
}

impl<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V> Default for Tree<K, O, S, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V> Tree<K, O, S, V> {
    pub fn new() -> Self {
        Tree {
            root: Node::None,
            _ordering: PhantomData,
            _segmentation: PhantomData,
        }
    }

    /// Inserts `(key, value)`. A re-insert of an already-present key
    /// overwrites its value (DESIGN.md OQ-4) without changing the
    /// structural hash.
    pub fn put(&mut self, key: &[u8; K], value: V)
    where
        V: Clone,
    {
        let tree_key = O::tree_ordered(key);
        self.root = self.root.put::<S>(&tree_key, value);
    }

    pub fn get(&self, key: &[u8; K]) -> Option<V>
    where
        V: Clone,
    {
        let tree_key = O::tree_ordered(key);
        self.root.get(0, &tree_key)
    }

    pub fn count(&self) -> u64 {
        self.root.leaf_count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn is_equal(&self, other: &Tree<K, O, S, V>) -> bool {
        self.root.is_equal(&other.root)
    }

    pub fn is_subset_of(&self, other: &Tree<K, O, S, V>) -> bool
    where
        V: Clone,
    {
        self.root.is_subset_of(&other.root)
    }

    pub fn is_intersecting(&self, other: &Tree<K, O, S, V>) -> bool
    where
        V: Clone,
    {
        self.root.is_intersecting(&other.root)
    }

    /// An independent snapshot sharing structure with `self` (O(1), bumps
    /// the root `Rc`'s refcount).
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// Structural union of `trees`, grounded on `patch.rs`'s recursive
    /// `union` (shared-hash short circuit, common-infix walk, propose-union
    /// of children).
    pub fn init_union(trees: &[Tree<K, O, S, V>]) -> Self
    where
        V: Clone,
    {
        let roots: Vec<Node<K, V>> = trees.iter().map(|t| t.root.clone()).collect();
        Tree {
            root: node::union(&roots),
            _ordering: PhantomData,
            _segmentation: PhantomData,
        }
    }

    /// Structural intersection of `trees`, grounded on `node::intersect`
    /// (spec.md §9's "derive it from the union recipe" Design Note).
    pub fn init_intersection(trees: &[Tree<K, O, S, V>]) -> Self
    where
        V: Clone,
    {
        let roots: Vec<Node<K, V>> = trees.iter().map(|t| t.root.clone()).collect();
        Tree {
            root: node::intersect(&roots),
            _ordering: PhantomData,
            _segmentation: PhantomData,
        }
    }

    /// A depth-first walk over every reachable node, yielding `(start_depth,
    /// key_prefix, node)` with `key_prefix` translated back to the caller's
    /// natural key order.
    pub fn nodes(&self) -> NaturalNodeIter<K, O, S, V>
    where
        V: Clone,
    {
        NaturalNodeIter {
            inner: self.root.nodes(),
            _ordering: PhantomData,
            _segmentation: PhantomData,
        }
    }

    pub fn cursor(&self) -> Cursor<K, V>
    where
        V: Clone,
    {
        Cursor::new(self.root.clone())
    }

    pub fn padded_cursor<P: Padding<K>>(&self) -> PaddedCursor<K, P, V>
    where
        V: Clone,
    {
        PaddedCursor::new(self.cursor())
    }
}

pub struct NaturalNodeIter<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V> {
    inner: NodeIter<K, V>,
    _ordering: PhantomData<O>,
    _segmentation: PhantomData<S>,
}

impl<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V: Clone> Iterator
    for NaturalNodeIter<K, O, S, V>
{
    type Item = (usize, [u8; K], Node<K, V>);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, prefix, node) = self.inner.next()?;
        Some((depth, O::key_ordered(&prefix), node))
    }
}

impl<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>, V: Debug> Debug for Tree<K, O, S, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::hash;
    use crate::patch::{IdentityOrder, SingleSegmentation};

    type TestTree = Tree<4, IdentityOrder, SingleSegmentation, u32>;

    #[test]
    fn put_get_count_single_leaf() {
        hash::init_with_seed([11; 16]);
        let mut t = TestTree::new();
        t.put(&[0, 0, 0, 0], 1);
        assert_eq!(t.count(), 1);
        assert_eq!(t.get(&[0, 0, 0, 0]), Some(1));
        assert!(matches!(t.root, Node::Leaf(_)));
    }

    #[test]
    fn two_keys_build_branch_with_three_byte_infix() {
        hash::init_with_seed([12; 16]);
        let mut t = TestTree::new();
        t.put(&[0, 0, 0, 0], 1);
        t.put(&[0, 0, 0, 1], 2);
        assert_eq!(t.count(), 2);
        assert_eq!(t.get(&[0, 0, 0, 0]), Some(1));
        assert_eq!(t.get(&[0, 0, 0, 1]), Some(2));
        match &t.root {
            Node::Branch(b) => {
                assert_eq!(b.start_depth, 0);
                assert_eq!(b.branch_depth, 3);
            }
            _ => panic!("expected a Branch root"),
        }
    }

    #[test]
    fn branch_snapshot_independence() {
        hash::init_with_seed([13; 16]);
        let mut a = TestTree::new();
        a.put(&[0, 0, 0, 0], 1);
        let b = a.branch();
        a.put(&[0, 0, 0, 1], 2);
        assert_eq!(a.count(), 2);
        assert_eq!(b.count(), 1);
        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
    }

    #[test]
    fn insert_256_siblings_forces_growth() {
        hash::init_with_seed([14; 16]);
        let mut t = TestTree::new();
        for x in 0u8..=255 {
            t.put(&[0, 0, 0, x], x as u32);
        }
        assert_eq!(t.count(), 256);
        for x in 0u8..=255 {
            assert_eq!(t.get(&[0, 0, 0, x]), Some(x as u32));
        }
    }

    #[test]
    fn same_keys_any_order_hash_equal() {
        hash::init_with_seed([15; 16]);
        let keys: Vec<[u8; 4]> = (0u8..=255).map(|x| [0, 0, 0, x]).collect();
        let mut forward = TestTree::new();
        for k in &keys {
            forward.put(k, 1);
        }
        let mut backward = TestTree::new();
        for k in keys.iter().rev() {
            backward.put(k, 1);
        }
        assert!(forward.is_equal(&backward));
    }

    #[test]
    fn init_union_matches_sequential_insert() {
        hash::init_with_seed([16; 16]);
        let mut a = TestTree::new();
        for x in 0u8..10 {
            a.put(&[0, 0, 0, x], 1);
        }
        let mut b = TestTree::new();
        for x in 10u8..20 {
            b.put(&[0, 0, 0, x], 1);
        }
        let merged = TestTree::init_union(&[a.clone(), b.clone()]);

        let mut reference = a.clone();
        for x in 10u8..20 {
            reference.put(&[0, 0, 0, x], 1);
        }
        assert!(merged.is_equal(&reference));
        assert_eq!(merged.count(), 20);
    }

    #[test]
    fn init_intersection_keeps_only_shared_keys() {
        hash::init_with_seed([18; 16]);
        let mut a = TestTree::new();
        for x in 0u8..20 {
            a.put(&[0, 0, 0, x], 1);
        }
        let mut b = TestTree::new();
        for x in 10u8..30 {
            b.put(&[0, 0, 0, x], 1);
        }
        let shared = TestTree::init_intersection(&[a.clone(), b.clone()]);
        assert_eq!(shared.count(), 10);
        for x in 10u8..20 {
            assert_eq!(shared.get(&[0, 0, 0, x]), Some(1));
        }
        assert!(shared.is_subset_of(&a));
        assert!(shared.is_subset_of(&b));
    }

    #[test]
    fn nodes_iterator_enumerates_every_leaf_with_full_key() {
        hash::init_with_seed([17; 16]);
        let mut t = TestTree::new();
        let keys: Vec<[u8; 4]> = (0u8..16).map(|x| [1, 2, 3, x]).collect();
        for k in &keys {
            t.put(k, 1);
        }
        let mut seen: Vec<[u8; 4]> = t
            .nodes()
            .filter_map(|(_, prefix, node)| matches!(node, Node::Leaf(_)).then_some(prefix))
            .collect();
        seen.sort();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
