//! Byte-at-a-time traversal. `Cursor` walks a single PACT, tracking the
//! path of nodes reached at each depth so `push`/`pop` are O(1). `PaddedCursor`
//! wraps a `Cursor` and inserts constant zero bytes at compile-time-marked
//! padding depths, letting segments of differing natural width line up to a
//! common stride for a join engine that wants uniform per-variable byte
//! counts. Grounded on the commented `ByteCursor`/`CursorIterator` sketch in
//! `src/pact/bytecursor.rs` and `src/patch/paddingcursor.rs`.

use std::fmt::Debug;

use crate::bitset::ByteBitset;
use crate::patch::node::Node;
use crate::patch::{KeyOrdering, KeySegmentation};

/// A stateful descent through one PACT. `path[d]` is the node reached after
/// `d` pushes; `path[0]` is the root handed to `new`.
pub struct Cursor<const K: usize, V> {
    depth: usize,
    path: Vec<Node<K, V>>,
}

impl<const K: usize, V: Clone> Cursor<K, V> {
    pub fn new(root: Node<K, V>) -> Self {
        Cursor {
            depth: 0,
            path: vec![root],
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn current(&self) -> &Node<K, V> {
        &self.path[self.depth]
    }

    /// The byte fixed at the current depth, or `None` if the current node
    /// branches here.
    pub fn peek(&self) -> Option<u8> {
        self.current().peek(self.depth)
    }

    /// The candidate byte set at the current depth.
    pub fn propose(&self, out: &mut ByteBitset) {
        self.current().propose(self.depth, out);
    }

    /// Descends through the child indexed by `byte`. `byte` must have been
    /// a member of the most recent `propose()` — violating this is a
    /// programmer error (spec.md §7), asserted rather than returned.
    pub fn push(&mut self, byte: u8) {
        assert!(self.depth < K, "push past key length {K}");
        let mut proposal = ByteBitset::new_empty();
        self.propose(&mut proposal);
        assert!(
            proposal.is_set(byte),
            "push of byte {byte} not present in the last propose()"
        );
        let child = self.current().child_at(self.depth, byte);
        self.path.push(child);
        self.depth += 1;
    }

    /// Retracts one depth.
    pub fn pop(&mut self) {
        assert!(self.depth > 0, "pop below depth 0");
        self.path.pop();
        self.depth -= 1;
    }

    /// I9's selectivity hint for the current node: the number of distinct
    /// segment-prefixes below, or 1 if the current node's branch point
    /// lies in a different segment than the current depth.
    pub fn segment_count<O: KeyOrdering<K>, S: KeySegmentation<K>>(&self) -> u64 {
        self.current().segment_count_at::<O, S>(self.depth)
    }

    /// The structural hash of the subtree at the current position. Used by
    /// `TribleConstraint::sample_variable` as a cheap stand-in for a
    /// min-hash sample: two cursors positioned over an identical subtree
    /// always agree here, regardless of insertion order (DESIGN.md OQ-6).
    pub fn node_hash(&self) -> crate::patch::hash::Hash128 {
        self.current().hash()
    }
}

/// Marks which tree-order depths of a `PaddedCursor` are pure padding
/// (forced to value 0, never advancing the wrapped `Cursor`).
pub trait Padding<const KEY_LEN: usize>: Copy + Clone + Debug {
    fn is_padding(at_depth: usize) -> bool;
}

/// No depth is padding; `PaddedCursor<K, NoPadding, V>` behaves exactly
/// like the `Cursor` it wraps.
#[derive(Copy, Clone, Debug)]
pub struct NoPadding {}

impl<const KEY_LEN: usize> Padding<KEY_LEN> for NoPadding {
    fn is_padding(_at_depth: usize) -> bool {
        false
    }
}

/// Wraps a `Cursor`, inserting constant zero bytes at every depth `P` marks
/// as padding. The wrapped cursor's own depth only advances on non-padding
/// pushes, so segments of differing natural width can present a uniform
/// stride to a query engine without the underlying PACT storing the
/// padding bytes at all.
pub struct PaddedCursor<const K: usize, P: Padding<K>, V> {
    inner: Cursor<K, V>,
    depth: usize,
    _padding: std::marker::PhantomData<P>,
}

impl<const K: usize, P: Padding<K>, V: Clone> PaddedCursor<K, P, V> {
    pub fn new(inner: Cursor<K, V>) -> Self {
        PaddedCursor {
            inner,
            depth: 0,
            _padding: std::marker::PhantomData,
        }
    }

    pub fn peek(&self) -> Option<u8> {
        if P::is_padding(self.depth) {
            Some(0)
        } else {
            self.inner.peek()
        }
    }

    pub fn propose(&self, out: &mut ByteBitset) {
        if P::is_padding(self.depth) {
            *out = ByteBitset::new_empty();
            out.set(0);
        } else {
            self.inner.propose(out);
        }
    }

    pub fn push(&mut self, byte: u8) {
        if P::is_padding(self.depth) {
            assert_eq!(byte, 0, "padding depth {} only accepts byte 0", self.depth);
        } else {
            self.inner.push(byte);
        }
        self.depth += 1;
    }

    pub fn pop(&mut self) {
        assert!(self.depth > 0, "pop below depth 0");
        self.depth -= 1;
        if !P::is_padding(self.depth) {
            self.inner.pop();
        }
    }

    pub fn segment_count<O: KeyOrdering<K>, S: KeySegmentation<K>>(&self) -> u64 {
        self.inner.segment_count::<O, S>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::hash;
    use crate::patch::{IdentityOrder, SingleSegmentation};
    use crate::patch::node::Node;

    fn build() -> Node<4, u32> {
        hash::init_with_seed([42; 16]);
        let mut n = Node::<4, u32>::None;
        n = n.put::<SingleSegmentation>(&[0, 0, 0, 0], 1);
        n = n.put::<SingleSegmentation>(&[0, 0, 0, 1], 2);
        n
    }

    #[test]
    fn push_pop_reaches_leaf() {
        let root = build();
        let mut cursor = Cursor::new(root);
        let mut proposal = ByteBitset::new_empty();
        for byte in [0u8, 0, 0] {
            cursor.propose(&mut proposal);
            assert!(proposal.is_set(byte));
            cursor.push(byte);
        }
        cursor.propose(&mut proposal);
        assert!(proposal.is_set(0));
        assert!(proposal.is_set(1));
        cursor.push(0);
        assert_eq!(cursor.peek(), None);
        cursor.pop();
        cursor.push(1);
        assert_eq!(cursor.peek(), None);
    }

    #[test]
    #[should_panic(expected = "not present")]
    fn push_rejects_byte_outside_last_propose() {
        let root = build();
        let mut cursor = Cursor::new(root);
        cursor.push(9);
    }

    #[test]
    fn segment_count_reports_one_outside_segment() {
        let root = build();
        let cursor = Cursor::new(root);
        assert_eq!(cursor.segment_count::<IdentityOrder, SingleSegmentation>(), 2);
    }
}
