//! The node taxonomy (`None`/`Leaf`/`Infix`/`Branch`) and the algorithms that
//! operate on it: peek/propose/get, the mismatch-driven `put`, the cuckoo
//! bucket protocol (grow included), structural union, and the subset/
//! intersection tests. Grounded on the union-dispatch shape of `pact.rs` and
//! the cuckoo bucket rules of `patch/bytetable.rs`, reworked as a safe
//! `Rc`-based persistent structure (see DESIGN.md, OQ-1 and OQ-5): every
//! `put` returns a fresh `Node` rather than mutating in place, so there is no
//! `single_owner` threading — structural sharing and independence of
//! snapshots fall out of never touching an existing `Rc` body.

use std::rc::Rc;

use rand::Rng;

use crate::bitset::ByteBitset;
use crate::patch::bytetable::{self, BUCKET_ENTRY_COUNT, MAX_BUCKET_COUNT, MAX_RETRIES};
use crate::patch::hash::{leaf_hash, Hash128};
use crate::patch::{KeyOrdering, KeySegmentation};

/// A node in the trie. `K` is the fixed key length in bytes.
pub enum Node<const K: usize, V> {
    None,
    Leaf(Rc<Leaf<K, V>>),
    Infix(Rc<Infix<K, V>>),
    Branch(Rc<Branch<K, V>>),
}

impl<const K: usize, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::None => Node::None,
            Node::Leaf(l) => Node::Leaf(Rc::clone(l)),
            Node::Infix(i) => Node::Infix(Rc::clone(i)),
            Node::Branch(b) => Node::Branch(Rc::clone(b)),
        }
    }
}

impl<const K: usize, V> Default for Node<K, V> {
    fn default() -> Self {
        Node::None
    }
}

pub struct Leaf<const K: usize, V> {
    pub start_depth: usize,
    pub key: [u8; K],
    pub value: V,
}

pub struct Infix<const K: usize, V> {
    pub start_depth: usize,
    pub branch_depth: usize,
    pub infix: Vec<u8>,
    pub child: Node<K, V>,
}

pub struct Branch<const K: usize, V> {
    pub start_depth: usize,
    pub branch_depth: usize,
    pub infix: Vec<u8>,
    pub child_set: ByteBitset,
    pub rand_hash_used: ByteBitset,
    pub node_hash: Hash128,
    pub leaf_count: u64,
    pub bucket_count: usize,
    pub buckets: Vec<[Node<K, V>; BUCKET_ENTRY_COUNT]>,
}

fn empty_bucket<const K: usize, V>() -> [Node<K, V>; BUCKET_ENTRY_COUNT] {
    [Node::None, Node::None, Node::None, Node::None]
}

impl<const K: usize, V> Node<K, V> {
    pub fn is_none(&self) -> bool {
        matches!(self, Node::None)
    }

    pub fn start_depth(&self) -> usize {
        match self {
            Node::None => 0,
            Node::Leaf(l) => l.start_depth,
            Node::Infix(i) => i.start_depth,
            Node::Branch(b) => b.start_depth,
        }
    }

    /// For `Leaf` there is no further branch point; `K` is used as a
    /// sentinel so comparisons against a real `branch_depth` behave as "this
    /// node never diverges before the end of the key".
    pub fn branch_depth(&self) -> usize {
        match self {
            Node::None => 0,
            Node::Leaf(_) => K,
            Node::Infix(i) => i.branch_depth,
            Node::Branch(b) => b.branch_depth,
        }
    }

    pub fn hash(&self) -> Hash128 {
        match self {
            Node::None => Hash128::ZERO,
            Node::Leaf(l) => leaf_hash(&l.key),
            Node::Infix(i) => i.child.hash(),
            Node::Branch(b) => b.node_hash,
        }
    }

    pub fn leaf_count(&self) -> u64 {
        match self {
            Node::None => 0,
            Node::Leaf(_) => 1,
            Node::Infix(i) => i.child.leaf_count(),
            Node::Branch(b) => b.leaf_count,
        }
    }

    /// I9's selectivity estimate: the number of distinct key-prefixes of
    /// length `target_depth` reachable through this node. Computed on
    /// demand rather than maintained incrementally (DESIGN.md OQ-2), since
    /// it is only ever consulted as a join-ordering hint (`countVariable`),
    /// never as part of an equality/subset/union invariant. `target_depth`
    /// and this node's `branch_depth` are both tree-order depths; `O` maps
    /// them back to key-order before consulting `S::segment` so segment
    /// boundaries are evaluated in the caller's original field layout, not
    /// the permuted tree layout.
    pub fn segment_count_at<O: KeyOrdering<K>, S: KeySegmentation<K>>(
        &self,
        target_depth: usize,
    ) -> u64 {
        match self {
            Node::None => 0,
            Node::Leaf(_) => 1,
            Node::Infix(i) => {
                if same_segment::<K, O, S>(target_depth, i.branch_depth) {
                    i.child.segment_count_at::<O, S>(target_depth)
                } else {
                    1
                }
            }
            Node::Branch(b) => {
                if same_segment::<K, O, S>(target_depth, b.branch_depth) {
                    b.buckets
                        .iter()
                        .flatten()
                        .map(|c| c.segment_count_at::<O, S>(target_depth))
                        .sum()
                } else {
                    1
                }
            }
        }
    }

    /// The byte fixed at `depth` by this node, or `None` if this node
    /// branches (or doesn't cover `depth`) at that position.
    pub fn peek(&self, depth: usize) -> Option<u8> {
        match self {
            Node::None => None,
            Node::Leaf(l) => {
                if depth < K {
                    Some(l.key[depth])
                } else {
                    None
                }
            }
            Node::Infix(i) => {
                if depth >= i.start_depth && depth < i.branch_depth {
                    Some(i.infix[depth - i.start_depth])
                } else if depth == i.branch_depth {
                    i.child.peek(depth)
                } else {
                    None
                }
            }
            Node::Branch(b) => {
                if depth >= b.start_depth && depth < b.branch_depth {
                    Some(b.infix[depth - b.start_depth])
                } else {
                    None
                }
            }
        }
    }

    /// The candidate byte set at `depth`, clearing `out` first.
    pub fn propose(&self, depth: usize, out: &mut ByteBitset) {
        *out = ByteBitset::new_empty();
        match self {
            Node::None => {}
            Node::Leaf(l) => {
                if depth < K {
                    out.set(l.key[depth]);
                }
            }
            Node::Infix(i) => {
                if depth == i.branch_depth {
                    i.child.propose(depth, out);
                } else if let Some(b) = self.peek(depth) {
                    out.set(b);
                }
            }
            Node::Branch(b) => {
                if depth == b.branch_depth {
                    *out = b.child_set;
                } else if let Some(byte) = self.peek(depth) {
                    out.set(byte);
                }
            }
        }
    }

    pub fn get(&self, depth: usize, key: &[u8; K]) -> Option<V>
    where
        V: Clone,
    {
        match self {
            Node::None => None,
            Node::Leaf(l) => {
                if l.key == *key {
                    Some(l.value.clone())
                } else {
                    None
                }
            }
            Node::Infix(i) => {
                for d in i.start_depth..i.branch_depth {
                    if i.infix[d - i.start_depth] != key[d] {
                        return None;
                    }
                }
                i.child.get(i.branch_depth, key)
            }
            Node::Branch(b) => {
                for d in b.start_depth..b.branch_depth {
                    if b.infix[d - b.start_depth] != key[d] {
                        return None;
                    }
                }
                let k = key[b.branch_depth];
                if !b.child_set.is_set(k) {
                    return None;
                }
                bucket_get(b, k).get(b.branch_depth, key)
            }
        }
    }

    /// Re-anchors `self` so it starts at `new_start`, filling bytes in
    /// `[new_start, old_start)` from `key`. Precondition: `new_start <=
    /// self.start_depth()`.
    pub fn init_at(&self, new_start: usize, key: &[u8; K]) -> Node<K, V>
    where
        V: Clone,
    {
        let old_start = self.start_depth();
        if new_start == old_start {
            return self.clone();
        }
        debug_assert!(new_start < old_start);
        match self {
            Node::None => Node::None,
            Node::Leaf(l) => Node::Leaf(Rc::new(Leaf {
                start_depth: new_start,
                key: l.key,
                value: l.value.clone(),
            })),
            Node::Infix(i) => {
                let mut infix = key[new_start..old_start].to_vec();
                infix.extend_from_slice(&i.infix);
                Node::Infix(Rc::new(Infix {
                    start_depth: new_start,
                    branch_depth: i.branch_depth,
                    infix,
                    child: i.child.clone(),
                }))
            }
            Node::Branch(b) => {
                let mut infix = key[new_start..old_start].to_vec();
                infix.extend_from_slice(&b.infix);
                Node::Branch(Rc::new(Branch {
                    start_depth: new_start,
                    branch_depth: b.branch_depth,
                    infix,
                    child_set: b.child_set,
                    rand_hash_used: b.rand_hash_used,
                    node_hash: b.node_hash,
                    leaf_count: b.leaf_count,
                    bucket_count: b.bucket_count,
                    buckets: b.buckets.clone(),
                }))
            }
        }
    }

    /// Wraps `child` in an `Infix` covering `[start_depth, child.start_depth())`
    /// when that range is non-empty; otherwise returns `child` unchanged.
    /// Mirrors the "smallest variant that covers the gap" wrap rule; since
    /// this port represents `Infix` as a single variable-length variant,
    /// "smallest" degenerates to "exactly the needed length" (DESIGN.md
    /// OQ-3).
    pub fn wrap_infix(start_depth: usize, key: &[u8; K], child: Node<K, V>) -> Node<K, V>
    where
        V: Clone,
    {
        let child_start = child.start_depth();
        if child_start == start_depth {
            return child;
        }
        debug_assert!(start_depth < child_start);
        if let Node::Leaf(_) = &child {
            // A leaf already carries an arbitrary-length inline suffix, so
            // lowering its own start_depth is cheaper than wrapping it.
            return child.init_at(start_depth, key);
        }
        Node::Infix(Rc::new(Infix {
            start_depth,
            branch_depth: child_start,
            infix: key[start_depth..child_start].to_vec(),
            child,
        }))
    }

    /// Inserts `(key, value)` at `depth`, returning the updated node. `depth`
    /// must equal `self.start_depth()`.
    pub fn put<S: KeySegmentation<K>>(&self, key: &[u8; K], value: V) -> Node<K, V>
    where
        V: Clone,
    {
        match self {
            Node::None => Node::Leaf(Rc::new(Leaf {
                start_depth: 0,
                key: *key,
                value,
            })),
            Node::Leaf(l) => put_into_leaf(l, key, value),
            Node::Infix(i) => put_into_infix::<K, V, S>(i, key, value),
            Node::Branch(b) => put_into_branch::<K, V, S>(b, key, value),
        }
    }

    pub fn is_equal(&self, other: &Node<K, V>) -> bool {
        self.hash() == other.hash()
    }

    pub fn is_subset_of(&self, other: &Node<K, V>) -> bool
    where
        V: Clone,
    {
        if self.is_none() {
            return true;
        }
        if self.hash() == other.hash() {
            return true;
        }
        if other.is_none() {
            return false;
        }
        let lo = match diverge(self, other) {
            Diverge::Equal => return true,
            Diverge::At(d) => d,
        };
        let mut mine = ByteBitset::new_empty();
        self.propose(lo, &mut mine);
        let mut theirs = ByteBitset::new_empty();
        other.propose(lo, &mut theirs);
        if !mine.is_subset_of(&theirs) {
            return false;
        }
        let mut remaining = mine;
        while let Some(byte) = remaining.drain_next_ascending() {
            let my_child = child_at(self, lo, byte);
            let their_child = child_at(other, lo, byte);
            if !my_child.is_subset_of(&their_child) {
                return false;
            }
        }
        true
    }

    pub fn is_intersecting(&self, other: &Node<K, V>) -> bool
    where
        V: Clone,
    {
        if self.is_none() || other.is_none() {
            return false;
        }
        if self.hash() == other.hash() {
            return true;
        }
        let lo = match diverge(self, other) {
            Diverge::Equal => return true,
            Diverge::At(d) => d,
        };
        let mut mine = ByteBitset::new_empty();
        self.propose(lo, &mut mine);
        let mut theirs = ByteBitset::new_empty();
        other.propose(lo, &mut theirs);
        let mut common = mine.set_intersect(&theirs);
        while let Some(byte) = common.drain_next_ascending() {
            let my_child = child_at(self, lo, byte);
            let their_child = child_at(other, lo, byte);
            if my_child.is_intersecting(&their_child) {
                return true;
            }
        }
        false
    }

    /// The child reached by following `byte` at `depth`, or `Node::None` if
    /// no such child exists. Used by `Cursor::push` to descend one byte at
    /// a time without re-walking from the root.
    pub fn child_at(&self, depth: usize, byte: u8) -> Node<K, V>
    where
        V: Clone,
    {
        child_at(self, depth, byte)
    }

    /// A depth-first walk yielding `(start_depth, key_prefix, node)` for
    /// every node reachable from `self`, grounded on the explicit-stack
    /// shape of the commented `CursorIterator` sketch. `key_prefix` carries
    /// every byte fixed by an ancestor or by this node's own infix; for a
    /// `Leaf` it is always the leaf's full key (P9).
    pub fn nodes(&self) -> NodeIter<K, V>
    where
        V: Clone,
    {
        NodeIter {
            stack: vec![(self.clone(), [0u8; K])],
        }
    }
}

fn same_segment<const K: usize, O: KeyOrdering<K>, S: KeySegmentation<K>>(a: usize, b: usize) -> bool {
    let a = a.min(K - 1);
    let b = b.min(K - 1);
    S::segment(O::key_index(a)) == S::segment(O::key_index(b))
}

enum Diverge {
    Equal,
    At(usize),
}

/// Walks the common infix of two nodes, returning the depth at which they
/// first disagree. `propose`/`child_at` handle the branch-point delegation
/// uniformly for `Leaf`/`Infix`/`Branch`, so no special-casing is needed
/// here beyond "did we reach depth K without a mismatch".
fn diverge<const K: usize, V>(a: &Node<K, V>, b: &Node<K, V>) -> Diverge {
    let start = a.start_depth().max(b.start_depth());
    let end = a.branch_depth().min(b.branch_depth());
    for d in start..end {
        if a.peek(d) != b.peek(d) {
            return Diverge::At(d);
        }
    }
    if end == K {
        Diverge::Equal
    } else {
        Diverge::At(end)
    }
}

fn child_at<const K: usize, V>(node: &Node<K, V>, depth: usize, byte: u8) -> Node<K, V>
where
    V: Clone,
{
    match node {
        Node::Branch(b) if depth == b.branch_depth => {
            if b.child_set.is_set(byte) {
                bucket_get(b, byte)
            } else {
                Node::None
            }
        }
        Node::Leaf(_) if node.peek(depth) == Some(byte) => node.clone(),
        Node::Infix(i) if depth == i.branch_depth => child_at(&i.child, depth, byte),
        _ => {
            if node.peek(depth) == Some(byte) {
                node.clone()
            } else {
                Node::None
            }
        }
    }
}

fn bucket_get<const K: usize, V>(b: &Branch<K, V>, k: u8) -> Node<K, V>
where
    V: Clone,
{
    for bucket in &b.buckets {
        for slot in bucket {
            if slot.peek(b.branch_depth) == Some(k) {
                return slot.clone();
            }
        }
    }
    Node::None
}

fn put_into_leaf<const K: usize, V: Clone>(l: &Leaf<K, V>, key: &[u8; K], value: V) -> Node<K, V> {
    let mut mismatch = None;
    for d in l.start_depth..K {
        if l.key[d] != key[d] {
            mismatch = Some(d);
            break;
        }
    }
    match mismatch {
        None => {
            // Same key: overwrite the value (DESIGN.md OQ-4 resolves this in
            // favor of P3 over the literal "returns self unchanged" text).
            Node::Leaf(Rc::new(Leaf {
                start_depth: l.start_depth,
                key: l.key,
                value,
            }))
        }
        Some(m) => {
            let existing = Node::Leaf(Rc::new(Leaf {
                start_depth: m,
                key: l.key,
                value: l.value.clone(),
            }));
            let fresh = Node::Leaf(Rc::new(Leaf {
                start_depth: m,
                key: *key,
                value,
            }));
            new_branch_of_two(l.start_depth, m, key, existing, fresh)
        }
    }
}

fn put_into_infix<const K: usize, V: Clone, S: KeySegmentation<K>>(
    i: &Infix<K, V>,
    key: &[u8; K],
    value: V,
) -> Node<K, V> {
    let mut mismatch = None;
    for d in i.start_depth..i.branch_depth {
        if i.infix[d - i.start_depth] != key[d] {
            mismatch = Some(d);
            break;
        }
    }
    match mismatch {
        None => {
            let new_child = i.child.put::<S>(key, value);
            Node::Infix(Rc::new(Infix {
                start_depth: i.start_depth,
                branch_depth: i.branch_depth,
                infix: i.infix.clone(),
                child: new_child,
            }))
        }
        Some(m) => {
            let existing = Node::Infix(Rc::new(Infix {
                start_depth: m,
                branch_depth: i.branch_depth,
                infix: i.infix[(m - i.start_depth)..].to_vec(),
                child: i.child.clone(),
            }));
            let fresh = Node::Leaf(Rc::new(Leaf {
                start_depth: m,
                key: *key,
                value,
            }));
            new_branch_of_two(i.start_depth, m, key, existing, fresh)
        }
    }
}

/// Builds the `Branch(1)` introduced by a mismatch at depth `m`, carrying
/// `[outer_start, m)` as its own infix, with `existing` (re-anchored to `m`)
/// and `fresh` as its two children.
fn new_branch_of_two<const K: usize, V: Clone>(
    outer_start: usize,
    m: usize,
    key: &[u8; K],
    existing: Node<K, V>,
    fresh: Node<K, V>,
) -> Node<K, V> {
    let existing = existing.init_at(m, key);
    let existing_key = existing.peek(m).expect("re-anchored node must cover depth m");
    let fresh_key = fresh.peek(m).expect("fresh leaf must cover depth m");
    debug_assert_ne!(existing_key, fresh_key);

    let mut branch = Branch {
        start_depth: outer_start,
        branch_depth: m,
        infix: key[outer_start..m].to_vec(),
        child_set: ByteBitset::new_empty(),
        rand_hash_used: ByteBitset::new_empty(),
        node_hash: existing.hash().combine(fresh.hash()),
        leaf_count: existing.leaf_count() + fresh.leaf_count(),
        bucket_count: 1,
        buckets: vec![empty_bucket()],
    };
    branch_insert(&mut branch, existing_key, existing);
    branch_insert(&mut branch, fresh_key, fresh);
    Node::Branch(Rc::new(branch))
}

fn put_into_branch<const K: usize, V: Clone, S: KeySegmentation<K>>(
    b: &Branch<K, V>,
    key: &[u8; K],
    value: V,
) -> Node<K, V> {
    let mut mismatch = None;
    for d in b.start_depth..b.branch_depth {
        if b.infix[d - b.start_depth] != key[d] {
            mismatch = Some(d);
            break;
        }
    }
    if let Some(m) = mismatch {
        // `m` falls inside this branch's own compressed infix
        // (`b.start_depth <= m < b.branch_depth`), so the re-anchored node
        // keeps the same `branch_depth`/children/hash/counts and only drops
        // its leading `m - b.start_depth` infix bytes — mirroring
        // `put_into_infix`'s mismatch arm rather than `init_at`, which only
        // ever *lowers* a start (it would panic re-anchoring forward to a
        // deeper `m`).
        let existing = Node::Branch(Rc::new(Branch {
            start_depth: m,
            branch_depth: b.branch_depth,
            infix: b.infix[(m - b.start_depth)..].to_vec(),
            child_set: b.child_set,
            rand_hash_used: b.rand_hash_used,
            node_hash: b.node_hash,
            leaf_count: b.leaf_count,
            bucket_count: b.bucket_count,
            buckets: b.buckets.clone(),
        }));
        let fresh = Node::Leaf(Rc::new(Leaf {
            start_depth: m,
            key: *key,
            value,
        }));
        return new_branch_of_two(b.start_depth, m, key, existing, fresh);
    }

    let k = key[b.branch_depth];
    if b.child_set.is_set(k) {
        let old = bucket_get(b, k);
        let new = old.put::<S>(key, value);
        if same_node(&old, &new) {
            return Node::Branch(Rc::new(clone_branch(b)));
        }
        let mut branch = clone_branch(b);
        branch.leaf_count = branch.leaf_count - old.leaf_count() + new.leaf_count();
        branch.node_hash = branch.node_hash.combine(old.hash()).combine(new.hash());
        write_into_bucket(&mut branch, k, new);
        Node::Branch(Rc::new(branch))
    } else {
        let new = Node::Leaf(Rc::new(Leaf {
            start_depth: b.branch_depth,
            key: *key,
            value,
        }));
        let mut branch = clone_branch(b);
        branch.leaf_count += 1;
        branch.node_hash = branch.node_hash.combine(new.hash());
        branch_insert(&mut branch, k, new);
        Node::Branch(Rc::new(branch))
    }
}

/// True when `put` produced no observable change relative to `old` (a true
/// duplicate re-insert). Using reference identity rather than hash equality
/// (spec.md's literal shortcut) avoids silently discarding value overwrites,
/// since the structural hash here is keyed on keys only (DESIGN.md OQ-4).
fn same_node<const K: usize, V>(old: &Node<K, V>, new: &Node<K, V>) -> bool {
    match (old, new) {
        (Node::Leaf(a), Node::Leaf(b)) => Rc::ptr_eq(a, b),
        (Node::Infix(a), Node::Infix(b)) => Rc::ptr_eq(a, b),
        (Node::Branch(a), Node::Branch(b)) => Rc::ptr_eq(a, b),
        (Node::None, Node::None) => true,
        _ => false,
    }
}

fn clone_branch<const K: usize, V: Clone>(b: &Branch<K, V>) -> Branch<K, V> {
    Branch {
        start_depth: b.start_depth,
        branch_depth: b.branch_depth,
        infix: b.infix.clone(),
        child_set: b.child_set,
        rand_hash_used: b.rand_hash_used,
        node_hash: b.node_hash,
        leaf_count: b.leaf_count,
        bucket_count: b.bucket_count,
        buckets: b.buckets.clone(),
    }
}

fn write_into_bucket<const K: usize, V>(branch: &mut Branch<K, V>, k: u8, new: Node<K, V>) {
    let idx = bytetable::bucket_index(k, branch.rand_hash_used.is_set(k), branch.bucket_count);
    for slot in &mut branch.buckets[idx] {
        if slot.peek(branch.branch_depth) == Some(k) {
            *slot = new;
            return;
        }
    }
    unreachable!("write_into_bucket called for a key not present in any bucket");
}

fn slot_byte<const K: usize, V>(slot: &Node<K, V>, branch_depth: usize) -> Option<u8> {
    slot.peek(branch_depth)
}

fn try_place<const K: usize, V>(
    bucket: &mut [Node<K, V>; BUCKET_ENTRY_COUNT],
    branch_depth: usize,
    bucket_count: usize,
    idx: usize,
    rand_hash_used: &ByteBitset,
    k: u8,
    child: Node<K, V>,
) -> bool {
    for slot in bucket.iter_mut() {
        if slot_byte(slot, branch_depth) == Some(k) {
            *slot = child;
            return true;
        }
    }
    for slot in bucket.iter_mut() {
        if slot.is_none() {
            *slot = child;
            return true;
        }
    }
    for slot in bucket.iter_mut() {
        if let Some(b) = slot_byte(slot, branch_depth) {
            let used = rand_hash_used.is_set(b);
            if bytetable::bucket_index(b, used, bucket_count) != idx {
                *slot = child;
                return true;
            }
        }
    }
    false
}

fn grow<const K: usize, V: Clone>(branch: &mut Branch<K, V>) {
    debug_assert!(branch.bucket_count < MAX_BUCKET_COUNT);
    let duplicate = branch.buckets.clone();
    branch.buckets.extend(duplicate);
    branch.bucket_count *= 2;
}

/// Inserts child `k` into `branch`, displacing and growing as needed. This
/// is the cuckoo protocol of spec.md 4.5: two hash functions, bounded
/// retries, bucket duplication on grow, and an eviction-only fallback once
/// the branch is at its largest size.
fn branch_insert<const K: usize, V: Clone>(branch: &mut Branch<K, V>, mut k: u8, mut child: Node<K, V>) {
    branch.child_set.set(k);
    branch.rand_hash_used.unset(k);
    loop {
        let mut retries = 0usize;
        loop {
            let used = branch.rand_hash_used.is_set(k);
            let idx = bytetable::bucket_index(k, used, branch.bucket_count);
            if try_place(
                &mut branch.buckets[idx],
                branch.branch_depth,
                branch.bucket_count,
                idx,
                &branch.rand_hash_used,
                k,
                child.clone(),
            ) {
                return;
            }

            if branch.bucket_count == 1 {
                break;
            }

            if branch.bucket_count == MAX_BUCKET_COUNT {
                let bucket = &mut branch.buckets[idx];
                let victim_slot = (0..BUCKET_ENTRY_COUNT).find(|&i| {
                    slot_byte(&bucket[i], branch.branch_depth)
                        .map_or(false, |b| branch.rand_hash_used.is_set(b))
                });
                match victim_slot {
                    Some(slot_i) => {
                        let victim = std::mem::replace(&mut bucket[slot_i], child.clone());
                        let victim_byte = slot_byte(&victim, branch.branch_depth).unwrap();
                        branch.rand_hash_used.set_value(k, used);
                        branch.rand_hash_used.unset(victim_byte);
                        k = victim_byte;
                        child = victim;
                        retries += 1;
                        if retries > MAX_RETRIES * (BUCKET_ENTRY_COUNT + 1) {
                            // Defensive fallback: should not be reachable
                            // given H0/H1 disagree on every key at max size.
                            bucket[0] = child;
                            return;
                        }
                        continue;
                    }
                    None => {
                        bucket[0] = child;
                        return;
                    }
                }
            }

            retries += 1;
            if retries > MAX_RETRIES {
                break;
            }
            let bucket = &mut branch.buckets[idx];
            let slot_i = rand::thread_rng().gen_range(0..BUCKET_ENTRY_COUNT);
            let victim = std::mem::replace(&mut bucket[slot_i], child.clone());
            if victim.is_none() {
                return;
            }
            let victim_byte = slot_byte(&victim, branch.branch_depth).unwrap();
            let victim_used = branch.rand_hash_used.is_set(victim_byte);
            branch.rand_hash_used.set_value(k, used);
            branch.rand_hash_used.set_value(victim_byte, !victim_used);
            k = victim_byte;
            child = victim;
        }
        grow(branch);
    }
}

pub struct NodeIter<const K: usize, V> {
    stack: Vec<(Node<K, V>, [u8; K])>,
}

impl<const K: usize, V: Clone> Iterator for NodeIter<K, V> {
    type Item = (usize, [u8; K], Node<K, V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, mut prefix) = self.stack.pop()?;
            if node.is_none() {
                continue;
            }
            match &node {
                Node::Leaf(l) => {
                    prefix = l.key;
                }
                Node::Infix(i) => {
                    prefix[i.start_depth..i.branch_depth].copy_from_slice(&i.infix);
                    self.stack.push((i.child.clone(), prefix));
                }
                Node::Branch(b) => {
                    prefix[b.start_depth..b.branch_depth].copy_from_slice(&b.infix);
                    for bucket in &b.buckets {
                        for slot in bucket {
                            if !slot.is_none() {
                                let mut child_prefix = prefix;
                                if let Some(byte) = slot.peek(b.branch_depth) {
                                    child_prefix[b.branch_depth] = byte;
                                }
                                self.stack.push((slot.clone(), child_prefix));
                            }
                        }
                    }
                }
                Node::None => unreachable!(),
            }
            let start_depth = node.start_depth();
            return Some((start_depth, prefix, node));
        }
    }
}

/// Structural union of any number of trees, grounded on `patch.rs`'s
/// recursive `union` (shared-hash short circuit, common-infix walk,
/// propose-union of children, recurse on the subset of inputs that have a
/// child at each set byte).
pub fn union<const K: usize, V: Clone>(trees: &[Node<K, V>]) -> Node<K, V> {
    let trees: Vec<&Node<K, V>> = trees.iter().filter(|t| !t.is_none()).collect();
    if trees.is_empty() {
        return Node::None;
    }
    if trees.len() == 1 {
        return trees[0].clone();
    }
    let first_hash = trees[0].hash();
    if trees.iter().all(|t| t.hash() == first_hash) {
        return trees[0].clone();
    }

    let start = trees.iter().map(|t| t.start_depth()).max().unwrap();
    let min_branch_depth = trees.iter().map(|t| t.branch_depth()).min().unwrap();
    let mut d = start;
    let mut infix = Vec::new();
    while d < min_branch_depth {
        let byte = trees[0].peek(d);
        if trees.iter().all(|t| t.peek(d) == byte) {
            infix.push(byte.unwrap());
            d += 1;
        } else {
            break;
        }
    }
    let branch_depth = d;

    if branch_depth == K {
        // All inputs agree down to the full key length: they are the same
        // leaf (by key); values differ only if re-inserted out of band.
        return trees[0].clone();
    }

    let mut child_set = ByteBitset::new_empty();
    for t in &trees {
        let mut proposal = ByteBitset::new_empty();
        t.propose(branch_depth, &mut proposal);
        child_set = child_set.set_union(&proposal);
    }

    let mut branch = Branch {
        start_depth: start,
        branch_depth,
        infix,
        child_set: ByteBitset::new_empty(),
        rand_hash_used: ByteBitset::new_empty(),
        node_hash: Hash128::ZERO,
        leaf_count: 0,
        bucket_count: 1,
        buckets: vec![empty_bucket()],
    };

    let mut bytes = child_set;
    while let Some(byte) = bytes.drain_next_ascending() {
        let participating: Vec<Node<K, V>> = trees
            .iter()
            .map(|t| child_at(t, branch_depth, byte))
            .filter(|c| !c.is_none())
            .collect();
        let merged = union(&participating);
        if merged.is_none() {
            continue;
        }
        branch.node_hash = branch.node_hash.combine(merged.hash());
        branch.leaf_count += merged.leaf_count();
        branch_insert(&mut branch, byte, merged);
    }

    Node::Branch(Rc::new(branch))
}

/// Structural intersection of any number of trees, grounded on spec.md §9's
/// Design Notes instruction to derive it from the union recipe: same
/// shared-hash short circuit and common-infix walk, but a set byte must be
/// proposed by *every* input (not just one) to survive, and a diverging
/// infix means no key can satisfy all inputs, so the whole subtree is empty.
pub fn intersect<const K: usize, V: Clone>(trees: &[Node<K, V>]) -> Node<K, V> {
    if trees.is_empty() || trees.iter().any(|t| t.is_none()) {
        return Node::None;
    }
    if trees.len() == 1 {
        return trees[0].clone();
    }
    let first_hash = trees[0].hash();
    if trees.iter().all(|t| t.hash() == first_hash) {
        return trees[0].clone();
    }

    let start = trees.iter().map(|t| t.start_depth()).max().unwrap();
    let min_branch_depth = trees.iter().map(|t| t.branch_depth()).min().unwrap();
    let mut d = start;
    let mut infix = Vec::new();
    while d < min_branch_depth {
        let byte = trees[0].peek(d);
        if trees.iter().all(|t| t.peek(d) == byte) {
            infix.push(byte.unwrap());
            d += 1;
        } else {
            // Inputs disagree on a shared byte: no key can be present in
            // every input, so the intersection of this subtree is empty.
            return Node::None;
        }
    }
    let branch_depth = d;

    if branch_depth == K {
        return trees[0].clone();
    }

    let mut child_set = ByteBitset::new_full();
    for t in &trees {
        let mut proposal = ByteBitset::new_empty();
        t.propose(branch_depth, &mut proposal);
        child_set = child_set.set_intersect(&proposal);
    }

    let mut branch = Branch {
        start_depth: start,
        branch_depth,
        infix,
        child_set: ByteBitset::new_empty(),
        rand_hash_used: ByteBitset::new_empty(),
        node_hash: Hash128::ZERO,
        leaf_count: 0,
        bucket_count: 1,
        buckets: vec![empty_bucket()],
    };

    let mut bytes = child_set;
    while let Some(byte) = bytes.drain_next_ascending() {
        let participating: Vec<Node<K, V>> =
            trees.iter().map(|t| child_at(t, branch_depth, byte)).collect();
        let merged = intersect(&participating);
        if merged.is_none() {
            continue;
        }
        branch.node_hash = branch.node_hash.combine(merged.hash());
        branch.leaf_count += merged.leaf_count();
        branch_insert(&mut branch, byte, merged);
    }

    if branch.leaf_count == 0 {
        return Node::None;
    }

    Node::Branch(Rc::new(branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::hash;
    use crate::trible::TribleSegmentation;
    use proptest::prelude::*;

    fn key_of(byte_at_0: u8) -> [u8; 4] {
        [byte_at_0, 0, 0, 0]
    }

    #[test]
    fn put_then_get_single_key() {
        hash::init_with_seed([1; 16]);
        let n = Node::<4, u32>::None.put::<TribleSegmentation>(&[0, 0, 0, 0], 1);
        assert_eq!(n.get(0, &[0, 0, 0, 0]), Some(1));
        assert_eq!(n.leaf_count(), 1);
    }

    #[test]
    fn put_two_keys_builds_branch() {
        hash::init_with_seed([2; 16]);
        let n = Node::<4, u32>::None.put::<TribleSegmentation>(&[0, 0, 0, 0], 1);
        let n = n.put::<TribleSegmentation>(&[0, 0, 0, 1], 2);
        assert_eq!(n.get(0, &[0, 0, 0, 0]), Some(1));
        assert_eq!(n.get(0, &[0, 0, 0, 1]), Some(2));
        assert_eq!(n.leaf_count(), 2);
        match &n {
            Node::Branch(b) => assert_eq!(b.branch_depth, 3),
            _ => panic!("expected a Branch root"),
        }
    }

    #[test]
    fn reinsert_overwrites_value_without_changing_hash() {
        hash::init_with_seed([3; 16]);
        let n = Node::<4, u32>::None.put::<TribleSegmentation>(&[0, 0, 0, 0], 1);
        let h1 = n.hash();
        let n2 = n.put::<TribleSegmentation>(&[0, 0, 0, 0], 2);
        assert_eq!(n2.get(0, &[0, 0, 0, 0]), Some(2));
        assert_eq!(n2.hash(), h1);
    }

    #[test]
    fn put_diverging_inside_branch_infix() {
        // [0,0,0,0] then [0,0,0,1] builds a Branch at (start_depth=0,
        // branch_depth=3) whose own infix is [0,0,0]. Inserting
        // [0,5,0,0] then diverges from that infix at depth 1 (mid-infix,
        // m > start_depth), which must re-anchor the existing branch to
        // start_depth=1 rather than panic (node.rs put_into_branch).
        hash::init_with_seed([50; 16]);
        let n = Node::<4, u32>::None.put::<TribleSegmentation>(&[0, 0, 0, 0], 1);
        let n = n.put::<TribleSegmentation>(&[0, 0, 0, 1], 2);
        let n = n.put::<TribleSegmentation>(&[0, 5, 0, 0], 3);
        assert_eq!(n.leaf_count(), 3);
        assert_eq!(n.get(0, &[0, 0, 0, 0]), Some(1));
        assert_eq!(n.get(0, &[0, 0, 0, 1]), Some(2));
        assert_eq!(n.get(0, &[0, 5, 0, 0]), Some(3));
    }

    proptest! {
        #[test]
        fn put_diverging_inside_branch_infix_arbitrary_depth(
            tail in prop::collection::vec(0u8..255, 2..3),
            diverge_byte in 1u8..255,
        ) {
            // Generalizes the fixed-depth case above: build a branch whose
            // infix spans several bytes, then insert a key that agrees on
            // a non-empty prefix of that infix before diverging strictly
            // after start_depth.
            hash::init();
            let a = [0u8, 0, tail[0], tail[1]];
            let b = [0u8, 0, tail[0], if tail[1] == 255 { tail[1] - 1 } else { tail[1] + 1 }];
            let mut n = Node::<4, u32>::None;
            n = n.put::<TribleSegmentation>(&a, 1);
            n = n.put::<TribleSegmentation>(&b, 2);
            let c = [0u8, diverge_byte, 0, 0];
            n = n.put::<TribleSegmentation>(&c, 3);
            prop_assert_eq!(n.leaf_count(), 3);
            prop_assert_eq!(n.get(0, &a), Some(1));
            prop_assert_eq!(n.get(0, &b), Some(2));
            prop_assert_eq!(n.get(0, &c), Some(3));
        }
    }

    #[test]
    fn branch_grows_past_initial_bucket_on_256_siblings() {
        hash::init_with_seed([4; 16]);
        let mut n = Node::<4, u32>::None;
        for x in 0u8..=255 {
            n = n.put::<TribleSegmentation>(&[0, 0, 0, x], x as u32);
        }
        assert_eq!(n.leaf_count(), 256);
        for x in 0u8..=255 {
            assert_eq!(n.get(0, &[0, 0, 0, x]), Some(x as u32));
        }
    }

    #[test]
    fn branch_operation_matches_original_order() {
        hash::init_with_seed([5; 16]);
        let mut forward = Node::<4, u32>::None;
        let mut backward = Node::<4, u32>::None;
        let keys: Vec<[u8; 4]> = (0u8..=255).map(key_of).collect();
        for k in &keys {
            forward = forward.put::<TribleSegmentation>(k, 1);
        }
        for k in keys.iter().rev() {
            backward = backward.put::<TribleSegmentation>(k, 1);
        }
        assert_eq!(forward.hash(), backward.hash());
        assert!(forward.is_equal(&backward));
    }

    #[test]
    fn branch_snapshot_is_independent() {
        hash::init_with_seed([6; 16]);
        let a = Node::<4, u32>::None.put::<TribleSegmentation>(&[0, 0, 0, 0], 1);
        let b = a.clone();
        let a2 = a.put::<TribleSegmentation>(&[0, 0, 0, 1], 2);
        assert_eq!(a2.leaf_count(), 2);
        assert_eq!(b.leaf_count(), 1);
        assert!(b.is_subset_of(&a2));
        assert!(!a2.is_subset_of(&b));
    }

    #[test]
    fn union_matches_sequential_insert() {
        hash::init_with_seed([8; 16]);
        let mut a = Node::<4, u32>::None;
        for x in 0u8..16 {
            a = a.put::<TribleSegmentation>(&key_of(x), 1);
        }
        let mut b = Node::<4, u32>::None;
        for x in 16u8..32 {
            b = b.put::<TribleSegmentation>(&key_of(x), 1);
        }
        let merged = union(&[a.clone(), b.clone()]);

        let mut reference = a.clone();
        for x in 16u8..32 {
            reference = reference.put::<TribleSegmentation>(&key_of(x), 1);
        }
        assert_eq!(merged.hash(), reference.hash());
        assert_eq!(merged.leaf_count(), reference.leaf_count());
    }

    #[test]
    fn intersect_keeps_only_shared_keys() {
        hash::init_with_seed([40; 16]);
        let mut a = Node::<4, u32>::None;
        for x in 0u8..20 {
            a = a.put::<TribleSegmentation>(&key_of(x), 1);
        }
        let mut b = Node::<4, u32>::None;
        for x in 10u8..30 {
            b = b.put::<TribleSegmentation>(&key_of(x), 1);
        }
        let shared = intersect(&[a.clone(), b.clone()]);
        assert_eq!(shared.leaf_count(), 10);
        for x in 10u8..20 {
            assert_eq!(shared.get(0, &key_of(x)), Some(1));
        }
        for x in 0u8..10 {
            assert_eq!(shared.get(0, &key_of(x)), None);
        }
    }

    #[test]
    fn intersect_of_disjoint_trees_is_empty() {
        hash::init_with_seed([41; 16]);
        let mut a = Node::<4, u32>::None;
        a = a.put::<TribleSegmentation>(&key_of(0), 1);
        let mut b = Node::<4, u32>::None;
        b = b.put::<TribleSegmentation>(&key_of(1), 1);
        let shared = intersect(&[a, b]);
        assert!(shared.is_none());
        assert_eq!(shared.leaf_count(), 0);
    }

    proptest! {
        #[test]
        fn count_equals_distinct_keys(xs in prop::collection::vec(0u8..255, 0..200)) {
            hash::init();
            let mut n = Node::<4, u32>::None;
            let mut distinct = std::collections::HashSet::new();
            for x in &xs {
                n = n.put::<TribleSegmentation>(&key_of(*x), 1);
                distinct.insert(*x);
            }
            prop_assert_eq!(n.leaf_count(), distinct.len() as u64);
        }

        #[test]
        fn get_returns_inserted_values(xs in prop::collection::vec(0u8..255, 0..200)) {
            hash::init();
            let mut n = Node::<4, u32>::None;
            for (i, x) in xs.iter().enumerate() {
                n = n.put::<TribleSegmentation>(&key_of(*x), i as u32);
            }
            let mut last = std::collections::HashMap::new();
            for (i, x) in xs.iter().enumerate() {
                last.insert(*x, i as u32);
            }
            for (x, v) in last {
                prop_assert_eq!(n.get(0, &key_of(x)), Some(v));
            }
        }
    }
}
