//! The composite index. `TribleSet` keeps six [`crate::patch::Tree`]
//! instances over the same data, one per permutation of `(E, A, V)`, so a
//! join engine can pick whichever tree puts its next-bound variable first.
//! Every insert writes to all six; [`TribleConstraint`] multiplexes them for
//! querying. Grounded on `src/trible/tribleset.rs`'s `TribleSet`, narrowed to
//! a unit-valued key set (no `ValueSchema` decoding) per spec.md §1's
//! Non-goals.

pub mod constraint;

use crate::patch::{Node, Tree};
use crate::trible::{
    AEVOrder, AVEOrder, EAVOrder, EVAOrder, Trible, TribleSegmentation, VAEOrder, VEAOrder,
    TRIBLE_LEN,
};

pub use constraint::TribleConstraint;

type EAV = Tree<TRIBLE_LEN, EAVOrder, TribleSegmentation, ()>;
type EVA = Tree<TRIBLE_LEN, EVAOrder, TribleSegmentation, ()>;
type AEV = Tree<TRIBLE_LEN, AEVOrder, TribleSegmentation, ()>;
type AVE = Tree<TRIBLE_LEN, AVEOrder, TribleSegmentation, ()>;
type VEA = Tree<TRIBLE_LEN, VEAOrder, TribleSegmentation, ()>;
type VAE = Tree<TRIBLE_LEN, VAEOrder, TribleSegmentation, ()>;

/// A persistent set of tribles, indexed six ways. Cloning is O(1) (each of
/// the six trees is an `Rc` snapshot).
#[derive(Clone)]
pub struct TribleSet {
    eav: EAV,
    eva: EVA,
    aev: AEV,
    ave: AVE,
    vea: VEA,
    vae: VAE,
}

impl Default for TribleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TribleSet {
    pub fn new() -> Self {
        TribleSet {
            eav: EAV::new(),
            eva: EVA::new(),
            aev: AEV::new(),
            ave: AVE::new(),
            vea: VEA::new(),
            vae: VAE::new(),
        }
    }

    /// Writes `t` into all six trees. A re-insert of an already-present
    /// trible is a no-op observable only through the unchanged count.
    pub fn insert(&mut self, t: &Trible) {
        self.eav.put(&t.data, ());
        self.eva.put(&t.data, ());
        self.aev.put(&t.data, ());
        self.ave.put(&t.data, ());
        self.vea.put(&t.data, ());
        self.vae.put(&t.data, ());
    }

    pub fn contains(&self, t: &Trible) -> bool {
        self.eav.get(&t.data).is_some()
    }

    /// The number of distinct tribles. All six trees agree, so any one
    /// serves; `eav` is picked for no reason beyond being first.
    pub fn count(&self) -> u64 {
        self.eav.count()
    }

    pub fn is_empty(&self) -> bool {
        self.eav.is_empty()
    }

    pub fn is_equal(&self, other: &TribleSet) -> bool {
        self.eav.is_equal(&other.eav)
    }

    pub fn is_subset_of(&self, other: &TribleSet) -> bool {
        self.eav.is_subset_of(&other.eav)
    }

    pub fn is_intersecting(&self, other: &TribleSet) -> bool {
        self.eav.is_intersecting(&other.eav)
    }

    /// An independent snapshot sharing structure with `self` (O(1)).
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// Structural union of `sets`, one tree-permutation at a time.
    pub fn init_union(sets: &[TribleSet]) -> Self {
        let eavs: Vec<EAV> = sets.iter().map(|s| s.eav.clone()).collect();
        let evas: Vec<EVA> = sets.iter().map(|s| s.eva.clone()).collect();
        let aevs: Vec<AEV> = sets.iter().map(|s| s.aev.clone()).collect();
        let aves: Vec<AVE> = sets.iter().map(|s| s.ave.clone()).collect();
        let veas: Vec<VEA> = sets.iter().map(|s| s.vea.clone()).collect();
        let vaes: Vec<VAE> = sets.iter().map(|s| s.vae.clone()).collect();
        TribleSet {
            eav: EAV::init_union(&eavs),
            eva: EVA::init_union(&evas),
            aev: AEV::init_union(&aevs),
            ave: AVE::init_union(&aves),
            vea: VEA::init_union(&veas),
            vae: VAE::init_union(&vaes),
        }
    }

    /// Structural intersection of `sets`, one tree-permutation at a time.
    pub fn init_intersection(sets: &[TribleSet]) -> Self {
        let eavs: Vec<EAV> = sets.iter().map(|s| s.eav.clone()).collect();
        let evas: Vec<EVA> = sets.iter().map(|s| s.eva.clone()).collect();
        let aevs: Vec<AEV> = sets.iter().map(|s| s.aev.clone()).collect();
        let aves: Vec<AVE> = sets.iter().map(|s| s.ave.clone()).collect();
        let veas: Vec<VEA> = sets.iter().map(|s| s.vea.clone()).collect();
        let vaes: Vec<VAE> = sets.iter().map(|s| s.vae.clone()).collect();
        TribleSet {
            eav: EAV::init_intersection(&eavs),
            eva: EVA::init_intersection(&evas),
            aev: AEV::init_intersection(&aevs),
            ave: AVE::init_intersection(&aves),
            vea: VEA::init_intersection(&veas),
            vae: VAE::init_intersection(&vaes),
        }
    }

    /// Every trible, in `eav` tree order.
    pub fn iter(&self) -> impl Iterator<Item = Trible> + '_ {
        self.eav.nodes().filter_map(|(_, key, node)| {
            matches!(node, Node::Leaf(_)).then(|| Trible::new_raw(key))
        })
    }

    /// Builds a constraint over this set for the three variable ids
    /// `e`, `a`, `v`, as consumed by a join engine's `pushVariable`/
    /// `pushByte` protocol (spec.md §6.2).
    pub fn constraint(&self, e: u8, a: u8, v: u8) -> TribleConstraint {
        TribleConstraint::new(self, e, a, v)
    }
}
