//! A join-engine constraint multiplexing a `TribleSet`'s six trees. Pushing
//! a variable picks which tree becomes authoritative for the bytes that
//! follow; pushing all three leaves exactly one tree driving the walk, with
//! the other five parked at whatever depth they reached. Grounded on the
//! commented `Stack`/`ByteCursor`/`VariableConstraint` sketch in
//! `src/tribleset/tribleconstraint.rs`, expanded from its nine covered
//! states to the full sixteen spec.md §4.8 specifies (DESIGN.md OQ-6).

use crate::bitset::ByteBitset;
use crate::patch::hash::Hash128;
use crate::patch::Cursor;
use crate::trible::{
    AEVOrder, AVEOrder, EAVOrder, EVAOrder, TribleSegmentation, VAEOrder, VEAOrder, TRIBLE_LEN,
};
use crate::tribleset::TribleSet;

/// Which of the three trible fields a caller-chosen variable id is bound
/// to, for one particular `TribleConstraint`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    E,
    A,
    V,
}

/// The sixteen reachable push/pop states: no variable bound, one bound, two
/// bound (in either order), or all three bound (in one of six orders).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stack {
    Empty,
    E,
    A,
    V,
    EA,
    EV,
    AE,
    AV,
    VE,
    VA,
    EAV,
    EVA,
    AEV,
    AVE,
    VEA,
    VAE,
}

/// A constraint binding one `TribleSet`'s (E, A, V) fields to three
/// caller-chosen variable ids. `push_variable`/`pop_variable` drive a
/// sixteen-state machine selecting, at every point, which one or two of the
/// six underlying cursors answer `peek_byte`/`propose_byte`/`push_byte`/
/// `pop_byte`.
///
/// While exactly one variable is bound (states `E`/`A`/`V`), two cursors
/// whose trees agree on field order up to that point advance in lockstep —
/// e.g. binding only the entity walks both `eav` and `eva` together, since
/// both start with the E field and so branch identically until a second
/// variable is bound. That redundancy lets `push_variable` for the second
/// variable switch to the tree built for that exact pair without losing any
/// already-descended depth.
pub struct TribleConstraint<'a> {
    e_var: u8,
    a_var: u8,
    v_var: u8,
    state: Stack,
    eav: Cursor<TRIBLE_LEN, ()>,
    eva: Cursor<TRIBLE_LEN, ()>,
    aev: Cursor<TRIBLE_LEN, ()>,
    ave: Cursor<TRIBLE_LEN, ()>,
    vea: Cursor<TRIBLE_LEN, ()>,
    vae: Cursor<TRIBLE_LEN, ()>,
    _set: std::marker::PhantomData<&'a TribleSet>,
}

impl<'a> TribleConstraint<'a> {
    pub(crate) fn new(set: &'a TribleSet, e_var: u8, a_var: u8, v_var: u8) -> Self {
        assert!(
            e_var != a_var && e_var != v_var && a_var != v_var,
            "a constraint's three variable ids must be distinct"
        );
        TribleConstraint {
            e_var,
            a_var,
            v_var,
            state: Stack::Empty,
            eav: set.eav.cursor(),
            eva: set.eva.cursor(),
            aev: set.aev.cursor(),
            ave: set.ave.cursor(),
            vea: set.vea.cursor(),
            vae: set.vae.cursor(),
            _set: std::marker::PhantomData,
        }
    }

    fn role_of(&self, v: u8) -> Role {
        if v == self.e_var {
            Role::E
        } else if v == self.a_var {
            Role::A
        } else if v == self.v_var {
            Role::V
        } else {
            panic!("variable {v} is not one of this constraint's bound variables")
        }
    }

    /// The variable ids this constraint can bind.
    pub fn variables(&self) -> ByteBitset {
        let mut out = ByteBitset::new_empty();
        out.set(self.e_var);
        out.set(self.a_var);
        out.set(self.v_var);
        out
    }

    /// Binds the next free variable. Variables must be pushed in an order
    /// consistent with some permutation of (E, A, V); pushing an
    /// already-bound variable, or one unrelated to this constraint, is a
    /// programmer error.
    pub fn push_variable(&mut self, v: u8) {
        let role = self.role_of(v);
        self.state = match (self.state, role) {
            (Stack::Empty, Role::E) => Stack::E,
            (Stack::Empty, Role::A) => Stack::A,
            (Stack::Empty, Role::V) => Stack::V,
            (Stack::E, Role::A) => Stack::EA,
            (Stack::E, Role::V) => Stack::EV,
            (Stack::A, Role::E) => Stack::AE,
            (Stack::A, Role::V) => Stack::AV,
            (Stack::V, Role::E) => Stack::VE,
            (Stack::V, Role::A) => Stack::VA,
            (Stack::EA, Role::V) => Stack::EAV,
            (Stack::EV, Role::A) => Stack::EVA,
            (Stack::AE, Role::V) => Stack::AEV,
            (Stack::AV, Role::E) => Stack::AVE,
            (Stack::VE, Role::A) => Stack::VEA,
            (Stack::VA, Role::E) => Stack::VAE,
            _ => panic!("push_variable called for a variable already bound, or out of order"),
        };
    }

    /// Unbinds the most recently bound variable.
    pub fn pop_variable(&mut self) {
        self.state = match self.state {
            Stack::EAV => Stack::EA,
            Stack::EVA => Stack::EV,
            Stack::AEV => Stack::AE,
            Stack::AVE => Stack::AV,
            Stack::VEA => Stack::VE,
            Stack::VAE => Stack::VA,
            Stack::EA | Stack::EV => Stack::E,
            Stack::AE | Stack::AV => Stack::A,
            Stack::VE | Stack::VA => Stack::V,
            Stack::E | Stack::A | Stack::V => Stack::Empty,
            Stack::Empty => panic!("pop_variable called with no variable bound"),
        };
    }

    /// The byte fixed at the authoritative cursor's current depth, or
    /// `None` if it branches here.
    pub fn peek_byte(&self) -> Option<u8> {
        match self.state {
            Stack::Empty => panic!("peek_byte called before any variable is bound"),
            Stack::E => self.eav.peek(),
            Stack::A => self.aev.peek(),
            Stack::V => self.vea.peek(),
            Stack::EA | Stack::EAV => self.eav.peek(),
            Stack::EV | Stack::EVA => self.eva.peek(),
            Stack::AE | Stack::AEV => self.aev.peek(),
            Stack::AV | Stack::AVE => self.ave.peek(),
            Stack::VE | Stack::VEA => self.vea.peek(),
            Stack::VA | Stack::VAE => self.vae.peek(),
        }
    }

    /// The candidate byte set at the authoritative cursor's current depth.
    pub fn propose_byte(&self, out: &mut ByteBitset) {
        match self.state {
            Stack::Empty => panic!("propose_byte called before any variable is bound"),
            Stack::E => self.eav.propose(out),
            Stack::A => self.aev.propose(out),
            Stack::V => self.vea.propose(out),
            Stack::EA | Stack::EAV => self.eav.propose(out),
            Stack::EV | Stack::EVA => self.eva.propose(out),
            Stack::AE | Stack::AEV => self.aev.propose(out),
            Stack::AV | Stack::AVE => self.ave.propose(out),
            Stack::VE | Stack::VEA => self.vea.propose(out),
            Stack::VA | Stack::VAE => self.vae.propose(out),
        }
    }

    /// Descends the authoritative cursor(s) through `byte`. While only one
    /// variable is bound, the two trees sharing that field order advance
    /// together so either is ready to become authoritative for whichever
    /// variable is bound next.
    pub fn push_byte(&mut self, byte: u8) {
        match self.state {
            Stack::Empty => panic!("push_byte called before any variable is bound"),
            Stack::E => {
                self.eav.push(byte);
                self.eva.push(byte);
            }
            Stack::A => {
                self.aev.push(byte);
                self.ave.push(byte);
            }
            Stack::V => {
                self.vea.push(byte);
                self.vae.push(byte);
            }
            Stack::EA | Stack::EAV => self.eav.push(byte),
            Stack::EV | Stack::EVA => self.eva.push(byte),
            Stack::AE | Stack::AEV => self.aev.push(byte),
            Stack::AV | Stack::AVE => self.ave.push(byte),
            Stack::VE | Stack::VEA => self.vea.push(byte),
            Stack::VA | Stack::VAE => self.vae.push(byte),
        }
    }

    /// Retracts the authoritative cursor(s) by one byte.
    pub fn pop_byte(&mut self) {
        match self.state {
            Stack::Empty => panic!("pop_byte called before any variable is bound"),
            Stack::E => {
                self.eav.pop();
                self.eva.pop();
            }
            Stack::A => {
                self.aev.pop();
                self.ave.pop();
            }
            Stack::V => {
                self.vea.pop();
                self.vae.pop();
            }
            Stack::EA | Stack::EAV => self.eav.pop(),
            Stack::EV | Stack::EVA => self.eva.pop(),
            Stack::AE | Stack::AEV => self.aev.pop(),
            Stack::AV | Stack::AVE => self.ave.pop(),
            Stack::VE | Stack::VEA => self.vea.pop(),
            Stack::VA | Stack::VAE => self.vae.pop(),
        }
    }

    /// I9's selectivity estimate for binding `v` next: the segment count of
    /// whichever tree would become authoritative once `v` is pushed. Lets a
    /// join engine pick its next variable without actually pushing it.
    pub fn count_variable(&self, v: u8) -> u64 {
        let target = self.role_of(v);
        match (self.state, target) {
            (Stack::Empty, Role::E) => self.eav.segment_count::<EAVOrder, TribleSegmentation>(),
            (Stack::Empty, Role::A) => self.aev.segment_count::<AEVOrder, TribleSegmentation>(),
            (Stack::Empty, Role::V) => self.vea.segment_count::<VEAOrder, TribleSegmentation>(),
            (Stack::E, Role::A) => self.eav.segment_count::<EAVOrder, TribleSegmentation>(),
            (Stack::E, Role::V) => self.eva.segment_count::<EVAOrder, TribleSegmentation>(),
            (Stack::A, Role::E) => self.aev.segment_count::<AEVOrder, TribleSegmentation>(),
            (Stack::A, Role::V) => self.ave.segment_count::<AVEOrder, TribleSegmentation>(),
            (Stack::V, Role::E) => self.vea.segment_count::<VEAOrder, TribleSegmentation>(),
            (Stack::V, Role::A) => self.vae.segment_count::<VAEOrder, TribleSegmentation>(),
            (Stack::EA, Role::V) => self.eav.segment_count::<EAVOrder, TribleSegmentation>(),
            (Stack::EV, Role::A) => self.eva.segment_count::<EVAOrder, TribleSegmentation>(),
            (Stack::AE, Role::V) => self.aev.segment_count::<AEVOrder, TribleSegmentation>(),
            (Stack::AV, Role::E) => self.ave.segment_count::<AVEOrder, TribleSegmentation>(),
            (Stack::VE, Role::A) => self.vea.segment_count::<VEAOrder, TribleSegmentation>(),
            (Stack::VA, Role::E) => self.vae.segment_count::<VAEOrder, TribleSegmentation>(),
            _ => panic!("count_variable called for a variable already bound, or out of order"),
        }
    }

    /// A cheap selectivity sample for binding `v` next: the structural hash
    /// of the subtree that would become authoritative. Two constraints
    /// positioned over identical data always agree here regardless of
    /// insertion history, which is the property a min-hash-style sample
    /// needs (DESIGN.md OQ-6) without the expense of hashing every leaf
    /// under the subtree on every call.
    pub fn sample_variable(&self, v: u8) -> Hash128 {
        let target = self.role_of(v);
        match (self.state, target) {
            (Stack::Empty, Role::E) => self.eav.node_hash(),
            (Stack::Empty, Role::A) => self.aev.node_hash(),
            (Stack::Empty, Role::V) => self.vea.node_hash(),
            (Stack::E, Role::A) => self.eav.node_hash(),
            (Stack::E, Role::V) => self.eva.node_hash(),
            (Stack::A, Role::E) => self.aev.node_hash(),
            (Stack::A, Role::V) => self.ave.node_hash(),
            (Stack::V, Role::E) => self.vea.node_hash(),
            (Stack::V, Role::A) => self.vae.node_hash(),
            (Stack::EA, Role::V) => self.eav.node_hash(),
            (Stack::EV, Role::A) => self.eva.node_hash(),
            (Stack::AE, Role::V) => self.aev.node_hash(),
            (Stack::AV, Role::E) => self.ave.node_hash(),
            (Stack::VE, Role::A) => self.vea.node_hash(),
            (Stack::VA, Role::E) => self.vae.node_hash(),
            _ => panic!("sample_variable called for a variable already bound, or out of order"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::hash;
    use crate::trible::Trible;

    fn trible(e: u8, a: u8, v: u8) -> Trible {
        Trible::new(&[e; 16], &[a; 16], &[v; 32])
    }

    fn set() -> TribleSet {
        let mut s = TribleSet::new();
        s.insert(&trible(1, 1, 1));
        s.insert(&trible(1, 2, 1));
        s.insert(&trible(2, 1, 1));
        s
    }

    #[test]
    fn variables_reports_the_three_bound_ids() {
        hash::init_with_seed([30; 16]);
        let s = set();
        let c = s.constraint(10, 11, 12);
        let vars = c.variables();
        assert!(vars.is_set(10) && vars.is_set(11) && vars.is_set(12));
        assert_eq!(vars.count(), 3);
    }

    #[test]
    fn push_pop_variable_walks_all_sixteen_states() {
        hash::init_with_seed([31; 16]);
        let s = set();
        let mut c = s.constraint(10, 11, 12);
        c.push_variable(10); // E
        c.push_variable(11); // EA
        c.push_variable(12); // EAV
        c.pop_variable(); // EA
        c.pop_variable(); // E
        c.push_variable(12); // EV
        c.push_variable(11); // EVA
        c.pop_variable();
        c.pop_variable();
        c.pop_variable(); // Empty
        c.push_variable(11); // A
        c.push_variable(10); // AE
        c.push_variable(12); // AEV
        c.pop_variable();
        c.pop_variable();
        c.push_variable(12); // AV
        c.push_variable(10); // AVE
        c.pop_variable();
        c.pop_variable();
        c.pop_variable(); // Empty
        c.push_variable(12); // V
        c.push_variable(10); // VE
        c.push_variable(11); // VEA
        c.pop_variable();
        c.pop_variable();
        c.push_variable(11); // VA
        c.push_variable(10); // VAE
        c.pop_variable();
        c.pop_variable();
        c.pop_variable(); // Empty
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn push_variable_rejects_rebinding() {
        hash::init_with_seed([32; 16]);
        let s = set();
        let mut c = s.constraint(10, 11, 12);
        c.push_variable(10);
        c.push_variable(10);
    }

    #[test]
    fn single_variable_lockstep_cursors_agree_on_propose() {
        hash::init_with_seed([33; 16]);
        let s = set();
        let mut c = s.constraint(10, 11, 12);
        c.push_variable(10);
        let mut out = ByteBitset::new_empty();
        c.propose_byte(&mut out);
        assert!(out.is_set(1));
        assert!(out.is_set(2));
        assert_eq!(out.count(), 2);
    }

    #[test]
    fn count_variable_matches_segment_count_of_future_authority() {
        hash::init_with_seed([34; 16]);
        let s = set();
        let c = s.constraint(10, 11, 12);
        // Three distinct entities: E=1 appears twice, E=2 once, but at
        // depth 0 this only reports how many distinct top-level bytes a
        // push of the entity variable would branch into, not leaf counts.
        assert!(c.count_variable(10) >= 1);
    }

    fn walk_field(c: &mut TribleConstraint, len: usize) -> Vec<u8> {
        let mut field = Vec::with_capacity(len);
        for _ in 0..len {
            let mut proposal = ByteBitset::new_empty();
            c.propose_byte(&mut proposal);
            let b = proposal.find_first_set().expect("no candidate bytes at this depth");
            c.push_byte(b);
            field.push(b);
        }
        field
    }

    #[test]
    fn walking_eav_order_to_completion_matches_direct_lookup() {
        hash::init_with_seed([35; 16]);
        let s = set();
        let mut c = s.constraint(10, 11, 12);

        c.push_variable(10);
        let e = walk_field(&mut c, 16);
        c.push_variable(11);
        let a = walk_field(&mut c, 16);
        c.push_variable(12);
        let v = walk_field(&mut c, 32);

        let e: [u8; 16] = e.try_into().unwrap();
        let a: [u8; 16] = a.try_into().unwrap();
        let v: [u8; 32] = v.try_into().unwrap();
        assert!(s.contains(&Trible::new(&e, &a, &v)));
    }
}
