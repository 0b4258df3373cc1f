//! The `Trible` key shape: three concatenated fixed-width fields `(E, A, V)`
//! of sizes `(16, 16, 32)` summing to the 64-byte key [`TribleSet`] indexes.
//! `TribleSegmentation` exposes those field boundaries to [`crate::patch`]'s
//! I9 selectivity estimate; the six `*Order` marker types give each of
//! [`crate::tribleset::TribleSet`]'s six PACTs a distinct byte permutation
//! without duplicating any PACT code. Grounded on `src/trible.rs`'s
//! `E_START`/`A_START`/`V_START` constants, `TribleSegmentation`, and its six
//! `KeyOrdering` impls — narrowed to a unit-valued key shape, since schema
//! encoding/decoding (`ValueSchema`, `RawId`) is out of this crate's scope
//! (spec.md §1).
//!
//! [`TribleSet`]: crate::tribleset::TribleSet

use crate::patch::{KeyOrdering, KeySegmentation};

pub const TRIBLE_LEN: usize = 64;

pub const E_START: usize = 0;
pub const E_LEN: usize = 16;
pub const A_START: usize = E_START + E_LEN;
pub const A_LEN: usize = 16;
pub const V_START: usize = A_START + A_LEN;
pub const V_LEN: usize = 32;

/// Three concatenated fields `(entity, attribute, value)` forming one
/// 64-byte PACT key.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Trible {
    pub data: [u8; TRIBLE_LEN],
}

impl Trible {
    pub fn new(e: &[u8; E_LEN], a: &[u8; A_LEN], v: &[u8; V_LEN]) -> Trible {
        let mut data = [0u8; TRIBLE_LEN];
        data[E_START..E_START + E_LEN].copy_from_slice(e);
        data[A_START..A_START + A_LEN].copy_from_slice(a);
        data[V_START..V_START + V_LEN].copy_from_slice(v);
        Trible { data }
    }

    pub fn new_raw(data: [u8; TRIBLE_LEN]) -> Trible {
        Trible { data }
    }

    pub fn e(&self) -> [u8; E_LEN] {
        self.data[E_START..E_START + E_LEN].try_into().unwrap()
    }

    pub fn a(&self) -> [u8; A_LEN] {
        self.data[A_START..A_START + A_LEN].try_into().unwrap()
    }

    pub fn v(&self) -> [u8; V_LEN] {
        self.data[V_START..V_START + V_LEN].try_into().unwrap()
    }
}

/// I9's segment boundaries for a `Trible` key: bytes `[0,16)` are segment 0
/// (E), `[16,32)` are segment 1 (A), `[32,64)` are segment 2 (V).
#[derive(Copy, Clone, Debug)]
pub struct TribleSegmentation {}

impl KeySegmentation<TRIBLE_LEN> for TribleSegmentation {
    fn segment(at_depth: usize) -> usize {
        if at_depth < A_START {
            0
        } else if at_depth < V_START {
            1
        } else if at_depth < TRIBLE_LEN {
            2
        } else {
            panic!("depth {at_depth} out of range for a {TRIBLE_LEN}-byte trible")
        }
    }
}

fn tree_index_with_offsets(key_index: usize, e_off: usize, a_off: usize, v_off: usize) -> usize {
    match key_index {
        d if d < E_LEN => d + e_off,
        d if d < E_LEN + A_LEN => (d - E_LEN) + a_off,
        d => (d - E_LEN - A_LEN) + v_off,
    }
}

fn key_index_with_offsets(tree_index: usize, e_off: usize, a_off: usize, v_off: usize) -> usize {
    if (e_off..e_off + E_LEN).contains(&tree_index) {
        tree_index - e_off
    } else if (a_off..a_off + A_LEN).contains(&tree_index) {
        (tree_index - a_off) + E_LEN
    } else {
        debug_assert!((v_off..v_off + V_LEN).contains(&tree_index));
        (tree_index - v_off) + E_LEN + A_LEN
    }
}

macro_rules! trible_order {
    ($name:ident, $doc:literal, e = $e_off:expr, a = $a_off:expr, v = $v_off:expr) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug)]
        pub struct $name {}

        impl KeyOrdering<TRIBLE_LEN> for $name {
            fn tree_index(key_index: usize) -> usize {
                tree_index_with_offsets(key_index, $e_off, $a_off, $v_off)
            }
            fn key_index(tree_index: usize) -> usize {
                key_index_with_offsets(tree_index, $e_off, $a_off, $v_off)
            }
        }
    };
}

trible_order!(EAVOrder, "Tree order E, A, V (identity).", e = 0, a = 16, v = 32);
trible_order!(EVAOrder, "Tree order E, V, A.", e = 0, a = 48, v = 16);
trible_order!(AEVOrder, "Tree order A, E, V.", e = 16, a = 0, v = 32);
trible_order!(AVEOrder, "Tree order A, V, E.", e = 48, a = 0, v = 16);
trible_order!(VEAOrder, "Tree order V, E, A.", e = 32, a = 48, v = 0);
trible_order!(VAEOrder, "Tree order V, A, E.", e = 48, a = 32, v = 0);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip<O: KeyOrdering<TRIBLE_LEN>>(key: &[u8; TRIBLE_LEN]) {
        let tree_key = O::tree_ordered(key);
        let back = O::key_ordered(&tree_key);
        assert_eq!(&back, key);
    }

    #[test]
    fn all_six_orders_round_trip() {
        let t = Trible::new(&[1; 16], &[2; 16], &[3; 32]).data;
        roundtrip::<EAVOrder>(&t);
        roundtrip::<EVAOrder>(&t);
        roundtrip::<AEVOrder>(&t);
        roundtrip::<AVEOrder>(&t);
        roundtrip::<VEAOrder>(&t);
        roundtrip::<VAEOrder>(&t);
    }

    #[test]
    fn eav_is_identity() {
        let t = Trible::new(&[1; 16], &[2; 16], &[3; 32]).data;
        assert_eq!(EAVOrder::tree_ordered(&t), t);
    }

    #[test]
    fn segmentation_matches_field_boundaries() {
        for d in 0..16 {
            assert_eq!(TribleSegmentation::segment(d), 0);
        }
        for d in 16..32 {
            assert_eq!(TribleSegmentation::segment(d), 1);
        }
        for d in 32..64 {
            assert_eq!(TribleSegmentation::segment(d), 2);
        }
    }

    proptest! {
        #[test]
        fn every_order_round_trips_random_keys(bytes in prop::array::uniform64(any::<u8>())) {
            roundtrip::<EAVOrder>(&bytes);
            roundtrip::<EVAOrder>(&bytes);
            roundtrip::<AEVOrder>(&bytes);
            roundtrip::<AVEOrder>(&bytes);
            roundtrip::<VEAOrder>(&bytes);
            roundtrip::<VAEOrder>(&bytes);
        }
    }
}
