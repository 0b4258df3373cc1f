//! PACT: a persistent, hash-consing-friendly ordered map over fixed-length
//! byte-string keys, and `TribleSet`: a composite six-permutation index
//! built on top of it for `(entity, attribute, value)` triples. See
//! `patch` for the tree itself and `tribleset` for the composite index and
//! its join-engine constraint.

pub mod bitset;
pub mod patch;
pub mod trible;
pub mod tribleset;

pub use patch::Tree;
pub use trible::Trible;
pub use tribleset::{TribleConstraint, TribleSet};
