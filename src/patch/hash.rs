//! Structural hashing. A single process-wide 128-bit secret keys a SipHash-128
//! digest over full keys; node hashes are the commutative XOR-combination of
//! their leaves' digests, giving O(1) equality/subset checks on subtrees.

use std::sync::Once;

use siphasher::sip128::{Hash128 as SipHash128, Hasher128, SipHasher24};

static SECRET_INIT: Once = Once::new();
static mut SECRET: [u8; 16] = [0; 16];

/// Initializes the process-wide hash secret from a cryptographic RNG.
/// Idempotent: subsequent calls (from any thread) are no-ops. Must happen
/// before the first `put` on any tree; re-initializing mid-run would
/// invalidate the structural hashes of every tree already built.
pub fn init() {
    SECRET_INIT.call_once(|| {
        use rand::RngCore;
        let mut secret = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut secret);
        unsafe {
            SECRET = secret;
        }
    });
}

/// Initializes the hash secret from a fixed seed. Intended for reproducible
/// tests; like [`init`] this only takes effect on the first call.
pub fn init_with_seed(seed: [u8; 16]) {
    SECRET_INIT.call_once(|| unsafe {
        SECRET = seed;
    });
}

fn secret() -> [u8; 16] {
    assert!(
        SECRET_INIT.is_completed(),
        "hash secret used before init()/init_with_seed() was called"
    );
    unsafe { SECRET }
}

/// A 128-bit structural digest.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub struct Hash128(pub u128);

impl Hash128 {
    pub const ZERO: Hash128 = Hash128(0);

    pub fn combine(self, other: Hash128) -> Hash128 {
        Hash128(self.0 ^ other.0)
    }
}

/// Keyed 128-bit digest of `key` under the process-wide secret.
pub fn leaf_hash(key: &[u8]) -> Hash128 {
    let secret = secret();
    let key0 = u64::from_le_bytes(secret[0..8].try_into().unwrap());
    let key1 = u64::from_le_bytes(secret[8..16].try_into().unwrap());
    let mut hasher = SipHasher24::new_with_keys(key0, key1);
    std::hash::Hasher::write(&mut hasher, key);
    let SipHash128 { h1, h2 } = hasher.finish128();
    Hash128(((h1 as u128) << 64) | h2 as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_commutative_and_self_inverse() {
        init_with_seed([7; 16]);
        let a = leaf_hash(b"alpha");
        let b = leaf_hash(b"beta");
        assert_eq!(a.combine(b), b.combine(a));
        assert_eq!(a.combine(b).combine(b), a);
        assert_eq!(a.combine(a), Hash128::ZERO);
    }

    #[test]
    fn same_key_same_hash() {
        init_with_seed([9; 16]);
        assert_eq!(leaf_hash(b"same"), leaf_hash(b"same"));
    }

    #[test]
    fn different_keys_differ() {
        init_with_seed([3; 16]);
        assert_ne!(leaf_hash(b"a"), leaf_hash(b"b"));
    }
}
