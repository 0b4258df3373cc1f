//! The two-hash cuckoo addressing scheme shared by every `Branch` bucket
//! table: `H0` is bit-reversal, `H1` is a compile-time random permutation.
//! Branch itself (module `branch.rs`) owns the bucket storage and the
//! put/displace/grow state machine; this module only supplies the hash
//! functions and the bucket-local put rule.

use std::sync::OnceLock;

use rand::seq::SliceRandom;

pub const BUCKET_ENTRY_COUNT: usize = 4;
pub const MAX_BUCKET_COUNT: usize = 64;
pub const MAX_RETRIES: usize = 8;

fn random_permutation_hash() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: [u8; 256] = [0; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8;
        }
        table.shuffle(&mut rand::thread_rng());
        table
    })
}

/// `H0(k) = bitreverse(k)`.
pub fn h0(k: u8) -> u8 {
    k.reverse_bits()
}

/// `H1(k) = rand_lut[k]`, a fixed-at-process-start random permutation chosen
/// so that `H0` and `H1` disagree on bucket index for every key once the
/// branch is at its largest bucket count.
pub fn h1(k: u8) -> u8 {
    random_permutation_hash()[k as usize]
}

pub fn hash_for(k: u8, rand_hash_used: bool) -> u8 {
    if rand_hash_used {
        h1(k)
    } else {
        h0(k)
    }
}

/// `bucket_index(k) = (b-1) AND H_{rand_hash_used[k]}(k)`; `b` must be a
/// power of two.
pub fn bucket_index(k: u8, rand_hash_used: bool, bucket_count: usize) -> usize {
    debug_assert!(bucket_count.is_power_of_two());
    (hash_for(k, rand_hash_used) as usize) & (bucket_count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h0_is_involution() {
        for k in 0u8..=255 {
            assert_eq!(h0(h0(k)), k);
        }
    }

    #[test]
    fn h1_is_a_permutation() {
        let mut seen = [false; 256];
        for k in 0u8..=255 {
            seen[h1(k) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn bucket_index_respects_mask() {
        for k in 0u8..=255 {
            let idx = bucket_index(k, false, 32);
            assert!(idx < 32);
        }
    }
}
