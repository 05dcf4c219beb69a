//! Consistent hashing used by percentage rollouts and variant selection.
//!
//! The hash is shared with the server and with every other client SDK, so the same subject lands
//! in the same bucket no matter which client evaluates it: MurmurHash3 (x86, 32-bit) over
//! `"{group_id}:{identifier}"`, reduced modulo the number of buckets.
use std::io::Cursor;

/// Seed used for percentage rollouts.
pub const ROLLOUT_SEED: u32 = 0;

/// Seed used for variant selection.
pub const VARIANT_SEED: u32 = 86_028_157;

pub trait ConsistentHasher {
    /// Map `identifier` salted with `group_id` to a bucket in `0..buckets`.
    ///
    /// `buckets` must be non-zero.
    fn bucket(&self, identifier: &str, group_id: &str, buckets: u32, seed: u32) -> u32;
}

/// The default (and only) hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Hasher;

impl ConsistentHasher for Murmur3Hasher {
    fn bucket(&self, identifier: &str, group_id: &str, buckets: u32, seed: u32) -> u32 {
        let input = format!("{group_id}:{identifier}");
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), seed)
            .expect("reading from an in-memory buffer should not fail");
        hash % buckets
    }
}

/// Map `identifier` salted with `group_id` to a stable percentage bucket in `0..100`.
///
/// A rollout at `p` percent is enabled for the identifier iff `normalize(..) < p`.
pub fn normalize(identifier: &str, group_id: &str) -> u32 {
    Murmur3Hasher.bucket(identifier, group_id, 100, ROLLOUT_SEED)
}
