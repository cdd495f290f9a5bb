//! Partition routing
//!
//! The server side places records with the same function, so this must stay
//! bit-compatible with it: CRC-64 of the raw hash-key bytes, modulo the
//! partition count.

use crate::common::partition_hash;

/// Partition index for `hash_key` in a table with `partition_count` partitions.
///
/// `partition_count` must be non-zero; partition maps with no partitions are
/// rejected before they can be routed against.
pub fn partition_of(hash_key: &[u8], partition_count: u32) -> u32 {
    debug_assert!(partition_count > 0);
    partition_hash(hash_key, partition_count)
}
