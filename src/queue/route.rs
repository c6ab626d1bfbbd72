//! Connection-affinity routing.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash of `key`.
#[inline]
pub fn fnv1a_32(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Partition owning `key` among `partition_count` partitions.
///
/// A pure function of its inputs: the same key always maps to the same
/// partition for a given count. `partition_count` must be non-zero.
#[inline]
pub fn partition_index(key: &str, partition_count: usize) -> usize {
    debug_assert!(partition_count > 0);
    fnv1a_32(key.as_bytes()) as usize % partition_count
}
