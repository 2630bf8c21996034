//! XOR metric over the 256-bit keyspace.
//!
//! Distances compare lexicographically byte-by-byte, so a shorter common
//! prefix with the target means a larger distance. Bucket placement uses the
//! common prefix length between the local and remote ids, capped at the last
//! bucket.

use crate::types::{NodeId, NODE_ID_LEN};
use std::cmp::Ordering;

/// Number of buckets in the routing table (one per bit of the id).
pub const NUM_BUCKETS: usize = NODE_ID_LEN * 8;

/// Byte-wise XOR distance between two ids.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; NODE_ID_LEN] {
    let mut out = [0u8; NODE_ID_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.as_bytes()[i] ^ b.as_bytes()[i];
    }
    out
}

/// Order `a` and `b` by their distance to `target`.
///
/// `Less` means `a` is closer. Two ids equal to the target are equidistant.
pub fn compare_distance(a: &NodeId, b: &NodeId, target: &NodeId) -> Ordering {
    let da = xor_distance(a, target);
    let db = xor_distance(b, target);
    da.cmp(&db)
}

/// Count of leading equal bits of `a XOR b`.
pub fn common_prefix_len(a: &NodeId, b: &NodeId) -> u32 {
    let mut bits = 0u32;
    for i in 0..NODE_ID_LEN {
        let x = a.as_bytes()[i] ^ b.as_bytes()[i];
        if x == 0 {
            bits += 8;
        } else {
            bits += x.leading_zeros();
            break;
        }
    }
    bits
}

/// Bucket placement for `remote` relative to `local`.
///
/// Identical ids would yield a prefix length of 256; the index is capped at
/// the last bucket.
pub fn bucket_index(local: &NodeId, remote: &NodeId) -> usize {
    (common_prefix_len(local, remote) as usize).min(NUM_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; NODE_ID_LEN])
    }

    #[test]
    fn test_xor_distance_symmetric() {
        for _ in 0..64 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        }
    }

    #[test]
    fn test_xor_distance_to_self_is_zero() {
        let a = NodeId::random();
        assert_eq!(xor_distance(&a, &a), [0u8; NODE_ID_LEN]);
    }

    #[test]
    fn test_compare_distance_reflexive_and_antisymmetric() {
        for _ in 0..64 {
            let a = NodeId::random();
            let b = NodeId::random();
            let t = NodeId::random();
            assert_eq!(compare_distance(&a, &a, &t), Ordering::Equal);
            assert_eq!(
                compare_distance(&a, &b, &t),
                compare_distance(&b, &a, &t).reverse()
            );
        }
    }

    #[test]
    fn test_compare_distance_target_is_closest() {
        let t = NodeId::random();
        let other = NodeId::random();
        if other != t {
            assert_eq!(compare_distance(&t, &other, &t), Ordering::Less);
        }
    }

    #[test]
    fn test_common_prefix_len_known_values() {
        let zero = id(0x00);
        assert_eq!(common_prefix_len(&zero, &zero), 256);
        // 0x00 vs 0x80: first bit differs.
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = 0x80;
        assert_eq!(common_prefix_len(&zero, &NodeId::from_bytes(bytes)), 0);
        // 0x00 vs 0x01 in the first byte: seven leading equal bits.
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = 0x01;
        assert_eq!(common_prefix_len(&zero, &NodeId::from_bytes(bytes)), 7);
        // Difference only in the second byte.
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[1] = 0xff;
        assert_eq!(common_prefix_len(&zero, &NodeId::from_bytes(bytes)), 8);
    }

    #[test]
    fn test_bucket_index_capped() {
        let a = NodeId::random();
        assert_eq!(bucket_index(&a, &a), NUM_BUCKETS - 1);
        let mut flipped = *a.as_bytes();
        flipped[0] ^= 0x80;
        assert_eq!(bucket_index(&a, &NodeId::from_bytes(flipped)), 0);
    }
}
