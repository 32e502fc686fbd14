//! # Sharding Strategies
//!
//! A strategy maps `(key, bucket_count)` to the index of the connection that
//! owns the key. It must be pure: the same key and count always pick the
//! same bucket, or multi-key requests and later reads would disagree.

use std::sync::Arc;

/// Shared strategy handle.
pub type Strategy = Arc<dyn Fn(&str, usize) -> usize + Send + Sync>;

/// Default strategy: 32-bit string hash folded modulo the bucket count.
pub fn hash() -> Strategy {
    Arc::new(hash_bucket)
}

/// Single-server strategy; always bucket 0.
pub fn solo() -> Strategy {
    Arc::new(|_: &str, _: usize| 0)
}

/// Folds UTF-16 code units with `h = (h << 5) - h + c` in wrapping 32-bit
/// signed arithmetic, then reduces into `[0, buckets)`.
pub fn hash_bucket(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let hash = key.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    });
    // Negative hashes must still land inside the bucket range.
    (i64::from(hash)).rem_euclid(buckets as i64) as usize
}
