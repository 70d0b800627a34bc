//! Stable per-particle hashing

/// SplitMix64 finalizer: a fast, well-mixed 64-bit permutation
#[inline]
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Map an identity and seed to a uniform value in `[0, 1)`
#[inline]
pub fn unit_hash(id: u64, seed: u64) -> f64 {
    (splitmix64(id ^ splitmix64(seed)) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_hash_range_and_spread() {
        let n = 10_000;
        let below_half = (0..n).filter(|&id| unit_hash(id, 7) < 0.5).count();
        assert!((0..n).all(|id| (0.0..1.0).contains(&unit_hash(id, 7))));
        assert!((4_500..5_500).contains(&below_half));
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_eq!(unit_hash(42, 1), unit_hash(42, 1));
        assert_ne!(unit_hash(42, 1), unit_hash(42, 2));
    }
}
