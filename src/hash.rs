use std::hash::{Hash, Hasher};

use siphasher::sip128::{Hasher128, SipHasher13};

/// Produce a 128-bit hash of a value.
#[inline]
pub fn hash<T: Hash>(value: &T) -> u128 {
    let mut state = SipHasher13::new();
    value.hash(&mut state);
    state.finish128().as_u128()
}

/// Produce a 128-bit hash of a byte slice.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u128 {
    let mut state = SipHasher13::new();
    state.write(bytes);
    state.finish128().as_u128()
}

/// Render a hash as a fixed-width lowercase hex digest, suitable for file
/// and directory names.
pub fn hex_digest(hash: u128) -> String {
    format!("{hash:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_fixed_width() {
        let a = hex_digest(hash(&"compute.py:step"));
        let b = hex_digest(hash(&"compute.py:step"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, hex_digest(hash(&"compute.py:other")));
    }
}
