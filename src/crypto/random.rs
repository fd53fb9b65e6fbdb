//! Pseudorandom

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Process-wide CSPRNG handle.
///
/// Shared behind `Arc`; the lock is only held for the duration of a fill.
pub struct SecureRandom {
    inner: Mutex<StdRng>,
}

impl SecureRandom {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fill a caller-provided buffer with random bytes.
    pub fn fill(&self, buf: &mut [u8]) {
        self.inner.lock().fill_bytes(buf);
    }

    /// Fixed-size random array (nonce, connection id seed).
    pub fn array<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        self.fill(&mut out);
        out
    }

    pub fn u64(&self) -> u64 {
        self.inner.lock().gen()
    }

    /// Random number in `[0, max)`; 0 when `max == 0`.
    pub fn range(&self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        self.inner.lock().gen_range(0..max)
    }

    /// Choose a random element from a slice.
    pub fn choose<'a, T>(&self, slice: &'a [T]) -> Option<&'a T> {
        if slice.is_empty() {
            None
        } else {
            Some(&slice[self.range(slice.len())])
        }
    }
}

impl Default for SecureRandom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_arrays_unique() {
        let rng = SecureRandom::new();
        let a: [u8; 32] = rng.array();
        let b: [u8; 32] = rng.array();
        assert_ne!(a, b);
    }

    #[test]
    fn test_range_bounds() {
        let rng = SecureRandom::new();
        for _ in 0..1000 {
            assert!(rng.range(10) < 10);
        }
        assert_eq!(rng.range(1), 0);
        assert_eq!(rng.range(0), 0);
    }

    #[test]
    fn test_choose_covers_all() {
        let rng = SecureRandom::new();
        let items = [1, 2, 3, 4, 5];

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            seen.insert(*rng.choose(&items).unwrap());
        }
        assert_eq!(seen.len(), items.len());

        let empty: [i32; 0] = [];
        assert!(rng.choose(&empty).is_none());
    }
}
