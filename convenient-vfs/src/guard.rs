//! Striped locks around snapshot production.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Serializes work per key using a fixed number of lock stripes.
///
/// Two keys may share a stripe; a key never maps to two stripes, so work for
/// one key is never done twice at the same time.
pub struct StripedProducerGuard {
    stripes: Vec<Mutex<()>>,
}

impl StripedProducerGuard {
    /// Guard with `stripes` locks (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of stripes.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Run `producer` while holding the stripe for `key`.
    pub fn guard_by_key<K, T>(&self, key: &K, producer: impl FnOnce() -> T) -> T
    where
        K: Hash + ?Sized,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % self.stripes.len() as u64).unwrap_or(0);
        let _guard = self.stripes[stripe].lock();
        producer()
    }
}

impl Default for StripedProducerGuard {
    /// Four stripes per CPU.
    fn default() -> Self {
        Self::new(num_cpus::get() * 4)
    }
}
