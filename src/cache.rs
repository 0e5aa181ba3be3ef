use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    generation: u64,
    stored_at: Instant,
}

/// Explicit cache for values derived from season data (aggregates, team info).
/// An entry is served while it is younger than the TTL and belongs to the current
/// generation; `bump_generation` retires everything at once.
#[derive(Debug, Clone)]
pub struct DerivedCache<K, V> {
    ttl: Option<Duration>,
    generation: u64,
    entries: HashMap<K, CachedEntry<V>>,
}

impl<K, V> DerivedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            generation: 0,
            entries: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &CachedEntry<V>, now: Instant) -> bool {
        if entry.generation != self.generation {
            return false;
        }
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(entry.stored_at) < ttl,
            None => true,
        }
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| self.is_fresh(e, now))
            .map(|e| &e.value)
    }

    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            CachedEntry {
                value,
                generation: self.generation,
                stored_at: now,
            },
        );
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    /// A failed computation leaves the cache untouched.
    pub fn get_or_compute<E>(
        &mut self,
        key: K,
        now: Instant,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(v) = self.get(&key, now) {
            return Ok(v.clone());
        }
        let value = compute()?;
        self.insert(key, value.clone(), now);
        Ok(value)
    }

    pub fn invalidate(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_once_while_fresh() {
        let mut cache: DerivedCache<i32, String> = DerivedCache::new(None);
        let now = Instant::now();
        let mut calls = 0;
        for _ in 0..3 {
            let v = cache
                .get_or_compute(2024, now, || {
                    calls += 1;
                    Ok::<_, ()>("agg".to_string())
                })
                .unwrap();
            assert_eq!(v, "agg");
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn ttl_expiry_recomputes() {
        let mut cache: DerivedCache<i32, u32> = DerivedCache::new(Some(Duration::from_secs(60)));
        let t0 = Instant::now();
        cache.insert(1, 10, t0);
        assert_eq!(cache.get(&1, t0 + Duration::from_secs(30)), Some(&10));
        assert_eq!(cache.get(&1, t0 + Duration::from_secs(61)), None);
        let v = cache
            .get_or_compute(1, t0 + Duration::from_secs(61), || Ok::<_, ()>(11))
            .unwrap();
        assert_eq!(v, 11);
    }

    #[test]
    fn generation_bump_and_invalidate_drop_entries() {
        let mut cache: DerivedCache<&str, u32> = DerivedCache::new(None);
        let now = Instant::now();
        cache.insert("a", 1, now);
        cache.insert("b", 2, now);
        assert!(cache.invalidate(&"a"));
        assert!(!cache.invalidate(&"a"));
        cache.bump_generation();
        assert_eq!(cache.generation(), 1);
        assert!(cache.get(&"b", now).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let mut cache: DerivedCache<u8, u8> = DerivedCache::new(None);
        let now = Instant::now();
        assert!(cache.get_or_compute(1, now, || Err::<u8, _>("boom")).is_err());
        assert!(cache.is_empty());
    }
}
