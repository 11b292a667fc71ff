//! Bounded recent-change cache used to suppress redundant writes.
//!
//! Keyed by the event fingerprint (key ∥ kind ∥ value hash); an event seen
//! again within the window is dropped before fan-out. Two eviction rules
//! run on every insert: entries older than the window, and oldest-first
//! when the cache exceeds its capacity.
//!
//! The window must stay shorter than the incremental interval, otherwise a
//! real subsequent write of the same value would be suppressed; the
//! coordinator validates this at start.
//!
//! Lookup is O(1) amortized (hash map); eviction pops from the front of an
//! insertion-ordered queue and never holds the writer lock across I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Fingerprint type: 128-bit digest.
pub type Fingerprint = [u8; 16];

/// Default maximum number of remembered fingerprints.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default suppression window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct DedupStats {
    hits: u64,
    misses: u64,
    evicted: u64,
}

struct Inner {
    entries: HashMap<Fingerprint, Instant>,
    /// Insertion order; front = oldest. May contain stale fingerprints for
    /// entries that were refreshed; they are skipped on eviction.
    order: VecDeque<(Fingerprint, Instant)>,
    stats: DedupStats,
}

/// Bounded fingerprint → last-seen cache. Safe for concurrent readers and
/// occasional exclusive writers.
pub struct DedupCache {
    inner: RwLock<Inner>,
    capacity: usize,
    window: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::new(),
                stats: DedupStats::default(),
            }),
            capacity: capacity.max(1),
            window,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a fingerprint. Returns `true` if the event is fresh (should
    /// be dispatched), `false` if it is a duplicate within the window.
    pub fn check_and_insert(&self, fp: Fingerprint) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write().expect("dedup lock poisoned");

        self.evict(&mut inner, now);

        if let Some(&seen) = inner.entries.get(&fp) {
            if now.duration_since(seen) <= self.window {
                inner.stats.hits += 1;
                return false;
            }
        }

        inner.entries.insert(fp, now);
        inner.order.push_back((fp, now));
        inner.stats.misses += 1;
        true
    }

    /// Read-only membership probe (used by tests and the status surface).
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        let inner = self.inner.read().expect("dedup lock poisoned");
        match inner.entries.get(fp) {
            Some(&seen) => seen.elapsed() <= self.window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("dedup lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses, evicted) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.read().expect("dedup lock poisoned");
        (inner.stats.hits, inner.stats.misses, inner.stats.evicted)
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        // Age rule: drop everything older than the window.
        while let Some(&(fp, inserted)) = inner.order.front() {
            if now.duration_since(inserted) <= self.window {
                break;
            }
            inner.order.pop_front();
            // Only drop from the map if this queue slot is the live one.
            if inner.entries.get(&fp) == Some(&inserted) {
                inner.entries.remove(&fp);
                inner.stats.evicted += 1;
            }
        }

        // Size rule: oldest first until back under capacity.
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((fp, inserted)) => {
                    if inner.entries.get(&fp) == Some(&inserted) {
                        inner.entries.remove(&fp);
                        inner.stats.evicted += 1;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Fingerprint {
        let mut out = [0u8; 16];
        out[0] = n;
        out
    }

    #[test]
    fn test_first_sight_is_fresh() {
        let cache = DedupCache::with_defaults();
        assert!(cache.check_and_insert(fp(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let cache = DedupCache::new(100, Duration::from_secs(5));
        assert!(cache.check_and_insert(fp(1)));
        assert!(!cache.check_and_insert(fp(1)));
        assert!(!cache.check_and_insert(fp(1)));

        let (hits, misses, _) = cache.stats();
        assert_eq!(hits, 2);
        assert_eq!(misses, 1);
    }

    #[test]
    fn test_distinct_fingerprints_independent() {
        let cache = DedupCache::with_defaults();
        assert!(cache.check_and_insert(fp(1)));
        assert!(cache.check_and_insert(fp(2)));
        assert!(!cache.check_and_insert(fp(1)));
        assert!(!cache.check_and_insert(fp(2)));
    }

    #[test]
    fn test_expired_entry_is_fresh_again() {
        let cache = DedupCache::new(100, Duration::from_millis(30));
        assert!(cache.check_and_insert(fp(1)));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.check_and_insert(fp(1)));
    }

    #[test]
    fn test_age_eviction_bounds_len() {
        let cache = DedupCache::new(1000, Duration::from_millis(20));
        for n in 0..50 {
            cache.check_and_insert(fp(n));
        }
        std::thread::sleep(Duration::from_millis(50));
        // The next insert sweeps the expired entries.
        cache.check_and_insert(fp(200));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_size_eviction_oldest_first() {
        let cache = DedupCache::new(4, Duration::from_secs(60));
        for n in 0..4 {
            assert!(cache.check_and_insert(fp(n)));
        }
        // Capacity hit: inserting a fifth evicts the oldest.
        assert!(cache.check_and_insert(fp(100)));
        assert!(cache.len() <= 4);
        assert!(!cache.contains(&fp(0)));
        assert!(cache.contains(&fp(100)));
    }

    #[test]
    fn test_contains_read_only() {
        let cache = DedupCache::with_defaults();
        assert!(!cache.contains(&fp(9)));
        cache.check_and_insert(fp(9));
        assert!(cache.contains(&fp(9)));
        // contains() must not insert.
        assert!(!cache.contains(&fp(10)));
        assert!(cache.check_and_insert(fp(10)));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        use std::sync::Arc;

        let cache = Arc::new(DedupCache::new(1000, Duration::from_secs(5)));
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for n in 0..100u8 {
                    cache.check_and_insert([t, n, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
                    cache.contains(&[t, n, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
    }

    #[test]
    fn test_capacity_of_zero_clamped() {
        let cache = DedupCache::new(0, Duration::from_secs(5));
        assert!(cache.check_and_insert(fp(1)));
        assert!(cache.len() <= 1);
    }
}
