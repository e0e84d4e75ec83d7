//! Time-bounded memo tables shared between request workers.
//!
//! Entries older than the TTL are misses on read, whether or not the
//! background sweep has removed them yet, so the read path and the sweep
//! agree on staleness regardless of sweep timing.
//!
//! Inserts also purge expired entries once the table has doubled since the
//! last purge, which keeps memory bounded when no sweeper runs.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{post_id::PostId, query::FilteredQuery};

/// Smallest table size that triggers a purge on insert.
const PURGE_FLOOR: usize = 64;

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    query: FilteredQuery,
}

/// A cache keyed by normalized query.
///
/// Writes are first-writer-wins: a live entry is never replaced, so a slow
/// computation racing a faster one cannot clobber the earlier result. Every
/// invalidation bumps a generation counter; [`put_if_generation`] refuses to
/// store values computed before the latest invalidation.
///
/// [`put_if_generation`]: TtlCache::put_if_generation
pub struct TtlCache<V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Entry<V>>>,
    generation: AtomicU64,
    /// Table size at which the next insert purges expired entries.
    purge_at: AtomicUsize,
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("len", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            purge_at: AtomicUsize::new(PURGE_FLOOR),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_live(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < self.ttl
    }

    /// Look up a live entry.
    pub fn get(&self, query: &FilteredQuery) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read();
        let entry = entries.get(&query.key())?;
        if self.is_live(entry, now) {
            trace!(cache = self.name, key = %query, "cache hit");
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// The current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert unless a live entry exists. Returns the value cached
    /// afterwards.
    pub fn put(&self, query: &FilteredQuery, value: V) -> V {
        let mut entries = self.entries.write();
        self.insert_locked(&mut entries, query, value)
    }

    /// Like [`put`](Self::put), but only if no invalidation happened since
    /// `generation` was read. Returns `None` when the value was discarded.
    pub fn put_if_generation(
        &self,
        query: &FilteredQuery,
        value: V,
        generation: u64,
    ) -> Option<V> {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(
                cache = self.name,
                key = %query,
                "discarding result computed before an invalidation"
            );
            return None;
        }
        Some(self.insert_locked(&mut entries, query, value))
    }

    fn insert_locked(
        &self,
        entries: &mut HashMap<String, Entry<V>>,
        query: &FilteredQuery,
        value: V,
    ) -> V {
        let now = self.clock.now();
        let key = query.key();
        match entries.get(&key) {
            Some(existing) if self.is_live(existing, now) => {
                return existing.value.clone();
            }
            Some(_) => {}
            None => self.purge_if_grown(entries, now),
        }
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                inserted_at: now,
                query: query.clone(),
            },
        );
        value
    }

    fn purge_if_grown(
        &self,
        entries: &mut HashMap<String, Entry<V>>,
        now: Instant,
    ) {
        if entries.len() < self.purge_at.load(Ordering::Relaxed) {
            return;
        }
        let before = entries.len();
        entries.retain(|_, entry| self.is_live(entry, now));
        let removed = before - entries.len();
        self.purge_at
            .store((entries.len() * 2).max(PURGE_FLOOR), Ordering::Relaxed);
        if removed > 0 {
            debug!(cache = self.name, removed, "purged expired entries on insert");
        }
    }

    /// Drop every entry whose result can change when posts carrying any of
    /// `tags` are added, edited or removed. Wildcard-based entries are always
    /// dropped.
    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|_, entry| {
            !entry.query.depends_on(tags.iter().map(String::as_str))
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(cache = self.name, removed, "invalidated cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something the background sweeper can evict from.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove expired entries, holding the write lock for at most
    /// `batch` removals at a time. Returns how many were removed.
    fn sweep_expired(&self, batch: usize) -> usize;
}

impl<V: Clone + Send + Sync> Sweep for TtlCache<V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sweep_expired(&self, batch: usize) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !self.is_live(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for chunk in expired.chunks(batch.max(1)) {
            let mut entries = self.entries.write();
            for key in chunk {
                // Re-check: the entry may have been replaced since the scan.
                if entries.get(key).is_some_and(|e| !self.is_live(e, now)) {
                    entries.remove(key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(cache = self.name, removed, "swept expired entries");
        }
        removed
    }
}

/// Query → matching post ids, newest first.
pub type SearchCache = TtlCache<Arc<[PostId]>>;
