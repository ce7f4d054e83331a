//! In-memory read cache of silences.
//!
//! The cache serves the alert hot path. It never talks to storage itself;
//! the manager writes through to the store first and then updates the
//! cache, so every method here is synchronous and holds its lock briefly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::Silence;

#[derive(Debug, Default)]
struct CacheState {
    silences: HashMap<String, Arc<Silence>>,
    /// IDs deleted since the last full load.
    tombstones: HashSet<String>,
}

/// Silences by ID, shared between the manager and its worker.
#[derive(Debug, Default)]
pub struct SilenceCache {
    state: RwLock<CacheState>,
}

impl SilenceCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with `silences` and forgets every tombstone.
    ///
    /// The new map is built before the write lock is taken.
    pub fn replace_all(&self, silences: Vec<Silence>) {
        let fresh: HashMap<String, Arc<Silence>> = silences
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(s)))
            .collect();
        let mut state = self.state.write();
        state.silences = fresh;
        state.tombstones.clear();
    }

    /// Inserts or replaces `silence` unless it is older than the cached
    /// copy or its ID was deleted. Returns true if the cache changed.
    pub fn upsert(&self, silence: Silence) -> bool {
        let mut state = self.state.write();
        Self::upsert_locked(&mut state, silence)
    }

    /// Inserts a freshly created silence, clearing any tombstone for its ID.
    pub fn insert_created(&self, silence: Silence) -> bool {
        let mut state = self.state.write();
        state.tombstones.remove(&silence.id);
        Self::upsert_locked(&mut state, silence)
    }

    fn upsert_locked(state: &mut CacheState, silence: Silence) -> bool {
        if state.tombstones.contains(&silence.id) {
            return false;
        }
        if let Some(existing) = state.silences.get(&silence.id) {
            if existing.updated_at > silence.updated_at {
                return false;
            }
        }
        state.silences.insert(silence.id.clone(), Arc::new(silence));
        true
    }

    /// Removes `id` and tombstones it until the next [`replace_all`].
    ///
    /// [`replace_all`]: Self::replace_all
    pub fn remove(&self, id: &str) -> Option<Arc<Silence>> {
        let mut state = self.state.write();
        state.tombstones.insert(id.to_string());
        state.silences.remove(id)
    }

    /// Looks up a silence by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Silence>> {
        self.state.read().silences.get(id).cloned()
    }

    /// Returns true if `id` was deleted since the last full load.
    #[must_use]
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.state.read().tombstones.contains(id)
    }

    /// Snapshot of the silences active at `now`.
    ///
    /// Only `Arc`s are cloned, so the read lock is held for one pass.
    #[must_use]
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<Arc<Silence>> {
        self.state
            .read()
            .silences
            .values()
            .filter(|s| s.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Snapshot of every cached silence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Silence>> {
        self.state.read().silences.values().cloned().collect()
    }

    /// Number of cached silences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().silences.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().silences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Matcher, SilenceStatus};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn silence(id: &str, updated_at: DateTime<Utc>) -> Silence {
        Silence {
            id: id.to_string(),
            created_by: "alice".to_string(),
            comment: "maintenance".to_string(),
            starts_at: t0() - Duration::hours(1),
            ends_at: t0() + Duration::hours(1),
            matchers: vec![Matcher::equal("alertname", "HighCPU")],
            status: SilenceStatus::Active,
            created_at: t0(),
            updated_at,
        }
    }

    #[test]
    fn upsert_and_get() {
        let cache = SilenceCache::new();
        assert!(cache.upsert(silence("a", t0())));
        assert_eq!(cache.get("a").unwrap().id, "a");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn older_version_does_not_replace_newer() {
        let cache = SilenceCache::new();
        let mut newer = silence("a", t0() + Duration::seconds(5));
        newer.comment = "newer".to_string();
        cache.upsert(newer);

        let applied = cache.upsert(silence("a", t0()));

        assert!(!applied);
        assert_eq!(cache.get("a").unwrap().comment, "newer");
    }

    #[test]
    fn tombstone_blocks_stale_reinsert() {
        let cache = SilenceCache::new();
        cache.upsert(silence("a", t0()));

        cache.remove("a");
        let applied = cache.upsert(silence("a", t0()));

        assert!(!applied);
        assert!(cache.get("a").is_none());
        assert!(cache.is_tombstoned("a"));
    }

    #[test]
    fn create_clears_tombstone() {
        let cache = SilenceCache::new();
        cache.upsert(silence("a", t0()));
        cache.remove("a");

        assert!(cache.insert_created(silence("a", t0() + Duration::seconds(1))));
        assert!(cache.get("a").is_some());
        assert!(!cache.is_tombstoned("a"));
    }

    #[test]
    fn replace_all_swaps_and_clears_tombstones() {
        let cache = SilenceCache::new();
        cache.upsert(silence("a", t0()));
        cache.remove("a");
        cache.upsert(silence("b", t0()));

        cache.replace_all(vec![silence("a", t0()), silence("c", t0())]);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(!cache.is_tombstoned("a"));
    }

    #[test]
    fn active_at_filters_by_window() {
        let cache = SilenceCache::new();
        cache.upsert(silence("live", t0()));
        let mut ended = silence("ended", t0());
        ended.starts_at = t0() - Duration::hours(3);
        ended.ends_at = t0() - Duration::hours(2);
        cache.upsert(ended);

        let active = cache.active_at(t0());

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "live");
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn remove_missing_still_tombstones() {
        let cache = SilenceCache::new();
        assert!(cache.remove("ghost").is_none());
        assert!(cache.is_tombstoned("ghost"));
        assert!(cache.is_empty());
    }
}
