//! Dependency-indexed cache store
//!
//! Two maps: the primary map (key hash → entry) and the reverse index (tag → hashes).
//! Both are mutated only while holding the lock stripes of every tag and hash the
//! mutation touches, which keeps the following true between operations:
//!
//! - every hash in a tag's member set has a primary entry listing that tag;
//! - every primary entry's tags list the entry's hash as a member.
//!
//! `get` reads the primary map without stripes. Expiry is passive: an expired entry
//! is reported as a miss and reaped (under its stripes) on the spot.

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    guard::{LockStripes, StripeGuard},
    types::{CacheKey, CachedPayload, DependencyTag},
};
use crate::error::{CacheError, Result};
use crate::policy::CachePolicy;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Concurrent tag-indexed result store
pub struct DependencyStore {
    /// Main storage: key hash -> entry
    entries: DashMap<String, CacheEntry>,

    /// Reverse index: tag -> hashes tagged with it
    tag_index: DashMap<DependencyTag, HashSet<String>>,

    stripes: LockStripes,

    /// TTL for Absolute/Sliding policies that carry no timeout
    default_ttl: Duration,

    expired_evictions: AtomicU64,
}

impl Default for DependencyStore {
    fn default() -> Self {
        Self::with_config(&CacheConfig::default())
    }
}

impl DependencyStore {
    /// Create a store with the given stripe count and default TTL
    pub fn new(lock_stripes: usize, default_ttl: Duration) -> Self {
        debug!("Initializing dependency store with {} lock stripes", lock_stripes);
        Self {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            stripes: LockStripes::new(lock_stripes),
            default_ttl,
            expired_evictions: AtomicU64::new(0),
        }
    }

    /// Create a store sized and timed from a cache configuration
    pub fn with_config(config: &CacheConfig) -> Self {
        Self::new(config.lock_stripes, config.default_ttl)
    }

    /// Store `payload` under `key.hash` and index it under every tag in
    /// `key.dependencies`. `None` stores an explicit null result. Re-inserting a
    /// hash replaces both the entry and its tag membership.
    pub fn insert(&self, key: &CacheKey, payload: Option<CachedPayload>, policy: &CachePolicy) {
        let payload = payload.unwrap_or(CachedPayload::Null);
        let hash = key.hash.as_str();

        let mut needed = self.tag_stripes(&key.dependencies);
        needed.insert(self.stripes.key_stripe(hash));

        let _guard = self.lock_covering(needed, || {
            // Tags of the entry being replaced must be unlinked too
            let previous = self.entry_dependencies(hash).unwrap_or_default();
            self.tag_stripes(&previous)
        });

        if let Some(previous) = self.entry_dependencies(hash) {
            for tag in previous.difference(&key.dependencies) {
                self.unlink(tag, hash);
            }
        }

        let entry = CacheEntry::new(payload, key.dependencies.clone(), policy, self.default_ttl);
        self.entries.insert(hash.to_string(), entry);

        for tag in &key.dependencies {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(hash.to_string());
        }

        debug!("Inserted cache entry {} under {} tag(s)", hash, key.dependencies.len());
    }

    /// Look up by `key.hash` alone. Expired entries are misses.
    pub fn get(&self, key: &CacheKey) -> Option<CachedPayload> {
        {
            let Some(mut entry) = self.entries.get_mut(&key.hash) else {
                debug!("Cache miss: {}", key.hash);
                return None;
            };
            if !entry.is_expired() {
                entry.mark_accessed();
                debug!("Cache hit: {}", key.hash);
                return Some(entry.payload.clone());
            }
        }

        // Shard guard released above; taking stripes under it could deadlock
        debug!("Cache entry expired: {}", key.hash);
        self.remove_if_expired(&key.hash);
        None
    }

    /// True if a live entry exists for `key.hash` (does not count as a hit)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(&key.hash)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Evict every entry tagged with any of `key.dependencies` and clear those tags.
    /// An entry under several of the tags is removed once. Returns the number of
    /// entries removed; invalidating empty or unknown tags is a no-op.
    pub fn invalidate(&self, key: &CacheKey) -> usize {
        let tags = &key.dependencies;
        if tags.is_empty() {
            return 0;
        }

        let _guard = self.lock_covering(self.tag_stripes(tags), || {
            let mut required = BTreeSet::new();
            for hash in self.members_of(tags) {
                required.insert(self.stripes.key_stripe(&hash));
                if let Some(deps) = self.entry_dependencies(&hash) {
                    required.extend(self.tag_stripes(&deps));
                }
            }
            required
        });

        let mut removed = 0;
        for hash in self.members_of(tags) {
            if let Some((_, entry)) = self.entries.remove(&hash) {
                removed += 1;
                for tag in entry.dependencies.difference(tags) {
                    self.unlink(tag, &hash);
                }
            }
        }

        for tag in tags {
            self.tag_index.remove(tag);
        }

        info!("Invalidated {} entries for {} tag(s)", removed, tags.len());
        removed
    }

    /// Drop every entry and every tag index
    pub fn clear_all(&self) {
        let _guard = self.stripes.lock_all();
        let count = self.entries.len();
        self.entries.clear();
        self.tag_index.clear();
        info!("Cleared {} entries from cache", count);
    }

    /// Reap every expired entry. Caller-driven; the store runs no background task.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let purged = expired
            .iter()
            .filter(|hash| self.remove_if_expired(hash))
            .count();

        if purged > 0 {
            debug!("Purged {} expired entries", purged);
        }
        purged
    }

    /// Number of entries, including expired ones not yet reaped
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hashes currently indexed under `tag`
    pub fn tag_members(&self, tag: &str) -> BTreeSet<String> {
        self.tag_index
            .get(tag)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every tag with at least one member
    pub fn tags(&self) -> BTreeSet<DependencyTag> {
        self.tag_index.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of expired entries reaped so far
    pub fn expired_evictions(&self) -> u64 {
        self.expired_evictions.load(Ordering::Relaxed)
    }

    /// Verify that the primary map and the reverse index agree
    pub fn check_consistency(&self) -> Result<()> {
        let _guard = self.stripes.lock_all();

        let index: Vec<(String, Vec<String>)> = self
            .tag_index
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect();

        for (tag, members) in &index {
            if members.is_empty() {
                return Err(CacheError::InconsistentIndex(format!("tag {} has an empty member set", tag)));
            }
            for hash in members {
                match self.entries.get(hash) {
                    None => {
                        return Err(CacheError::InconsistentIndex(format!(
                            "tag {} references missing entry {}",
                            tag, hash
                        )))
                    }
                    Some(entry) if !entry.has_tag(tag) => {
                        return Err(CacheError::InconsistentIndex(format!(
                            "entry {} is indexed under {} but does not depend on it",
                            hash, tag
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        for entry in self.entries.iter() {
            for tag in &entry.value().dependencies {
                let indexed = self
                    .tag_index
                    .get(tag)
                    .is_some_and(|members| members.contains(entry.key()));
                if !indexed {
                    return Err(CacheError::InconsistentIndex(format!(
                        "entry {} depends on {} but is not indexed under it",
                        entry.key(),
                        tag
                    )));
                }
            }
        }

        Ok(())
    }

    /// Remove `hash` if it is still expired once its stripes are held
    fn remove_if_expired(&self, hash: &str) -> bool {
        let mut needed = BTreeSet::new();
        needed.insert(self.stripes.key_stripe(hash));

        let _guard = self.lock_covering(needed, || {
            let deps = self.entry_dependencies(hash).unwrap_or_default();
            self.tag_stripes(&deps)
        });

        let removed = self
            .entries
            .remove_if(hash, |_, entry| entry.is_expired());

        match removed {
            Some((_, entry)) => {
                for tag in &entry.dependencies {
                    self.unlink(tag, hash);
                }
                self.expired_evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Lock `needed`, then ask `discover` which stripes the operation turns out to
    /// need given the now-stable state. Re-lock the union until it covers them.
    /// Stripes only ever get added, so this terminates within the stripe count.
    ///
    /// Lock order is stripes first, then DashMap shards. No caller may hold a shard
    /// guard (`entries.get`, `get_mut`, `tag_index.get`) when it gets here; `get`
    /// drops its guard before `remove_if_expired` for that reason.
    fn lock_covering<F>(&self, mut needed: BTreeSet<usize>, discover: F) -> StripeGuard<'_>
    where
        F: Fn() -> BTreeSet<usize>,
    {
        loop {
            let guard = self.stripes.lock(&needed);
            let required = discover();
            if guard.covers(&required) {
                return guard;
            }
            drop(guard);
            needed.extend(required);
        }
    }

    fn tag_stripes(&self, tags: &BTreeSet<DependencyTag>) -> BTreeSet<usize> {
        tags.iter().map(|tag| self.stripes.tag_stripe(tag)).collect()
    }

    fn entry_dependencies(&self, hash: &str) -> Option<BTreeSet<DependencyTag>> {
        self.entries.get(hash).map(|entry| entry.dependencies.clone())
    }

    /// Union of the member sets of `tags`, deduplicated
    fn members_of(&self, tags: &BTreeSet<DependencyTag>) -> HashSet<String> {
        let mut members = HashSet::new();
        for tag in tags {
            if let Some(set) = self.tag_index.get(tag) {
                members.extend(set.iter().cloned());
            }
        }
        members
    }

    /// Remove `hash` from `tag`'s member set, dropping the set once empty.
    /// Caller holds `tag`'s stripe.
    fn unlink(&self, tag: &str, hash: &str) {
        let now_empty = match self.tag_index.get_mut(tag) {
            Some(mut members) => {
                members.remove(hash);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.tag_index.remove_if(tag, |_, members| members.is_empty());
        }
    }
}

impl std::fmt::Debug for DependencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyStore")
            .field("entries", &self.entries.len())
            .field("tags", &self.tag_index.len())
            .field("stripes", &self.stripes)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}
