//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Opaque invalidation root, conventionally `<prefix><TableName>`
pub type DependencyTag = String;

/// Identity under which a result is stored
///
/// Equality and hashing use `(hash, owner_context)` only. `dependencies` is metadata
/// the store reads at insert time to populate its tag index; two keys that differ
/// only in their dependencies are the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    /// Deterministic content hash, optionally prefixed
    pub hash: String,

    /// Type/identity token of the context that issued the command
    pub owner_context: String,

    /// Tags whose invalidation must evict this entry
    pub dependencies: BTreeSet<DependencyTag>,
}

impl CacheKey {
    pub fn new<I, S>(hash: impl Into<String>, owner_context: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hash: hash.into(),
            owner_context: owner_context.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    /// A key carrying only tags, for invalidation calls that have no stored hash
    pub fn for_dependencies<I, S>(dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(String::new(), String::new(), dependencies)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.owner_context == other.owner_context
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.owner_context.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hash, self.owner_context)
    }
}

/// A cached command result
///
/// A miss is `Option::None` at the API surface. `Null` is a stored result that is
/// known to be empty, which is a hit.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    /// The command produced no value
    Null,

    /// Single value from a scalar query
    Scalar(serde_json::Value),

    /// Affected/returned row count
    RowCount(i64),

    /// Serialized tabular result; encoding belongs to the caller
    Rows(Arc<[u8]>),
}

impl CachedPayload {
    pub fn rows(bytes: impl Into<Vec<u8>>) -> Self {
        CachedPayload::Rows(Arc::from(bytes.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CachedPayload::Null)
    }

    /// True for results that carry no data rows
    pub fn is_empty_result(&self) -> bool {
        match self {
            CachedPayload::Null => true,
            CachedPayload::Scalar(value) => value.is_null(),
            CachedPayload::RowCount(count) => *count == 0,
            CachedPayload::Rows(bytes) => bytes.is_empty(),
        }
    }
}

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,

    /// Lookups that had to execute the command
    pub misses: u64,

    /// Commands that were not eligible for caching
    pub bypasses: u64,

    /// Results written to the store
    pub inserts: u64,

    /// Results not written because of `skip_empty_results`
    pub skipped_inserts: u64,

    /// Number of entries currently in cache
    pub entries: usize,

    /// Number of invalidation calls
    pub invalidations: u64,

    /// Entries removed by invalidation calls
    pub invalidated_entries: u64,

    /// Entries reaped after their expiration passed
    pub evictions_ttl: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, invalidated: {}, expired: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.invalidated_entries,
            self.evictions_ttl
        )
    }
}
