//! Cache entry management with policy-derived expiration

use crate::cache::types::{CachedPayload, DependencyTag};
use crate::policy::{CachePolicy, ExpirationMode};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

/// A stored result together with its expiration state and the tags it is indexed under
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached result
    pub payload: CachedPayload,

    /// Tags whose member sets contain this entry's hash
    pub dependencies: BTreeSet<DependencyTag>,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    /// Create an entry whose expiration follows `policy`. Absolute and sliding
    /// policies without a timeout use `default_ttl`.
    pub fn new(
        payload: CachedPayload,
        dependencies: BTreeSet<DependencyTag>,
        policy: &CachePolicy,
        default_ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let timeout = policy.effective_timeout(default_ttl);

        Self {
            payload,
            dependencies,
            metadata: CacheMetadata {
                created_at: now,
                accessed_at: now,
                expires_at: timeout.and_then(|t| deadline(now, t)),
                expiration_mode: policy.expiration_mode(),
                timeout,
                access_count: 0,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.metadata
            .expires_at
            .is_some_and(|expires_at| Utc::now() > expires_at)
    }

    /// Get time until expiration; `None` if expired or never expiring
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let expires_at = self.metadata.expires_at?;
        (expires_at - Utc::now()).to_std().ok()
    }

    /// Record a hit. Sliding entries restart their expiration window.
    pub fn mark_accessed(&mut self) {
        let now = Utc::now();
        self.metadata.accessed_at = now;
        self.metadata.access_count += 1;

        if self.metadata.expiration_mode == ExpirationMode::Sliding {
            if let Some(window) = self.metadata.timeout {
                self.metadata.expires_at = deadline(now, window);
            }
        }
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.metadata.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Check if entry has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.dependencies.contains(tag)
    }
}

/// `None` when the deadline is beyond what chrono can represent; such entries
/// never expire.
fn deadline(from: DateTime<Utc>, timeout: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// Last hit
    pub accessed_at: DateTime<Utc>,

    /// When the entry expires; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,

    pub expiration_mode: ExpirationMode,

    /// Absolute lifetime or sliding window
    pub timeout: Option<Duration>,

    /// Number of hits served from this entry
    pub access_count: u64,
}
