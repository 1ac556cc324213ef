//! Query cache facade
//!
//! Ties the pieces together for a database command pipeline:
//! - before execution, `lookup` decides whether a command is cacheable, builds its key
//!   and answers from the store when it can;
//! - after execution, `store_result` saves the result under the key from the miss;
//! - after a write, `invalidate_for_command` evicts everything that read the written
//!   tables.

use crate::cache::{
    config::CacheConfig,
    invalidation::{InvalidationEvent, InvalidationReason},
    key::{build_key, CommandParameter},
    store::DependencyStore,
    types::{CacheKey, CacheStats, CachedPayload, DependencyTag},
};
use crate::error::Result;
use crate::policy::{parse_policy, CachePolicy};
use crate::sql::{classify, StatementKind, TableNameExtractor};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECENT_INVALIDATIONS: usize = 64;

/// A command as the database layer hands it over
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Full command text, including any policy directive
    pub command_text: String,

    /// Bound parameters in position order
    pub parameters: Vec<CommandParameter>,

    pub connection_identity: String,

    /// Identity of the context type that issued the command
    pub owner_context: String,

    /// Every table name the context knows about
    pub table_names: BTreeSet<String>,
}

impl CommandContext {
    pub fn new<I, S>(command_text: impl Into<String>, table_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command_text: command_text.into(),
            table_names: table_names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, parameter: CommandParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_connection(mut self, identity: impl Into<String>) -> Self {
        self.connection_identity = identity.into();
        self
    }

    pub fn with_owner_context(mut self, owner: impl Into<String>) -> Self {
        self.owner_context = owner.into();
        self
    }
}

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Answer from the cache; do not execute the command
    Hit { key: CacheKey, payload: CachedPayload },

    /// Execute the command, then hand the result to `store_result` with this key
    Miss { key: CacheKey, policy: CachePolicy },

    /// Not cacheable; execute normally
    Bypass,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss { .. })
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, CacheLookup::Bypass)
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    inserts: AtomicU64,
    skipped_inserts: AtomicU64,
    invalidations: AtomicU64,
    invalidated_entries: AtomicU64,
}

/// Dependency-aware result cache for SQL commands
pub struct QueryCache {
    config: CacheConfig,
    store: Arc<DependencyStore>,
    extractor: TableNameExtractor,
    stats: StatsCounters,
    recent: Mutex<VecDeque<InvalidationEvent>>,
}

impl QueryCache {
    /// Create a query cache with its own store
    pub fn new(config: CacheConfig) -> Result<Self> {
        let store = Arc::new(DependencyStore::with_config(&config));
        Self::with_store(config, store)
    }

    /// Create a query cache over an existing store
    pub fn with_store(config: CacheConfig, store: Arc<DependencyStore>) -> Result<Self> {
        config.validate()?;
        info!(
            "Query cache ready (prefix {:?}, cache-all {})",
            config.dependency_prefix,
            config.cache_all_queries.is_some()
        );
        Ok(Self {
            extractor: TableNameExtractor::new(config.case_sensitive_table_names),
            config,
            store,
            stats: StatsCounters::default(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_INVALIDATIONS)),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the underlying store
    pub fn store(&self) -> Arc<DependencyStore> {
        Arc::clone(&self.store)
    }

    /// Tags a result of `command_text` depends on: the policy's extra dependencies
    /// plus the tables the command reads, prefixed. Falls back to the unknowns tag
    /// when nothing is found.
    pub fn dependencies_for(
        &self,
        policy: &CachePolicy,
        table_names: &BTreeSet<String>,
        command_text: &str,
    ) -> BTreeSet<DependencyTag> {
        let tables = self.extractor.extract(command_text, table_names);

        let mut tags: BTreeSet<DependencyTag> = policy
            .extra_dependencies()
            .iter()
            .chain(tables.iter())
            .map(|name| self.config.dependency_tag(name))
            .collect();

        if tags.is_empty() {
            debug!("No dependencies found, using the unknowns tag");
            tags.insert(self.config.unknowns_tag());
        }
        tags
    }

    /// Decide the policy a command is cached under, if any
    pub fn resolve_policy(&self, command: &CommandContext) -> Result<Option<CachePolicy>> {
        let text = command.command_text.as_str();
        let kind = classify(text);
        if kind == StatementKind::Write {
            return Ok(None);
        }

        let tables = self.extractor.extract(text, &command.table_names);
        if let Some(table) = tables.iter().find(|t| self.config.is_non_cacheable_table(t)) {
            debug!("Command touches non-cacheable table {}", table);
            return Ok(None);
        }

        match parse_policy(text)? {
            Some(policy) if policy.is_cacheable() => Ok(Some(policy)),
            Some(_) => Ok(None),
            None if kind == StatementKind::Read => Ok(self.config.cache_all_queries.clone()),
            None => Ok(None),
        }
    }

    /// Look a command up before executing it
    pub fn lookup(&self, command: &CommandContext) -> Result<CacheLookup> {
        let Some(policy) = self.resolve_policy(command)? else {
            self.count(&self.stats.bypasses, 1);
            return Ok(CacheLookup::Bypass);
        };

        let dependencies =
            self.dependencies_for(&policy, &command.table_names, &command.command_text);
        let key = build_key(
            &command.command_text,
            &command.parameters,
            &command.connection_identity,
            &command.owner_context,
            &policy,
            dependencies,
            self.config.hash_prefix.as_deref(),
        );

        match self.store.get(&key) {
            Some(payload) => {
                self.count(&self.stats.hits, 1);
                Ok(CacheLookup::Hit { key, payload })
            }
            None => {
                self.count(&self.stats.misses, 1);
                Ok(CacheLookup::Miss { key, policy })
            }
        }
    }

    /// Save the result of a missed command. Returns false if the result was skipped.
    pub fn store_result(
        &self,
        key: &CacheKey,
        policy: &CachePolicy,
        payload: Option<CachedPayload>,
    ) -> bool {
        let empty = payload.as_ref().map_or(true, CachedPayload::is_empty_result);
        if self.config.skip_empty_results && empty {
            debug!("Skipping empty result for {}", key.hash);
            self.count(&self.stats.skipped_inserts, 1);
            return false;
        }

        self.store.insert(key, payload, policy);
        self.count(&self.stats.inserts, 1);
        true
    }

    /// Evict everything that depends on the tables a command may have changed.
    ///
    /// Writes evict their target table. Commands with an unrecognised verb (EXEC,
    /// DDL) may write anything, so they evict every candidate table, unless a
    /// cacheable directive marks them as a cached read. Reads and blank text
    /// invalidate nothing.
    pub fn invalidate_for_command(&self, command: &CommandContext) -> usize {
        let text = command.command_text.as_str();
        let kind = classify(text);
        if kind == StatementKind::Read || text.trim().is_empty() {
            return 0;
        }

        // A broken directive must not stop the write from invalidating
        let policy = match parse_policy(text) {
            Ok(policy) => policy,
            Err(e) => {
                warn!("Ignoring malformed cache policy on write command: {}", e);
                None
            }
        };
        if kind == StatementKind::Unknown && policy.as_ref().is_some_and(|p| p.is_cacheable()) {
            debug!("Command with unrecognised verb is cached as a read; not invalidating");
            return 0;
        }

        let tables = self.extractor.extract(text, &command.table_names);
        let extra = policy.map(|p| p.extra_dependencies().clone()).unwrap_or_default();

        let tags = self.tags_with_unknowns(tables.iter().chain(extra.iter()));
        let removed = self.store.invalidate(&CacheKey::for_dependencies(tags.iter()));

        let mut event = InvalidationEvent::new(InvalidationReason::TableWrite { tables }, tags, removed);
        if !command.owner_context.is_empty() {
            event = event.with_context(command.owner_context.clone());
        }
        self.record(event);
        removed
    }

    /// Evict everything that depends on any of `table_names`
    pub fn invalidate_tables<I, S>(&self, table_names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = self.tags_with_unknowns(table_names);
        let removed = self.store.invalidate(&CacheKey::for_dependencies(tags.iter()));

        self.record(InvalidationEvent::new(InvalidationReason::Manual, tags, removed));
        removed
    }

    /// Drop every cached result
    pub fn clear(&self) {
        let removed = self.store.len();
        self.store.clear_all();
        self.record(InvalidationEvent::new(InvalidationReason::Cleared, BTreeSet::new(), removed));
    }

    /// Reap expired entries now
    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired();
        if purged > 0 {
            self.record(InvalidationEvent::new(InvalidationReason::Expired, BTreeSet::new(), purged));
        }
        purged
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.stats.hits),
            misses: load(&self.stats.misses),
            bypasses: load(&self.stats.bypasses),
            inserts: load(&self.stats.inserts),
            skipped_inserts: load(&self.stats.skipped_inserts),
            entries: self.store.len(),
            invalidations: load(&self.stats.invalidations),
            invalidated_entries: load(&self.stats.invalidated_entries),
            evictions_ttl: self.store.expired_evictions(),
        }
    }

    /// Most recent invalidations, oldest first
    pub fn recent_invalidations(&self) -> Vec<InvalidationEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    fn tags_with_unknowns<I>(&self, names: I) -> BTreeSet<DependencyTag>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut tags: BTreeSet<DependencyTag> = names
            .into_iter()
            .map(|name| self.config.dependency_tag(name.as_ref()))
            .collect();
        tags.insert(self.config.unknowns_tag());
        tags
    }

    fn record(&self, event: InvalidationEvent) {
        info!("Invalidation ({}): {} entries removed", event.reason, event.removed);
        self.count(&self.stats.invalidations, 1);
        self.count(&self.stats.invalidated_entries, event.removed as u64);

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_INVALIDATIONS {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    fn count(&self, counter: &AtomicU64, n: u64) {
        if self.config.enable_metrics {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}
