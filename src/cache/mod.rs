//! # Dependency-Aware Result Cache
//!
//! Caches the results of read commands and evicts them when a write touches any table
//! they were read from.
//!
//! ## Features
//!
//! - **Table Dependencies**: every cached result is tagged with the tables it read
//! - **Write Invalidation**: a write evicts every result tagged with its target table
//! - **Per-Command Policies**: absolute, sliding or never-expiring lifetimes chosen by a
//!   comment directive in the command text
//! - **Deterministic Keys**: SHA-256 over connection, text, parameters and salt
//! - **Striped Locking**: concurrent inserts and invalidations over unrelated tables
//!   never contend
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query_cache::cache::{CacheConfig, CacheLookup, CachedPayload, CommandContext, QueryCache};
//!
//! # fn example() -> anyhow::Result<()> {
//! let cache = QueryCache::new(CacheConfig::default())?;
//! let tables = ["Posts", "Users"];
//!
//! let read = CommandContext::new(
//!     "-- EFCachePolicy[Index.cs] --> Absolute|00:05:00\nSELECT * FROM [Posts]",
//!     tables,
//! );
//!
//! if let CacheLookup::Miss { key, policy } = cache.lookup(&read)? {
//!     // execute the command, then
//!     cache.store_result(&key, &policy, Some(CachedPayload::RowCount(3)));
//! }
//! assert!(cache.lookup(&read)?.is_hit());
//!
//! let write = CommandContext::new("DELETE FROM [Posts] WHERE [Id] = 1", tables);
//! cache.invalidate_for_command(&write);
//! assert!(cache.lookup(&read)?.is_miss());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod guard;
pub mod integration;
pub mod invalidation;
pub mod key;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, CacheMetadata};
pub use guard::{LockStripes, StripeGuard};
pub use integration::{CacheLookup, CommandContext, QueryCache};
pub use invalidation::{InvalidationEvent, InvalidationReason};
pub use key::{build_key, CacheKeyBuilder, CommandParameter, ParameterDirection, ParameterValue};
pub use store::DependencyStore;
pub use types::{CacheKey, CacheStats, CachedPayload, DependencyTag};
