//! # Ouroboros Query Cache (ouroboros-query-cache)
//!
//! A second-level result cache for SQL commands that knows which tables each cached
//! result was read from, and evicts results when those tables are written.
//!
//! ## Features
//!
//! - Table reference extraction from command text (bracketed, quoted and schema
//!   qualified names, aliases, CTEs, comments and string literals)
//! - Per-command cache policies carried in a comment directive
//! - Deterministic SHA-256 cache keys
//! - Tag-indexed concurrent store with striped locking
//! - Configuration from code, presets or the environment
//!
//! ## Policy Directives
//!
//! A command opts in to caching with a comment line:
//!
//! ```text
//! -- EFCachePolicy[Origin] --> Mode|Timeout|SaltKey|Dep1,Dep2|Cacheable
//! ```
//!
//! ```
//! use ouroboros_query_cache::policy::{parse_policy, strip_policy_directive, ExpirationMode};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let sql = "-- EFCachePolicy[Index.cs] --> Sliding|00:10:00\nSELECT * FROM [Posts]";
//!
//! let policy = parse_policy(sql)?.expect("directive present");
//! assert_eq!(policy.expiration_mode(), ExpirationMode::Sliding);
//! assert_eq!(policy.timeout(), Some(Duration::from_secs(600)));
//!
//! assert_eq!(strip_policy_directive(sql), "SELECT * FROM [Posts]");
//! # Ok(())
//! # }
//! ```
//!
//! ## Table Extraction
//!
//! ```
//! use ouroboros_query_cache::sql::extract_table_names;
//! use std::collections::BTreeSet;
//!
//! let known: BTreeSet<String> = ["Posts", "Users", "Tags"].iter().map(|s| s.to_string()).collect();
//! let tables = extract_table_names(
//!     "SELECT * FROM [dbo].[Posts] p INNER JOIN [Users] u ON u.[Id] = p.[UserId]",
//!     &known,
//! );
//! assert_eq!(tables.into_iter().collect::<Vec<_>>(), vec!["Posts", "Users"]);
//! ```
//!
//! See [`cache`] for the end-to-end flow.

pub mod cache;
pub mod error;
pub mod policy;
pub mod sql;

// Re-export main types for convenience
pub use cache::{
    build_key, CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CacheKeyBuilder, CacheLookup,
    CacheMetadata, CacheStats, CachedPayload, CommandContext, CommandParameter, DependencyStore,
    InvalidationEvent, InvalidationReason, ParameterDirection, ParameterValue, QueryCache,
};
pub use error::{CacheError, Result};
pub use policy::{parse_policy, strip_policy_directive, CachePolicy, ExpirationMode};
pub use sql::{extract_table_names, is_write_command, TableNameExtractor};
