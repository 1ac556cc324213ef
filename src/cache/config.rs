//! Configuration for the query cache

use crate::error::{CacheError, Result};
use crate::policy::CachePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration for the query cache
///
/// Everything here is fixed when the cache is constructed. Changing the dependency
/// prefix or table-name case sensitivity on a live cache would orphan existing tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prepended to every table name to form its dependency tag
    pub dependency_prefix: String,

    /// Prepended to every key hash, to share one store between several caches
    pub hash_prefix: Option<String>,

    /// Match table names case-sensitively
    pub case_sensitive_table_names: bool,

    /// Lifetime for Absolute/Sliding policies that carry no timeout
    pub default_ttl: Duration,

    /// Number of lock stripes guarding the store (rounded up to a power of two)
    pub lock_stripes: usize,

    /// Policy applied to read commands that carry no directive; `None` caches only
    /// commands that opt in
    pub cache_all_queries: Option<CachePolicy>,

    /// Commands touching any of these tables are never cached
    pub non_cacheable_tables: BTreeSet<String>,

    /// Do not store results without rows
    pub skip_empty_results: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dependency_prefix: "EF_".to_string(),
            hash_prefix: None,
            case_sensitive_table_names: false,
            // 30 minutes
            default_ttl: Duration::from_secs(1800),
            lock_stripes: 64,
            cache_all_queries: None,
            non_cacheable_tables: BTreeSet::new(),
            skip_empty_results: false,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load a `.env` file if one exists, then read `QUERY_CACHE_*` variables over the
    /// defaults. Unset variables keep their default.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            dependency_prefix: env::var("QUERY_CACHE_DEPENDENCY_PREFIX")
                .unwrap_or(defaults.dependency_prefix),
            hash_prefix: env::var("QUERY_CACHE_HASH_PREFIX")
                .ok()
                .filter(|p| !p.is_empty())
                .or(defaults.hash_prefix),
            case_sensitive_table_names: env_parse("QUERY_CACHE_CASE_SENSITIVE")?
                .unwrap_or(defaults.case_sensitive_table_names),
            default_ttl: env_parse::<u64>("QUERY_CACHE_DEFAULT_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            lock_stripes: env_parse("QUERY_CACHE_LOCK_STRIPES")?.unwrap_or(defaults.lock_stripes),
            skip_empty_results: env_parse("QUERY_CACHE_SKIP_EMPTY_RESULTS")?
                .unwrap_or(defaults.skip_empty_results),
            ..defaults
        };

        config.validate()?;
        debug!("Loaded cache configuration from environment: {:?}", config);
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lock_stripes == 0 {
            return Err(CacheError::ConfigError("lock_stripes must be greater than 0".to_string()));
        }

        if !self.lock_stripes.is_power_of_two() {
            return Err(CacheError::ConfigError(format!(
                "lock_stripes must be a power of two, got {}",
                self.lock_stripes
            )));
        }

        if self.default_ttl.is_zero() {
            return Err(CacheError::ConfigError("default_ttl must be greater than 0".to_string()));
        }

        if self.dependency_prefix.chars().any(char::is_whitespace) {
            return Err(CacheError::ConfigError(
                "dependency_prefix must not contain whitespace".to_string(),
            ));
        }

        if let Some(policy) = &self.cache_all_queries {
            if !policy.is_cacheable() {
                return Err(CacheError::ConfigError(
                    "cache_all_queries policy must be cacheable".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Dependency tag for a table name
    pub fn dependency_tag(&self, table_name: &str) -> String {
        format!("{}{}", self.dependency_prefix, table_name)
    }

    /// Tag carried by results whose tables could not be determined
    pub fn unknowns_tag(&self) -> String {
        self.dependency_tag("UnknownsCacheDependency")
    }

    /// True if `table_name` is configured as never cacheable
    pub fn is_non_cacheable_table(&self, table_name: &str) -> bool {
        if self.case_sensitive_table_names {
            self.non_cacheable_tables.contains(table_name)
        } else {
            self.non_cacheable_tables
                .iter()
                .any(|t| t.eq_ignore_ascii_case(table_name))
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    dependency_prefix: Option<String>,
    hash_prefix: Option<String>,
    case_sensitive_table_names: Option<bool>,
    default_ttl: Option<Duration>,
    lock_stripes: Option<usize>,
    cache_all_queries: Option<CachePolicy>,
    non_cacheable_tables: BTreeSet<String>,
    skip_empty_results: Option<bool>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the dependency tag prefix
    pub fn dependency_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dependency_prefix = Some(prefix.into());
        self
    }

    /// Set the key hash prefix
    pub fn hash_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hash_prefix = Some(prefix.into());
        self
    }

    pub fn case_sensitive_table_names(mut self, enable: bool) -> Self {
        self.case_sensitive_table_names = Some(enable);
        self
    }

    /// Set the TTL used by policies without a timeout
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = Some(stripes);
        self
    }

    /// Cache every read command without a directive under `policy`
    pub fn cache_all_queries(mut self, policy: CachePolicy) -> Self {
        self.cache_all_queries = Some(policy);
        self
    }

    /// Never cache commands that touch `table_name`
    pub fn non_cacheable_table(mut self, table_name: impl Into<String>) -> Self {
        self.non_cacheable_tables.insert(table_name.into());
        self
    }

    pub fn skip_empty_results(mut self, enable: bool) -> Self {
        self.skip_empty_results = Some(enable);
        self
    }

    /// Enable or disable metrics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            dependency_prefix: self.dependency_prefix.unwrap_or(defaults.dependency_prefix),
            hash_prefix: self.hash_prefix.or(defaults.hash_prefix),
            case_sensitive_table_names: self
                .case_sensitive_table_names
                .unwrap_or(defaults.case_sensitive_table_names),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            lock_stripes: self.lock_stripes.unwrap_or(defaults.lock_stripes),
            cache_all_queries: self.cache_all_queries.or(defaults.cache_all_queries),
            non_cacheable_tables: self.non_cacheable_tables,
            skip_empty_results: self.skip_empty_results.unwrap_or(defaults.skip_empty_results),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Cache every read for a short absolute window
    pub fn read_heavy() -> Self {
        Self {
            cache_all_queries: Some(CachePolicy::absolute(Duration::from_secs(300))),
            skip_empty_results: true,
            ..Default::default()
        }
    }

    /// Cache only commands that opt in with a directive
    pub fn opt_in() -> Self {
        Self::default()
    }

    /// Few stripes and a short default lifetime, for tests and small tools
    pub fn small() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            lock_stripes: 8,
            ..Default::default()
        }
    }

    /// Many stripes for highly concurrent hosts
    pub fn high_concurrency() -> Self {
        Self {
            lock_stripes: 1024,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.dependency_prefix, "EF_");
        assert_eq!(config.default_ttl, Duration::from_secs(1800));
        assert_eq!(config.lock_stripes, 64);
        assert!(config.hash_prefix.is_none());
        assert!(config.cache_all_queries.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = CacheConfig::default();
        invalid.lock_stripes = 0;
        assert!(matches!(invalid.validate(), Err(CacheError::ConfigError(_))));

        let mut invalid = CacheConfig::default();
        invalid.lock_stripes = 12;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.default_ttl = Duration::ZERO;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.cache_all_queries = Some(CachePolicy::never_remove().with_cacheable(false));
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .dependency_prefix("APP_")
            .hash_prefix("tenant1:")
            .default_ttl(Duration::from_secs(600))
            .lock_stripes(16)
            .non_cacheable_table("AuditLog")
            .skip_empty_results(true)
            .build();

        assert_eq!(config.dependency_prefix, "APP_");
        assert_eq!(config.hash_prefix.as_deref(), Some("tenant1:"));
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.lock_stripes, 16);
        assert!(config.skip_empty_results);
        assert!(config.is_non_cacheable_table("auditlog"));
    }

    #[test]
    fn test_tags() {
        let config = CacheConfig::default();
        assert_eq!(config.dependency_tag("Posts"), "EF_Posts");
        assert_eq!(config.unknowns_tag(), "EF_UnknownsCacheDependency");
    }

    #[test]
    fn test_case_sensitive_non_cacheable_tables() {
        let config = CacheConfig::builder()
            .case_sensitive_table_names(true)
            .non_cacheable_table("AuditLog")
            .build();
        assert!(config.is_non_cacheable_table("AuditLog"));
        assert!(!config.is_non_cacheable_table("auditlog"));
    }

    #[test]
    fn test_preset_configs() {
        assert!(CacheConfig::read_heavy().cache_all_queries.is_some());
        assert!(CacheConfig::opt_in().cache_all_queries.is_none());
        assert_eq!(CacheConfig::small().lock_stripes, 8);
        assert_eq!(CacheConfig::high_concurrency().lock_stripes, 1024);

        for preset in [
            CacheConfig::read_heavy(),
            CacheConfig::opt_in(),
            CacheConfig::small(),
            CacheConfig::high_concurrency(),
        ] {
            assert!(preset.validate().is_ok());
        }
    }

    #[test]
    fn test_from_env() {
        env::set_var("QUERY_CACHE_DEPENDENCY_PREFIX", "ENV_");
        env::set_var("QUERY_CACHE_DEFAULT_TTL_SECS", "90");
        env::set_var("QUERY_CACHE_LOCK_STRIPES", "32");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.dependency_prefix, "ENV_");
        assert_eq!(config.default_ttl, Duration::from_secs(90));
        assert_eq!(config.lock_stripes, 32);

        env::set_var("QUERY_CACHE_LOCK_STRIPES", "many");
        assert!(matches!(CacheConfig::from_env(), Err(CacheError::ConfigError(_))));

        env::remove_var("QUERY_CACHE_DEPENDENCY_PREFIX");
        env::remove_var("QUERY_CACHE_DEFAULT_TTL_SECS");
        env::remove_var("QUERY_CACHE_LOCK_STRIPES");
    }
}
