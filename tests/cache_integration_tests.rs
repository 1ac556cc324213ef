//! Integration tests for the query cache
//!
//! These tests drive the cache the way a command pipeline would:
//! - Lookup, execute, store, hit
//! - Invalidation by write commands
//! - Policy lifetimes (absolute, sliding, never remove)
//! - Key derivation from parameters and connections
//! - Configuration

use ouroboros_query_cache::cache::{
    CacheConfig, CacheKey, CacheLookup, CachedPayload, CommandContext, CommandParameter,
    DependencyStore, InvalidationReason, QueryCache,
};
use ouroboros_query_cache::policy::CachePolicy;
use std::collections::BTreeSet;
use std::time::Duration;

const TABLES: [&str; 4] = ["Posts", "Users", "Tags", "Products"];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn read(policy: &str, sql: &str) -> CommandContext {
    CommandContext::new(format!("-- EFCachePolicy[tests.rs] --> {}\n{}", policy, sql), TABLES)
        .with_connection("Server=.;Database=Blog")
        .with_owner_context("BloggingContext")
}

/// Miss, then store `payload`, returning the key it was stored under
fn populate(cache: &QueryCache, command: &CommandContext, payload: CachedPayload) -> CacheKey {
    match cache.lookup(command).unwrap() {
        CacheLookup::Miss { key, policy } => {
            assert!(cache.store_result(&key, &policy, Some(payload)));
            key
        }
        other => panic!("expected a miss, got {:?}", other),
    }
}

#[tokio::test]
async fn test_basic_cache_operations() -> anyhow::Result<()> {
    init_tracing();
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("Absolute|00:10:00", "SELECT * FROM [Posts] WHERE [Id] = @p0")
        .with_parameter(CommandParameter::input("@p0", 42));

    let key = populate(&cache, &command, CachedPayload::rows(b"row-data".to_vec()));
    assert_eq!(key.dependencies, BTreeSet::from(["EF_Posts".to_string()]));

    match cache.lookup(&command)? {
        CacheLookup::Hit { payload, key: hit_key } => {
            assert_eq!(payload, CachedPayload::rows(b"row-data".to_vec()));
            assert_eq!(hit_key, key);
        }
        other => panic!("expected a hit, got {:?}", other),
    }

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
    Ok(())
}

#[tokio::test]
async fn test_parameters_and_connection_separate_entries() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let sql = "SELECT * FROM [Posts] WHERE [Id] = @p0";

    populate(
        &cache,
        &read("Absolute", sql).with_parameter(CommandParameter::input("@p0", 1)),
        CachedPayload::RowCount(1),
    );

    assert!(cache
        .lookup(&read("Absolute", sql).with_parameter(CommandParameter::input("@p0", 2)))?
        .is_miss());
    assert!(cache
        .lookup(
            &read("Absolute", sql)
                .with_parameter(CommandParameter::input("@p0", 1))
                .with_connection("Server=replica")
        )?
        .is_miss());
    assert!(cache
        .lookup(&read("Absolute", sql).with_parameter(CommandParameter::input("@p0", 1)))?
        .is_hit());
    Ok(())
}

#[tokio::test]
async fn test_salt_key_separates_entries() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let sql = "SELECT * FROM [Tags]";

    populate(&cache, &read("Absolute||tenant-a", sql), CachedPayload::RowCount(1));
    assert!(cache.lookup(&read("Absolute||tenant-b", sql))?.is_miss());
    assert!(cache.lookup(&read("Absolute||tenant-a", sql))?.is_hit());
    Ok(())
}

#[tokio::test]
async fn test_write_invalidates_only_dependent_results() -> anyhow::Result<()> {
    init_tracing();
    let cache = QueryCache::new(CacheConfig::default())?;

    let posts_and_users = read(
        "Absolute",
        "SELECT [p].* FROM [Posts] AS [p] INNER JOIN [Users] AS [u] ON [p].[UserId] = [u].[Id]",
    );
    let users_only = read("Absolute", "SELECT * FROM [dbo].[Users]");
    let products = read("Absolute", "SELECT * FROM [Products] WHERE [Name] = N' [Users] '");

    populate(&cache, &posts_and_users, CachedPayload::RowCount(1));
    populate(&cache, &users_only, CachedPayload::RowCount(2));
    populate(&cache, &products, CachedPayload::RowCount(3));

    let write = CommandContext::new("UPDATE [Users] SET [Name] = @p0 WHERE [Id] = @p1", TABLES)
        .with_owner_context("BloggingContext");
    assert_eq!(cache.invalidate_for_command(&write), 2);

    assert!(cache.lookup(&posts_and_users)?.is_miss());
    assert!(cache.lookup(&users_only)?.is_miss());
    assert!(cache.lookup(&products)?.is_hit());

    let events = cache.recent_invalidations();
    let last = events.last().expect("invalidation recorded");
    assert_eq!(
        last.reason,
        InvalidationReason::TableWrite {
            tables: BTreeSet::from(["Users".to_string()])
        }
    );
    assert_eq!(last.context.as_deref(), Some("BloggingContext"));
    Ok(())
}

#[tokio::test]
async fn test_insert_select_back_invalidates_target() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    populate(&cache, &read("Absolute", "SELECT * FROM [Tags]"), CachedPayload::RowCount(1));
    populate(&cache, &read("Absolute", "SELECT * FROM [Posts]"), CachedPayload::RowCount(1));

    let write = CommandContext::new(
        "SET NOCOUNT ON;\nINSERT INTO [Tags] ([Name]) VALUES (@p0);\nSELECT [Id] FROM [Tags] WHERE @@ROWCOUNT = 1 AND [Id] = scope_identity();",
        TABLES,
    );
    assert_eq!(cache.invalidate_for_command(&write), 1);
    assert!(cache.lookup(&read("Absolute", "SELECT * FROM [Posts]"))?.is_hit());
    Ok(())
}

#[tokio::test]
async fn test_extra_dependencies_from_directive() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("Absolute|||Audit,Reports", "SELECT * FROM [Posts]");
    let key = populate(&cache, &command, CachedPayload::RowCount(1));

    assert_eq!(
        key.dependencies,
        BTreeSet::from([
            "EF_Audit".to_string(),
            "EF_Posts".to_string(),
            "EF_Reports".to_string()
        ])
    );

    assert_eq!(cache.invalidate_tables(["Reports"]), 1);
    assert!(cache.lookup(&command)?.is_miss());
    Ok(())
}

#[tokio::test]
async fn test_unknown_dependencies_invalidated_by_any_write() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("NeverRemove", "SELECT GETDATE()");
    let key = populate(&cache, &command, CachedPayload::Scalar(serde_json::json!("2024-01-01")));
    assert_eq!(
        key.dependencies,
        BTreeSet::from(["EF_UnknownsCacheDependency".to_string()])
    );

    let write = CommandContext::new("DELETE FROM [Products] WHERE [Id] = 1", TABLES);
    assert_eq!(cache.invalidate_for_command(&write), 1);
    Ok(())
}

#[tokio::test]
async fn test_truncate_and_procedure_calls_evict_stale_reads() -> anyhow::Result<()> {
    init_tracing();
    let cache = QueryCache::new(CacheConfig::default())?;
    let posts = read("NeverRemove", "SELECT * FROM [Posts]");
    let products = read("NeverRemove", "SELECT * FROM [Products]");
    populate(&cache, &posts, CachedPayload::RowCount(10));
    populate(&cache, &products, CachedPayload::RowCount(3));

    let truncate = CommandContext::new("TRUNCATE TABLE [Posts]", TABLES);
    assert_eq!(cache.invalidate_for_command(&truncate), 1);
    assert!(cache.lookup(&posts)?.is_miss());
    assert!(cache.lookup(&products)?.is_hit());

    // The procedure body is opaque, so every known table goes
    populate(&cache, &posts, CachedPayload::RowCount(10));
    let exec = CommandContext::new("EXEC dbo.ReindexCatalog", TABLES);
    assert_eq!(cache.invalidate_for_command(&exec), 2);
    assert!(cache.lookup(&posts)?.is_miss());
    assert!(cache.lookup(&products)?.is_miss());

    let ddl = CommandContext::new("ALTER TABLE [Users] ADD [Bio] NVARCHAR(MAX) NULL", TABLES);
    populate(&cache, &read("NeverRemove", "SELECT * FROM [Users]"), CachedPayload::RowCount(1));
    assert_eq!(cache.invalidate_for_command(&ddl), 1);
    assert!(cache.store().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_absolute_expiration() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("Absolute|00:00:00.1000000", "SELECT * FROM [Posts]");
    populate(&cache, &command, CachedPayload::RowCount(1));

    assert!(cache.lookup(&command)?.is_hit());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cache.lookup(&command)?.is_miss());

    let stats = cache.stats();
    assert!(stats.evictions_ttl > 0);
    assert_eq!(stats.entries, 0);
    Ok(())
}

#[tokio::test]
async fn test_sliding_expiration() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("Sliding|00:00:00.3000000", "SELECT * FROM [Posts]");
    populate(&cache, &command, CachedPayload::RowCount(1));

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&command)?.is_hit());
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.lookup(&command)?.is_miss());
    Ok(())
}

#[tokio::test]
async fn test_purge_expired() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    populate(
        &cache,
        &read("Absolute|00:00:00.0500000", "SELECT * FROM [Posts]"),
        CachedPayload::RowCount(1),
    );
    populate(&cache, &read("NeverRemove", "SELECT * FROM [Tags]"), CachedPayload::RowCount(1));

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.stats().entries, 1);
    assert_eq!(cache.store().tag_members("EF_Posts").len(), 0);
    assert_eq!(
        cache.recent_invalidations().last().map(|e| e.reason.clone()),
        Some(InvalidationReason::Expired)
    );
    Ok(())
}

#[tokio::test]
async fn test_null_result_is_cached() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    let command = read("Absolute", "SELECT TOP 1 [Title] FROM [Posts] WHERE 1 = 0");

    let CacheLookup::Miss { key, policy } = cache.lookup(&command)? else {
        panic!("expected a miss");
    };
    assert!(cache.store_result(&key, &policy, None));

    match cache.lookup(&command)? {
        CacheLookup::Hit { payload, .. } => assert!(payload.is_null()),
        other => panic!("expected a hit, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_hash_prefix_and_shared_store() -> anyhow::Result<()> {
    let store = std::sync::Arc::new(DependencyStore::new(16, Duration::from_secs(60)));
    let tenant_a = QueryCache::with_store(
        CacheConfig::builder().hash_prefix("a:").build(),
        store.clone(),
    )?;
    let tenant_b = QueryCache::with_store(
        CacheConfig::builder().hash_prefix("b:").build(),
        store.clone(),
    )?;

    let command = read("Absolute", "SELECT * FROM [Posts]");
    let key = populate(&tenant_a, &command, CachedPayload::RowCount(1));
    assert!(key.hash.starts_with("a:"));

    assert!(tenant_b.lookup(&command)?.is_miss());
    assert!(tenant_a.lookup(&command)?.is_hit());
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cache_all_queries_preset() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::read_heavy())?;
    let command = CommandContext::new("SELECT * FROM [Posts]", TABLES);

    let CacheLookup::Miss { key, policy } = cache.lookup(&command)? else {
        panic!("expected a miss");
    };
    assert_eq!(policy, CachePolicy::absolute(Duration::from_secs(300)));

    // read_heavy skips empty results
    assert!(!cache.store_result(&key, &policy, Some(CachedPayload::RowCount(0))));
    assert!(cache.lookup(&command)?.is_miss());
    Ok(())
}

#[tokio::test]
async fn test_invalid_configuration_rejected() {
    let config = CacheConfig::builder().lock_stripes(10).build();
    assert!(QueryCache::new(config).is_err());
}

#[tokio::test]
async fn test_clear() -> anyhow::Result<()> {
    let cache = QueryCache::new(CacheConfig::default())?;
    populate(&cache, &read("Absolute", "SELECT * FROM [Posts]"), CachedPayload::RowCount(1));
    populate(&cache, &read("Absolute", "SELECT * FROM [Users]"), CachedPayload::RowCount(1));

    cache.clear();

    assert_eq!(cache.stats().entries, 0);
    assert!(cache.store().tags().is_empty());
    cache.store().check_consistency()?;
    Ok(())
}
