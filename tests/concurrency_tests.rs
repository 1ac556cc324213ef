//! Concurrency tests for the dependency store
//!
//! Many writers and invalidators sharing a root tag must leave the primary map and
//! the tag index in agreement, and no invalidation may leave behind an entry that was
//! inserted before it started.

use futures::future::join_all;
use ouroboros_query_cache::cache::{
    CacheConfig, CacheKey, CacheLookup, CachedPayload, CommandContext, DependencyStore, QueryCache,
};
use ouroboros_query_cache::policy::CachePolicy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const ROOT: &str = "EF_Root";
const SIDE_TAGS: [&str; 6] = ["EF_A", "EF_B", "EF_C", "EF_D", "EF_E", "EF_F"];

fn random_key(rng: &mut StdRng) -> CacheKey {
    let mut tags = vec![ROOT.to_string()];
    for _ in 0..rng.gen_range(0..3) {
        tags.push(SIDE_TAGS[rng.gen_range(0..SIDE_TAGS.len())].to_string());
    }
    // Shared hash space so re-inserts happen
    let hash = format!("h{}", rng.gen_range(0..64));
    CacheKey::new(hash, "StressContext", tags)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_inserts_and_invalidations_stay_consistent() -> anyhow::Result<()> {
    // Few stripes to force contention
    let store = Arc::new(DependencyStore::new(4, Duration::from_secs(60)));
    let policy = CachePolicy::never_remove();

    let writers = (0..8).map(|worker| {
        let store = Arc::clone(&store);
        let policy = policy.clone();
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(worker as u64);
            for i in 0..2_000 {
                let key = random_key(&mut rng);
                store.insert(&key, Some(CachedPayload::RowCount(i as i64)), &policy);
                if i % 7 == 0 {
                    let _ = store.get(&key);
                }
            }
        })
    });

    let invalidators = (0..4).map(|worker| {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(1_000 + worker as u64);
            for _ in 0..500 {
                let tag = if rng.gen_bool(0.3) {
                    ROOT
                } else {
                    SIDE_TAGS[rng.gen_range(0..SIDE_TAGS.len())]
                };
                store.invalidate(&CacheKey::for_dependencies([tag]));
            }
        })
    });

    for result in join_all(writers.chain(invalidators)).await {
        result?;
    }

    store.check_consistency()?;

    // Every entry carries the root tag, so one final invalidation empties the store
    store.invalidate(&CacheKey::for_dependencies([ROOT]));
    assert!(store.is_empty());
    assert!(store.tags().is_empty());
    store.check_consistency()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_completed_invalidation_leaves_no_earlier_insert() -> anyhow::Result<()> {
    let store = Arc::new(DependencyStore::new(8, Duration::from_secs(60)));
    let policy = CachePolicy::never_remove();

    let workers = (0..8).map(|worker| {
        let store = Arc::clone(&store);
        let policy = policy.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..1_000 {
                let key = CacheKey::new(
                    format!("w{}-{}", worker, i),
                    "StressContext",
                    [ROOT, SIDE_TAGS[(worker + i) % SIDE_TAGS.len()]],
                );
                store.insert(&key, Some(CachedPayload::Null), &policy);

                store.invalidate(&CacheKey::for_dependencies([ROOT]));

                // Inserted before this invalidation started, so it must be gone
                assert!(store.get(&key).is_none(), "{} survived invalidation", key.hash);
            }
        })
    });

    for result in join_all(workers).await {
        result?;
    }

    store.check_consistency()?;
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_expiring_reads_race_with_writers_without_deadlock() -> anyhow::Result<()> {
    // Reads that find an expired entry take stripes to unlink it while writers and
    // invalidators hold stripes and touch the same map shards
    let store = Arc::new(DependencyStore::new(2, Duration::from_secs(60)));
    let short = CachePolicy::absolute(Duration::from_millis(1));

    let readers = (0..4).map(|worker| {
        let store = Arc::clone(&store);
        let short = short.clone();
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(2_000 + worker as u64);
            for i in 0..1_000 {
                let key = random_key(&mut rng);
                store.insert(&key, Some(CachedPayload::RowCount(i)), &short);
                if i % 50 == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
                let _ = store.get(&key);
            }
        })
    });

    let invalidators = (0..4).map(|worker| {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(3_000 + worker as u64);
            for _ in 0..1_000 {
                let tag = SIDE_TAGS[rng.gen_range(0..SIDE_TAGS.len())];
                store.invalidate(&CacheKey::for_dependencies([tag]));
                let _ = store.purge_expired();
            }
        })
    });

    let all = join_all(readers.chain(invalidators));
    for result in tokio::time::timeout(Duration::from_secs(60), all).await? {
        result?;
    }

    std::thread::sleep(Duration::from_millis(5));
    store.purge_expired();
    store.check_consistency()?;
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reinsert_races_with_side_tag_invalidation() -> anyhow::Result<()> {
    let store = Arc::new(DependencyStore::new(2, Duration::from_secs(60)));
    let policy = CachePolicy::never_remove();

    let reinserter = {
        let store = Arc::clone(&store);
        let policy = policy.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..5_000 {
                let tag = SIDE_TAGS[i % SIDE_TAGS.len()];
                store.insert(&CacheKey::new("same", "Ctx", [ROOT, tag]), None, &policy);
            }
        })
    };

    let invalidator = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for i in 0..5_000 {
                store.invalidate(&CacheKey::for_dependencies([SIDE_TAGS[i % SIDE_TAGS.len()]]));
            }
        })
    };

    reinserter.await?;
    invalidator.await?;

    store.check_consistency()?;
    assert!(store.len() <= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_query_cache_under_load() -> anyhow::Result<()> {
    let cache = Arc::new(QueryCache::new(CacheConfig::small())?);
    let tables = ["Posts", "Users", "Tags"];

    let tasks = (0..8).map(|worker| {
        let cache = Arc::clone(&cache);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut rng = StdRng::seed_from_u64(worker as u64);
            for _ in 0..300 {
                let table = tables[rng.gen_range(0..tables.len())];
                if rng.gen_bool(0.2) {
                    let write = CommandContext::new(format!("DELETE FROM [{}] WHERE [Id] = 1", table), tables);
                    cache.invalidate_for_command(&write);
                } else {
                    let read = CommandContext::new(
                        format!(
                            "-- EFCachePolicy[stress] --> Absolute|00:01:00\nSELECT * FROM [{}] WHERE [Id] = {}",
                            table,
                            rng.gen_range(0..10)
                        ),
                        tables,
                    );
                    if let CacheLookup::Miss { key, policy } = cache.lookup(&read)? {
                        cache.store_result(&key, &policy, Some(CachedPayload::RowCount(1)));
                    }
                }
            }
            Ok(())
        })
    });

    for result in join_all(tasks).await {
        result??;
    }

    cache.store().check_consistency()?;
    let stats = cache.stats();
    assert!(stats.hits + stats.misses > 0);
    assert_eq!(stats.entries, cache.store().len());
    Ok(())
}
