//! Facade behaviour against in-memory servers.
//!
//! Covers every operation in both its `try_*` and sentinel form, the
//! rejection of invalid calls before any network traffic, and shutdown.

use kaisen_cache::{Cache, CasOutcome, OpOptions, ServerAddress, StringCodec};
use kaisen_test_utils::assertions::{
    assert_connectivity, assert_contract_violation, assert_soft_failure,
};
use kaisen_test_utils::fixtures::{json_cache, memory_pool, test_config};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u32,
    name: String,
}

fn profile(id: u32) -> Profile {
    Profile {
        id,
        name: format!("user-{}", id),
    }
}

fn opts() -> OpOptions {
    OpOptions::new()
}

// ============================================================================
// READS AND WRITES
// ============================================================================

#[tokio::test]
async fn test_set_get_delete() {
    let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<Profile> = json_cache(&pool, "UserProfile");

    assert_eq!(cache.get("42", opts()).await, None);
    assert!(cache.set("42", &profile(42), opts()).await);
    assert_eq!(cache.get("42", opts()).await, Some(profile(42)));

    assert!(cache.delete("42", opts()).await);
    assert!(!cache.delete("42", opts()).await);
    assert_eq!(cache.try_get("42", opts()).await.unwrap(), None);
}

#[tokio::test]
async fn test_add_and_replace() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "n");

    assert!(!cache.replace("k", &1, opts()).await);
    assert!(cache.add("k", &1, opts()).await);
    assert!(!cache.add("k", &2, opts()).await);
    assert!(cache.replace("k", &3, opts()).await);
    assert_eq!(cache.get("k", opts()).await, Some(3));
}

#[tokio::test]
async fn test_prefixes_are_isolated() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let users: Cache<String> = json_cache(&pool, "User");
    let orders: Cache<String> = json_cache(&pool, "Order");

    assert!(users.set("1", &"ada".to_string(), opts()).await);
    assert_eq!(orders.get("1", opts()).await, None);
    assert_eq!(users.get("1", opts()).await.as_deref(), Some("ada"));
}

#[tokio::test]
async fn test_keys_spread_over_servers() {
    let (pool, connector) = memory_pool(test_config(), "a:1 b:2 c:3").await;
    let cache: Cache<u32> = json_cache(&pool, "spread");

    for i in 0..300 {
        assert!(cache.set(&format!("key-{}", i), &i, opts()).await);
    }
    for port in 1..=3u16 {
        let host = ["a", "b", "c"][usize::from(port - 1)];
        let store = connector.store(&ServerAddress::new(host, port));
        assert!(!store.is_empty(), "{}:{} got no keys", host, port);
    }
    for i in 0..300 {
        assert_eq!(cache.get(&format!("key-{}", i), opts()).await, Some(i));
    }
}

#[tokio::test]
async fn test_multi_get_matches_single_gets() {
    let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<String> = json_cache(&pool, "multi");

    assert!(cache.set("A", &"alpha".to_string(), opts()).await);
    assert!(cache.set("C", &"gamma".to_string(), opts()).await);

    let keys = ["A", "B", "C"];
    let batch = cache.get_multi(&keys, opts()).await;
    assert_eq!(batch.len(), 2);
    for key in keys {
        assert_eq!(batch.get(key).cloned(), cache.get(key, opts()).await);
    }
}

#[tokio::test]
async fn test_multi_get_respects_merge_factor() {
    let (pool, connector) = memory_pool(test_config().with_merge_factor(10), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "chunk");

    let keys: Vec<String> = (0..35).map(|i| format!("k{}", i)).collect();
    let found = cache.get_multi(&keys, opts()).await;
    assert!(found.is_empty());
    assert_eq!(connector.call_count("get_multi"), 4);
}

#[tokio::test]
async fn test_multi_get_duplicate_keys_fetched_once() {
    let (pool, connector) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "dup");
    assert!(cache.set("x", &1, opts()).await);

    let found = cache.get_multi(&["x", "x", "x"], opts()).await;
    assert_eq!(found.len(), 1);
    assert_eq!(connector.call_count("get_multi"), 1);
}

#[tokio::test]
async fn test_concurrent_gets_are_merged() {
    let (pool, connector) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "merge");
    assert!(cache.set("a", &1, opts()).await);

    let (a, b, c) = tokio::join!(
        cache.get("a", opts()),
        cache.get("b", opts()),
        cache.get("a", opts()),
    );
    assert_eq!((a, b, c), (Some(1), None, Some(1)));
    assert_eq!(connector.call_count("get_multi"), 1);
}

#[tokio::test]
async fn test_unmerged_gets_go_direct() {
    let (pool, connector) = memory_pool(test_config().with_optimize_get(false), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "direct");

    let _ = tokio::join!(cache.get("a", opts()), cache.get("b", opts()));
    assert_eq!(connector.call_count("get_multi"), 2);
}

#[tokio::test]
async fn test_touch_and_get_and_touch() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "t");

    assert!(!cache.touch("k", opts()).await);
    assert!(cache.set("k", &7, opts()).await);
    assert!(cache.touch("k", opts().with_expiration(60)).await);
    assert_eq!(
        cache.get_and_touch("k", opts().with_expiration(60)).await,
        Some(7)
    );
    assert_eq!(cache.get_and_touch("missing", opts()).await, None);
}

#[tokio::test]
async fn test_append_and_prepend_with_string_codec() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<String, StringCodec> =
        Cache::with_codec(Arc::clone(&pool), "log", StringCodec::new()).unwrap();

    assert!(!cache.append("line", &"x".to_string(), opts()).await);
    assert!(cache.set("line", &"b".to_string(), opts()).await);
    assert!(cache.append("line", &"c".to_string(), opts()).await);
    assert!(cache.prepend("line", &"a".to_string(), opts()).await);
    assert_eq!(cache.get("line", opts()).await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_no_reply_write_is_dispatched() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "nr");

    assert!(cache.set("k", &5, opts().no_reply()).await);
    let mut seen = None;
    for _ in 0..50 {
        seen = cache.get("k", opts()).await;
        if seen.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(5));
}

// ============================================================================
// COUNTERS AND CAS
// ============================================================================

#[tokio::test]
async fn test_incr_decr() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u64> = json_cache(&pool, "ctr");

    assert_eq!(cache.incr("hits", 1, None, opts()).await, -1);
    assert_eq!(cache.try_incr("hits", 1, None, opts()).await.unwrap(), None);
    assert_eq!(cache.incr("hits", 1, Some(100), opts()).await, 100);
    assert_eq!(cache.incr("hits", 5, Some(100), opts()).await, 105);
    assert_eq!(cache.decr("hits", 200, None, opts()).await, 0);

    // Counters are decimal text, which JSON also reads as a number.
    assert_eq!(cache.get("hits", opts()).await, Some(0));
}

#[tokio::test]
async fn test_incr_on_non_numeric_value_is_soft_failure() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<String> = json_cache(&pool, "ctr");

    assert!(cache.set("name", &"ada".to_string(), opts()).await);
    assert_soft_failure(&cache.try_incr("name", 1, None, opts()).await);
    assert_eq!(cache.incr("name", 1, None, opts()).await, -1);
    assert_eq!(cache.cache_stats().soft_failures, 1);
}

#[tokio::test]
async fn test_cas_with_explicit_token() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "cas");

    assert!(cache.set("k", &1, opts()).await);
    let read = cache.gets("k", opts()).await.unwrap();
    assert_eq!(read.value, 1);

    assert!(cache.set("k", &2, opts()).await);
    assert_eq!(
        cache.try_cas("k", &10, read.cas, opts()).await.unwrap(),
        CasOutcome::Conflict
    );

    let fresh = cache.gets("k", opts()).await.unwrap();
    assert!(cache.cas("k", &10, fresh.cas, opts()).await);
    assert_eq!(cache.get("k", opts()).await, Some(10));
    assert_eq!(
        cache.try_cas("missing", &1, fresh.cas, opts()).await.unwrap(),
        CasOutcome::NotFound
    );
}

#[tokio::test]
async fn test_cas_with_closure() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<Vec<u32>> = json_cache(&pool, "cas");

    assert!(!cache.cas_with("list", |mut v| {
        v.push(1);
        v
    }, opts()).await);

    assert!(cache.set("list", &vec![1], opts()).await);
    assert!(cache.cas_with("list", |mut v| {
        v.push(2);
        v
    }, opts()).await);
    assert_eq!(cache.get("list", opts()).await, Some(vec![1, 2]));
}

#[tokio::test]
async fn test_gets_multi_and_delete_if() {
    let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<u32> = json_cache(&pool, "gm");

    assert!(cache.set("a", &1, opts()).await);
    assert!(cache.set("b", &2, opts()).await);
    let read = cache.gets_multi(&["a", "b", "c"], opts()).await;
    assert_eq!(read.len(), 2);
    assert_eq!(read["b"].value, 2);

    assert!(cache.set("a", &3, opts()).await);
    assert!(!cache.delete_if("a", read["a"].cas, opts()).await);
    assert!(cache.delete_if("b", read["b"].cas, opts()).await);
    assert_eq!(cache.get("a", opts()).await, Some(3));
    assert_eq!(cache.get("b", opts()).await, None);
}

// ============================================================================
// CONTRACT VIOLATIONS
// ============================================================================

#[tokio::test]
async fn test_null_writes_make_no_calls() {
    let (pool, connector) = memory_pool(test_config(), "a:1").await;
    let mut cache: Cache<Option<String>> = json_cache(&pool, "null");

    assert_contract_violation(&cache.try_set("k", &None, opts()).await);
    assert!(!cache.add("k", &None, opts()).await);
    assert!(!cache.replace("k", &None, opts()).await);
    assert!(!cache.cas("k", &None, 1, opts()).await);

    // Inside a namespace the token lookup must not happen either.
    cache.begin_namespace("tenant").unwrap();
    assert!(!cache.set("k", &None, opts()).await);
    cache.end_namespace().unwrap();

    assert_eq!(connector.total_calls(), 0);
    assert_eq!(cache.cache_stats().contract_violations, 4);
}

#[tokio::test]
async fn test_invalid_keys_make_no_calls() {
    let (pool, connector) = memory_pool(test_config(), "a:1").await;
    let mut cache: Cache<u32> = json_cache(&pool, "keys");

    assert_contract_violation(&cache.try_get("", opts()).await);
    assert_contract_violation(&cache.try_set("has space", &1, opts()).await);
    assert_contract_violation(&cache.try_get("@reserved", opts()).await);
    assert_contract_violation(&cache.try_get(&"x".repeat(300), opts()).await);
    assert_contract_violation(&cache.try_get_multi(&["ok", ""], opts()).await);

    cache.begin_namespace("tenant").unwrap();
    assert_contract_violation(&cache.try_delete("", opts()).await);

    assert_eq!(connector.total_calls(), 0);
}

#[tokio::test]
async fn test_sanitized_keys_accept_whitespace() {
    let (pool, _) = memory_pool(test_config().with_sanitize_keys(true), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "s");

    assert!(cache.set("has space", &1, opts()).await);
    assert_eq!(cache.get("has space", opts()).await, Some(1));
}

// ============================================================================
// SERVER COMMANDS
// ============================================================================

#[tokio::test]
async fn test_flush_all() {
    let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<u32> = json_cache(&pool, "f");

    for i in 0..20 {
        assert!(cache.set(&format!("k{}", i), &i, opts()).await);
    }
    assert!(cache.flush_all(opts()).await);
    for i in 0..20 {
        assert_eq!(cache.get(&format!("k{}", i), opts()).await, None);
    }
}

#[tokio::test]
async fn test_flush_one_server() {
    let (pool, connector) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<u32> = json_cache(&pool, "f");
    for i in 0..50 {
        assert!(cache.set(&format!("k{}", i), &i, opts()).await);
    }

    let a = ServerAddress::new("a", 1);
    let b = ServerAddress::new("b", 2);
    assert!(cache.flush_all_on(&a, opts()).await);
    assert!(connector.store(&a).is_empty());
    assert!(!connector.store(&b).is_empty());

    assert!(!cache.flush_all_on(&ServerAddress::new("nope", 9), opts()).await);
}

#[tokio::test]
async fn test_stats_and_versions() {
    let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
    let cache: Cache<u32> = json_cache(&pool, "st");
    assert!(cache.set("k", &1, opts()).await);

    let stats = cache.stats(opts()).await;
    assert_eq!(stats.len(), 2);
    let items: u64 = stats
        .values()
        .map(|s| s["curr_items"].parse::<u64>().unwrap())
        .sum();
    assert_eq!(items, 1);

    let a = ServerAddress::new("a", 1);
    assert!(cache.stats_on(&a, opts()).await.is_some());
    let slabs = cache.stats_by_item("items", opts()).await;
    assert!(slabs[&a].contains_key("items:number"));

    let versions = cache.versions(opts()).await;
    assert_eq!(versions.len(), 2);
    assert!(versions[&a].starts_with("kaisen-memory"));
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_operations_after_shutdown_are_soft_failures() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "sd");
    assert!(cache.set("k", &1, opts()).await);

    pool.shutdown().await;
    assert!(cache.is_shutdown());
    assert_connectivity(&cache.try_get("k", opts()).await);
    assert_eq!(cache.get("k", opts()).await, None);
    assert!(!cache.set("k", &2, opts()).await);
    assert_eq!(cache.incr("n", 1, Some(0), opts()).await, -1);
    assert!(cache.versions(opts()).await.is_empty());
    assert!(!cache.flush_all(opts()).await);
}

#[tokio::test]
async fn test_no_servers_is_soft_failure() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    assert!(pool.remove_server(&ServerAddress::new("a", 1)).await);
    let cache: Cache<u32> = json_cache(&pool, "empty");

    assert_connectivity(&cache.try_set("k", &1, opts()).await);
}

#[tokio::test]
async fn test_cache_stats_counts_hits_and_misses() {
    let (pool, _) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "hs");
    let clone = cache.clone();

    assert!(cache.set("k", &1, opts()).await);
    assert_eq!(cache.get("k", opts()).await, Some(1));
    assert_eq!(clone.get("missing", opts()).await, None);
    let _ = cache.get_multi(&["k", "nope"], opts()).await;

    let stats = cache.cache_stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 2);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_default_expiration_applies() {
    let (pool, connector) = memory_pool(test_config(), "a:1").await;
    let cache: Cache<u32> = json_cache(&pool, "exp").with_expiration(1);
    assert_eq!(cache.expiration(), 1);

    assert!(cache.set("k", &1, opts()).await);
    assert!(cache.set("forever", &1, opts().with_expiration(0)).await);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(cache.get("k", opts()).await, None);
    assert_eq!(cache.get("forever", opts()).await, Some(1));
    assert_eq!(connector.store(&ServerAddress::new("a", 1)).len(), 1);
}
