//! Property-Based Tests for the Cache Facade
//!
//! **Property 1: Multi-get equivalence**
//!
//! For any set of stored keys and any set of requested keys, one multi-get
//! SHALL return exactly what the individual gets return.
//!
//! **Property 2: Namespace isolation**
//!
//! A value written inside a namespace SHALL be readable inside it, SHALL NOT
//! be visible outside it, and SHALL disappear when the namespace is
//! invalidated.

use kaisen_cache::{Cache, OpOptions};
use kaisen_test_utils::fixtures::{json_cache, memory_pool, test_config};
use kaisen_test_utils::generators::{arb_key, arb_namespace};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
}

fn opts() -> OpOptions {
    OpOptions::new()
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_multi_get_equals_single_gets(
        stored in prop::collection::btree_set(arb_key(), 0..20),
        absent in prop::collection::btree_set(arb_key(), 0..10),
        merge_factor in 1usize..8,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (pool, _) = memory_pool(test_config().with_merge_factor(merge_factor), "a:1 b:2 c:3").await;
            let cache: Cache<String> = json_cache(&pool, "prop");

            for key in &stored {
                let value = format!("v:{}", key);
                prop_assert!(cache.set(key, &value, opts()).await);
            }

            let requested: Vec<String> = stored.union(&absent).cloned().collect();
            let batch = cache.try_get_multi(&requested, opts()).await.unwrap();

            let mut singles = HashMap::new();
            for key in &requested {
                if let Some(value) = cache.try_get(key, opts()).await.unwrap() {
                    singles.insert(key.clone(), value);
                }
            }
            prop_assert_eq!(&batch, &singles);

            let returned: BTreeSet<String> = batch.keys().cloned().collect();
            prop_assert_eq!(returned, stored);
            Ok(())
        })?;
    }

    #[test]
    fn prop_namespace_isolates_and_invalidates(
        namespace in arb_namespace(),
        key in arb_key(),
        value in any::<u32>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (pool, _) = memory_pool(test_config(), "a:1 b:2").await;
            let mut cache: Cache<u32> = json_cache(&pool, "prop");

            cache.begin_namespace(&namespace).unwrap();
            prop_assert!(cache.set(&key, &value, opts()).await);
            prop_assert_eq!(cache.get(&key, opts()).await, Some(value));
            cache.end_namespace().unwrap();

            prop_assert_eq!(cache.get(&key, opts()).await, None);

            prop_assert!(cache.invalidate_namespace(&namespace, opts()).await);
            cache.begin_namespace(&namespace).unwrap();
            prop_assert_eq!(cache.get(&key, opts()).await, None);
            Ok(())
        })?;
    }
}
