//! Scheduler properties: block-to-core routing and residency caching.
//!
//! The per-core refill and job counters are updated before each reply is
//! sent, so once a search call returns the counters are settled.

use vecscan::util;
use vecscan::{Feature, FeatureValue, Manager};

const DIMS: usize = 5;
const PRECISION: usize = 4;

/// 10 vectors per block.
const BLOCK_SIZE: usize = 10 * DIMS * PRECISION;

fn feature(id: &str, seed: f32) -> Feature {
    Feature::from_f32(
        id,
        &util::normalize(&[seed, seed + 1.0, seed + 2.0, seed - 1.0, seed * 0.5]),
    )
}

fn query() -> FeatureValue {
    util::value_of_f32(&util::normalize(&[1.0, 2.0, 3.0, 4.0, 5.0]))
}

fn owned_indices(manager: &Manager, set: &str) -> Vec<usize> {
    manager
        .cache()
        .blocks()
        .iter()
        .filter(|b| b.owner().as_deref() == Some(set))
        .map(|b| b.index())
        .collect()
}

#[tokio::test]
async fn test_routing_follows_index_mod_cores() {
    // Two cores, four owned blocks.
    let manager = Manager::new(0, 2 * BLOCK_SIZE, 6, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 4).await.unwrap();

    let features: Vec<Feature> = (0..35).map(|i| feature(&format!("f{i}"), i as f32)).collect();
    manager.add_feature("s", &features).await.unwrap();

    let owned = owned_indices(&manager, "s");
    assert_eq!(owned.len(), 4);

    manager.search("s", -1.0, 1, &[query()]).await.unwrap();

    let cores = manager.cores();
    for core in cores {
        let expected = owned
            .iter()
            .filter(|&&index| index % cores.len() == core.id())
            .count() as u64;
        assert_eq!(core.handled_jobs(), expected, "core {}", core.id());
        assert_eq!(core.refill_count(), expected, "core {}", core.id());
    }
}

#[tokio::test]
async fn test_repeat_search_hits_resident_blocks() {
    let manager = Manager::new(0, 2 * BLOCK_SIZE, 6, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 4).await.unwrap();
    let features: Vec<Feature> = (0..15).map(|i| feature(&format!("f{i}"), i as f32)).collect();
    manager.add_feature("s", &features).await.unwrap();

    manager.search("s", -1.0, 1, &[query()]).await.unwrap();
    let refills_after_first: u64 = manager.cores().iter().map(|c| c.refill_count()).sum();
    let jobs_after_first: u64 = manager.cores().iter().map(|c| c.handled_jobs()).sum();

    // No intervening mutation: the second search must not trigger any
    // host-to-device refresh.
    manager.search("s", -1.0, 1, &[query()]).await.unwrap();
    let refills_after_second: u64 = manager.cores().iter().map(|c| c.refill_count()).sum();
    let jobs_after_second: u64 = manager.cores().iter().map(|c| c.handled_jobs()).sum();

    assert_eq!(refills_after_second, refills_after_first);
    assert_eq!(jobs_after_second, jobs_after_first * 2);
}

#[tokio::test]
async fn test_resident_marker_tracks_block() {
    let manager = Manager::new(0, 2 * BLOCK_SIZE, 4, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 4).await.unwrap();
    manager.add_feature("s", &[feature("a", 1.0)]).await.unwrap();

    let owned = owned_indices(&manager, "s");
    assert_eq!(owned.len(), 1);
    let block_index = owned[0];

    manager.search("s", -1.0, 1, &[query()]).await.unwrap();

    let core = &manager.cores()[block_index % manager.cores().len()];
    assert_eq!(core.resident_index(), Some(block_index));
}

#[tokio::test]
async fn test_mutation_forces_refresh() {
    let manager = Manager::new(0, 2 * BLOCK_SIZE, 4, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 4).await.unwrap();
    manager
        .add_feature("s", &[feature("a", 1.0), feature("b", 2.0)])
        .await
        .unwrap();

    manager.search("s", -1.0, 1, &[query()]).await.unwrap();
    let owned = owned_indices(&manager, "s");
    let core = &manager.cores()[owned[0] % manager.cores().len()];
    let refills = core.refill_count();
    let version = core.resident_version();

    manager
        .delete_feature("s", &["a".to_string()])
        .await
        .unwrap();
    manager.search("s", -1.0, 1, &[query()]).await.unwrap();

    assert_eq!(core.refill_count(), refills + 1);
    assert_eq!(core.resident_version(), version + 1);
}

#[tokio::test]
async fn test_competing_block_evicts_residency() {
    // One core: every block maps onto it and they evict each other.
    let manager = Manager::new(0, BLOCK_SIZE, 4, BLOCK_SIZE).unwrap();
    manager.new_set("a", DIMS, PRECISION, 4).await.unwrap();
    manager.new_set("b", DIMS, PRECISION, 4).await.unwrap();
    manager.add_feature("a", &[feature("fa", 1.0)]).await.unwrap();
    manager.add_feature("b", &[feature("fb", 2.0)]).await.unwrap();

    let core = &manager.cores()[0];

    manager.search("a", -1.0, 1, &[query()]).await.unwrap();
    assert_eq!(core.resident_index(), Some(owned_indices(&manager, "a")[0]));
    let refills = core.refill_count();

    manager.search("b", -1.0, 1, &[query()]).await.unwrap();
    assert_eq!(core.resident_index(), Some(owned_indices(&manager, "b")[0]));
    assert_eq!(core.refill_count(), refills + 1);

    // Coming back to the first set refills again.
    manager.search("a", -1.0, 1, &[query()]).await.unwrap();
    assert_eq!(core.refill_count(), refills + 2);
}

#[tokio::test]
async fn test_block_never_served_by_two_cores() {
    let manager = Manager::new(0, 3 * BLOCK_SIZE, 9, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 4).await.unwrap();
    let features: Vec<Feature> = (0..55).map(|i| feature(&format!("f{i}"), i as f32)).collect();
    manager.add_feature("s", &features).await.unwrap();

    let owned = owned_indices(&manager, "s");
    assert_eq!(owned.len(), 6);

    for _ in 0..4 {
        manager.search("s", -1.0, 1, &[query()]).await.unwrap();
    }

    // Every block refilled exactly once on exactly one core: job counts per
    // core stay proportional to the blocks mapped there, refills do not grow
    // with repeated searches.
    let cores = manager.cores();
    for core in cores {
        let mapped = owned
            .iter()
            .filter(|&&index| index % cores.len() == core.id())
            .count() as u64;
        assert_eq!(core.handled_jobs(), mapped * 4, "core {}", core.id());
        assert_eq!(core.refill_count(), mapped, "core {}", core.id());
    }
}
