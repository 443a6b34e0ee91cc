//! End-to-end search scenarios against the host-emulated device runtime.

use rand::Rng;
use vecscan::error::Error;
use vecscan::util;
use vecscan::{Feature, FeatureValue, Manager};

const DIMS: usize = 5;
const PRECISION: usize = 4;

/// 500 vectors per block at dims=5, precision=4.
const BLOCK_SIZE: usize = 500 * DIMS * PRECISION;

fn normalized(components: &[f32]) -> FeatureValue {
    util::value_of_f32(&util::normalize(components))
}

fn f1() -> Feature {
    Feature::new("f1", normalized(&[1.0, 2.0, 3.0, 4.0, 5.0]))
}

fn f2() -> Feature {
    Feature::new("f2", normalized(&[2.0, 1.0, -3.0, 2.1, -1.0]))
}

fn small_manager() -> Manager {
    Manager::new(0, 5 * BLOCK_SIZE, 10, BLOCK_SIZE).unwrap()
}

#[tokio::test]
async fn test_self_match() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1()]).await.unwrap();

    let ret = manager.search("s", 0.0, 1, &[f1().value]).await.unwrap();
    assert_eq!(ret.len(), 1);
    assert_eq!(ret[0].len(), 1);
    assert_eq!(ret[0][0].id, "f1");
    assert!(ret[0][0].score >= 0.999999);
}

#[tokio::test]
async fn test_top_k_order_two_queries() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    let ret = manager
        .search("s", -1.0, 5, &[f1().value, f2().value])
        .await
        .unwrap();
    assert_eq!(ret.len(), 2);
    assert_eq!(ret[0].len(), 2);
    assert_eq!(ret[1].len(), 2);
    assert_eq!(ret[0][0].id, "f1");
    assert!(ret[0][0].score >= 0.999999);
    assert_eq!(ret[1][0].id, "f2");
    assert!(ret[1][0].score >= 0.999999);
    // Rows are sorted by descending score.
    assert!(ret[0][0].score >= ret[0][1].score);
}

#[tokio::test]
async fn test_threshold_filters_low_scores() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    let ret = manager.search("s", 0.99, 2, &[f1().value]).await.unwrap();
    assert_eq!(ret.len(), 1);
    assert_eq!(ret[0].len(), 1);
    assert_eq!(ret[0][0].id, "f1");
}

#[tokio::test]
async fn test_delete_then_search() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    let deleted = manager
        .delete_feature("s", &["f1".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, vec!["f1".to_string()]);

    let ret = manager.search("s", -1.0, 2, &[f1().value]).await.unwrap();
    assert_eq!(ret[0].len(), 1);
    assert_eq!(ret[0][0].id, "f2");
    assert!(ret[0][0].score < 0.999999);
}

#[tokio::test]
async fn test_cross_block_search() {
    // 1000 features span two 500-capacity blocks; five gpu cores.
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();

    let mut rng = rand::thread_rng();
    let features: Vec<Feature> = (0..1000)
        .map(|i| {
            let components: Vec<f32> = (0..DIMS).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
            Feature::new(format!("feat-{i:04}"), normalized(&components))
        })
        .collect();
    manager.add_feature("s", &features).await.unwrap();

    let owned = manager
        .cache()
        .blocks()
        .iter()
        .filter(|b| b.owner().as_deref() == Some("s"))
        .count();
    assert_eq!(owned, 2);

    for _ in 0..5 {
        let target = &features[rng.gen_range(0..features.len())];
        let ret = manager
            .search("s", 0.0, 1, &[target.value.clone()])
            .await
            .unwrap();
        assert_eq!(ret[0][0].id, target.id);
        assert!(ret[0][0].score >= 0.999999);
    }
}

#[tokio::test]
async fn test_version_invalidation_after_delete() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    // First search makes f1's block resident on its core.
    let ret = manager.search("s", -1.0, 2, &[f1().value]).await.unwrap();
    assert_eq!(ret[0][0].id, "f1");

    manager
        .delete_feature("s", &["f1".to_string()])
        .await
        .unwrap();

    // A stale resident buffer would still return f1; the version bump must
    // force a refresh.
    let ret = manager.search("s", -1.0, 2, &[f1().value]).await.unwrap();
    assert!(ret[0].iter().all(|r| r.id != "f1"));
}

#[tokio::test]
async fn test_limit_above_row_count() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    let ret = manager.search("s", -1.0, 50, &[f1().value]).await.unwrap();
    assert_eq!(ret[0].len(), 2);
}

#[tokio::test]
async fn test_empty_batch_returns_empty_matrix() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1()]).await.unwrap();

    let ret = manager.search("s", 0.0, 1, &[]).await.unwrap();
    assert!(ret.is_empty());
}

#[tokio::test]
async fn test_batch_above_set_limit() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 1).await.unwrap();
    manager.add_feature("s", &[f1()]).await.unwrap();

    let err = manager
        .search("s", 0.0, 1, &[f1().value, f2().value])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::OutOfBatch {
            requested: 2,
            limit: 1
        }
    );
}

#[tokio::test]
async fn test_search_empty_set() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();

    let ret = manager.search("s", 0.0, 1, &[f1().value]).await.unwrap();
    assert_eq!(ret.len(), 1);
    assert!(ret[0].is_empty());
}

#[tokio::test]
async fn test_capacity_plus_one_spills_into_fresh_block() {
    let manager = Manager::new(0, BLOCK_SIZE, 2, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();

    let features: Vec<Feature> = (0..500)
        .map(|i| Feature::new(format!("f{i}"), normalized(&[i as f32, 1.0, 2.0, 3.0, 4.0])))
        .collect();
    manager.add_feature("s", &features).await.unwrap();
    assert_eq!(manager.cache().free_blocks(), 1);

    manager
        .add_feature("s", &[Feature::new("overflow", normalized(&[9.0, 8.0, 7.0, 6.0, 5.0]))])
        .await
        .unwrap();
    assert_eq!(manager.cache().free_blocks(), 0);

    let ret = manager
        .search("s", 0.0, 1, &[normalized(&[9.0, 8.0, 7.0, 6.0, 5.0])])
        .await
        .unwrap();
    assert_eq!(ret[0][0].id, "overflow");
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let manager = Manager::new(0, BLOCK_SIZE, 1, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();

    let features: Vec<Feature> = (0..501)
        .map(|i| Feature::new(format!("f{i}"), normalized(&[i as f32, 1.0, 2.0, 3.0, 4.0])))
        .collect();
    let err = manager.add_feature("s", &features).await.unwrap_err();
    assert!(matches!(err, Error::NotEnoughBlocks { .. }));
}

#[tokio::test]
async fn test_search_without_gpu_memory() {
    let manager = Manager::new(0, 0, 2, BLOCK_SIZE).unwrap();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1()]).await.unwrap();

    // Block management still works without cores; only search is refused.
    assert_eq!(
        manager.search("s", 0.0, 1, &[f1().value]).await.unwrap_err(),
        Error::SearchUnavailable
    );
    let deleted = manager
        .delete_feature("s", &["f1".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, vec!["f1".to_string()]);
}

#[tokio::test]
async fn test_set_lifecycle_and_errors() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();

    assert_eq!(
        manager.new_set("s", DIMS, PRECISION, 5).await.unwrap_err(),
        Error::FeatureSetExists("s".to_string())
    );
    assert_eq!(
        manager.get_set("missing").await.unwrap_err(),
        Error::FeatureSetNotFound("missing".to_string())
    );

    assert_eq!(manager.get_set("s").await.unwrap(), (DIMS, PRECISION, 5));
    manager.update_set("s", 8).await.unwrap();
    assert_eq!(manager.get_set("s").await.unwrap(), (DIMS, PRECISION, 8));
    assert!(matches!(
        manager.update_set("s", 17).await.unwrap_err(),
        Error::BatchTooLarge { requested: 17, .. }
    ));

    manager.add_feature("s", &[f1()]).await.unwrap();
    manager.destroy_set("s").await.unwrap();
    assert_eq!(manager.cache().free_blocks(), manager.cache().blocks().len());
    assert_eq!(
        manager.destroy_set("s").await.unwrap_err(),
        Error::FeatureSetNotFound("s".to_string())
    );
}

#[tokio::test]
async fn test_update_and_read_through_manager() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1(), f2()]).await.unwrap();

    let read = manager.read_feature("s", &["f2".to_string()]).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].value, f2().value);

    // Re-point f1 at f2's vector: searching f2's value now matches both.
    let moved = Feature::new("f1", f2().value);
    let updated = manager.update_feature("s", &[moved]).await.unwrap();
    assert_eq!(updated, vec!["f1".to_string()]);

    let ret = manager.search("s", 0.999, 2, &[f2().value]).await.unwrap();
    let mut ids: Vec<&str> = ret[0].iter().map(|r| r.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["f1", "f2"]);
}

#[tokio::test]
async fn test_mismatched_query_dimension() {
    let manager = small_manager();
    manager.new_set("s", DIMS, PRECISION, 5).await.unwrap();
    manager.add_feature("s", &[f1()]).await.unwrap();

    let short = util::value_of_f32(&[1.0, 2.0]);
    assert!(matches!(
        manager.search("s", 0.0, 1, &[short]).await.unwrap_err(),
        Error::MismatchDimension { got: 8, .. }
    ));
}
