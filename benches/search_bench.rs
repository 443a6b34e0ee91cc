//! Search throughput benchmarks against the host-emulated device runtime.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;
use tokio::runtime::Runtime;
use vecscan::util;
use vecscan::{Feature, FeatureValue, Manager};

const DIMS: usize = 512;
const PRECISION: usize = 4;
const COUNT: usize = 1000;

/// 2000 vectors per block.
const BLOCK_SIZE: usize = 2000 * DIMS * PRECISION;

fn setup(rt: &Runtime) -> (Manager, Vec<Feature>) {
    let manager = rt
        .block_on(async { Manager::new(0, BLOCK_SIZE, 4, BLOCK_SIZE) })
        .unwrap();
    rt.block_on(manager.new_set("bench", DIMS, PRECISION, 16))
        .unwrap();

    let mut rng = rand::thread_rng();
    let features: Vec<Feature> = (0..COUNT)
        .map(|i| {
            let components: Vec<f32> = (0..DIMS).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
            Feature::from_f32(format!("feat-{i:06}"), &util::normalize(&components))
        })
        .collect();
    rt.block_on(manager.add_feature("bench", &features)).unwrap();
    (manager, features)
}

fn bench_search_one_in_1000(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (manager, features) = setup(&rt);
    let queries = vec![features[COUNT / 2].value.clone()];

    c.bench_function("search_1_in_1000_d512", |b| {
        b.iter(|| {
            let ret = rt
                .block_on(manager.search("bench", 0.0, 1, black_box(&queries)))
                .unwrap();
            black_box(ret);
        })
    });
}

fn bench_search_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (manager, features) = setup(&rt);
    let queries: Vec<FeatureValue> = features[..8].iter().map(|f| f.value.clone()).collect();

    c.bench_function("search_8_in_1000_d512", |b| {
        b.iter(|| {
            let ret = rt
                .block_on(manager.search("bench", 0.0, 5, black_box(&queries)))
                .unwrap();
            black_box(ret);
        })
    });
}

criterion_group!(benches, bench_search_one_in_1000, bench_search_batch);
criterion_main!(benches);
