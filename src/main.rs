//! vecscan demo: load a set with random normalized vectors, then verify that
//! searching any stored vector returns itself as the top hit.

use std::time::Instant;

use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use tracing::{error, info};

use vecscan::config::{Cli, EngineConfig};
use vecscan::util;
use vecscan::{Feature, FeatureValue, Manager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "vecscan=debug"
    } else {
        "vecscan=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("vecscan v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load(&cli.config)?;
    info!(
        gpu_id = config.gpu_id,
        gpu_mem = config.gpu_mem,
        block_num = config.block_num,
        block_size = config.block_size,
        cores = config.core_num(),
        "configuration loaded"
    );

    let manager = Manager::new(
        config.gpu_id,
        config.gpu_mem,
        config.block_num,
        config.block_size,
    )?;
    manager.new_set("demo", cli.dims, 4, cli.batch).await?;

    // Load random normalized vectors in chunks.
    let mut rng = rand::thread_rng();
    let mut features = Vec::with_capacity(cli.count);
    for i in 0..cli.count {
        let components: Vec<f32> = (0..cli.dims).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        features.push(Feature::from_f32(
            format!("feat-{i:08}"),
            &util::normalize(&components),
        ));
    }

    let start = Instant::now();
    for chunk in features.chunks(1024) {
        manager.add_feature("demo", chunk).await?;
    }
    info!(
        count = cli.count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "set loaded"
    );

    // Self-match rounds: each stored vector must come back as its own top hit.
    let start = Instant::now();
    let mut hits = 0usize;
    for round in 0..cli.rounds {
        let picks: Vec<&Feature> = (0..cli.batch)
            .map(|_| &features[rng.gen_range(0..features.len())])
            .collect();
        let queries: Vec<FeatureValue> = picks.iter().map(|f| f.value.clone()).collect();

        let results = manager.search("demo", 0.0, 1, &queries).await?;
        for (pick, row) in picks.iter().zip(&results) {
            match row.first() {
                Some(top) if top.id == pick.id => hits += 1,
                Some(top) => error!(round, expected = %pick.id, got = %top.id, "top hit mismatch"),
                None => error!(round, expected = %pick.id, "no result"),
            }
        }
    }
    let elapsed = start.elapsed();
    let total = cli.rounds * cli.batch;
    info!(
        rounds = cli.rounds,
        hits,
        total,
        elapsed_ms = elapsed.as_millis() as u64,
        qps = (total as f64 / elapsed.as_secs_f64()) as u64,
        "search rounds complete"
    );

    // One concurrent burst to exercise the fan-out from parallel callers.
    let queries: Vec<FeatureValue> = (0..cli.batch)
        .map(|_| features[rng.gen_range(0..features.len())].value.clone())
        .collect();
    let burst = join_all((0..8).map(|_| manager.search("demo", 0.0, 1, &queries))).await;
    for result in burst {
        result?;
    }
    info!("concurrent burst complete");

    manager.shutdown();
    Ok(())
}
