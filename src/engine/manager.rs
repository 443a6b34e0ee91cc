//! The engine facade: sets by name, the block cache, and the core pool.
//!
//! The manager owns one device allocation of `gpu_mem` bytes sliced into
//! block-sized core windows, one long-lived core worker per window, and the
//! host-side block cache. Searches fan out one job per block of the target
//! set, routed by `block.index % cores`, and merge the per-block partials
//! into a global per-query top-K.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

use crate::config::MAX_BATCH;
use crate::engine::cache::Cache;
use crate::engine::core::{Core, JobTimings, SearchJob};
use crate::engine::set::Set;
use crate::error::{Error, Result};
use crate::feature::{Feature, FeatureId, FeatureScore, FeatureValue, SearchResult};
use crate::gpu::DeviceRuntime;
use crate::util;

pub struct Manager {
    sets: RwLock<HashMap<String, Arc<Set>>>,
    cores: Vec<Core>,
    cache: Arc<Cache>,
    runtime: Option<Arc<DeviceRuntime>>,
    shutdown: watch::Sender<bool>,
}

impl Manager {
    /// Build the engine: open the device, allocate and slice the core pool,
    /// spawn the workers, and construct the host block cache.
    ///
    /// With `gpu_mem == 0` no device state is created: set and block
    /// management work, searches fail with [`Error::SearchUnavailable`].
    /// Must be called within a tokio runtime (core workers are tasks).
    pub fn new(gpu_id: usize, gpu_mem: usize, block_num: usize, block_size: usize) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut cores = Vec::new();
        let mut runtime = None;
        if gpu_mem > 0 {
            let rt = DeviceRuntime::open(gpu_id)?;
            let usable = (rt.total_mem() as f64 * 0.95) as usize;
            if gpu_mem > usable {
                return Err(Error::TooMuchGpuMemory {
                    requested: gpu_mem,
                    usable,
                });
            }

            let pool = rt.alloc(gpu_mem)?;
            let core_num = gpu_mem / block_size;
            for id in 0..core_num {
                let window = pool
                    .slice(id * block_size, (id + 1) * block_size)
                    .map_err(|_| Error::SliceGpuBuffer)?;
                cores.push(Core::spawn(
                    id,
                    Arc::clone(&rt),
                    window,
                    shutdown_rx.clone(),
                )?);
            }
            info!(
                gpu = gpu_id,
                gpu_mem,
                cores = cores.len(),
                emulated = rt.is_emulated(),
                "core pool online"
            );
            runtime = Some(rt);
        }

        let cache = Arc::new(Cache::new(block_num, block_size));

        Ok(Self {
            sets: RwLock::new(HashMap::new()),
            cores,
            cache,
            runtime,
            shutdown,
        })
    }

    /// Stop every core worker at its next message boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The core pool, in routing order.
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// The host block pool.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    async fn set(&self, name: &str) -> Result<Arc<Set>> {
        self.sets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::FeatureSetNotFound(name.to_string()))
    }

    /// Register a new named set. No blocks are acquired until the first add.
    pub async fn new_set(
        &self,
        name: &str,
        dims: usize,
        precision: usize,
        batch: usize,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidSetState("set name must not be empty".into()));
        }
        if dims == 0 || !matches!(precision, 2 | 4 | 8) {
            return Err(Error::InvalidSetState(format!(
                "unsupported shape: dims {dims}, precision {precision}"
            )));
        }
        if dims * precision > self.cache.block_size() {
            return Err(Error::InvalidSetState(format!(
                "one {dims}x{precision} vector does not fit a {}-byte block",
                self.cache.block_size()
            )));
        }

        let mut sets = self.sets.write().await;
        if sets.contains_key(name) {
            return Err(Error::FeatureSetExists(name.to_string()));
        }
        sets.insert(
            name.to_string(),
            Arc::new(Set::new(name, dims, precision, batch, Arc::clone(&self.cache))),
        );
        info!(set = name, dims, precision, batch, "set created");
        Ok(())
    }

    /// Remove a set and release every block it owns.
    pub async fn destroy_set(&self, name: &str) -> Result<()> {
        let set = self
            .sets
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::FeatureSetNotFound(name.to_string()))?;
        set.destroy()?;
        info!(set = name, "set destroyed");
        Ok(())
    }

    /// Shape of a set: (dims, precision, batch).
    pub async fn get_set(&self, name: &str) -> Result<(usize, usize, usize)> {
        let set = self.set(name).await?;
        Ok((set.dims(), set.precision(), set.batch()))
    }

    /// Change a set's search batch limit.
    pub async fn update_set(&self, name: &str, batch: usize) -> Result<()> {
        if batch > MAX_BATCH {
            return Err(Error::BatchTooLarge {
                requested: batch,
                limit: MAX_BATCH,
            });
        }
        let set = self.set(name).await?;
        set.set_batch(batch);
        Ok(())
    }

    pub async fn add_feature(&self, name: &str, features: &[Feature]) -> Result<()> {
        let set = self.set(name).await?;
        set.add(features)
    }

    pub async fn delete_feature(&self, name: &str, ids: &[FeatureId]) -> Result<Vec<FeatureId>> {
        let set = self.set(name).await?;
        set.delete(ids)
    }

    pub async fn update_feature(&self, name: &str, features: &[Feature]) -> Result<Vec<FeatureId>> {
        let set = self.set(name).await?;
        set.update(features)
    }

    pub async fn read_feature(&self, name: &str, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        let set = self.set(name).await?;
        set.read(ids)
    }

    /// Batched top-K search: one job per block of the set, fanned out over
    /// the cores, merged into a `queries.len() x <=limit` result matrix
    /// sorted by descending score per row. Results below `threshold` are
    /// dropped. Any per-block failure poisons the whole call; the first
    /// error is returned after the reply channel drains.
    pub async fn search(
        &self,
        name: &str,
        threshold: FeatureScore,
        limit: usize,
        queries: &[FeatureValue],
    ) -> Result<Vec<Vec<SearchResult>>> {
        let set = self.set(name).await?;

        let batch = queries.len();
        if batch == 0 {
            return Ok(Vec::new());
        }
        if batch > set.batch() {
            return Err(Error::OutOfBatch {
                requested: batch,
                limit: set.batch(),
            });
        }
        let value_len = set.dims() * set.precision();
        for query in queries {
            if query.len() != value_len {
                return Err(Error::MismatchDimension {
                    got: query.len(),
                    expected: value_len,
                });
            }
        }

        let Some(runtime) = &self.runtime else {
            return Err(Error::SearchUnavailable);
        };
        if self.cores.is_empty() {
            return Err(Error::SearchUnavailable);
        }

        let blocks = set.blocks_snapshot();
        if blocks.is_empty() {
            return Ok(vec![Vec::new(); batch]);
        }

        // One device upload per call. Plain concatenation already is the
        // d x b column-major query matrix: with ldb = dims and opB = NoTrans,
        // column c is exactly bytes [c*dims*precision, (c+1)*dims*precision).
        // No transpose is involved.
        let packed = util::pack_values(queries);
        let input = runtime.alloc(packed.len())?;
        input
            .write(&packed)
            .map_err(|e| Error::WriteInputBuffer(e.to_string()))?;

        let (reply_tx, mut replies) = mpsc::channel(blocks.len());
        for block in &blocks {
            let core = &self.cores[block.index() % self.cores.len()];
            core.submit(SearchJob {
                block: Arc::clone(block),
                input: input.clone(),
                batch,
                limit,
                reply: reply_tx.clone(),
            })
            .await?;
        }
        drop(reply_tx);

        let mut accumulators: Vec<Vec<SearchResult>> = vec![Vec::new(); batch];
        let mut first_err: Option<Error> = None;
        let mut totals = JobTimings::default();
        for _ in 0..blocks.len() {
            let Some(reply) = replies.recv().await else {
                first_err.get_or_insert(Error::SearchUnavailable);
                break;
            };
            totals.refill += reply.timings.refill;
            totals.sgemm += reply.timings.sgemm;
            totals.readback += reply.timings.readback;
            match reply.partials {
                Ok(partials) => {
                    for (q, row) in partials.into_iter().enumerate() {
                        accumulators[q].extend(row.into_iter().filter(|r| r.score >= threshold));
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        debug!(
            set = name,
            batch,
            blocks = blocks.len(),
            refill_us = totals.refill.as_micros() as u64,
            sgemm_us = totals.sgemm.as_micros() as u64,
            readback_us = totals.readback.as_micros() as u64,
            "search complete"
        );

        Ok(accumulators
            .into_iter()
            .map(|row| util::top_n_results(row, limit))
            .collect())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
