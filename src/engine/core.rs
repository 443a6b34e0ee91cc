//! GPU cores: the workers that execute search jobs.
//!
//! Each core owns one block-sized window of the manager's device allocation
//! plus its own input/output scratch and BLAS handle, and consumes jobs from
//! a bounded queue. Blocks are routed to cores by `index % cores`, so a given
//! block always replays onto the same core; the core caches that block's
//! bytes in its device window keyed by ⟨index, version⟩ and only re-uploads
//! when either changes. Mutations on the CPU side therefore cost nothing at
//! mutation time; the next search through the version check pays for the
//! refresh.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::config::DEFAULT_SEARCH_QUEUE_SIZE;
use crate::engine::block::Block;
use crate::error::{Error, Result};
use crate::feature::SearchResult;
use crate::gpu::{BlasHandle, DeviceRuntime, GemmOp};
use crate::util;

/// One unit of search work: score `batch` query columns against one block.
pub struct SearchJob {
    pub block: Arc<Block>,
    /// Device buffer holding the concatenated query columns (d x b,
    /// column-major).
    pub input: Buffer,
    pub batch: usize,
    pub limit: usize,
    pub reply: mpsc::Sender<JobReply>,
}

/// Reply envelope for one job.
pub struct JobReply {
    /// Per-query partial results against this job's block.
    pub partials: Result<Vec<Vec<SearchResult>>>,
    pub timings: JobTimings,
}

/// Where a job spent its time.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobTimings {
    /// Host-to-device residency refresh, zero on a cache hit.
    pub refill: Duration,
    pub sgemm: Duration,
    pub readback: Duration,
}

/// Residency markers and counters shared between a worker and observers.
struct CoreShared {
    resident_index: AtomicI64,
    resident_version: AtomicU64,
    refills: AtomicU64,
    handled_jobs: AtomicU64,
}

/// Handle to one spawned core worker.
pub struct Core {
    id: usize,
    queue: mpsc::Sender<SearchJob>,
    shared: Arc<CoreShared>,
}

impl Core {
    /// Allocate the core's device-side state and spawn its dispatch loop.
    /// `buffer` is the core's block-sized window of the manager's device
    /// allocation.
    pub fn spawn(
        id: usize,
        runtime: Arc<DeviceRuntime>,
        buffer: Buffer,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        use crate::config::{MAX_BATCH, MAX_DIMENSION, MAX_PRECISION, MIN_DIMENSION};

        let input_scratch = runtime.alloc(MAX_BATCH * MAX_DIMENSION * MAX_PRECISION)?;
        let output_scratch = runtime.alloc(buffer.size() / MIN_DIMENSION * MAX_BATCH)?;
        let handle = runtime.new_blas_handle()?;

        let (queue, jobs) = mpsc::channel(DEFAULT_SEARCH_QUEUE_SIZE);
        let shared = Arc::new(CoreShared {
            resident_index: AtomicI64::new(-1),
            resident_version: AtomicU64::new(0),
            refills: AtomicU64::new(0),
            handled_jobs: AtomicU64::new(0),
        });

        let worker = CoreWorker {
            id,
            runtime,
            buffer,
            input_scratch,
            output_scratch,
            handle,
            shared: Arc::clone(&shared),
            jobs,
            shutdown,
        };
        tokio::spawn(worker.run());

        Ok(Self { id, queue, shared })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueue a job; fails once the worker has shut down.
    pub async fn submit(&self, job: SearchJob) -> Result<()> {
        self.queue
            .send(job)
            .await
            .map_err(|_| Error::SearchUnavailable)
    }

    /// Index of the block currently mirrored in the core's device window.
    pub fn resident_index(&self) -> Option<usize> {
        let index = self.shared.resident_index.load(Ordering::Acquire);
        (index >= 0).then_some(index as usize)
    }

    /// Version of the resident block image.
    pub fn resident_version(&self) -> u64 {
        self.shared.resident_version.load(Ordering::Acquire)
    }

    /// Number of host-to-device residency refreshes performed.
    pub fn refill_count(&self) -> u64 {
        self.shared.refills.load(Ordering::Acquire)
    }

    /// Number of jobs this core has completed.
    pub fn handled_jobs(&self) -> u64 {
        self.shared.handled_jobs.load(Ordering::Acquire)
    }
}

struct CoreWorker {
    id: usize,
    runtime: Arc<DeviceRuntime>,
    buffer: Buffer,
    input_scratch: Buffer,
    output_scratch: Buffer,
    handle: BlasHandle,
    shared: Arc<CoreShared>,
    jobs: mpsc::Receiver<SearchJob>,
    shutdown: watch::Receiver<bool>,
}

impl CoreWorker {
    async fn run(mut self) {
        debug!(
            core = self.id,
            block_window = self.buffer.size(),
            input_scratch = self.input_scratch.size(),
            output_scratch = self.output_scratch.size(),
            "core worker online"
        );
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                job = self.jobs.recv() => {
                    let Some(job) = job else { break };
                    self.handle_job(job).await;
                }
            }
        }
        debug!(core = self.id, "core worker stopped");
    }

    async fn handle_job(&mut self, job: SearchJob) {
        let mut timings = JobTimings::default();

        // Residency check: refresh the device mirror when either the block
        // index or its version moved since the last job.
        let index = job.block.index() as i64;
        let version = job.block.version();
        if self.shared.resident_index.load(Ordering::Acquire) != index
            || self.shared.resident_version.load(Ordering::Acquire) != version
        {
            let start = Instant::now();
            if let Err(e) = self.buffer.copy(job.block.buffer()) {
                let _ = job
                    .reply
                    .send(JobReply {
                        partials: Err(Error::WriteInputBuffer(e.to_string())),
                        timings,
                    })
                    .await;
                return;
            }
            timings.refill = start.elapsed();
            self.shared.resident_index.store(index, Ordering::Release);
            self.shared
                .resident_version
                .store(version, Ordering::Release);
            self.shared.refills.fetch_add(1, Ordering::Release);
            trace!(
                core = self.id,
                block = job.block.index(),
                version,
                "residency refresh"
            );
        }

        let partials = self.search(&job, &mut timings);
        self.shared.handled_jobs.fetch_add(1, Ordering::Release);
        let _ = job.reply.send(JobReply { partials, timings }).await;
    }

    /// Score every query column against the resident block and keep the best
    /// `limit` hits per column.
    fn search(&mut self, job: &SearchJob, timings: &mut JobTimings) -> Result<Vec<Vec<SearchResult>>> {
        let (height, dims, _precision) = job.block.shape();
        if height == 0 {
            return Ok(Vec::new());
        }
        let batch = job.batch;

        let needed = height * batch * 4;
        self.ensure_output_capacity(needed)?;

        let input = job.input.as_device()?;
        let block_matrix = self.buffer.as_device()?;
        let output = self.output_scratch.as_device()?;

        // C[h x b] = Block[h x d] . Queries^T[d x b]: each column of C is one
        // query's scores against all block rows.
        let start = Instant::now();
        self.runtime.sgemm(
            &self.handle,
            GemmOp::Transpose,
            GemmOp::None,
            height,
            batch,
            dims,
            1.0,
            block_matrix,
            dims,
            input,
            dims,
            0.0,
            output,
            height,
        )?;
        timings.sgemm += start.elapsed();

        let start = Instant::now();
        let score_bytes = self
            .output_scratch
            .slice(0, needed)
            .map_err(|_| Error::SliceBuffer)?
            .read()
            .map_err(|e| Error::WriteOutputBuffer(e.to_string()))?;
        timings.readback += start.elapsed();
        let scores = util::f32_of_value(&score_bytes)?;

        let mut partials = Vec::with_capacity(batch);
        for q in 0..batch {
            let column = &scores[q * height..(q + 1) * height];
            let top = util::top_n_scores(column, job.limit);
            let slots: Vec<usize> = top.iter().map(|&(slot, _)| slot).collect();
            let ids = job.block.ids_at(&slots);
            let row: Vec<SearchResult> = top
                .iter()
                .zip(ids)
                .filter(|(_, id)| !id.is_empty())
                .map(|(&(_, score), id)| SearchResult { score, id })
                .collect();
            partials.push(row);
        }
        Ok(partials)
    }

    fn ensure_output_capacity(&mut self, needed: usize) -> Result<()> {
        if needed <= self.output_scratch.size() {
            return Ok(());
        }
        debug!(
            core = self.id,
            current = self.output_scratch.size(),
            needed,
            "growing output scratch"
        );
        self.output_scratch = self
            .runtime
            .alloc(needed)
            .map_err(|e| Error::WriteOutputBuffer(e.to_string()))?;
        Ok(())
    }
}
