//! vecscan: in-memory GPU-accelerated brute-force vector similarity search.
//!
//! Clients organize fixed-dimension feature vectors into named sets; each set
//! supports inserts, deletes, and batched top-K similarity queries scored by
//! SGEMM over every vector it contains: an exact scanner, no approximate
//! index. A finite pool of host blocks is partitioned among sets, a smaller
//! pool of GPU cores pipelines the per-block dot products, and version
//! counters keep each core's resident device mirror coherent with its CPU
//! block.
//!
//! The default build runs against a host-emulated device runtime; the `cuda`
//! feature switches to the real CUDA driver and cuBLAS via cudarc.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod feature;
pub mod gpu;
pub mod util;

pub use engine::manager::Manager;
pub use error::{Error, Result};
pub use feature::{Feature, FeatureId, FeatureScore, FeatureValue, SearchResult};
