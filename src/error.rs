//! Engine error types.
//!
//! One central enum carrying every failure the engine can surface. Nothing is
//! retried internally and nothing is swallowed: every operation returns an
//! explicit tag and callers decide what to do with it. The one documented
//! exception is delete/update skipping unknown feature IDs, which is reported
//! through the returned ID list rather than an error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Buffer errors.
    #[error("buffer write out of range: {len} bytes into a {size}-byte buffer")]
    BufferWriteOutOfRange { len: usize, size: usize },

    #[error("buffer copy out of range: {src}-byte source into a {dst}-byte buffer")]
    BufferCopyOutOfRange { src: usize, dst: usize },

    #[error("buffer slice out of range: [{start}, {end}) of {size}")]
    BufferSliceOutOfRange {
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("operation requires a {expected} buffer")]
    InvalidBufferType { expected: &'static str },

    #[error("buffer data is not a whole number of {precision}-byte scalars")]
    InvalidBufferData { precision: usize },

    // Manager initialization errors.
    #[error("failed to allocate gpu buffer: {0}")]
    AllocateGpuBuffer(String),

    #[error("failed to slice gpu buffer into core windows")]
    SliceGpuBuffer,

    #[error("requested {requested} bytes of gpu memory, at most {usable} usable")]
    TooMuchGpuMemory { requested: usize, usable: usize },

    #[error("failed to allocate gpu memory: {0}")]
    AllocateGpuMemory(String),

    #[error("invalid gpu device id {0}")]
    InvalidDeviceId(usize),

    // Block errors.
    #[error("block is full")]
    BlockFull,

    #[error("block {index} is already owned by set {owner:?}")]
    BlockAlreadyUsed { index: usize, owner: String },

    // Cache errors.
    #[error("cache does not have enough free blocks: requested {requested}, free {free}")]
    NotEnoughBlocks { requested: usize, free: usize },

    // Set / manager errors.
    #[error("feature set {0:?} already exists")]
    FeatureSetExists(String),

    #[error("feature set {0:?} not found")]
    FeatureSetNotFound(String),

    #[error("invalid set state: {0}")]
    InvalidSetState(String),

    #[error("invalid features in request: {0}")]
    InvalidFeatures(String),

    #[error("search batch {requested} exceeds the set limit {limit}")]
    OutOfBatch { requested: usize, limit: usize },

    #[error("feature value is {got} bytes, expected {expected} (dims x precision)")]
    MismatchDimension { got: usize, expected: usize },

    #[error("batch {requested} exceeds the global limit {limit}")]
    BatchTooLarge { requested: usize, limit: usize },

    #[error("search is unavailable: manager was constructed without gpu memory")]
    SearchUnavailable,

    // Core / search errors.
    #[error("failed to write search input buffer: {0}")]
    WriteInputBuffer(String),

    #[error("failed to write search output buffer: {0}")]
    WriteOutputBuffer(String),

    #[error("failed to slice device buffer")]
    SliceBuffer,

    #[error("failed to write device buffer: {0}")]
    WriteCudaBuffer(String),

    #[error("failed to clear device buffer: {0}")]
    ClearCudaBuffer(String),

    // Utility errors.
    #[error("cannot transpose values that are not a whole number of scalars")]
    BadTransposeValue,
}
