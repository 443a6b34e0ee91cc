//! Device runtime: the engine's view of the GPU.
//!
//! The engine only needs a handful of primitives: zeroed allocation, H↔D/D↔D
//! copies, memset, and a column-major SGEMM bound to a BLAS handle. Two
//! backends provide them:
//!
//! - [`emulated`]: host memory plus a reference SGEMM. The default build uses
//!   this backend, so the full engine (and every test) runs on machines
//!   without a GPU.
//! - [`cuda`]: CUDA driver + cuBLAS through cudarc, behind the `cuda` feature.

pub mod emulated;

#[cfg(feature = "cuda")]
pub mod cuda;

use std::sync::Arc;

use crate::buffer::{Buffer, DeviceBuffer};
use crate::error::Result;

/// Transpose flag for one SGEMM operand, column-major BLAS semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmOp {
    None,
    Transpose,
}

/// Raw device memory backing one allocation. Buffers alias into an
/// allocation through `(offset, len)` windows; the allocation is freed when
/// the last window drops.
pub enum DeviceMemory {
    Emulated(std::sync::RwLock<Box<[u8]>>),
    #[cfg(feature = "cuda")]
    Cuda(std::sync::Mutex<cudarc::driver::CudaSlice<u8>>),
}

/// A BLAS handle bound to the runtime's device context.
pub struct BlasHandle {
    pub(crate) inner: HandleInner,
}

pub(crate) enum HandleInner {
    Emulated,
    #[cfg(feature = "cuda")]
    Cuda(cudarc::cublas::CudaBlas),
}

/// The device runtime the manager and cores run against.
pub struct DeviceRuntime {
    backend: Backend,
}

enum Backend {
    Emulated(emulated::EmulatedDevice),
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaDevice),
}

impl DeviceRuntime {
    /// Open the runtime bound to the given device ordinal.
    pub fn open(gpu_id: usize) -> Result<Arc<Self>> {
        #[cfg(feature = "cuda")]
        {
            Ok(Arc::new(Self {
                backend: Backend::Cuda(cuda::CudaDevice::open(gpu_id)?),
            }))
        }

        #[cfg(not(feature = "cuda"))]
        {
            Ok(Arc::new(Self {
                backend: Backend::Emulated(emulated::EmulatedDevice::open(gpu_id)?),
            }))
        }
    }

    /// Total memory of the underlying device, in bytes.
    pub fn total_mem(&self) -> usize {
        match &self.backend {
            Backend::Emulated(dev) => dev.total_mem(),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.total_mem(),
        }
    }

    /// Allocate a zeroed device buffer of `len` bytes.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Result<Buffer> {
        let mem = match &self.backend {
            Backend::Emulated(dev) => dev.alloc(len)?,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.alloc(len)?,
        };
        Ok(Buffer::Device(DeviceBuffer::new(
            Arc::clone(self),
            Arc::new(mem),
            0,
            len,
        )))
    }

    /// Create a BLAS handle bound to this runtime's context.
    pub fn new_blas_handle(&self) -> Result<BlasHandle> {
        match &self.backend {
            Backend::Emulated(_) => Ok(BlasHandle {
                inner: HandleInner::Emulated,
            }),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.new_blas_handle(),
        }
    }

    pub(crate) fn write_bytes(
        &self,
        mem: &DeviceMemory,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        match &self.backend {
            Backend::Emulated(dev) => dev.write(mem, offset, bytes),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.write(mem, offset, bytes),
        }
    }

    pub(crate) fn read_bytes(
        &self,
        mem: &DeviceMemory,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::Emulated(dev) => dev.read(mem, offset, len),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.read(mem, offset, len),
        }
    }

    pub(crate) fn copy_dtod(
        &self,
        dst: &DeviceMemory,
        dst_offset: usize,
        src: &DeviceMemory,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        match &self.backend {
            Backend::Emulated(dev) => dev.copy_dtod(dst, dst_offset, src, src_offset, len),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.copy_dtod(dst, dst_offset, src, src_offset, len),
        }
    }

    pub(crate) fn memset_zero(&self, mem: &DeviceMemory, offset: usize, len: usize) -> Result<()> {
        match &self.backend {
            Backend::Emulated(dev) => dev.memset_zero(mem, offset, len),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.memset_zero(mem, offset, len),
        }
    }

    /// Column-major `C = alpha * op(A) * op(B) + beta * C`, f32 operands.
    #[allow(clippy::too_many_arguments)]
    pub fn sgemm(
        &self,
        handle: &BlasHandle,
        op_a: GemmOp,
        op_b: GemmOp,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &DeviceBuffer,
        lda: usize,
        b: &DeviceBuffer,
        ldb: usize,
        beta: f32,
        c: &DeviceBuffer,
        ldc: usize,
    ) -> Result<()> {
        match &self.backend {
            Backend::Emulated(dev) => {
                dev.sgemm(handle, op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => {
                dev.sgemm(handle, op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
            }
        }
    }
}

#[cfg(not(feature = "cuda"))]
impl DeviceRuntime {
    /// Whether this runtime is the host-emulated backend.
    pub fn is_emulated(&self) -> bool {
        true
    }
}

#[cfg(feature = "cuda")]
impl DeviceRuntime {
    /// Whether this runtime is the host-emulated backend.
    pub fn is_emulated(&self) -> bool {
        false
    }
}
