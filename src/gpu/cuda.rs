//! CUDA device runtime (cudarc + cuBLAS), enabled by the `cuda` feature.
//!
//! One context/stream pair per runtime; allocations are `CudaSlice<u8>`
//! regions and SGEMM goes through the raw cuBLAS binding so the call shape
//! matches the engine's column-major `(op, m, n, k, ld*)` contract exactly.

use std::sync::{Arc, Mutex, PoisonError};

use cudarc::cublas::{result as cublas, sys, CudaBlas};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr, DevicePtrMut};
use tracing::{debug, info};

use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::gpu::{BlasHandle, DeviceMemory, GemmOp, HandleInner};

pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    total_mem: usize,
}

impl GemmOp {
    fn to_cublas(self) -> sys::cublasOperation_t {
        match self {
            GemmOp::None => sys::cublasOperation_t::CUBLAS_OP_N,
            GemmOp::Transpose => sys::cublasOperation_t::CUBLAS_OP_T,
        }
    }
}

impl CudaDevice {
    pub fn open(gpu_id: usize) -> Result<Self> {
        let count = CudaContext::device_count()
            .map_err(|e| Error::AllocateGpuBuffer(e.to_string()))? as usize;
        if gpu_id >= count {
            return Err(Error::InvalidDeviceId(gpu_id));
        }

        let ctx =
            CudaContext::new(gpu_id).map_err(|e| Error::AllocateGpuBuffer(e.to_string()))?;
        let stream = ctx.default_stream();

        let (_free, total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| Error::AllocateGpuBuffer(e.to_string()))?;

        info!(gpu = gpu_id, total_mem = total, "opened cuda device runtime");

        Ok(Self {
            ctx,
            stream,
            total_mem: total,
        })
    }

    pub fn total_mem(&self) -> usize {
        self.total_mem
    }

    pub fn alloc(&self, len: usize) -> Result<DeviceMemory> {
        let slice: CudaSlice<u8> = self
            .stream
            .alloc_zeros(len)
            .map_err(|e| Error::AllocateGpuMemory(e.to_string()))?;
        debug!(bytes = len, ordinal = self.ctx.ordinal(), "allocated device memory");
        Ok(DeviceMemory::Cuda(Mutex::new(slice)))
    }

    pub fn new_blas_handle(&self) -> Result<BlasHandle> {
        let blas = CudaBlas::new(self.stream.clone())
            .map_err(|e| Error::AllocateGpuBuffer(e.to_string()))?;
        Ok(BlasHandle {
            inner: HandleInner::Cuda(blas),
        })
    }

    fn slice_of(mem: &DeviceMemory) -> Result<&Mutex<CudaSlice<u8>>> {
        match mem {
            DeviceMemory::Cuda(slice) => Ok(slice),
            DeviceMemory::Emulated(_) => Err(Error::InvalidBufferType {
                expected: "cuda device",
            }),
        }
    }

    pub fn write(&self, mem: &DeviceMemory, offset: usize, bytes: &[u8]) -> Result<()> {
        let store = Self::slice_of(mem)?;
        let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = guard.slice_mut(offset..offset + bytes.len());
        self.stream
            .memcpy_htod(bytes, &mut view)
            .map_err(|e| Error::WriteCudaBuffer(e.to_string()))
    }

    pub fn read(&self, mem: &DeviceMemory, offset: usize, len: usize) -> Result<Vec<u8>> {
        let store = Self::slice_of(mem)?;
        let guard = store.lock().unwrap_or_else(PoisonError::into_inner);
        let view = guard.slice(offset..offset + len);
        let mut host = vec![0u8; len];
        self.stream
            .memcpy_dtoh(&view, &mut host)
            .map_err(|e| Error::WriteCudaBuffer(e.to_string()))?;
        Ok(host)
    }

    pub fn copy_dtod(
        &self,
        dst: &DeviceMemory,
        dst_offset: usize,
        src: &DeviceMemory,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        let dst_store = Self::slice_of(dst)?;
        let src_store = Self::slice_of(src)?;

        if std::ptr::eq(dst_store, src_store) {
            // Same allocation: stage through the host to keep the copy simple.
            let bytes = self.read(src, src_offset, len)?;
            return self.write(dst, dst_offset, &bytes);
        }

        let src_guard = src_store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dst_guard = dst_store.lock().unwrap_or_else(PoisonError::into_inner);
        let src_view = src_guard.slice(src_offset..src_offset + len);
        let mut dst_view = dst_guard.slice_mut(dst_offset..dst_offset + len);
        self.stream
            .memcpy_dtod(&src_view, &mut dst_view)
            .map_err(|e| Error::WriteCudaBuffer(e.to_string()))
    }

    pub fn memset_zero(&self, mem: &DeviceMemory, offset: usize, len: usize) -> Result<()> {
        let store = Self::slice_of(mem)?;
        let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = guard.slice_mut(offset..offset + len);
        self.stream
            .memset_zeros(&mut view)
            .map_err(|e| Error::ClearCudaBuffer(e.to_string()))
    }

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
        let blas = match &handle.inner {
            HandleInner::Cuda(blas) => blas,
            HandleInner::Emulated => {
                return Err(Error::InvalidBufferType {
                    expected: "cuda blas handle",
                })
            }
        };

        let a_store = Self::slice_of(a.memory())?;
        let b_store = Self::slice_of(b.memory())?;
        let c_store = Self::slice_of(c.memory())?;

        let a_guard = a_store.lock().unwrap_or_else(PoisonError::into_inner);
        let b_guard = b_store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut c_guard = c_store.lock().unwrap_or_else(PoisonError::into_inner);

        let (a_ptr, _a_sync) = a_guard.device_ptr(&self.stream);
        let (b_ptr, _b_sync) = b_guard.device_ptr(&self.stream);
        let (c_ptr, _c_sync) = c_guard.device_ptr_mut(&self.stream);

        unsafe {
            cublas::sgemm(
                *blas.handle(),
                op_a.to_cublas(),
                op_b.to_cublas(),
                m as i32,
                n as i32,
                k as i32,
                &alpha as *const f32,
                (a_ptr + a.offset() as u64) as *const f32,
                lda as i32,
                (b_ptr + b.offset() as u64) as *const f32,
                ldb as i32,
                &beta as *const f32,
                (c_ptr + c.offset() as u64) as *mut f32,
                ldc as i32,
            )
            .map_err(|e| Error::WriteOutputBuffer(e.to_string()))?;
        }

        self.stream
            .synchronize()
            .map_err(|e| Error::WriteOutputBuffer(e.to_string()))
    }
}
