//! Host-emulated device runtime.
//!
//! Device allocations are locked host byte arrays and SGEMM is a reference
//! column-major implementation in f32. This backend honors the same contract
//! as the CUDA backend (zeroed allocation, explicit H↔D/D↔D copies, BLAS op
//! flags and leading dimensions), so the scheduler, residency caching, and
//! every integration test run unchanged on machines without a GPU.

use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::gpu::{BlasHandle, DeviceMemory, GemmOp};

/// Reported device memory of the virtual device.
pub const EMULATED_TOTAL_MEM: usize = 2 * 1024 * 1024 * 1024;

pub struct EmulatedDevice {
    gpu_id: usize,
}

impl EmulatedDevice {
    pub fn open(gpu_id: usize) -> Result<Self> {
        debug!(gpu = gpu_id, "opening host-emulated device runtime");
        Ok(Self { gpu_id })
    }

    pub fn total_mem(&self) -> usize {
        EMULATED_TOTAL_MEM
    }

    pub fn alloc(&self, len: usize) -> Result<DeviceMemory> {
        if len > EMULATED_TOTAL_MEM {
            return Err(Error::AllocateGpuMemory(format!(
                "emulated device {} has {} bytes, requested {}",
                self.gpu_id, EMULATED_TOTAL_MEM, len
            )));
        }
        Ok(DeviceMemory::Emulated(RwLock::new(
            vec![0u8; len].into_boxed_slice(),
        )))
    }

    fn bytes_of(mem: &DeviceMemory) -> Result<&RwLock<Box<[u8]>>> {
        match mem {
            DeviceMemory::Emulated(bytes) => Ok(bytes),
            #[cfg(feature = "cuda")]
            DeviceMemory::Cuda(_) => Err(Error::InvalidBufferType {
                expected: "emulated device",
            }),
        }
    }

    pub fn write(&self, mem: &DeviceMemory, offset: usize, bytes: &[u8]) -> Result<()> {
        let store = Self::bytes_of(mem)?;
        let mut guard = store.write().unwrap_or_else(PoisonError::into_inner);
        guard[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, mem: &DeviceMemory, offset: usize, len: usize) -> Result<Vec<u8>> {
        let store = Self::bytes_of(mem)?;
        let guard = store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard[offset..offset + len].to_vec())
    }

    pub fn copy_dtod(
        &self,
        dst: &DeviceMemory,
        dst_offset: usize,
        src: &DeviceMemory,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        let dst_store = Self::bytes_of(dst)?;
        let src_store = Self::bytes_of(src)?;

        // Aliasing windows of one allocation share the lock.
        if std::ptr::eq(dst_store, src_store) {
            let mut guard = dst_store.write().unwrap_or_else(PoisonError::into_inner);
            guard.copy_within(src_offset..src_offset + len, dst_offset);
            return Ok(());
        }

        let src_guard = src_store.read().unwrap_or_else(PoisonError::into_inner);
        let mut dst_guard = dst_store.write().unwrap_or_else(PoisonError::into_inner);
        dst_guard[dst_offset..dst_offset + len]
            .copy_from_slice(&src_guard[src_offset..src_offset + len]);
        Ok(())
    }

    pub fn memset_zero(&self, mem: &DeviceMemory, offset: usize, len: usize) -> Result<()> {
        let store = Self::bytes_of(mem)?;
        let mut guard = store.write().unwrap_or_else(PoisonError::into_inner);
        guard[offset..offset + len].fill(0);
        Ok(())
    }

    /// Reference column-major SGEMM. Operand bytes are copied out under the
    /// allocation locks, so A or B may alias C.
    #[allow(clippy::too_many_arguments)]
    pub fn sgemm(
        &self,
        _handle: &BlasHandle,
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
        // Physical operand extents: A is lda x (op? m : k), B is ldb x (op? k : n).
        let a_cols = if op_a == GemmOp::Transpose { m } else { k };
        let b_cols = if op_b == GemmOp::Transpose { k } else { n };

        let a_f32 = floats_of(self.read(a.memory(), a.offset(), a.size())?)?;
        let b_f32 = floats_of(self.read(b.memory(), b.offset(), b.size())?)?;

        if a_f32.len() < lda * a_cols || b_f32.len() < ldb * b_cols {
            return Err(Error::SliceBuffer);
        }

        let c_len = c.size() / 4;
        if c_len < ldc * n {
            return Err(Error::SliceBuffer);
        }

        let mut c_f32 = if beta != 0.0 {
            floats_of(self.read(c.memory(), c.offset(), c.size())?)?
        } else {
            vec![0.0f32; c_len]
        };

        for j in 0..n {
            for i in 0..m {
                let mut acc = 0.0f32;
                for l in 0..k {
                    let a_il = match op_a {
                        GemmOp::None => a_f32[i + l * lda],
                        GemmOp::Transpose => a_f32[l + i * lda],
                    };
                    let b_lj = match op_b {
                        GemmOp::None => b_f32[l + j * ldb],
                        GemmOp::Transpose => b_f32[j + l * ldb],
                    };
                    acc += a_il * b_lj;
                }
                let dst = i + j * ldc;
                c_f32[dst] = alpha * acc + beta * c_f32[dst];
            }
        }

        self.write(c.memory(), c.offset(), bytemuck::cast_slice(&c_f32))
    }
}

fn floats_of(bytes: Vec<u8>) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidBufferData { precision: 4 });
    }
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceRuntime;

    #[test]
    fn test_alloc_is_zeroed() {
        let runtime = DeviceRuntime::open(0).unwrap();
        let buf = runtime.alloc(16).unwrap();
        assert_eq!(buf.read().unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_sgemm_block_times_queries() {
        // Block of two 3-dim rows, one query column: C = A^T-layout dot products.
        let runtime = DeviceRuntime::open(0).unwrap();
        let handle = runtime.new_blas_handle().unwrap();

        // Row-major block rows: [1,0,0], [0,2,0] -> column-major 3x2 with lda=3.
        let a = runtime.alloc(6 * 4).unwrap();
        a.write(bytemuck::cast_slice(&[1.0f32, 0.0, 0.0, 0.0, 2.0, 0.0]))
            .unwrap();

        // One query [1,1,1], column-major 3x1 with ldb=3.
        let b = runtime.alloc(3 * 4).unwrap();
        b.write(bytemuck::cast_slice(&[1.0f32, 1.0, 1.0])).unwrap();

        let c = runtime.alloc(2 * 4).unwrap();

        runtime
            .sgemm(
                &handle,
                GemmOp::Transpose,
                GemmOp::None,
                2,
                1,
                3,
                1.0,
                c_dev(&a),
                3,
                c_dev(&b),
                3,
                0.0,
                c_dev(&c),
                2,
            )
            .unwrap();

        let scores: Vec<f32> = bytemuck::pod_collect_to_vec(&c.read().unwrap());
        assert_eq!(scores, vec![1.0, 2.0]);
    }

    fn c_dev(buf: &crate::buffer::Buffer) -> &crate::buffer::DeviceBuffer {
        buf.as_device().unwrap()
    }
}
