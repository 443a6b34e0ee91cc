//! Uniform byte buffers over host and device memory.
//!
//! Blocks store their authoritative bytes in a [`HostBuffer`]; cores mirror
//! one block at a time into a [`DeviceBuffer`]. Both sides share one contract
//! (write / read / copy / slice / reset / size) so the residency refresh is a
//! single `copy` that crosses the host/device boundary explicitly.
//!
//! `slice` returns an aliasing view: windows share the parent's storage, and
//! dropping a window never frees the allocation.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::gpu::{DeviceMemory, DeviceRuntime};

/// A byte buffer living on either side of the PCIe boundary.
pub enum Buffer {
    Host(HostBuffer),
    Device(DeviceBuffer),
}

impl Buffer {
    /// Allocate a zeroed host buffer.
    pub fn host(size: usize) -> Self {
        Buffer::Host(HostBuffer::new(size))
    }

    /// Copy `bytes` to the start of the buffer.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        match self {
            Buffer::Host(host) => host.write(bytes),
            Buffer::Device(device) => device.write(bytes),
        }
    }

    /// Read the full buffer contents (a copy, D→H for device buffers).
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            Buffer::Host(host) => host.read(),
            Buffer::Device(device) => device.read(),
        }
    }

    /// Copy the full contents of `src` to the start of this buffer. All four
    /// host/device pairings are supported.
    pub fn copy(&self, src: &Buffer) -> Result<()> {
        if src.size() > self.size() {
            return Err(Error::BufferCopyOutOfRange {
                src: src.size(),
                dst: self.size(),
            });
        }
        match (self, src) {
            (Buffer::Host(dst), Buffer::Host(src)) => dst.copy_from(src),
            (Buffer::Host(dst), Buffer::Device(src)) => dst.write(&src.read()?),
            (Buffer::Device(dst), Buffer::Host(src)) => src.with_bytes(|bytes| dst.write(bytes)),
            (Buffer::Device(dst), Buffer::Device(src)) => dst.copy_from_device(src),
        }
    }

    /// An aliasing view of `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Buffer> {
        match self {
            Buffer::Host(host) => Ok(Buffer::Host(host.slice(start, end)?)),
            Buffer::Device(device) => Ok(Buffer::Device(device.slice(start, end)?)),
        }
    }

    /// Zero the buffer.
    pub fn reset(&self) -> Result<()> {
        match self {
            Buffer::Host(host) => host.reset(),
            Buffer::Device(device) => device.reset(),
        }
    }

    /// Byte capacity.
    pub fn size(&self) -> usize {
        match self {
            Buffer::Host(host) => host.size(),
            Buffer::Device(device) => device.size(),
        }
    }

    pub fn as_host(&self) -> Result<&HostBuffer> {
        match self {
            Buffer::Host(host) => Ok(host),
            Buffer::Device(_) => Err(Error::InvalidBufferType { expected: "host" }),
        }
    }

    pub fn as_device(&self) -> Result<&DeviceBuffer> {
        match self {
            Buffer::Device(device) => Ok(device),
            Buffer::Host(_) => Err(Error::InvalidBufferType { expected: "device" }),
        }
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        match self {
            Buffer::Host(host) => Buffer::Host(host.clone()),
            Buffer::Device(device) => Buffer::Device(device.clone()),
        }
    }
}

/// Host RAM buffer. Clones and slices alias one locked byte store.
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<RwLock<Box<[u8]>>>,
    offset: usize,
    len: usize,
}

impl HostBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0u8; size].into_boxed_slice())),
            offset: 0,
            len: size,
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(Error::BufferWriteOutOfRange {
                len: bytes.len(),
                size: self.len,
            });
        }
        let mut guard = self.write_guard();
        guard[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        let guard = self.read_guard();
        Ok(guard[self.offset..self.offset + self.len].to_vec())
    }

    /// Run `f` over the buffer's bytes without copying them out.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.read_guard();
        f(&guard[self.offset..self.offset + self.len])
    }

    fn copy_from(&self, src: &HostBuffer) -> Result<()> {
        // Windows of one store share the lock.
        if Arc::ptr_eq(&self.data, &src.data) {
            let mut guard = self.write_guard();
            guard.copy_within(src.offset..src.offset + src.len, self.offset);
            return Ok(());
        }
        src.with_bytes(|bytes| self.write(bytes))
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<HostBuffer> {
        if start > end || end > self.len {
            return Err(Error::BufferSliceOutOfRange {
                start,
                end,
                size: self.len,
            });
        }
        Ok(HostBuffer {
            data: Arc::clone(&self.data),
            offset: self.offset + start,
            len: end - start,
        })
    }

    pub fn reset(&self) -> Result<()> {
        let mut guard = self.write_guard();
        guard[self.offset..self.offset + self.len].fill(0);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.len
    }
}

/// Device memory buffer: a window into one device allocation.
#[derive(Clone)]
pub struct DeviceBuffer {
    runtime: Arc<DeviceRuntime>,
    mem: Arc<DeviceMemory>,
    offset: usize,
    len: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(
        runtime: Arc<DeviceRuntime>,
        mem: Arc<DeviceMemory>,
        offset: usize,
        len: usize,
    ) -> Self {
        Self {
            runtime,
            mem,
            offset,
            len,
        }
    }

    pub(crate) fn memory(&self) -> &DeviceMemory {
        &self.mem
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(Error::BufferWriteOutOfRange {
                len: bytes.len(),
                size: self.len,
            });
        }
        self.runtime.write_bytes(&self.mem, self.offset, bytes)
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        self.runtime.read_bytes(&self.mem, self.offset, self.len)
    }

    fn copy_from_device(&self, src: &DeviceBuffer) -> Result<()> {
        self.runtime
            .copy_dtod(&self.mem, self.offset, &src.mem, src.offset, src.len)
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<DeviceBuffer> {
        if start > end || end > self.len {
            return Err(Error::BufferSliceOutOfRange {
                start,
                end,
                size: self.len,
            });
        }
        Ok(DeviceBuffer {
            runtime: Arc::clone(&self.runtime),
            mem: Arc::clone(&self.mem),
            offset: self.offset + start,
            len: end - start,
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.runtime.memset_zero(&self.mem, self.offset, self.len)
    }

    pub fn size(&self) -> usize {
        self.len
    }
}
