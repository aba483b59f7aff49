// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory shared between the host and the IOC: message frames, chain buffers
//! and sense buffers.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A DMA target, or a view of part of one.
///
/// The IOC may access the memory concurrently, so the bytes are only ever
/// touched through atomic loads and stores.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<[AtomicU8]>,
    offset: usize,
    len: usize,
    iova: u64,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("len", &self.len)
            .field("iova", &format_args!("{:#x}", self.iova))
            .finish()
    }
}

impl MemoryBlock {
    /// Allocates `len` zeroed bytes that the device sees at bus address
    /// `iova`.
    pub fn new(len: usize, iova: u64) -> Self {
        Self {
            mem: (0..len).map(|_| AtomicU8::new(0)).collect(),
            offset: 0,
            len,
            iova,
        }
    }

    /// Returns a view of a subset of the buffer.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(offset <= self.len && self.len - offset >= len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
            iova: self.iova + offset as u64,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bus address of the first byte of the buffer.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// Gets the buffer as an atomic slice.
    pub fn as_slice(&self) -> &[AtomicU8] {
        &self.mem[self.offset..][..self.len]
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (dst, src) in data.iter_mut().zip(&self.as_slice()[offset..][..len]) {
            *dst = src.load(Ordering::Relaxed);
        }
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (dst, src) in self.as_slice()[offset..][..data.len()].iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0; 4];
        self.read_at(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_at(offset, &value.to_le_bytes());
    }

    /// Zeroes the whole buffer.
    pub fn fill_zero(&self) {
        for b in self.as_slice() {
            b.store(0, Ordering::Relaxed);
        }
    }
}
