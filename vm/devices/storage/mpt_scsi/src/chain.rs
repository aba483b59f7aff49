// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Allocator for chain buffers, the request-frame-sized buffers that continue
//! a scatter-gather list that does not fit in its request frame.
//!
//! Each in-flight request owns a singly linked list of chain buffers, rooted
//! at `req_to_chain[req_idx]` and continued through `chain_to_chain`. Releasing
//! a request walks that list back onto the free list.

use crate::memory::MemoryBlock;
use parking_lot::Mutex;

/// Marks the end of a request's chain list.
pub const NO_CHAIN: u16 = u16::MAX;

pub struct ChainPool {
    core: Mutex<ChainPoolCore>,
    mem: MemoryBlock,
    buffer_size: usize,
    count: u16,
}

impl std::fmt::Debug for ChainPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainPool")
            .field("count", &self.count)
            .field("free", &self.free_count())
            .finish()
    }
}

struct ChainPoolCore {
    free: Vec<u16>,
    req_to_chain: Box<[u16]>,
    chain_to_chain: Box<[u16]>,
}

impl ChainPoolCore {
    fn new(count: u16, req_depth: u16) -> Self {
        Self {
            free: (0..count).rev().collect(),
            req_to_chain: vec![NO_CHAIN; req_depth.into()].into(),
            chain_to_chain: vec![NO_CHAIN; count.into()].into(),
        }
    }
}

impl ChainPool {
    /// Carves `mem` into buffers of `buffer_size` bytes, tracking chains for
    /// `req_depth` request indexes.
    pub fn new(mem: MemoryBlock, buffer_size: usize, req_depth: u16) -> Self {
        assert!(buffer_size > 0);
        let count = (mem.len() / buffer_size).min(NO_CHAIN as usize) as u16;
        Self {
            core: Mutex::new(ChainPoolCore::new(count, req_depth)),
            mem,
            buffer_size,
            count,
        }
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn free_count(&self) -> usize {
        self.core.lock().free.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a buffer off the free list. Never waits.
    pub fn acquire(&self) -> Option<u16> {
        let chain = self.core.lock().free.pop();
        if chain.is_none() {
            tracing::debug!("no free chain buffers");
        }
        chain
    }

    /// Takes a buffer off the free list and appends it to `req_idx`'s chain
    /// list, after `prev` or as the first buffer.
    pub fn acquire_linked(&self, req_idx: u16, prev: Option<u16>) -> Option<u16> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let link = match prev {
            Some(prev) => core.chain_to_chain.get_mut(prev as usize)?,
            None => core.req_to_chain.get_mut(req_idx as usize)?,
        };
        let chain = core.free.pop()?;
        *link = chain;
        Some(chain)
    }

    /// Returns every chain buffer owned by `req_idx` to the free list. Does
    /// nothing if the request owns none.
    pub fn release(&self, req_idx: u16) {
        let mut core = self.core.lock();
        let core = &mut *core;
        let Some(first) = core.req_to_chain.get_mut(req_idx as usize) else {
            return;
        };
        let mut chain = std::mem::replace(first, NO_CHAIN);
        while chain != NO_CHAIN {
            let next = std::mem::replace(&mut core.chain_to_chain[chain as usize], NO_CHAIN);
            tracing::trace!(req_idx, chain, "free chain buffer");
            core.free.push(chain);
            chain = next;
        }
    }

    /// The chain buffers owned by `req_idx`, in list order.
    pub fn chains(&self, req_idx: u16) -> Vec<u16> {
        let core = self.core.lock();
        let mut chains = Vec::new();
        let mut chain = core
            .req_to_chain
            .get(req_idx as usize)
            .copied()
            .unwrap_or(NO_CHAIN);
        while chain != NO_CHAIN {
            chains.push(chain);
            chain = core.chain_to_chain[chain as usize];
        }
        chains
    }

    /// The memory of chain buffer `chain`.
    pub fn buffer(&self, chain: u16) -> MemoryBlock {
        self.mem
            .subblock(chain as usize * self.buffer_size, self.buffer_size)
    }
}
