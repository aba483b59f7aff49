// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated IOC transport for exercising the host without hardware.
//!
//! The emulator hands out frames and records what is posted. It never
//! replies on its own: tests play the IOC by feeding replies to
//! [`ScsiHost::handle_reply`](crate::ScsiHost::handle_reply).

#![allow(missing_docs)]

use crate::adapter::AdapterError;
use crate::adapter::BusType;
use crate::adapter::IocFacts;
use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::adapter::MSG_CONTEXT_OFFSET;
use crate::cmd::ScsiCmd;
use crate::memory::MemoryBlock;
use mpi_spec::Doorbell;
use mpi_spec::IocCapabilities;
use mpi_spec::IocState;
use mpi_spec::MsgContext;
use mpi_spec::SgeFormat;
use mpi_spec::SENSE_BUFFER_ALLOC;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

const FRAME_IOVA: u64 = 0x1000_0000;
const SENSE_IOVA: u64 = 0x2000_0000;
const DMA_IOVA: u64 = 0x4000_0000;

/// Initializes `tracing` output for tests. `RUST_LOG` overrides the default
/// debug level.
pub fn init_tracing() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::filter::Targets;
    use tracing_subscriber::prelude::*;

    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}

#[derive(Clone, Debug)]
pub struct IocConfig {
    pub bus_type: BusType,
    pub sge_format: SgeFormat,
    pub req_sz: usize,
    pub req_depth: u16,
    pub nb_shift_factor: u8,
    pub msg_version: u16,
    pub high_pri_q: bool,
    pub pci_vendor: u16,
}

impl Default for IocConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::Spi,
            sge_format: SgeFormat::Sge64,
            req_sz: 128,
            req_depth: 16,
            nb_shift_factor: 5,
            msg_version: 0x0105,
            high_pri_q: true,
            pci_vendor: 0x1000,
        }
    }
}

/// How a frame reached the IOC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostPath {
    Fifo,
    HighPriority,
    Handshake,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PostedFrame {
    pub context: ReplyContext,
    pub index: u16,
    pub path: PostPath,
}

struct Posts {
    /// Everything posted, in order.
    log: Vec<PostedFrame>,
    /// Posts not yet picked up by [`EmulatedIoc::wait_for_post`].
    pending: VecDeque<PostedFrame>,
}

pub struct EmulatedIoc {
    bus_type: BusType,
    facts: IocFacts,
    frames: MemoryBlock,
    sense: MemoryBlock,
    allocated: Mutex<Vec<bool>>,
    posts: Mutex<Posts>,
    posted: Condvar,
    doorbell: AtomicU32,
    fail_soft_reset: AtomicBool,
    fail_hard_reset: AtomicBool,
    fail_handshake: AtomicBool,
    fail_dma_map: AtomicBool,
    soft_resets: AtomicU32,
    hard_resets: AtomicU32,
    dma_unmaps: AtomicU32,
    next_iova: AtomicU64,
}

fn cb_idx(context: ReplyContext) -> u8 {
    match context {
        ReplyContext::ScsiIo => 1,
        ReplyContext::TaskMgmt => 2,
        ReplyContext::Internal => 3,
    }
}

fn doorbell_bits(state: IocState, active: bool) -> u32 {
    state.0 | (u32::from(active) << 27)
}

impl EmulatedIoc {
    pub fn new(config: IocConfig) -> Self {
        let depth = usize::from(config.req_depth);
        Self {
            bus_type: config.bus_type,
            facts: IocFacts {
                msg_version: config.msg_version,
                capabilities: IocCapabilities::new().with_high_pri_q(config.high_pri_q),
                req_sz: config.req_sz,
                req_depth: config.req_depth,
                nb_shift_factor: config.nb_shift_factor,
                sge_format: config.sge_format,
                pci_vendor: config.pci_vendor,
            },
            frames: MemoryBlock::new(depth * config.req_sz, FRAME_IOVA),
            sense: MemoryBlock::new(depth * SENSE_BUFFER_ALLOC, SENSE_IOVA),
            allocated: Mutex::new(vec![false; depth]),
            posts: Mutex::new(Posts {
                log: Vec::new(),
                pending: VecDeque::new(),
            }),
            posted: Condvar::new(),
            doorbell: AtomicU32::new(doorbell_bits(IocState::OPERATIONAL, false)),
            fail_soft_reset: AtomicBool::new(false),
            fail_hard_reset: AtomicBool::new(false),
            fail_handshake: AtomicBool::new(false),
            fail_dma_map: AtomicBool::new(false),
            soft_resets: AtomicU32::new(0),
            hard_resets: AtomicU32::new(0),
            dma_unmaps: AtomicU32::new(0),
            next_iova: AtomicU64::new(DMA_IOVA),
        }
    }

    pub fn set_doorbell(&self, state: IocState, active: bool) {
        self.doorbell
            .store(doorbell_bits(state, active), Ordering::SeqCst);
    }

    pub fn fail_soft_reset(&self, fail: bool) {
        self.fail_soft_reset.store(fail, Ordering::SeqCst);
    }

    pub fn fail_hard_reset(&self, fail: bool) {
        self.fail_hard_reset.store(fail, Ordering::SeqCst);
    }

    pub fn fail_handshake(&self, fail: bool) {
        self.fail_handshake.store(fail, Ordering::SeqCst);
    }

    pub fn fail_dma_map(&self, fail: bool) {
        self.fail_dma_map.store(fail, Ordering::SeqCst);
    }

    pub fn soft_resets(&self) -> u32 {
        self.soft_resets.load(Ordering::SeqCst)
    }

    pub fn hard_resets(&self) -> u32 {
        self.hard_resets.load(Ordering::SeqCst)
    }

    pub fn dma_unmaps(&self) -> u32 {
        self.dma_unmaps.load(Ordering::SeqCst)
    }

    /// Number of frames in the free pool.
    pub fn free_frames(&self) -> usize {
        self.allocated.lock().iter().filter(|a| !**a).count()
    }

    pub fn is_allocated(&self, index: u16) -> bool {
        self.allocated.lock()[usize::from(index)]
    }

    /// Every frame posted so far, in order.
    pub fn posted(&self) -> Vec<PostedFrame> {
        self.posts.lock().log.clone()
    }

    /// Waits for the next post for `context` that has not been returned
    /// before.
    pub fn wait_for_post(&self, context: ReplyContext, timeout: Duration) -> Option<PostedFrame> {
        let deadline = Instant::now() + timeout;
        let mut posts = self.posts.lock();
        loop {
            if let Some(i) = posts.pending.iter().position(|p| p.context == context) {
                return posts.pending.remove(i);
            }
            if self.posted.wait_until(&mut posts, deadline).timed_out() {
                return None;
            }
        }
    }

    fn record_post(&self, context: ReplyContext, frame: &MessageFrame, path: PostPath) {
        let post = PostedFrame {
            context,
            index: frame.index(),
            path,
        };
        let mut posts = self.posts.lock();
        posts.log.push(post);
        posts.pending.push_back(post);
        self.posted.notify_all();
    }
}

impl MptAdapter for EmulatedIoc {
    fn name(&self) -> &str {
        "ioc0"
    }

    fn bus_type(&self) -> BusType {
        self.bus_type
    }

    fn facts(&self) -> &IocFacts {
        &self.facts
    }

    fn doorbell(&self) -> Doorbell {
        Doorbell::from_bits(self.doorbell.load(Ordering::SeqCst))
    }

    fn alloc_frame(&self, context: ReplyContext) -> Option<MessageFrame> {
        let index = {
            let mut allocated = self.allocated.lock();
            let index = allocated.iter().position(|a| !*a)?;
            allocated[index] = true;
            index as u16
        };
        let frame = self.frame(index);
        frame.mem().fill_zero();
        frame.mem().write_u32(
            MSG_CONTEXT_OFFSET,
            MsgContext::new()
                .with_req_idx(index)
                .with_cb_idx(cb_idx(context))
                .into_bits(),
        );
        Some(frame)
    }

    fn free_frame(&self, index: u16) {
        let mut allocated = self.allocated.lock();
        assert!(
            std::mem::replace(&mut allocated[usize::from(index)], false),
            "frame {index} freed twice"
        );
    }

    fn frame(&self, index: u16) -> MessageFrame {
        let req_sz = self.facts.req_sz;
        MessageFrame::new(
            index,
            self.frames.subblock(usize::from(index) * req_sz, req_sz),
        )
    }

    fn post_frame(&self, context: ReplyContext, frame: &MessageFrame) {
        self.record_post(context, frame, PostPath::Fifo);
    }

    fn post_frame_high_priority(&self, context: ReplyContext, frame: &MessageFrame) {
        self.record_post(context, frame, PostPath::HighPriority);
    }

    fn send_handshake(
        &self,
        context: ReplyContext,
        frame: &MessageFrame,
    ) -> Result<(), AdapterError> {
        if self.fail_handshake.load(Ordering::SeqCst) {
            return Err(AdapterError::Handshake);
        }
        self.record_post(context, frame, PostPath::Handshake);
        Ok(())
    }

    fn soft_reset(&self) -> Result<(), AdapterError> {
        self.soft_resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_soft_reset.load(Ordering::SeqCst) {
            return Err(AdapterError::ResetFailed);
        }
        self.set_doorbell(IocState::OPERATIONAL, false);
        Ok(())
    }

    fn hard_reset(&self) -> Result<(), AdapterError> {
        self.hard_resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_hard_reset.load(Ordering::SeqCst) {
            return Err(AdapterError::ResetFailed);
        }
        self.set_doorbell(IocState::OPERATIONAL, false);
        Ok(())
    }

    fn dma_map(&self, cmd: &ScsiCmd) -> Result<usize, AdapterError> {
        if self.fail_dma_map.load(Ordering::SeqCst) {
            return Err(AdapterError::DmaMap);
        }
        Ok(cmd.sg_list().len())
    }

    fn dma_unmap(&self, _cmd: &ScsiCmd) {
        self.dma_unmaps.fetch_add(1, Ordering::SeqCst);
    }

    fn alloc_dma(&self, len: usize) -> Result<MemoryBlock, AdapterError> {
        let iova = self.next_iova.fetch_add(len as u64, Ordering::SeqCst);
        Ok(MemoryBlock::new(len, iova))
    }

    fn sense_buffer(&self, index: u16) -> MemoryBlock {
        self.sense
            .subblock(usize::from(index) * SENSE_BUFFER_ALLOC, SENSE_BUFFER_ALLOC)
    }
}
