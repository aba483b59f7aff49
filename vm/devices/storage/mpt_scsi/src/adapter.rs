// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface to the message frame transport of a Fusion-MPT IOC.
//!
//! The base driver owns the PCI function, the doorbell and the request and
//! reply FIFOs. The SCSI host only allocates frames, posts them, and is called
//! back with replies.

use crate::cmd::ScsiCmd;
use crate::memory::MemoryBlock;
use mpi_spec::Doorbell;
use mpi_spec::EncodedSge;
use mpi_spec::IocCapabilities;
use mpi_spec::MsgContext;
use mpi_spec::SgeFormat;
use mpi_spec::MPI_VERSION_01_05;
use thiserror::Error;

/// The physical transport behind the IOC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusType {
    /// Parallel SCSI.
    Spi,
    /// Fibre channel.
    Fc,
    /// Serial attached SCSI.
    Sas,
}

/// The reply handler a frame is allocated for. Replies to the frame are routed
/// back to the matching handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplyContext {
    ScsiIo,
    TaskMgmt,
    Internal,
}

/// What the reply handler wants done with the request frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameRelease {
    /// Return the frame to the adapter's free pool.
    Free,
    /// Someone else still owns the frame.
    Retain,
}

/// IOC properties reported by IOC_FACTS and fixed at attach.
#[derive(Clone, Debug)]
pub struct IocFacts {
    pub msg_version: u16,
    pub capabilities: IocCapabilities,
    /// Request frame size in bytes. Chain buffers are the same size.
    pub req_sz: usize,
    /// Number of request frames, and so of request indexes.
    pub req_depth: u16,
    /// log2 of the request frame granule used to compute a frame's
    /// RequestNB.
    pub nb_shift_factor: u8,
    pub sge_format: SgeFormat,
    pub pci_vendor: u16,
}

impl IocFacts {
    /// Whether task management can use the high priority request FIFO
    /// instead of the doorbell handshake.
    pub fn high_priority_queue(&self) -> bool {
        self.capabilities.high_pri_q() && self.msg_version >= MPI_VERSION_01_05
    }
}

pub const PCI_VENDOR_ID_IBM: u16 = 0x1014;

/// A request message frame.
#[derive(Clone, Debug)]
pub struct MessageFrame {
    index: u16,
    mem: MemoryBlock,
    request_nb: u8,
}

impl MessageFrame {
    pub fn new(index: u16, mem: MemoryBlock) -> Self {
        Self {
            index,
            mem,
            request_nb: 0,
        }
    }

    /// The request index, which is also the low half of the message context.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn mem(&self) -> &MemoryBlock {
        &self.mem
    }

    /// The message context the allocator stamped into the frame.
    pub fn msg_context(&self) -> MsgContext {
        MsgContext::from_bits(self.mem.read_u32(MSG_CONTEXT_OFFSET))
    }

    /// The frame size code posted with the request descriptor.
    pub fn request_nb(&self) -> u8 {
        self.request_nb
    }

    pub(crate) fn set_request_nb(&mut self, nb: u8) {
        self.request_nb = nb;
    }
}

/// Byte offset of the message context in every request and reply.
pub const MSG_CONTEXT_OFFSET: usize = 8;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("doorbell handshake failed")]
    Handshake,
    #[error("IOC is not operational")]
    NotOperational,
    #[error("IOC reset failed")]
    ResetFailed,
    #[error("IOC reset already in progress")]
    ResetInProgress,
    #[error("failed to map command data for dma")]
    DmaMap,
    #[error("failed to allocate {0} bytes of dma memory")]
    DmaAlloc(usize),
}

/// Services the host consumes from the base driver.
pub trait MptAdapter: Send + Sync {
    /// The adapter name used in diagnostics.
    fn name(&self) -> &str;

    fn bus_type(&self) -> BusType;

    fn facts(&self) -> &IocFacts;

    /// Reads the doorbell register.
    fn doorbell(&self) -> Doorbell;

    /// Allocates a request frame whose replies go to `context`. Returns
    /// `None` if every frame is in use.
    fn alloc_frame(&self, context: ReplyContext) -> Option<MessageFrame>;

    /// Returns the frame with request index `index` to the free pool.
    fn free_frame(&self, index: u16);

    /// Gets the frame with request index `index`, allocated or not.
    fn frame(&self, index: u16) -> MessageFrame;

    /// Posts a frame on the request FIFO.
    fn post_frame(&self, context: ReplyContext, frame: &MessageFrame);

    /// Posts a frame on the high priority request FIFO.
    fn post_frame_high_priority(&self, context: ReplyContext, frame: &MessageFrame);

    /// Sends a frame through the doorbell handshake.
    fn send_handshake(
        &self,
        context: ReplyContext,
        frame: &MessageFrame,
    ) -> Result<(), AdapterError>;

    /// Message unit reset. Fails quickly if the IOC cannot be brought back
    /// this way.
    fn soft_reset(&self) -> Result<(), AdapterError>;

    /// Diagnostic reset of the whole IOC.
    fn hard_reset(&self) -> Result<(), AdapterError>;

    /// Maps the command's data buffer for the device. Returns the number of
    /// scatter-gather entries.
    fn dma_map(&self, cmd: &ScsiCmd) -> Result<usize, AdapterError>;

    fn dma_unmap(&self, cmd: &ScsiCmd);

    /// Allocates device visible memory.
    fn alloc_dma(&self, len: usize) -> Result<MemoryBlock, AdapterError>;

    /// The sense buffer paired with request index `index`.
    fn sense_buffer(&self, index: u16) -> MemoryBlock;

    /// Encodes a simple element.
    fn add_sge(&self, flags_length: u32, address: u64) -> EncodedSge {
        self.facts().sge_format.simple(flags_length, address)
    }

    /// Encodes a chain element.
    fn add_chain(&self, next_chain_offset: u8, length: u16, address: u64) -> EncodedSge {
        self.facts()
            .sge_format
            .chain(next_chain_offset, length, address)
    }

    /// The size of one encoded element.
    fn sge_size(&self) -> usize {
        self.facts().sge_format.element_size()
    }
}
