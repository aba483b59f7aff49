// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The SCSI host: command submission, reply dispatch, IOC reset handling and
//! device lifetime events.

use crate::adapter::AdapterError;
use crate::adapter::BusType;
use crate::adapter::FrameRelease;
use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::chain::ChainPool;
use crate::cmd::CompletionReceiver;
use crate::cmd::DataDirection;
use crate::cmd::HostStatus;
use crate::cmd::ScsiCmd;
use crate::cmd::ScsiDevice;
use crate::cmd::ScsiResult;
use crate::cmd::ScsiTarget;
use crate::internal::InternalCompletion;
use crate::lookup::LookupError;
use crate::lookup::LookupTable;
use crate::mgmt::MgmtSlot;
use crate::ratelimit::RateLimiter;
use crate::sgl::build_sgl;
use crate::sgl::SglError;
use mpi_spec::lun_bytes;
use mpi_spec::scsi::PERIPHERAL_DIRECT_ACCESS;
use mpi_spec::Event;
use mpi_spec::EventNotificationReply;
use mpi_spec::Function;
use mpi_spec::ScsiIoRequest;
use mpi_spec::ScsiTaskMgmtReply;
use mpi_spec::SCSIIO_CONTROL_NODATATRANSFER;
use mpi_spec::SCSIIO_CONTROL_READ;
use mpi_spec::SCSIIO_CONTROL_SIMPLEQ;
use mpi_spec::SCSIIO_CONTROL_UNTAGGED;
use mpi_spec::SCSIIO_CONTROL_WRITE;
use mpi_spec::SCSI_IO_SGL_OFFSET;
use mpi_spec::SENSE_BUFFER_SIZE;
use mpi_spec::SGE_FLAGS_SSIMPLE_READ;
use mpi_spec::SGE_NULL_ADDRESS;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;

/// Host configuration.
#[derive(Clone, Debug)]
pub struct ScsiHostConfig {
    /// The unit all task management and internal command timeouts are
    /// counted in.
    pub time_unit: Duration,
    /// Number of chain buffers to allocate.
    pub chain_buffers: u16,
    /// Minimum time between two queue full reports.
    pub queue_full_report_period: Duration,
    /// How much sense data to copy back to a command.
    pub sense_buffer_len: usize,
}

impl Default for ScsiHostConfig {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_secs(1),
            chain_buffers: 256,
            queue_full_report_period: Duration::from_secs(10),
            sense_buffer_len: mpi_spec::scsi::SENSE_BUFFER_SIZE,
        }
    }
}

impl ScsiHostConfig {
    pub(crate) fn units(&self, n: u32) -> Duration {
        self.time_unit * n
    }
}

/// Task management timeout, in time units.
pub(crate) fn task_mgmt_timeout(bus: BusType) -> u32 {
    match bus {
        BusType::Fc => 40,
        BusType::Sas => 30,
        BusType::Spi => 10,
    }
}

#[derive(Debug, Error)]
pub enum HostInitError {
    #[error("failed to allocate chain buffers")]
    ChainBuffers(#[source] AdapterError),
}

/// Why a command could not be queued. Every variant means the host is busy
/// and the OS should requeue the command.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io is quiesced for task management")]
    Quiesced,
    #[error("no message frames available")]
    NoFrames,
    #[error("failed to map command data")]
    DmaMap(#[source] AdapterError),
    #[error("failed to build scatter-gather list")]
    Sgl(#[source] SglError),
    #[error("request frame still tracked as outstanding")]
    Lookup(#[source] LookupError),
}

/// The kind of IOC reset to perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

/// IOC reset notification phases.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetPhase {
    Setup,
    PreReset,
    PostReset,
}

#[derive(Default)]
pub(crate) struct IocFlags {
    pub reset_in_progress: bool,
    pub taskmgmt_in_progress: bool,
    pub quiesce_io: bool,
}

#[derive(Default)]
pub(crate) struct HostCounters {
    pub timeouts: AtomicU64,
    pub soft_resets: AtomicU64,
    pub queue_full: AtomicU64,
    pub sel_timeouts: AtomicU64,
}

/// A snapshot of the host counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Abort and bus reset requests from the OS error handler.
    pub timeouts: u64,
    /// Bus reset events reported by a parallel SCSI IOC.
    pub soft_resets: u64,
    pub queue_full: u64,
    pub sel_timeouts: u64,
}

/// The SCSI host for one Fusion-MPT IOC.
pub struct ScsiHost<A> {
    pub(crate) adapter: A,
    pub(crate) config: ScsiHostConfig,
    pub(crate) lookup: LookupTable<ScsiCmd>,
    pub(crate) chains: ChainPool,
    pub(crate) taskmgmt: MgmtSlot<ScsiTaskMgmtReply>,
    pub(crate) internal: MgmtSlot<InternalCompletion>,
    pub(crate) flags: Mutex<IocFlags>,
    pub(crate) queue_full: RateLimiter,
    pub(crate) counters: HostCounters,
    serial: AtomicU64,
}

impl<A: MptAdapter> ScsiHost<A> {
    pub fn new(adapter: A, config: ScsiHostConfig) -> Result<Self, HostInitError> {
        let facts = adapter.facts();
        let req_sz = facts.req_sz;
        let req_depth = facts.req_depth;
        let chain_mem = adapter
            .alloc_dma(usize::from(config.chain_buffers) * req_sz)
            .map_err(HostInitError::ChainBuffers)?;
        tracing::debug!(
            ioc = adapter.name(),
            req_depth,
            req_sz,
            chain_buffers = config.chain_buffers,
            "scsi host created"
        );
        Ok(Self {
            lookup: LookupTable::new(req_depth),
            chains: ChainPool::new(chain_mem, req_sz, req_depth),
            taskmgmt: MgmtSlot::new(),
            internal: MgmtSlot::new(),
            flags: Mutex::new(IocFlags::default()),
            queue_full: RateLimiter::new(config.queue_full_report_period),
            counters: HostCounters::default(),
            serial: AtomicU64::new(0),
            adapter,
            config,
        })
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn config(&self) -> &ScsiHostConfig {
        &self.config
    }

    pub fn chain_pool(&self) -> &ChainPool {
        &self.chains
    }

    pub fn lookup(&self) -> &LookupTable<ScsiCmd> {
        &self.lookup
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            soft_resets: self.counters.soft_resets.load(Ordering::Relaxed),
            queue_full: self.counters.queue_full.load(Ordering::Relaxed),
            sel_timeouts: self.counters.sel_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Builds a SCSI IO request for `cmd` and posts it to the IOC.
    ///
    /// The returned receiver yields the completion. On error, nothing was
    /// sent and the command may be retried later.
    pub fn queue_command(&self, cmd: &Arc<ScsiCmd>) -> Result<CompletionReceiver, QueueError> {
        if self.flags.lock().quiesce_io {
            tracing::debug!(ioc = self.adapter.name(), "io quiesced, host busy");
            return Err(QueueError::Quiesced);
        }

        let Some(mut frame) = self.adapter.alloc_frame(ReplyContext::ScsiIo) else {
            tracing::warn!(ioc = self.adapter.name(), "no message frames");
            return Err(QueueError::NoFrames);
        };
        let idx = frame.index();

        let (data_length, direction) = match cmd.direction() {
            DataDirection::FromDevice => (cmd.bufflen(), SCSIIO_CONTROL_READ),
            DataDirection::ToDevice => (cmd.bufflen(), SCSIIO_CONTROL_WRITE),
            DataDirection::None => (0, SCSIIO_CONTROL_NODATATRANSFER),
        };

        // Untagged until inquiry data says the device takes tags.
        let target = cmd.target();
        let queue = if target.q_yes() && cmd.device().tagged_supported() {
            SCSIIO_CONTROL_SIMPLEQ
        } else {
            SCSIIO_CONTROL_UNTAGGED
        };

        let function = if target.is_raid_component() {
            Function::RAID_SCSI_IO_PASSTHROUGH
        } else {
            Function::SCSI_IO_REQUEST
        };

        let mut cdb = [0; 16];
        cdb[..cmd.cdb().len()].copy_from_slice(cmd.cdb());

        let request = ScsiIoRequest {
            target_id: target.id,
            bus: target.channel,
            chain_offset: 0,
            function,
            cdb_length: cmd.cdb().len() as u8,
            sense_buffer_length: SENSE_BUFFER_SIZE,
            reserved: 0,
            msg_flags: 0,
            msg_context: frame.msg_context(),
            lun: lun_bytes(cmd.device().lun()),
            control: direction | queue,
            cdb,
            data_length,
            sense_buffer_low_addr: self.adapter.sense_buffer(idx).iova() as u32,
        };
        frame.mem().write_obj(0, &request);

        let request_nb = if data_length == 0 {
            self.write_simple_sge(
                &frame,
                SCSI_IO_SGL_OFFSET,
                SGE_FLAGS_SSIMPLE_READ,
                SGE_NULL_ADDRESS,
            )
        } else {
            match self.map_and_build_sgl(cmd, &frame) {
                Ok(nb) => nb,
                Err(err) => {
                    self.chains.release(idx);
                    self.adapter.free_frame(idx);
                    tracing::debug!(
                        ioc = self.adapter.name(),
                        req_idx = idx,
                        error = &err as &dyn std::error::Error,
                        "failed to queue command"
                    );
                    return Err(err);
                }
            }
        };
        frame.set_request_nb(request_nb);

        if let Err(err) = self.lookup.set(idx, cmd.clone()) {
            tracing::error!(
                ioc = self.adapter.name(),
                req_idx = idx,
                error = &err as &dyn std::error::Error,
                "lookup slot conflict"
            );
            if data_length != 0 {
                self.adapter.dma_unmap(cmd);
            }
            self.chains.release(idx);
            self.adapter.free_frame(idx);
            return Err(QueueError::Lookup(err));
        }
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let recv = cmd.begin(idx, serial);
        self.adapter.post_frame(ReplyContext::ScsiIo, &frame);
        tracing::trace!(
            ioc = self.adapter.name(),
            req_idx = idx,
            serial,
            op = ?cmd.op(),
            "issued scsi command"
        );
        Ok(recv)
    }

    fn map_and_build_sgl(&self, cmd: &ScsiCmd, frame: &MessageFrame) -> Result<u8, QueueError> {
        let count = self.adapter.dma_map(cmd).map_err(QueueError::DmaMap)?;
        let entries = &cmd.sg_list()[..count.min(cmd.sg_list().len())];
        build_sgl(
            &self.adapter,
            &self.chains,
            frame,
            SCSI_IO_SGL_OFFSET,
            entries,
            cmd.direction(),
        )
        .inspect_err(|_| self.adapter.dma_unmap(cmd))
        .map_err(QueueError::Sgl)
    }

    /// Writes a single terminating simple element at `offset` and returns the
    /// frame's RequestNB.
    pub(crate) fn write_simple_sge(
        &self,
        frame: &MessageFrame,
        offset: usize,
        flags_length: u32,
        address: u64,
    ) -> u8 {
        let sge = self.adapter.add_sge(flags_length, address);
        frame.mem().write_at(offset, sge.as_bytes());
        let end = offset + sge.as_bytes().len();
        let shift = self.adapter.facts().nb_shift_factor;
        ((((end - 1) >> shift) + 1) & 3) as u8
    }

    /// Routes an IOC reply to the handler for `context`.
    ///
    /// `reply` is `None` for a context (turbo) reply.
    pub fn handle_reply(
        &self,
        context: ReplyContext,
        frame: &MessageFrame,
        reply: Option<&[u8]>,
    ) -> FrameRelease {
        match context {
            ReplyContext::ScsiIo => self.io_done(frame, reply),
            ReplyContext::TaskMgmt => self.taskmgmt_complete(frame, reply),
            ReplyContext::Internal => self.internal_complete(frame, reply),
        }
    }

    /// Handles an event notification from the IOC.
    pub fn handle_event(&self, reply: &[u8]) {
        let Ok((reply, _)) = EventNotificationReply::read_from_prefix(reply) else {
            tracing::warn!(ioc = self.adapter.name(), "short event notification");
            return;
        };
        let event = reply.event();
        tracing::debug!(ioc = self.adapter.name(), ?event, "event");
        match event {
            Event::IOC_BUS_RESET | Event::EXT_BUS_RESET => {
                if self.adapter.bus_type() == BusType::Spi {
                    self.counters.soft_resets.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    /// Resets the IOC, notifying the host before and after.
    pub fn reset_ioc(&self, kind: ResetKind) -> Result<(), AdapterError> {
        {
            let mut flags = self.flags.lock();
            if flags.reset_in_progress {
                return Err(AdapterError::ResetInProgress);
            }
            flags.reset_in_progress = true;
        }

        tracing::info!(ioc = self.adapter.name(), ?kind, "issuing ioc reset");
        self.ioc_reset(ResetPhase::Setup);
        self.ioc_reset(ResetPhase::PreReset);
        let result = match kind {
            ResetKind::Soft => self.adapter.soft_reset(),
            ResetKind::Hard => self.adapter.hard_reset(),
        };
        self.ioc_reset(ResetPhase::PostReset);

        {
            let mut flags = self.flags.lock();
            flags.reset_in_progress = false;
            flags.taskmgmt_in_progress = false;
            flags.quiesce_io = false;
        }

        match &result {
            Ok(()) => tracing::info!(ioc = self.adapter.name(), ?kind, "ioc reset succeeded"),
            Err(err) => tracing::error!(
                ioc = self.adapter.name(),
                ?kind,
                error = err as &dyn std::error::Error,
                "ioc reset failed"
            ),
        }
        result
    }

    /// Tries a soft reset, then a hard reset if that fails. Does nothing more
    /// if another reset is already running.
    pub(crate) fn reset_ioc_escalating(&self) -> Result<(), AdapterError> {
        match self.reset_ioc(ResetKind::Soft) {
            Err(AdapterError::ResetInProgress) => Err(AdapterError::ResetInProgress),
            Err(_) => self.reset_ioc(ResetKind::Hard),
            Ok(()) => Ok(()),
        }
    }

    /// IOC reset notification.
    ///
    /// Before the reset, every outstanding command is completed with a reset
    /// result. After it, task management and internal command waiters are
    /// woken.
    pub fn ioc_reset(&self, phase: ResetPhase) {
        tracing::debug!(ioc = self.adapter.name(), ?phase, "ioc reset notification");
        match phase {
            ResetPhase::Setup => {}
            ResetPhase::PreReset => self.flush_running_cmds(),
            ResetPhase::PostReset => {
                if self.internal.ioc_reset() {
                    tracing::debug!(ioc = self.adapter.name(), "woke internal command waiter");
                }
                if self.taskmgmt.ioc_reset() {
                    tracing::debug!(ioc = self.adapter.name(), "woke task management waiter");
                }
            }
        }
    }

    /// Completes every outstanding command with a reset result.
    fn flush_running_cmds(&self) {
        for idx in 0..self.lookup.depth() {
            let Some(cmd) = self.lookup.take(idx) else {
                continue;
            };
            self.chains.release(idx);
            self.adapter.free_frame(idx);
            if cmd.frame_index() != Some(idx) {
                continue;
            }
            cmd.clear_frame();
            self.adapter.dma_unmap(&cmd);
            cmd.set_result(ScsiResult::host(HostStatus::Reset));
            tracing::debug!(ioc = self.adapter.name(), req_idx = idx, "flushing command");
            cmd.complete();
        }
    }

    /// Marks a target as gone. Commands completing for it afterwards on a SAS
    /// IOC report no connection.
    pub fn target_removed(&self, target: &ScsiTarget) {
        tracing::info!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            "target removed"
        );
        target.set_deleted();
    }

    /// The upper layer is done with `device`: fail its outstanding commands
    /// and flush its write cache.
    pub fn device_removed(&self, device: &ScsiDevice) {
        self.search_running_cmds(device);
        if let Err(err) = self.synchronize_cache(device) {
            tracing::warn!(
                ioc = self.adapter.name(),
                channel = device.target().channel,
                id = device.target().id,
                lun = device.lun(),
                error = &err as &dyn std::error::Error,
                "synchronize cache failed"
            );
        }
    }

    /// Completes the outstanding commands for `device` with a no connect
    /// result.
    fn search_running_cmds(&self, device: &ScsiDevice) {
        let target = device.target();
        let taken = self.lookup.take_matching(|idx, cmd| {
            let request: ScsiIoRequest = self.adapter.frame(idx).mem().read_obj(0);
            if request.bus != target.channel
                || request.target_id != target.id
                || cmd.device().lun() != device.lun()
            {
                return false;
            }
            // Hidden RAID components only see passthrough IO.
            if target.is_raid_component()
                && request.function != Function::RAID_SCSI_IO_PASSTHROUGH
            {
                return false;
            }
            cmd.frame_index() == Some(idx)
        });

        for (idx, cmd) in taken {
            self.chains.release(idx);
            self.adapter.free_frame(idx);
            cmd.clear_frame();
            self.adapter.dma_unmap(&cmd);
            cmd.set_result(ScsiResult::host(HostStatus::NoConnect));
            tracing::debug!(
                ioc = self.adapter.name(),
                req_idx = idx,
                channel = target.channel,
                id = target.id,
                lun = device.lun(),
                "failing command for removed device"
            );
            cmd.complete();
        }
    }

    /// Sets the queue depth of `device`, clamped to what the bus allows.
    /// Returns the new depth.
    pub fn change_queue_depth(&self, device: &ScsiDevice, depth: u16) -> u16 {
        const CMD_PER_DEV_HIGH: u16 = 64;
        const CMD_PER_DEV_LOW: u16 = 32;
        const ULTRA160_SYNC_FACTOR: u8 = 0x09;

        let target = device.target();
        let max_depth = match self.adapter.bus_type() {
            BusType::Spi => {
                if device.peripheral_type() == PERIPHERAL_DIRECT_ACCESS
                    && target.min_sync_factor() <= ULTRA160_SYNC_FACTOR
                {
                    CMD_PER_DEV_HIGH
                } else {
                    CMD_PER_DEV_LOW
                }
            }
            BusType::Fc | BusType::Sas => self.adapter.facts().req_depth,
        };

        let depth = if !device.tagged_supported() {
            1
        } else {
            depth.min(max_depth).max(1)
        };
        device.set_queue_depth(depth, depth != 1);
        tracing::debug!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            lun = device.lun(),
            depth,
            "queue depth changed"
        );
        depth
    }
}
