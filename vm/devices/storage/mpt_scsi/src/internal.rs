// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Commands the host issues on its own behalf, outside the OS command path:
//! discovery commands, cache flushes and RAID quiescing.
//!
//! One internal command is outstanding at a time. The caller blocks until it
//! completes or times out; a timeout resets the bus and, failing that, the
//! IOC.

use crate::adapter::BusType;
use crate::adapter::FrameRelease;
use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::cmd::ScsiDevice;
use crate::host::ScsiHost;
use crate::mgmt::WaitOutcome;
use mpi_spec::lun_bytes;
use mpi_spec::scsi::ScsiOp;
use mpi_spec::scsi::BUFFER_MODE_DATA;
use mpi_spec::scsi::BUFFER_MODE_DESCRIPTOR;
use mpi_spec::scsi::BUFFER_MODE_ECHO;
use mpi_spec::scsi::PERIPHERAL_DIRECT_ACCESS;
use mpi_spec::scsi::SAI_READ_CAPACITY_16;
use mpi_spec::DefaultReply;
use mpi_spec::Function;
use mpi_spec::IocStatus;
use mpi_spec::RaidActionReply;
use mpi_spec::RaidActionRequest;
use mpi_spec::ScsiIoRequest;
use mpi_spec::ScsiState;
use mpi_spec::ScsiStatus;
use mpi_spec::RAID_ACTION_ENABLE_PHYS_IO;
use mpi_spec::RAID_ACTION_QUIESCE_PHYS_IO;
use mpi_spec::RAID_ACTION_SGE_OFFSET;
use mpi_spec::RAID_ACTION_STATUS_SUCCESS;
use mpi_spec::SCSIIO_CONTROL_READ;
use mpi_spec::SCSIIO_CONTROL_SIMPLEQ;
use mpi_spec::SCSIIO_CONTROL_UNTAGGED;
use mpi_spec::SCSIIO_CONTROL_WRITE;
use mpi_spec::SCSI_IO_SGL_OFFSET;
use mpi_spec::SENSE_BUFFER_ALLOC;
use mpi_spec::SENSE_BUFFER_SIZE;
use mpi_spec::SGE_FLAGS_SSIMPLE_READ;
use mpi_spec::SGE_FLAGS_SSIMPLE_WRITE;
use mpi_spec::SGE_NULL_ADDRESS;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;

/// Internal command timeout, in time units.
const INTERNAL_CMD_TIMEOUT: u32 = 10;
const START_STOP_TIMEOUT: u32 = 15;
const RAID_ACTION_TIMEOUT: u32 = 10;

/// Timeout of the bus reset that follows a timed out internal command, in
/// time units.
pub(crate) fn scandv_reset_timeout(bus: BusType) -> u32 {
    match bus {
        BusType::Fc => 40,
        BusType::Sas => 30,
        BusType::Spi => 2,
    }
}

/// How an internal command ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InternalOutcome {
    Good,
    /// The command was terminated, by a reset or otherwise, and may be
    /// retried.
    DidReset,
    /// The command failed with sense data.
    Sense,
    SomeError,
    SelectionTimeout,
    /// Autosense failed on an INQUIRY; send a REQUEST SENSE.
    IssueSense,
    Busy,
}

#[derive(Debug, Error)]
pub enum InternalCmdError {
    #[error("unsupported internal command opcode {0:?}")]
    UnsupportedOpcode(ScsiOp),
    #[error("no message frames available")]
    NoFrames,
    #[error("request was terminated by an IOC reset")]
    IocReset,
    #[error("request timed out")]
    TimedOut,
    #[error("command completed with {0:?}")]
    Failed(InternalOutcome),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalCmdFlags {
    /// READ/WRITE BUFFER on the echo buffer.
    pub echo: bool,
    /// READ BUFFER of the buffer descriptor.
    pub buf_cap: bool,
    /// Send as a simple queue tagged command.
    pub tagged: bool,
}

/// An internally generated command.
#[derive(Clone, Debug)]
pub struct InternalCmd {
    pub op: ScsiOp,
    pub channel: u8,
    pub id: u8,
    pub lun: u64,
    /// Transfer length. Also the allocation length written into the CDB.
    pub size: u32,
    pub flags: InternalCmdFlags,
    /// Send as RAID passthrough to this physical disk instead of to
    /// `channel`/`id`.
    pub phys_disk_num: Option<u8>,
    pub data_dma: u64,
}

impl InternalCmd {
    /// A command with no data.
    pub fn new(op: ScsiOp, channel: u8, id: u8, lun: u64) -> Self {
        Self {
            op,
            channel,
            id,
            lun,
            size: 0,
            flags: InternalCmdFlags::default(),
            phys_disk_num: None,
            data_dma: SGE_NULL_ADDRESS,
        }
    }
}

/// The result of an internal command, with the sense data if autosense was
/// valid.
#[derive(Clone, Debug)]
pub struct InternalCompletion {
    pub outcome: InternalOutcome,
    sense: [u8; SENSE_BUFFER_ALLOC],
    sense_len: usize,
}

impl InternalCompletion {
    fn new(outcome: InternalOutcome) -> Self {
        Self {
            outcome,
            sense: [0; SENSE_BUFFER_ALLOC],
            sense_len: 0,
        }
    }

    pub fn sense(&self) -> &[u8] {
        &self.sense[..self.sense_len]
    }
}

struct CdbRecipe {
    cdb: [u8; 16],
    len: u8,
    control_dir: u32,
    timeout: u32,
}

fn build_cdb(io: &InternalCmd) -> Result<CdbRecipe, InternalCmdError> {
    let mut cdb = [0; 16];
    cdb[0] = io.op.0;
    let size = io.size.to_be_bytes();
    let mut control_dir = SCSIIO_CONTROL_READ;
    let mut timeout = INTERNAL_CMD_TIMEOUT;
    let len = match io.op {
        ScsiOp::INQUIRY | ScsiOp::REQUEST_SENSE => {
            cdb[4] = io.size as u8;
            6
        }
        ScsiOp::TEST_UNIT_READY | ScsiOp::RESERVE_UNIT | ScsiOp::RELEASE_UNIT => 6,
        ScsiOp::START_STOP_UNIT => {
            // Spin up.
            cdb[4] = 1;
            timeout = START_STOP_TIMEOUT;
            6
        }
        ScsiOp::READ_DATA_BUFF | ScsiOp::WRITE_DATA_BUFF => {
            cdb[1] = if io.flags.echo {
                BUFFER_MODE_ECHO
            } else {
                BUFFER_MODE_DATA
            };
            if io.op == ScsiOp::READ_DATA_BUFF {
                if io.flags.buf_cap {
                    cdb[1] |= BUFFER_MODE_DESCRIPTOR;
                }
            } else {
                control_dir = SCSIIO_CONTROL_WRITE;
            }
            cdb[6..9].copy_from_slice(&size[1..]);
            10
        }
        ScsiOp::SYNCHRONIZE_CACHE => 10,
        ScsiOp::REPORT_LUNS => {
            cdb[6..10].copy_from_slice(&size);
            12
        }
        ScsiOp::TRANSPORT_LAYER_RETRIES => {
            cdb[1] = 0x01;
            6
        }
        ScsiOp::SERVICE_ACTION_IN16 => {
            cdb[1] = SAI_READ_CAPACITY_16;
            cdb[10..14].copy_from_slice(&size);
            16
        }
        op => return Err(InternalCmdError::UnsupportedOpcode(op)),
    };
    Ok(CdbRecipe {
        cdb,
        len,
        control_dir,
        timeout,
    })
}

/// Maps an internal command reply to its outcome. `op` is the opcode of the
/// request.
fn completion_code(raw: &[u8], op: ScsiOp) -> InternalOutcome {
    let Ok((header, _)) = DefaultReply::read_from_prefix(raw) else {
        return InternalOutcome::SomeError;
    };
    let status = IocStatus::from_reply(header.ioc_status);
    // SCSI IO replies keep the SCSI status and state in bytes 12 and 13,
    // which every reply header has.
    let scsi_status = ScsiStatus(raw[12]);
    let scsi_state = ScsiState::from_bits(raw[13]);

    match status {
        IocStatus::SCSI_DEVICE_NOT_THERE => InternalOutcome::SelectionTimeout,

        IocStatus::SCSI_IO_DATA_ERROR
        | IocStatus::SCSI_TASK_TERMINATED
        | IocStatus::SCSI_IOC_TERMINATED
        | IocStatus::SCSI_EXT_TERMINATED => InternalOutcome::DidReset,

        IocStatus::BUSY | IocStatus::INSUFFICIENT_RESOURCES => InternalOutcome::Busy,

        IocStatus::SCSI_DATA_UNDERRUN | IocStatus::SCSI_RECOVERED_ERROR | IocStatus::SUCCESS => {
            if header.function == Function::CONFIG {
                InternalOutcome::Good
            } else if header.function == Function::RAID_ACTION {
                match RaidActionReply::read_from_prefix(raw) {
                    Ok((reply, _)) if reply.action_status == RAID_ACTION_STATUS_SUCCESS => {
                        InternalOutcome::Good
                    }
                    _ => InternalOutcome::SomeError,
                }
            } else if scsi_state.autosense_valid() {
                InternalOutcome::Sense
            } else if scsi_state.autosense_failed() {
                if op == ScsiOp::INQUIRY {
                    InternalOutcome::IssueSense
                } else {
                    InternalOutcome::DidReset
                }
            } else if scsi_state.no_scsi_status() || scsi_state.terminated() {
                InternalOutcome::DidReset
            } else if scsi_status == ScsiStatus::BUSY {
                InternalOutcome::Busy
            } else {
                InternalOutcome::Good
            }
        }

        IocStatus::SCSI_PROTOCOL_ERROR => {
            if scsi_state.terminated() {
                InternalOutcome::DidReset
            } else {
                InternalOutcome::SomeError
            }
        }

        _ => InternalOutcome::SomeError,
    }
}

impl<A: MptAdapter> ScsiHost<A> {
    /// Issues an internal command and waits for it.
    ///
    /// Returns [`InternalOutcome::Busy`] without sending anything while the
    /// IOC is being reset or no frame is free.
    pub fn do_cmd(&self, io: &InternalCmd) -> Result<InternalCompletion, InternalCmdError> {
        if self.flags.lock().reset_in_progress {
            tracing::debug!(ioc = self.adapter.name(), "busy with ioc reset");
            return Ok(InternalCompletion::new(InternalOutcome::Busy));
        }

        let guard = self.internal.lock();
        let recipe = build_cdb(io)?;

        let Some(mut frame) = self.adapter.alloc_frame(ReplyContext::Internal) else {
            tracing::warn!(ioc = self.adapter.name(), "no frames for internal command");
            return Ok(InternalCompletion::new(InternalOutcome::Busy));
        };

        let (function, target_id, bus) = match io.phys_disk_num {
            Some(num) => (Function::RAID_SCSI_IO_PASSTHROUGH, num, 0),
            None => (Function::SCSI_IO_REQUEST, io.id, io.channel),
        };
        let queue = if io.flags.tagged && io.op != ScsiOp::REQUEST_SENSE {
            SCSIIO_CONTROL_SIMPLEQ
        } else {
            SCSIIO_CONTROL_UNTAGGED
        };
        let request = ScsiIoRequest {
            target_id,
            bus,
            chain_offset: 0,
            function,
            cdb_length: recipe.len,
            sense_buffer_length: SENSE_BUFFER_SIZE,
            reserved: 0,
            msg_flags: 0,
            msg_context: frame.msg_context(),
            lun: lun_bytes(io.lun),
            control: recipe.control_dir | queue,
            cdb: recipe.cdb,
            data_length: io.size,
            sense_buffer_low_addr: self.adapter.sense_buffer(frame.index()).iova() as u32,
        };
        frame.mem().write_obj(0, &request);
        let sge_flags = if recipe.control_dir == SCSIIO_CONTROL_READ {
            SGE_FLAGS_SSIMPLE_READ
        } else {
            SGE_FLAGS_SSIMPLE_WRITE
        };
        let nb = self.write_simple_sge(
            &frame,
            SCSI_IO_SGL_OFFSET,
            sge_flags | io.size,
            io.data_dma,
        );
        frame.set_request_nb(nb);

        tracing::debug!(
            ioc = self.adapter.name(),
            channel = io.channel,
            id = io.id,
            lun = io.lun,
            req_idx = frame.index(),
            op = ?io.op,
            "sending internal command"
        );

        self.internal.arm(&guard);
        self.adapter.post_frame(ReplyContext::Internal, &frame);
        let completion = match self.internal.wait(&guard, self.config.units(recipe.timeout)) {
            WaitOutcome::Completed(reply) => {
                reply.unwrap_or_else(|| InternalCompletion::new(InternalOutcome::Good))
            }
            WaitOutcome::IocReset => {
                self.adapter.free_frame(frame.index());
                InternalCompletion::new(InternalOutcome::DidReset)
            }
            WaitOutcome::TimedOut => {
                tracing::debug!(
                    ioc = self.adapter.name(),
                    op = ?io.op,
                    "internal command timed out"
                );
                if let Err(err) = self.scandv_bus_reset() {
                    tracing::warn!(
                        ioc = self.adapter.name(),
                        error = &err as &dyn std::error::Error,
                        "bus reset failed, resetting ioc"
                    );
                    self.reset_after_timeout();
                }
                self.adapter.free_frame(frame.index());
                InternalCompletion::new(InternalOutcome::DidReset)
            }
        };
        tracing::debug!(
            ioc = self.adapter.name(),
            op = ?io.op,
            outcome = ?completion.outcome,
            "internal command done"
        );
        Ok(completion)
    }

    fn reset_after_timeout(&self) {
        if let Err(err) = self.reset_ioc_escalating() {
            tracing::error!(
                ioc = self.adapter.name(),
                error = &err as &dyn std::error::Error,
                "ioc reset after internal command timeout failed"
            );
        }
    }

    /// Completion handler for internal command frames.
    pub(crate) fn internal_complete(
        &self,
        frame: &MessageFrame,
        reply: Option<&[u8]>,
    ) -> FrameRelease {
        let completion = reply.map(|raw| {
            let request: ScsiIoRequest = frame.mem().read_obj(0);
            let mut completion =
                InternalCompletion::new(completion_code(raw, ScsiOp(request.cdb[0])));
            let scsi_io = matches!(
                request.function,
                Function::SCSI_IO_REQUEST | Function::RAID_SCSI_IO_PASSTHROUGH
            );
            let autosense = raw.get(13).is_some_and(|&b| ScsiState::from_bits(b).autosense_valid());
            if scsi_io && autosense {
                let mem = self.adapter.sense_buffer(frame.index());
                let len = usize::from(request.sense_buffer_length)
                    .min(SENSE_BUFFER_ALLOC)
                    .min(mem.len());
                mem.read_at(0, &mut completion.sense[..len]);
                completion.sense_len = len;
            }
            completion
        });

        if self.internal.complete(completion) {
            FrameRelease::Free
        } else {
            // The waiter gave up and frees the frame itself.
            FrameRelease::Retain
        }
    }

    /// Flushes the write cache of a disk before it goes away.
    pub fn synchronize_cache(&self, device: &ScsiDevice) -> Result<(), InternalCmdError> {
        let target = device.target();
        // Hidden components are flushed through their volume.
        if target.is_raid_component() {
            return Ok(());
        }
        if device.peripheral_type() != PERIPHERAL_DIRECT_ACCESS
            || target.is_deleted()
            || !device.is_configured()
        {
            return Ok(());
        }

        tracing::info!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            lun = device.lun(),
            "synchronize cache"
        );
        let io = InternalCmd::new(
            ScsiOp::SYNCHRONIZE_CACHE,
            target.channel,
            target.id,
            device.lun(),
        );
        match self.do_cmd(&io)?.outcome {
            InternalOutcome::Good => Ok(()),
            outcome => Err(InternalCmdError::Failed(outcome)),
        }
    }

    /// Quiesces or resumes physical disk IO behind a RAID volume.
    pub fn quiesce_raid(
        &self,
        quiesce: bool,
        channel: u8,
        id: u8,
    ) -> Result<InternalOutcome, InternalCmdError> {
        let guard = self.internal.lock();
        let Some(mut frame) = self.adapter.alloc_frame(ReplyContext::Internal) else {
            tracing::warn!(ioc = self.adapter.name(), "no frames for raid action");
            return Err(InternalCmdError::NoFrames);
        };

        let action = if quiesce {
            RAID_ACTION_QUIESCE_PHYS_IO
        } else {
            RAID_ACTION_ENABLE_PHYS_IO
        };
        let request = RaidActionRequest {
            action,
            function: Function::RAID_ACTION,
            volume_id: id,
            volume_bus: channel,
            msg_context: frame.msg_context(),
            ..RaidActionRequest::new_zeroed()
        };
        frame.mem().write_obj(0, &request);
        let nb = self.write_simple_sge(
            &frame,
            RAID_ACTION_SGE_OFFSET,
            SGE_FLAGS_SSIMPLE_READ,
            SGE_NULL_ADDRESS,
        );
        frame.set_request_nb(nb);

        tracing::debug!(
            ioc = self.adapter.name(),
            channel,
            id,
            action,
            "raid volume action"
        );

        self.internal.arm(&guard);
        self.adapter.post_frame(ReplyContext::Internal, &frame);
        match self
            .internal
            .wait(&guard, self.config.units(RAID_ACTION_TIMEOUT))
        {
            WaitOutcome::Completed(reply) => {
                Ok(reply.map_or(InternalOutcome::Good, |reply| reply.outcome))
            }
            WaitOutcome::IocReset => {
                self.adapter.free_frame(frame.index());
                Err(InternalCmdError::IocReset)
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(ioc = self.adapter.name(), "raid action timed out, resetting ioc");
                self.reset_after_timeout();
                self.adapter.free_frame(frame.index());
                Err(InternalCmdError::TimedOut)
            }
        }
    }
}
