// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI IO completion: turns an IOC reply into the result the OS sees.

use crate::adapter::BusType;
use crate::adapter::FrameRelease;
use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::adapter::MSG_CONTEXT_OFFSET;
use crate::adapter::PCI_VENDOR_ID_IBM;
use crate::cmd::HostStatus;
use crate::cmd::ScsiCmd;
use crate::cmd::ScsiResult;
use crate::cmd::ScsiTarget;
use crate::host::ScsiHost;
use mpi_spec::scsi::ASC_FAILURE_PREDICTION;
use mpi_spec::scsi::SENSE_BUFFER_SIZE;
use mpi_spec::scsi::SENSE_ILI;
use mpi_spec::scsi::SENSE_INFO_NEGATIVE;
use mpi_spec::scsi::SENSE_KEY_MEDIUM_ERROR;
use mpi_spec::Function;
use mpi_spec::IocStatus;
use mpi_spec::MsgContext;
use mpi_spec::RequestHeader;
use mpi_spec::ScsiIoReply;
use mpi_spec::ScsiStatus;
use mpi_spec::SepRequest;
use mpi_spec::SepSlotStatus;
use mpi_spec::SAS_LOGINFO_MASK;
use mpi_spec::SAS_LOGINFO_NEXUS_LOSS;
use mpi_spec::SEP_REQ_ACTION_WRITE_STATUS;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::FromZeros;

type SenseData = [u8; SENSE_BUFFER_SIZE];

impl<A: MptAdapter> ScsiHost<A> {
    /// Completes a SCSI IO request. `reply` is `None` for a context reply,
    /// which means the command succeeded.
    pub(crate) fn io_done(&self, frame: &MessageFrame, reply: Option<&[u8]>) -> FrameRelease {
        let req_idx = frame.msg_context().req_idx();

        if let Some(reply) = reply {
            let reply_idx = reply
                .get(MSG_CONTEXT_OFFSET..MSG_CONTEXT_OFFSET + 4)
                .and_then(|b| b.try_into().ok())
                .map(|b| MsgContext::from_bits(u32::from_le_bytes(b)).req_idx());
            if reply_idx != Some(req_idx) {
                tracing::error!(
                    ioc = self.adapter.name(),
                    req_idx,
                    reply_idx,
                    "reply for a frame that was already freed"
                );
                return FrameRelease::Retain;
            }
        }

        let Some(cmd) = self.lookup.take(req_idx) else {
            let header: RequestHeader = frame.mem().read_obj(0);
            // Enclosure requests complete here too, without a command.
            if header.function == Function::SCSI_IO_REQUEST {
                tracing::error!(ioc = self.adapter.name(), req_idx, "no command for completion");
            }
            self.chains.release(req_idx);
            return FrameRelease::Free;
        };

        if cmd.frame_index() != Some(req_idx) {
            self.chains.release(req_idx);
            return FrameRelease::Free;
        }

        let target = cmd.target();
        if self.adapter.bus_type() == BusType::Sas && target.is_deleted() {
            cmd.set_result(ScsiResult::host(HostStatus::NoConnect));
        } else {
            cmd.set_result(ScsiResult::GOOD);
            if let Some(reply) = reply {
                match ScsiIoReply::read_from_prefix(reply) {
                    Ok((reply, _)) => self.decode_reply(&cmd, frame, &reply),
                    Err(_) => {
                        tracing::error!(
                            ioc = self.adapter.name(),
                            req_idx,
                            len = reply.len(),
                            "short scsi io reply"
                        );
                        cmd.set_result(ScsiResult::host(HostStatus::SoftError));
                    }
                }
            }
        }
        cmd.clear_frame();

        self.adapter.dma_unmap(&cmd);
        cmd.complete();
        self.chains.release(req_idx);
        FrameRelease::Free
    }

    fn decode_reply(&self, cmd: &ScsiCmd, frame: &MessageFrame, reply: &ScsiIoReply) {
        let bus = self.adapter.bus_type();
        let target = cmd.target();
        let raw_status = reply.ioc_status;
        let mut status = IocStatus::from_reply(raw_status);
        let scsi_state = reply.scsi_state;
        let scsi_status = reply.scsi_status;
        let xfer_cnt = reply.transfer_count;
        let log_info = reply.ioc_log_info;
        let bufflen = cmd.bufflen();

        cmd.set_resid(bufflen.saturating_sub(xfer_cnt));

        // Never started: report the SCSI status, not the underrun.
        if status == IocStatus::SCSI_DATA_UNDERRUN
            && xfer_cnt == 0
            && matches!(
                scsi_status,
                ScsiStatus::BUSY | ScsiStatus::RESERVATION_CONFLICT | ScsiStatus::TASK_SET_FULL
            )
        {
            status = IocStatus::SUCCESS;
        }

        let sense = if scsi_state.autosense_valid() {
            Some(self.copy_sense(cmd, frame, reply))
        } else {
            None
        };

        let result = match status {
            IocStatus::BUSY | IocStatus::INSUFFICIENT_RESOURCES => {
                ScsiResult::status(ScsiStatus::BUSY)
            }

            IocStatus::SCSI_INVALID_BUS | IocStatus::SCSI_INVALID_TARGETID => {
                ScsiResult::host(HostStatus::BadTarget)
            }

            IocStatus::SCSI_DEVICE_NOT_THERE => {
                target.count_sel_timeout();
                self.counters.sel_timeouts.fetch_add(1, Ordering::Relaxed);
                if target.led_on() {
                    self.issue_sep_command(target, SepSlotStatus::new().with_unconfigured(true));
                    target.set_led_on(false);
                }
                // A fibre channel device may come back with the next rescan.
                if bus == BusType::Fc {
                    ScsiResult::host(HostStatus::Requeue)
                } else {
                    ScsiResult::host(HostStatus::NoConnect)
                }
            }

            IocStatus::SCSI_IOC_TERMINATED
            | IocStatus::SCSI_TASK_TERMINATED
            | IocStatus::SCSI_EXT_TERMINATED => {
                if bus == BusType::Fc {
                    // Retryable, but not forever.
                    ScsiResult::host(HostStatus::Error)
                } else if bus == BusType::Sas
                    && status == IocStatus::SCSI_IOC_TERMINATED
                    && IocStatus::log_info_available(raw_status)
                    && log_info & SAS_LOGINFO_MASK == SAS_LOGINFO_NEXUS_LOSS
                {
                    ScsiResult::host(HostStatus::BusBusy)
                } else {
                    ScsiResult::host(HostStatus::Reset)
                }
            }

            IocStatus::SCSI_RESIDUAL_MISMATCH => {
                if xfer_cnt == 0 || cmd.underflow() > xfer_cnt {
                    ScsiResult::host(HostStatus::SoftError)
                } else {
                    ScsiResult::status(scsi_status)
                }
            }

            IocStatus::SCSI_DATA_UNDERRUN => {
                let mut result = ScsiResult::status(scsi_status);
                if !scsi_state.autosense_valid() {
                    if bus == BusType::Spi && cmd.op().is_read_or_verify() && bufflen != xfer_cnt {
                        tracing::warn!(
                            ioc = self.adapter.name(),
                            bufflen,
                            xfer_cnt,
                            "LSI53C1030 underrun erratum"
                        );
                        result = ScsiResult::host(HostStatus::SoftError);
                    }
                    if xfer_cnt < cmd.underflow() {
                        result = if scsi_status == ScsiStatus::BUSY {
                            ScsiResult::status(ScsiStatus::BUSY)
                        } else {
                            ScsiResult::host(HostStatus::SoftError)
                        };
                    }
                    if scsi_state.autosense_failed() || scsi_state.no_scsi_status() {
                        result = ScsiResult::host(HostStatus::SoftError);
                    } else if scsi_state.terminated() {
                        result = ScsiResult::host(HostStatus::Reset);
                    }
                }
                tracing::debug!(
                    ioc = self.adapter.name(),
                    underflow = cmd.underflow(),
                    xfer_cnt,
                    "data underrun"
                );
                if scsi_status == ScsiStatus::TASK_SET_FULL {
                    self.report_queue_full(cmd);
                }
                result
            }

            IocStatus::SCSI_DATA_OVERRUN
            | IocStatus::SCSI_RECOVERED_ERROR
            | IocStatus::SUCCESS => {
                if status == IocStatus::SCSI_DATA_OVERRUN {
                    cmd.set_resid(0);
                }
                let mut result = ScsiResult::status(scsi_status);
                if let Some(sense) = &sense {
                    if bus == BusType::Spi {
                        self.fix_1030_sense(cmd, sense, xfer_cnt);
                    }
                } else if scsi_state.autosense_failed() || scsi_state.no_scsi_status() {
                    result = ScsiResult::host(HostStatus::SoftError);
                } else if scsi_state.terminated() {
                    result = ScsiResult::host(HostStatus::Reset);
                }
                // A rejected queue tag still completed the command.

                if scsi_status == ScsiStatus::TASK_SET_FULL
                    && (sense.is_some() || result == ScsiResult::status(ScsiStatus::TASK_SET_FULL))
                {
                    self.report_queue_full(cmd);
                }
                result
            }

            IocStatus::SCSI_PROTOCOL_ERROR => ScsiResult::host(HostStatus::SoftError),

            _ => ScsiResult::host(HostStatus::SoftError),
        };

        if result != ScsiResult::GOOD {
            tracing::debug!(
                ioc = self.adapter.name(),
                channel = target.channel,
                id = target.id,
                lun = cmd.device().lun(),
                req_idx = frame.index(),
                op = ?cmd.op(),
                ?status,
                ?scsi_status,
                ?scsi_state,
                log_info,
                xfer_cnt,
                ?result,
                "scsi io completed with error"
            );
        }
        cmd.set_result(result);
    }

    /// Copies the autosense data into the command and watches it for SMART
    /// failure predictions. Returns the stored sense bytes.
    fn copy_sense(&self, cmd: &ScsiCmd, frame: &MessageFrame, reply: &ScsiIoReply) -> SenseData {
        let mem = self.adapter.sense_buffer(frame.index());
        let mut data: SenseData = [0; SENSE_BUFFER_SIZE];
        let available = mem.len().min(data.len());
        mem.read_at(0, &mut data[..available]);

        let count = (reply.sense_count as usize)
            .min(self.config.sense_buffer_len)
            .min(available);
        if count == 0 {
            tracing::debug!(ioc = self.adapter.name(), "autosense valid with no sense data");
        }
        let sense = cmd.set_sense(&data[..count]);

        let target = cmd.target();
        // ASC is byte 12 and must be part of the returned sense.
        if count > 12 && data[12] == ASC_FAILURE_PREDICTION && !target.is_raid_volume() {
            tracing::info!(
                ioc = self.adapter.name(),
                channel = target.channel,
                id = target.id,
                lun = cmd.device().lun(),
                asc = data[12],
                ascq = data[13],
                "smart failure prediction"
            );
            if self.adapter.facts().pci_vendor == PCI_VENDOR_ID_IBM {
                self.issue_sep_command(target, SepSlotStatus::new().with_predicted_fault(true));
                target.set_led_on(true);
            }
        }
        sense
    }

    /// The LSI53C1030 can report an incorrect length in otherwise successful
    /// sense data. When the residue does not add up, turn it into a medium
    /// error.
    fn fix_1030_sense(&self, cmd: &ScsiCmd, sense: &SenseData, xfer_cnt: u32) {
        if sense[2] & SENSE_ILI == 0 {
            return;
        }
        let bufflen = cmd.bufflen();
        let difftransfer = u32::from_be_bytes([sense[3], sense[4], sense[5], sense[6]]);
        let corrupt = if sense[3] & SENSE_INFO_NEGATIVE != 0 {
            bufflen != xfer_cnt
        } else {
            bufflen != xfer_cnt.wrapping_add(difftransfer)
        };
        if corrupt {
            cmd.patch_sense(2, SENSE_KEY_MEDIUM_ERROR);
            cmd.patch_sense(12, 0xff);
            cmd.patch_sense(13, 0xff);
            tracing::warn!(
                ioc = self.adapter.name(),
                bufflen,
                xfer_cnt,
                difftransfer,
                "LSI53C1030 sense erratum"
            );
        }
    }

    fn report_queue_full(&self, cmd: &ScsiCmd) {
        self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
        if let Ok(missed) = self.queue_full.event() {
            tracing::warn!(
                ioc = self.adapter.name(),
                channel = cmd.target().channel,
                id = cmd.target().id,
                lun = cmd.device().lun(),
                missed,
                "device reported queue full"
            );
        }
    }

    /// Writes a slot status to the enclosure processor. SAS only.
    pub(crate) fn issue_sep_command(&self, target: &ScsiTarget, status: SepSlotStatus) {
        if self.adapter.bus_type() != BusType::Sas || target.is_raid_component() {
            return;
        }
        let Some(frame) = self.adapter.alloc_frame(ReplyContext::ScsiIo) else {
            tracing::warn!(ioc = self.adapter.name(), "no frame for enclosure request");
            return;
        };
        let request = SepRequest {
            target_id: target.id,
            bus: target.channel,
            function: Function::SCSI_ENCLOSURE_PROCESSOR,
            action: SEP_REQ_ACTION_WRITE_STATUS,
            msg_context: frame.msg_context(),
            slot_status: status,
            ..SepRequest::new_zeroed()
        };
        frame.mem().write_obj(0, &request);
        tracing::debug!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            ?status,
            "sending enclosure request"
        );
        // The reply comes back through the SCSI IO path, which finds no
        // command and frees the frame.
        self.adapter.post_frame(ReplyContext::ScsiIo, &frame);
    }
}
