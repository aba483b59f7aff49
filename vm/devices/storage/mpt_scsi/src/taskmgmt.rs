// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Task management and the OS error handler entry points.
//!
//! Recovery escalates abort, target reset, bus reset, host reset. Only one
//! task management request is outstanding per IOC. A request that times out
//! resets the IOC.

use crate::adapter::AdapterError;
use crate::adapter::FrameRelease;
use crate::adapter::MessageFrame;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::cmd::HostStatus;
use crate::cmd::ScsiCmd;
use crate::cmd::ScsiResult;
use crate::host::task_mgmt_timeout;
use crate::host::ResetKind;
use crate::host::ScsiHost;
use crate::internal::scandv_reset_timeout;
use crate::mgmt::WaitOutcome;
use mpi_spec::lun_bytes;
use mpi_spec::Function;
use mpi_spec::IocState;
use mpi_spec::IocStatus;
use mpi_spec::ScsiTaskMgmt;
use mpi_spec::ScsiTaskMgmtReply;
use mpi_spec::TaskMgmtResponse;
use mpi_spec::TaskType;
use mpi_spec::MPI_VERSION_01_05;
use mpi_spec::TASKMGMT_MSGFLAGS_LIPRESET_RESET_OPTION;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;

#[derive(Debug, Error)]
pub enum TaskMgmtError {
    #[error("doorbell is busy with another handshake")]
    DoorbellActive,
    #[error("task management or IOC reset already in progress")]
    InProgress,
    #[error("no message frames available")]
    NoFrames,
    #[error("failed to send task management request")]
    Handshake(#[source] AdapterError),
    #[error("request was terminated by an IOC reset")]
    IocReset,
    #[error("request completed without a reply")]
    NoReply,
    #[error("request timed out")]
    TimedOut,
    #[error("request timed out and the IOC reset failed")]
    ResetFailed(#[source] AdapterError),
    #[error("request failed: ioc status {ioc_status:?}, {termination_count} terminated")]
    Failed {
        ioc_status: IocStatus,
        termination_count: u32,
    },
}

/// Errors from the OS error handler entry points.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("not supported for hidden RAID components")]
    RaidComponent,
    #[error("not supported for RAID volumes")]
    RaidVolume,
    #[error("command is still outstanding after abort")]
    StillActive,
    #[error("task management failed")]
    TaskMgmt(#[source] TaskMgmtError),
    #[error("IOC reset failed")]
    Reset(#[source] AdapterError),
}

impl<A: MptAdapter> ScsiHost<A> {
    /// Sets the task management in progress flag, which also quiesces IO.
    /// Fails if task management or an IOC reset is already running.
    fn set_taskmgmt_in_progress(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.reset_in_progress || flags.taskmgmt_in_progress {
            return false;
        }
        flags.taskmgmt_in_progress = true;
        flags.quiesce_io = true;
        true
    }

    fn clear_taskmgmt_in_progress(&self) {
        let mut flags = self.flags.lock();
        flags.taskmgmt_in_progress = false;
        flags.quiesce_io = false;
    }

    fn write_task_mgmt(
        &self,
        frame: &MessageFrame,
        task_type: TaskType,
        channel: u8,
        id: u8,
        lun: u64,
        ctx_to_abort: u32,
    ) {
        let msg_flags = if task_type == TaskType::RESET_BUS {
            TASKMGMT_MSGFLAGS_LIPRESET_RESET_OPTION
        } else {
            0
        };
        let request = ScsiTaskMgmt {
            target_id: id,
            bus: channel,
            function: Function::SCSI_TASK_MGMT,
            task_type,
            msg_flags,
            msg_context: frame.msg_context(),
            lun: lun_bytes(lun),
            task_msg_context: ctx_to_abort,
            ..ScsiTaskMgmt::new_zeroed()
        };
        frame.mem().write_obj(0, &request);
    }

    fn send_task_mgmt(&self, frame: &MessageFrame) -> Result<(), AdapterError> {
        if self.adapter.facts().high_priority_queue() {
            self.adapter
                .post_frame_high_priority(ReplyContext::TaskMgmt, frame);
            Ok(())
        } else {
            self.adapter.send_handshake(ReplyContext::TaskMgmt, frame)
        }
    }

    /// Sends a task management request and waits for it.
    ///
    /// If the IOC is not operational, it is hard reset instead and the
    /// request counts as done. If the request times out, the IOC is reset
    /// and the request succeeds if the reset does.
    pub fn issue_task_mgmt(
        &self,
        task_type: TaskType,
        channel: u8,
        id: u8,
        lun: u64,
        ctx_to_abort: u32,
        timeout: Duration,
    ) -> Result<(), TaskMgmtError> {
        let doorbell = self.adapter.doorbell();
        if doorbell.state() != IocState::OPERATIONAL {
            tracing::warn!(
                ioc = self.adapter.name(),
                ?task_type,
                state = ?doorbell.state(),
                "ioc not operational, issuing hard reset"
            );
            if let Err(err) = self.reset_ioc(ResetKind::Hard) {
                tracing::warn!(
                    ioc = self.adapter.name(),
                    error = &err as &dyn std::error::Error,
                    "task management hard reset failed"
                );
            }
            return Ok(());
        }

        if doorbell.active() {
            tracing::warn!(ioc = self.adapter.name(), ?task_type, "doorbell active");
            return Err(TaskMgmtError::DoorbellActive);
        }

        let guard = self.taskmgmt.lock();
        if !self.set_taskmgmt_in_progress() {
            return Err(TaskMgmtError::InProgress);
        }

        let Some(frame) = self.adapter.alloc_frame(ReplyContext::TaskMgmt) else {
            tracing::error!(ioc = self.adapter.name(), "no frames for task management");
            self.clear_taskmgmt_in_progress();
            return Err(TaskMgmtError::NoFrames);
        };
        self.write_task_mgmt(&frame, task_type, channel, id, lun, ctx_to_abort);
        tracing::debug!(
            ioc = self.adapter.name(),
            channel,
            id,
            lun,
            req_idx = frame.index(),
            ?task_type,
            ctx_to_abort,
            ?timeout,
            "issuing task management"
        );

        self.taskmgmt.arm(&guard);
        if let Err(err) = self.send_task_mgmt(&frame) {
            tracing::error!(
                ioc = self.adapter.name(),
                error = &err as &dyn std::error::Error,
                "task management handshake failed"
            );
            self.taskmgmt.disarm(&guard);
            self.adapter.free_frame(frame.index());
            self.clear_taskmgmt_in_progress();
            return Err(TaskMgmtError::Handshake(err));
        }

        let result = match self.taskmgmt.wait(&guard, timeout) {
            WaitOutcome::Completed(reply) => self.taskmgmt_reply(task_type, reply.as_ref()),
            WaitOutcome::IocReset => {
                self.adapter.free_frame(frame.index());
                Err(TaskMgmtError::IocReset)
            }
            WaitOutcome::TimedOut => {
                tracing::info!(
                    ioc = self.adapter.name(),
                    ?task_type,
                    "task management timed out, resetting ioc"
                );
                // The reset terminates whatever the request was for.
                let result = self
                    .reset_ioc_escalating()
                    .map_err(TaskMgmtError::ResetFailed);
                self.adapter.free_frame(frame.index());
                result
            }
        };
        self.clear_taskmgmt_in_progress();
        result
    }

    /// Interprets a task management reply.
    fn taskmgmt_reply(
        &self,
        task_type: TaskType,
        reply: Option<&ScsiTaskMgmtReply>,
    ) -> Result<(), TaskMgmtError> {
        let reply = reply.ok_or(TaskMgmtError::NoReply)?;
        let ioc_status = IocStatus::from_reply(reply.ioc_status);
        let termination_count = reply.termination_count;

        tracing::debug!(
            ioc = self.adapter.name(),
            channel = reply.bus,
            id = reply.target_id,
            ?task_type,
            ?ioc_status,
            log_info = reply.ioc_log_info,
            response_code = ?reply.response_code,
            termination_count,
            "task management reply"
        );

        if self.adapter.facts().msg_version >= MPI_VERSION_01_05
            && reply.response_code != TaskMgmtResponse::TASK_MGMT_COMPLETE
        {
            tracing::info!(
                ioc = self.adapter.name(),
                response_code = reply.response_code.0,
                "firmware response: {}",
                reply.response_code.description()
            );
        }

        let ok = if ioc_status == IocStatus::SUCCESS {
            true
        } else if task_type == TaskType::ABORT_TASK {
            termination_count == 1
        } else {
            matches!(
                ioc_status,
                IocStatus::SCSI_TASK_TERMINATED | IocStatus::SCSI_IOC_TERMINATED
            )
        };
        if ok {
            Ok(())
        } else {
            Err(TaskMgmtError::Failed {
                ioc_status,
                termination_count,
            })
        }
    }

    /// Completion handler for task management frames.
    pub(crate) fn taskmgmt_complete(
        &self,
        frame: &MessageFrame,
        reply: Option<&[u8]>,
    ) -> FrameRelease {
        let reply = reply.and_then(|raw| match ScsiTaskMgmtReply::read_from_prefix(raw) {
            Ok((reply, _)) => Some(reply),
            Err(_) => {
                tracing::warn!(
                    ioc = self.adapter.name(),
                    len = raw.len(),
                    "short task management reply"
                );
                None
            }
        });
        tracing::debug!(
            ioc = self.adapter.name(),
            req_idx = frame.index(),
            reply = reply.is_some(),
            "task management completed"
        );
        if self.taskmgmt.complete(reply) {
            self.clear_taskmgmt_in_progress();
            FrameRelease::Free
        } else {
            // The waiter gave up and frees the frame itself.
            FrameRelease::Retain
        }
    }

    /// Resets bus 0 on behalf of a timed out internal command. Never resets
    /// the IOC itself.
    pub(crate) fn scandv_bus_reset(&self) -> Result<(), TaskMgmtError> {
        let guard = self.taskmgmt.lock();
        if !self.set_taskmgmt_in_progress() {
            return Err(TaskMgmtError::InProgress);
        }

        let Some(frame) = self.adapter.alloc_frame(ReplyContext::TaskMgmt) else {
            tracing::warn!(ioc = self.adapter.name(), "no frames for bus reset");
            self.clear_taskmgmt_in_progress();
            return Err(TaskMgmtError::NoFrames);
        };
        self.write_task_mgmt(&frame, TaskType::RESET_BUS, 0, 0, 0, 0);

        let timeout = self
            .config
            .units(scandv_reset_timeout(self.adapter.bus_type()));
        tracing::debug!(
            ioc = self.adapter.name(),
            req_idx = frame.index(),
            ?timeout,
            "issuing bus reset"
        );

        self.taskmgmt.arm(&guard);
        if let Err(err) = self.send_task_mgmt(&frame) {
            self.taskmgmt.disarm(&guard);
            self.adapter.free_frame(frame.index());
            self.clear_taskmgmt_in_progress();
            return Err(TaskMgmtError::Handshake(err));
        }

        let result = match self.taskmgmt.wait(&guard, timeout) {
            WaitOutcome::Completed(None) => Err(TaskMgmtError::NoReply),
            WaitOutcome::Completed(Some(reply)) => {
                let ioc_status = IocStatus::from_reply(reply.ioc_status);
                match ioc_status {
                    IocStatus::SUCCESS
                    | IocStatus::SCSI_TASK_TERMINATED
                    | IocStatus::SCSI_IOC_TERMINATED => Ok(()),
                    _ => Err(TaskMgmtError::Failed {
                        ioc_status,
                        termination_count: reply.termination_count,
                    }),
                }
            }
            WaitOutcome::IocReset => {
                self.adapter.free_frame(frame.index());
                Err(TaskMgmtError::IocReset)
            }
            WaitOutcome::TimedOut => {
                self.adapter.free_frame(frame.index());
                Err(TaskMgmtError::TimedOut)
            }
        };
        self.clear_taskmgmt_in_progress();
        result
    }

    /// Aborts an outstanding command.
    ///
    /// Succeeds if the command no longer occupies its request slot
    /// afterwards, whatever the task management outcome.
    pub fn abort(&self, cmd: &Arc<ScsiCmd>) -> Result<(), RecoveryError> {
        let target = cmd.target();
        let lun = cmd.device().lun();
        tracing::info!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            lun,
            op = ?cmd.op(),
            "attempting task abort"
        );

        let Some(idx) = self.lookup.position(cmd) else {
            tracing::debug!(ioc = self.adapter.name(), "command not outstanding");
            cmd.set_result(ScsiResult::host(HostStatus::Reset));
            return Ok(());
        };

        if target.is_raid_component() {
            cmd.set_result(ScsiResult::host(HostStatus::Reset));
            return Err(RecoveryError::RaidComponent);
        }
        if target.is_raid_volume() {
            cmd.set_result(ScsiResult::host(HostStatus::Reset));
            return Err(RecoveryError::RaidVolume);
        }

        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);

        let serial = cmd.serial();
        let ctx_to_abort = self.adapter.frame(idx).msg_context().into_bits();
        let timeout = self.config.units(task_mgmt_timeout(self.adapter.bus_type()));
        if let Err(err) = self.issue_task_mgmt(
            TaskType::ABORT_TASK,
            target.channel,
            target.id,
            lun,
            ctx_to_abort,
            timeout,
        ) {
            tracing::debug!(
                ioc = self.adapter.name(),
                error = &err as &dyn std::error::Error,
                "abort task management failed"
            );
        }

        let still_active = self
            .lookup
            .get(idx)
            .is_some_and(|c| Arc::ptr_eq(&c, cmd) && c.serial() == serial);
        let result = if still_active {
            Err(RecoveryError::StillActive)
        } else {
            Ok(())
        };
        tracing::info!(
            ioc = self.adapter.name(),
            success = result.is_ok(),
            "task abort done"
        );
        result
    }

    /// Resets the target `cmd` was sent to.
    pub fn device_reset(&self, cmd: &ScsiCmd) -> Result<(), RecoveryError> {
        let target = cmd.target();
        tracing::info!(
            ioc = self.adapter.name(),
            channel = target.channel,
            id = target.id,
            "attempting target reset"
        );
        if target.is_raid_component() {
            return Err(RecoveryError::RaidComponent);
        }
        let timeout = self.config.units(task_mgmt_timeout(self.adapter.bus_type()));
        let result = self
            .issue_task_mgmt(TaskType::TARGET_RESET, target.channel, target.id, 0, 0, timeout)
            .map_err(RecoveryError::TaskMgmt);
        tracing::info!(
            ioc = self.adapter.name(),
            success = result.is_ok(),
            "target reset done"
        );
        result
    }

    /// Resets the bus `cmd` was sent on.
    pub fn bus_reset(&self, cmd: &ScsiCmd) -> Result<(), RecoveryError> {
        let channel = cmd.target().channel;
        tracing::info!(ioc = self.adapter.name(), channel, "attempting bus reset");
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.units(task_mgmt_timeout(self.adapter.bus_type()));
        let result = self
            .issue_task_mgmt(TaskType::RESET_BUS, channel, 0, 0, 0, timeout)
            .map_err(RecoveryError::TaskMgmt);
        tracing::info!(
            ioc = self.adapter.name(),
            success = result.is_ok(),
            "bus reset done"
        );
        result
    }

    /// Resets the IOC: soft reset first, hard reset if that fails.
    pub fn host_reset(&self) -> Result<(), RecoveryError> {
        tracing::info!(ioc = self.adapter.name(), "attempting host reset");
        let result = self
            .reset_ioc_escalating()
            .map_err(RecoveryError::Reset);
        tracing::info!(
            ioc = self.adapter.name(),
            success = result.is_ok(),
            "host reset done"
        );
        result
    }
}
