// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host scenarios against the emulated IOC. The test plays the IOC: it waits
//! for posted frames and feeds replies back through the host.

use crate::adapter::BusType;
use crate::adapter::FrameRelease;
use crate::adapter::MptAdapter;
use crate::adapter::ReplyContext;
use crate::cmd::CmdError;
use crate::cmd::CompletionReceiver;
use crate::cmd::DataDirection;
use crate::cmd::DeviceConfig;
use crate::cmd::HostStatus;
use crate::cmd::ScsiCmd;
use crate::cmd::ScsiCompletion;
use crate::cmd::ScsiDevice;
use crate::cmd::ScsiResult;
use crate::cmd::ScsiTarget;
use crate::cmd::SgEntry;
use crate::cmd::TargetConfig;
use crate::host::QueueError;
use crate::host::ScsiHost;
use crate::host::ScsiHostConfig;
use crate::internal::InternalCmd;
use crate::internal::InternalOutcome;
use crate::lookup::LookupError;
use crate::sgl::SglError;
use crate::taskmgmt::RecoveryError;
use crate::taskmgmt::TaskMgmtError;
use crate::test_helpers::init_tracing;
use crate::test_helpers::EmulatedIoc;
use crate::test_helpers::IocConfig;
use crate::test_helpers::PostPath;
use futures::executor::block_on;
use mpi_spec::scsi::ScsiOp;
use mpi_spec::Event;
use mpi_spec::EventNotificationReply;
use mpi_spec::Function;
use mpi_spec::IocState;
use mpi_spec::IocStatus;
use mpi_spec::ScsiIoReply;
use mpi_spec::ScsiIoRequest;
use mpi_spec::ScsiState;
use mpi_spec::ScsiStatus;
use mpi_spec::ScsiTaskMgmt;
use mpi_spec::ScsiTaskMgmtReply;
use mpi_spec::SepRequest;
use mpi_spec::SgeFormat;
use mpi_spec::TaskType;
use mpi_spec::SCSIIO_CONTROL_NODATATRANSFER;
use mpi_spec::SCSIIO_CONTROL_READ;
use mpi_spec::SCSIIO_CONTROL_SIMPLEQ;
use mpi_spec::SCSIIO_CONTROL_UNTAGGED;
use std::sync::Arc;
use std::time::Duration;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const WAIT: Duration = Duration::from_secs(10);

fn host_with(ioc: IocConfig, time_unit: Duration) -> ScsiHost<EmulatedIoc> {
    init_tracing();
    ScsiHost::new(
        EmulatedIoc::new(ioc),
        ScsiHostConfig {
            time_unit,
            chain_buffers: 8,
            ..Default::default()
        },
    )
    .unwrap()
}

fn host(bus_type: BusType) -> ScsiHost<EmulatedIoc> {
    host_with(
        IocConfig {
            bus_type,
            ..Default::default()
        },
        Duration::from_secs(1),
    )
}

fn target(id: u8) -> TargetConfig {
    TargetConfig {
        channel: 0,
        id,
        q_yes: true,
        min_sync_factor: 0x09,
        ..Default::default()
    }
}

fn disk(target: &Arc<ScsiTarget>, lun: u64) -> Arc<ScsiDevice> {
    ScsiDevice::new(
        target.clone(),
        DeviceConfig {
            lun,
            peripheral_type: 0,
            tagged_supported: true,
            configured: true,
        },
    )
}

fn entries(n: usize) -> Vec<SgEntry> {
    (0..n)
        .map(|i| SgEntry {
            address: 0x10_0000 + i as u64 * 0x1000,
            len: 0x1000,
        })
        .collect()
}

fn read(device: &Arc<ScsiDevice>, pages: usize) -> Arc<ScsiCmd> {
    let len = (pages * 0x1000) as u32;
    ScsiCmd::new(
        device.clone(),
        &[0x28, 0, 0, 0, 0, 0, 0, 0, pages as u8, 0],
        DataDirection::FromDevice,
        entries(pages),
        len,
    )
    .unwrap()
}

/// Delivers a reply the way the base driver does, freeing the frame if the
/// handler is done with it.
fn deliver(
    host: &ScsiHost<EmulatedIoc>,
    context: ReplyContext,
    index: u16,
    reply: Option<&[u8]>,
) -> FrameRelease {
    let frame = host.adapter().frame(index);
    let release = host.handle_reply(context, &frame, reply);
    if release == FrameRelease::Free {
        host.adapter().free_frame(index);
    }
    release
}

fn io_reply(host: &ScsiHost<EmulatedIoc>, index: u16) -> ScsiIoReply {
    ScsiIoReply {
        function: Function::SCSI_IO_REQUEST,
        msg_context: host.adapter().frame(index).msg_context(),
        ..ScsiIoReply::new_zeroed()
    }
}

fn tm_reply(
    host: &ScsiHost<EmulatedIoc>,
    index: u16,
    status: IocStatus,
    terminated: u32,
) -> ScsiTaskMgmtReply {
    ScsiTaskMgmtReply {
        function: Function::SCSI_TASK_MGMT,
        msg_context: host.adapter().frame(index).msg_context(),
        ioc_status: status.0,
        termination_count: terminated,
        ..ScsiTaskMgmtReply::new_zeroed()
    }
}

fn completion(recv: CompletionReceiver) -> ScsiCompletion {
    block_on(recv).unwrap()
}

/// Queues a two page read on a fresh host and completes it with `reply`.
fn complete_with(
    bus_type: BusType,
    f: impl FnOnce(&mut ScsiIoReply),
) -> (ScsiHost<EmulatedIoc>, Arc<ScsiCmd>, ScsiCompletion) {
    let host = host(bus_type);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 2);
    let recv = host.queue_command(&cmd).unwrap();
    let mut reply = io_reply(&host, 0);
    f(&mut reply);
    assert_eq!(
        deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes())),
        FrameRelease::Free
    );
    let completion = completion(recv);
    (host, cmd, completion)
}

#[test]
fn context_reply_completes_good() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 2);
    let recv = host.queue_command(&cmd).unwrap();

    let posted = host.adapter().posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].context, ReplyContext::ScsiIo);
    assert_eq!(posted[0].path, PostPath::Fifo);
    let request: ScsiIoRequest = host.adapter().frame(0).mem().read_obj(0);
    assert_eq!(request.function, Function::SCSI_IO_REQUEST);
    assert_eq!(request.target_id, 1);
    assert_eq!(request.cdb_length, 10);
    assert_eq!(request.data_length, 0x2000);
    assert_eq!(request.control, SCSIIO_CONTROL_READ | SCSIIO_CONTROL_SIMPLEQ);
    assert_eq!(cmd.frame_index(), Some(0));
    assert_eq!(host.lookup().outstanding(), 1);

    assert_eq!(deliver(&host, ReplyContext::ScsiIo, 0, None), FrameRelease::Free);
    let completion = completion(recv);
    assert_eq!(completion.result, ScsiResult::GOOD);
    assert_eq!(completion.resid, 0);
    assert_eq!(cmd.frame_index(), None);
    assert_eq!(host.lookup().outstanding(), 0);
    assert_eq!(host.adapter().free_frames(), 16);
    assert_eq!(host.adapter().dma_unmaps(), 1);
}

#[test]
fn mismatched_reply_is_ignored() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    let mut recv = host.queue_command(&cmd).unwrap();

    let mut reply = io_reply(&host, 0);
    reply.msg_context = reply.msg_context.with_req_idx(5);
    assert_eq!(
        deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes())),
        FrameRelease::Retain
    );
    assert!(recv.try_recv().unwrap().is_none());
    assert_eq!(host.lookup().outstanding(), 1);
    assert!(host.adapter().is_allocated(0));

    assert_eq!(deliver(&host, ReplyContext::ScsiIo, 0, None), FrameRelease::Free);
    assert_eq!(completion(recv).result, ScsiResult::GOOD);
}

#[test]
fn completion_without_command_frees_frame() {
    let host = host(BusType::Spi);
    let frame = host.adapter().alloc_frame(ReplyContext::ScsiIo).unwrap();
    let request = ScsiIoRequest {
        function: Function::SCSI_IO_REQUEST,
        msg_context: frame.msg_context(),
        ..ScsiIoRequest::new_zeroed()
    };
    frame.mem().write_obj(0, &request);
    assert_eq!(
        deliver(&host, ReplyContext::ScsiIo, frame.index(), None),
        FrameRelease::Free
    );
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn busy_before_any_transfer_reports_busy() {
    let (_, cmd, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
        reply.scsi_status = ScsiStatus::BUSY;
        reply.transfer_count = 0;
    });
    assert_eq!(completion.result, ScsiResult::status(ScsiStatus::BUSY));
    assert_eq!(completion.resid, cmd.bufflen());
}

#[test]
fn overrun_reports_no_residual() {
    let (_, _, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_DATA_OVERRUN.0;
        reply.transfer_count = 0x1000;
    });
    assert_eq!(completion.result, ScsiResult::GOOD);
    assert_eq!(completion.resid, 0);
}

#[test]
fn short_read_on_1030_is_retried() {
    let (_, _, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
        reply.transfer_count = 0x1000;
    });
    assert_eq!(completion.result, ScsiResult::host(HostStatus::SoftError));
    assert_eq!(completion.resid, 0x1000);
}

#[test]
fn underrun_state_flags_override_status() {
    let state = |f: fn(ScsiState) -> ScsiState| f(ScsiState::new());
    let cases = [
        (
            BusType::Sas,
            0x2000,
            state(|s| s.with_autosense_failed(true)),
            HostStatus::SoftError,
        ),
        (
            BusType::Sas,
            0x2000,
            state(|s| s.with_no_scsi_status(true)),
            HostStatus::SoftError,
        ),
        (
            BusType::Sas,
            0x2000,
            state(|s| s.with_terminated(true)),
            HostStatus::Reset,
        ),
        // A failed state wins over termination.
        (
            BusType::Fc,
            0x2000,
            state(|s| s.with_no_scsi_status(true).with_terminated(true)),
            HostStatus::SoftError,
        ),
        // Termination wins over the erratum and the underflow check.
        (
            BusType::Spi,
            0x1000,
            state(|s| s.with_terminated(true)),
            HostStatus::Reset,
        ),
    ];

    for (bus_type, transfer_count, scsi_state, expected) in cases {
        let (_, _, completion) = complete_with(bus_type, |reply| {
            reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
            reply.scsi_state = scsi_state;
            reply.transfer_count = transfer_count;
        });
        assert_eq!(
            completion.result,
            ScsiResult::host(expected),
            "{bus_type:?} {scsi_state:?}"
        );
    }
}

#[test]
fn underrun_below_underflow_on_sas_and_fc() {
    for bus_type in [BusType::Sas, BusType::Fc] {
        let (_, _, completion) = complete_with(bus_type, |reply| {
            reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
            reply.scsi_status = ScsiStatus::BUSY;
            reply.transfer_count = 0x1000;
        });
        assert_eq!(completion.result, ScsiResult::status(ScsiStatus::BUSY));
        assert_eq!(completion.resid, 0x1000);

        let (_, _, completion) = complete_with(bus_type, |reply| {
            reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
            reply.transfer_count = 0x1000;
        });
        assert_eq!(completion.result, ScsiResult::host(HostStatus::SoftError));

        // Reaching the underflow threshold is not an error.
        let (_, _, completion) = complete_with(bus_type, |reply| {
            reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
            reply.transfer_count = 0x2000;
        });
        assert_eq!(completion.result, ScsiResult::GOOD);
        assert_eq!(completion.resid, 0);
    }
}

#[test]
fn residual_mismatch_with_full_transfer_keeps_status() {
    let (_, _, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_RESIDUAL_MISMATCH.0;
        reply.transfer_count = 0x2000;
    });
    assert_eq!(completion.result, ScsiResult::GOOD);
    assert_eq!(completion.resid, 0);

    let (_, _, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_RESIDUAL_MISMATCH.0;
        reply.transfer_count = 0x1000;
    });
    assert_eq!(completion.result, ScsiResult::host(HostStatus::SoftError));
    assert_eq!(completion.resid, 0x1000);
}

#[test]
fn never_started_reports_scsi_status() {
    let (_, cmd, completion) = complete_with(BusType::Spi, |reply| {
        reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
        reply.scsi_status = ScsiStatus::RESERVATION_CONFLICT;
        reply.transfer_count = 0;
    });
    assert_eq!(
        completion.result,
        ScsiResult::status(ScsiStatus::RESERVATION_CONFLICT)
    );
    assert_eq!(completion.resid, cmd.bufflen());

    let (host, cmd, completion) = complete_with(BusType::Sas, |reply| {
        reply.ioc_status = IocStatus::SCSI_DATA_UNDERRUN.0;
        reply.scsi_status = ScsiStatus::TASK_SET_FULL;
        reply.transfer_count = 0;
    });
    assert_eq!(completion.result, ScsiResult::status(ScsiStatus::TASK_SET_FULL));
    assert_eq!(completion.resid, cmd.bufflen());
    assert_eq!(host.stats().queue_full, 1);
}

#[test]
fn status_mapping() {
    let state = |f: fn(ScsiState) -> ScsiState| f(ScsiState::new());
    let cases = [
        (
            BusType::Spi,
            IocStatus::BUSY.0,
            ScsiState::new(),
            0,
            ScsiResult::status(ScsiStatus::BUSY),
        ),
        (
            BusType::Spi,
            IocStatus::INSUFFICIENT_RESOURCES.0,
            ScsiState::new(),
            0,
            ScsiResult::status(ScsiStatus::BUSY),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_INVALID_TARGETID.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::BadTarget),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_DEVICE_NOT_THERE.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::NoConnect),
        ),
        (
            BusType::Fc,
            IocStatus::SCSI_DEVICE_NOT_THERE.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::Requeue),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_IOC_TERMINATED.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::Reset),
        ),
        (
            BusType::Fc,
            IocStatus::SCSI_TASK_TERMINATED.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::Error),
        ),
        (
            BusType::Sas,
            IocStatus::SCSI_IOC_TERMINATED.0 | IocStatus::FLAG_LOG_INFO_AVAILABLE,
            ScsiState::new(),
            0x3117_0100,
            ScsiResult::host(HostStatus::BusBusy),
        ),
        (
            BusType::Sas,
            IocStatus::SCSI_IOC_TERMINATED.0,
            ScsiState::new(),
            0x3117_0100,
            ScsiResult::host(HostStatus::Reset),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_RESIDUAL_MISMATCH.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::SoftError),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_PROTOCOL_ERROR.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::SoftError),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_IO_DATA_ERROR.0,
            ScsiState::new(),
            0,
            ScsiResult::host(HostStatus::SoftError),
        ),
        (
            BusType::Spi,
            IocStatus::SUCCESS.0,
            state(|s| s.with_no_scsi_status(true)),
            0,
            ScsiResult::host(HostStatus::SoftError),
        ),
        (
            BusType::Spi,
            IocStatus::SUCCESS.0,
            state(|s| s.with_terminated(true)),
            0,
            ScsiResult::host(HostStatus::Reset),
        ),
        (
            BusType::Spi,
            IocStatus::SCSI_RECOVERED_ERROR.0,
            ScsiState::new(),
            0,
            ScsiResult::GOOD,
        ),
    ];

    for (bus_type, ioc_status, scsi_state, log_info, expected) in cases {
        let (_, _, completion) = complete_with(bus_type, |reply| {
            reply.ioc_status = ioc_status;
            reply.scsi_state = scsi_state;
            reply.ioc_log_info = log_info;
            reply.transfer_count = 0x2000;
            if ioc_status == IocStatus::SCSI_RESIDUAL_MISMATCH.0 {
                reply.transfer_count = 0;
            }
        });
        assert_eq!(
            completion.result, expected,
            "{bus_type:?} {:?}",
            IocStatus::from_reply(ioc_status)
        );
    }
}

#[test]
fn selection_timeout_is_counted() {
    let (host, cmd, _) = complete_with(BusType::Sas, |reply| {
        reply.ioc_status = IocStatus::SCSI_DEVICE_NOT_THERE.0;
    });
    assert_eq!(cmd.target().sel_timeouts(), 1);
    assert_eq!(host.stats().sel_timeouts, 1);
}

#[test]
fn autosense_is_copied() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 2);
    let recv = host.queue_command(&cmd).unwrap();

    let mut sense = [0u8; 18];
    sense[0] = 0x70;
    sense[2] = 0x05;
    sense[7] = 10;
    sense[12] = 0x24;
    host.adapter().sense_buffer(0).write_at(0, &sense);

    let mut reply = io_reply(&host, 0);
    reply.scsi_status = ScsiStatus::CHECK_CONDITION;
    reply.scsi_state = ScsiState::new().with_autosense_valid(true);
    reply.sense_count = 18;
    reply.transfer_count = 0;
    deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes()));

    let completion = completion(recv);
    assert_eq!(completion.result, ScsiResult::status(ScsiStatus::CHECK_CONDITION));
    assert_eq!(completion.sense(), &sense);
    assert_eq!(cmd.sense(), sense);
}

#[test]
fn incorrect_length_sense_becomes_medium_error() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 2);
    let recv = host.queue_command(&cmd).unwrap();

    let mut sense = [0u8; 18];
    sense[0] = 0x70;
    // Incorrect length with a residue of zero, but only half transferred.
    sense[2] = 0x20;
    host.adapter().sense_buffer(0).write_at(0, &sense);

    let mut reply = io_reply(&host, 0);
    reply.scsi_status = ScsiStatus::CHECK_CONDITION;
    reply.scsi_state = ScsiState::new().with_autosense_valid(true);
    reply.sense_count = 18;
    reply.transfer_count = 0x1000;
    deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes()));

    let completion = completion(recv);
    assert_eq!(completion.sense()[2], 0x03);
    assert_eq!(completion.sense()[12], 0xff);
    assert_eq!(completion.sense()[13], 0xff);
}

#[test]
fn queue_full_is_counted() {
    let (host, _, completion) = complete_with(BusType::Spi, |reply| {
        reply.scsi_status = ScsiStatus::TASK_SET_FULL;
        reply.transfer_count = 0x2000;
    });
    assert_eq!(completion.result, ScsiResult::status(ScsiStatus::TASK_SET_FULL));
    assert_eq!(host.stats().queue_full, 1);
}

#[test]
fn short_reply_is_a_soft_error() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    let recv = host.queue_command(&cmd).unwrap();
    let reply = io_reply(&host, 0);
    deliver(&host, ReplyContext::ScsiIo, 0, Some(&reply.as_bytes()[..20]));
    assert_eq!(
        completion(recv).result,
        ScsiResult::host(HostStatus::SoftError)
    );
}

#[test]
fn removed_sas_target_reports_no_connect() {
    let host = host(BusType::Sas);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    let recv = host.queue_command(&cmd).unwrap();
    host.target_removed(&target);
    assert!(target.is_deleted());
    deliver(&host, ReplyContext::ScsiIo, 0, None);
    assert_eq!(
        completion(recv).result,
        ScsiResult::host(HostStatus::NoConnect)
    );
}

#[test]
fn failure_prediction_drives_enclosure_led() {
    let host = host_with(
        IocConfig {
            bus_type: BusType::Sas,
            pci_vendor: 0x1014,
            ..Default::default()
        },
        Duration::from_secs(1),
    );
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);

    let cmd = read(&device, 1);
    let recv = host.queue_command(&cmd).unwrap();
    let mut sense = [0u8; 18];
    sense[0] = 0x70;
    sense[2] = 0x06;
    sense[12] = 0x5d;
    host.adapter().sense_buffer(0).write_at(0, &sense);
    let mut reply = io_reply(&host, 0);
    reply.scsi_state = ScsiState::new().with_autosense_valid(true);
    reply.sense_count = 18;
    reply.transfer_count = 0x1000;
    deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes()));
    completion(recv);
    assert!(target.led_on());

    // The enclosure request went out on the next frame.
    let posted = host.adapter().posted();
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[1].context, ReplyContext::ScsiIo);
    let sep: SepRequest = host.adapter().frame(posted[1].index).mem().read_obj(0);
    assert_eq!(sep.function, Function::SCSI_ENCLOSURE_PROCESSOR);
    assert_eq!(sep.target_id, 1);
    assert!(sep.slot_status.predicted_fault());
    assert_eq!(
        deliver(&host, ReplyContext::ScsiIo, posted[1].index, None),
        FrameRelease::Free
    );

    // The device disappearing turns the LED back off.
    let cmd = read(&device, 1);
    let recv = host.queue_command(&cmd).unwrap();
    let idx = cmd.frame_index().unwrap();
    let mut reply = io_reply(&host, idx);
    reply.ioc_status = IocStatus::SCSI_DEVICE_NOT_THERE.0;
    deliver(&host, ReplyContext::ScsiIo, idx, Some(reply.as_bytes()));
    completion(recv);
    assert!(!target.led_on());
    let posted = host.adapter().posted();
    let sep: SepRequest = host
        .adapter()
        .frame(posted.last().unwrap().index)
        .mem()
        .read_obj(0);
    assert!(sep.slot_status.unconfigured());
}

#[test]
fn stale_sense_byte_does_not_drive_enclosure_led() {
    let host = host_with(
        IocConfig {
            bus_type: BusType::Sas,
            pci_vendor: 0x1014,
            ..Default::default()
        },
        Duration::from_secs(1),
    );
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);

    // Left over in the sense buffer, beyond what the reply reports.
    let mut stale = [0u8; 18];
    stale[12] = 0x5d;
    host.adapter().sense_buffer(0).write_at(0, &stale);

    for sense_count in [0, 12] {
        let cmd = read(&device, 1);
        let recv = host.queue_command(&cmd).unwrap();
        assert_eq!(cmd.frame_index(), Some(0));
        let mut reply = io_reply(&host, 0);
        reply.scsi_status = ScsiStatus::CHECK_CONDITION;
        reply.scsi_state = ScsiState::new().with_autosense_valid(true);
        reply.sense_count = sense_count;
        reply.transfer_count = 0x1000;
        deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes()));
        let completion = completion(recv);
        assert_eq!(completion.sense().len(), sense_count as usize);
    }
    assert!(!target.led_on());
    assert_eq!(host.adapter().posted().len(), 2);
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn no_data_command_gets_null_element() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(TargetConfig {
        q_yes: false,
        ..target(2)
    });
    let cmd = ScsiCmd::new(
        disk(&target, 0),
        &[0; 6],
        DataDirection::None,
        Vec::new(),
        0,
    )
    .unwrap();
    let recv = host.queue_command(&cmd).unwrap();
    let frame = host.adapter().frame(0);
    let request: ScsiIoRequest = frame.mem().read_obj(0);
    assert_eq!(request.data_length, 0);
    assert_eq!(
        request.control,
        SCSIIO_CONTROL_NODATATRANSFER | SCSIIO_CONTROL_UNTAGGED
    );
    assert_eq!(frame.mem().read_u32(52), 0xFFFF_FFFF);
    deliver(&host, ReplyContext::ScsiIo, 0, None);
    assert_eq!(completion(recv).result, ScsiResult::GOOD);
}

#[test]
fn raid_component_uses_passthrough() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(TargetConfig {
        raid_component: true,
        ..target(4)
    });
    let cmd = read(&disk(&target, 0), 1);
    let _recv = host.queue_command(&cmd).unwrap();
    let request: ScsiIoRequest = host.adapter().frame(0).mem().read_obj(0);
    assert_eq!(request.function, Function::RAID_SCSI_IO_PASSTHROUGH);
}

#[test]
fn dma_map_failure_is_host_busy() {
    let host = host(BusType::Spi);
    host.adapter().fail_dma_map(true);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    assert!(matches!(
        host.queue_command(&cmd),
        Err(QueueError::DmaMap(_))
    ));
    assert_eq!(host.adapter().free_frames(), 16);
    assert!(host.adapter().posted().is_empty());
}

#[test]
fn occupied_lookup_slot_fails_queue() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let stale = read(&device, 1);
    host.lookup().set(0, stale.clone()).unwrap();

    let cmd = read(&device, 1);
    assert!(matches!(
        host.queue_command(&cmd),
        Err(QueueError::Lookup(LookupError::InUse(0)))
    ));
    assert!(Arc::ptr_eq(&host.lookup().get(0).unwrap(), &stale));
    assert_eq!(cmd.frame_index(), None);
    assert_eq!(host.adapter().free_frames(), 16);
    assert_eq!(host.adapter().dma_unmaps(), 1);
    assert!(host.adapter().posted().is_empty());
}

#[test]
fn oversized_transfer_is_rejected() {
    let target = ScsiTarget::new(target(1));
    let huge = vec![
        SgEntry {
            address: 0x10_0000,
            len: 0x8000_0000,
        };
        2
    ];
    assert!(matches!(
        ScsiCmd::new(
            disk(&target, 0),
            &[0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            DataDirection::FromDevice,
            huge,
            0,
        ),
        Err(CmdError::TransferTooLong)
    ));
    assert!(matches!(
        ScsiCmd::new(
            disk(&target, 0),
            &[0; 17],
            DataDirection::None,
            Vec::new(),
            0,
        ),
        Err(CmdError::CdbTooLong(17))
    ));
}

#[test]
fn frame_exhaustion_is_host_busy() {
    let host = host_with(
        IocConfig {
            req_depth: 2,
            ..Default::default()
        },
        Duration::from_secs(1),
    );
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let _a = host.queue_command(&read(&device, 1)).unwrap();
    let _b = host.queue_command(&read(&device, 1)).unwrap();
    assert!(matches!(
        host.queue_command(&read(&device, 1)),
        Err(QueueError::NoFrames)
    ));
}

#[test]
fn chain_exhaustion_is_host_busy() {
    // 128 byte frames with 8 byte elements: 9 entries in the frame and 15 in
    // each chain buffer before the next chain element.
    let ioc = IocConfig {
        sge_format: SgeFormat::Sge32,
        ..Default::default()
    };
    let host = ScsiHost::new(
        EmulatedIoc::new(ioc),
        ScsiHostConfig {
            chain_buffers: 2,
            ..Default::default()
        },
    )
    .unwrap();
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);

    // Needs a third chain buffer.
    let cmd = read(&device, 41);
    assert!(matches!(
        host.queue_command(&cmd),
        Err(QueueError::Sgl(SglError::NoChainBuffer))
    ));
    assert_eq!(host.chain_pool().free_count(), 2);
    assert_eq!(host.adapter().free_frames(), 16);
    assert_eq!(host.adapter().dma_unmaps(), 1);
    assert_eq!(cmd.frame_index(), None);

    // Two commands needing one chain each fit; a third does not.
    let a = host.queue_command(&read(&device, 11)).unwrap();
    let _b = host.queue_command(&read(&device, 11)).unwrap();
    assert_eq!(host.chain_pool().free_count(), 0);
    assert!(matches!(
        host.queue_command(&read(&device, 11)),
        Err(QueueError::Sgl(SglError::NoChainBuffer))
    ));
    assert_eq!(host.chain_pool().free_count(), 0);

    deliver(&host, ReplyContext::ScsiIo, 0, None);
    completion(a);
    assert_eq!(host.chain_pool().free_count(), 1);
}

#[test]
fn abort_terminates_command() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let cmd = read(&device, 1);
    let recv = host.queue_command(&cmd).unwrap();
    let ctx = host.adapter().frame(0).msg_context().into_bits();

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            assert_eq!(post.path, PostPath::HighPriority);
            let request: ScsiTaskMgmt = host.adapter().frame(post.index).mem().read_obj(0);
            assert_eq!(request.task_type, TaskType::ABORT_TASK);
            assert_eq!(request.target_id, 1);
            assert_eq!(request.task_msg_context, ctx);

            // IO is quiesced while task management is outstanding.
            assert!(matches!(
                host.queue_command(&read(&device, 1)),
                Err(QueueError::Quiesced)
            ));

            let mut reply = io_reply(&host, 0);
            reply.ioc_status = IocStatus::SCSI_TASK_TERMINATED.0;
            deliver(&host, ReplyContext::ScsiIo, 0, Some(reply.as_bytes()));
            let reply = tm_reply(&host, post.index, IocStatus::SCSI_TASK_TERMINATED, 1);
            assert_eq!(
                deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes())),
                FrameRelease::Free
            );
        });
        host.abort(&cmd).unwrap();
    });

    assert_eq!(completion(recv).result, ScsiResult::host(HostStatus::Reset));
    assert_eq!(host.stats().timeouts, 1);
    assert_eq!(host.adapter().free_frames(), 16);
    // IO flows again.
    let _recv = host.queue_command(&read(&device, 1)).unwrap();
}

#[test]
fn abort_fails_while_command_is_outstanding() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    let _recv = host.queue_command(&cmd).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            let reply = tm_reply(&host, post.index, IocStatus::SUCCESS, 0);
            deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes()));
        });
        assert!(matches!(host.abort(&cmd), Err(RecoveryError::StillActive)));
    });
    assert_eq!(host.lookup().outstanding(), 1);
}

#[test]
fn abort_of_finished_command_succeeds() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    host.abort(&cmd).unwrap();
    assert_eq!(cmd.result(), ScsiResult::host(HostStatus::Reset));
    assert!(host.adapter().posted().is_empty());
    assert_eq!(host.stats().timeouts, 0);
}

#[test]
fn abort_refused_for_raid_volume() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(TargetConfig {
        raid_volume: true,
        ..target(1)
    });
    let cmd = read(&disk(&target, 0), 1);
    let _recv = host.queue_command(&cmd).unwrap();
    assert!(matches!(host.abort(&cmd), Err(RecoveryError::RaidVolume)));
    assert_eq!(host.adapter().posted().len(), 1);
}

#[test]
fn target_reset_uses_handshake_without_high_priority_queue() {
    let host = host_with(
        IocConfig {
            high_pri_q: false,
            ..Default::default()
        },
        Duration::from_secs(1),
    );
    let target = ScsiTarget::new(target(3));
    let cmd = read(&disk(&target, 0), 1);

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            assert_eq!(post.path, PostPath::Handshake);
            let request: ScsiTaskMgmt = host.adapter().frame(post.index).mem().read_obj(0);
            assert_eq!(request.task_type, TaskType::TARGET_RESET);
            assert_eq!(request.target_id, 3);
            let reply = tm_reply(&host, post.index, IocStatus::SCSI_IOC_TERMINATED, 0);
            deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes()));
        });
        host.device_reset(&cmd).unwrap();
    });
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn task_mgmt_failure_is_reported() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(3));
    let cmd = read(&disk(&target, 0), 1);

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            let reply = tm_reply(&host, post.index, IocStatus::SCSI_TASK_MGMT_FAILED, 0);
            deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes()));
        });
        let err = host.device_reset(&cmd).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::TaskMgmt(TaskMgmtError::Failed {
                ioc_status: IocStatus::SCSI_TASK_MGMT_FAILED,
                ..
            })
        ));
    });
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn abort_with_one_termination_succeeds_on_any_status() {
    let host = host(BusType::Spi);

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            let reply = tm_reply(&host, post.index, IocStatus::INTERNAL_ERROR, 1);
            deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes()));
        });
        host.issue_task_mgmt(TaskType::ABORT_TASK, 0, 3, 0, 0x1234, WAIT)
            .unwrap();
    });
    assert_eq!(host.adapter().free_frames(), 16);
    assert_eq!(host.adapter().soft_resets(), 0);
}

#[test]
fn handshake_failure_releases_everything() {
    let host = host_with(
        IocConfig {
            high_pri_q: false,
            ..Default::default()
        },
        Duration::from_secs(1),
    );
    host.adapter().fail_handshake(true);
    let target = ScsiTarget::new(target(3));
    let device = disk(&target, 0);
    let err = host.device_reset(&read(&device, 1)).unwrap_err();
    assert!(matches!(
        err,
        RecoveryError::TaskMgmt(TaskMgmtError::Handshake(_))
    ));
    assert_eq!(host.adapter().free_frames(), 16);
    host.queue_command(&read(&device, 1)).unwrap();
}

#[test]
fn raid_component_target_reset_refused() {
    let host = host(BusType::Sas);
    let target = ScsiTarget::new(TargetConfig {
        raid_component: true,
        ..target(1)
    });
    let cmd = read(&disk(&target, 0), 1);
    assert!(matches!(
        host.device_reset(&cmd),
        Err(RecoveryError::RaidComponent)
    ));
}

#[test]
fn task_mgmt_on_faulted_ioc_hard_resets() {
    let host = host(BusType::Fc);
    host.adapter().set_doorbell(IocState::FAULT, false);
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let cmd = read(&device, 1);
    let recv = host.queue_command(&cmd).unwrap();

    host.bus_reset(&cmd).unwrap();
    assert_eq!(host.adapter().hard_resets(), 1);
    assert_eq!(host.adapter().soft_resets(), 0);
    assert!(host
        .adapter()
        .posted()
        .iter()
        .all(|p| p.context != ReplyContext::TaskMgmt));
    assert_eq!(completion(recv).result, ScsiResult::host(HostStatus::Reset));
    assert_eq!(host.stats().timeouts, 1);
}

#[test]
fn busy_doorbell_fails_task_mgmt() {
    let host = host(BusType::Spi);
    host.adapter().set_doorbell(IocState::OPERATIONAL, true);
    let target = ScsiTarget::new(target(1));
    let cmd = read(&disk(&target, 0), 1);
    assert!(matches!(
        host.bus_reset(&cmd),
        Err(RecoveryError::TaskMgmt(TaskMgmtError::DoorbellActive))
    ));
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn task_mgmt_timeout_resets_ioc() {
    let host = host_with(IocConfig::default(), Duration::from_millis(1));
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let cmd = read(&device, 1);
    let recv = host.queue_command(&cmd).unwrap();

    // Nobody answers the bus reset; the soft reset that follows succeeds.
    host.bus_reset(&cmd).unwrap();
    assert_eq!(host.adapter().soft_resets(), 1);
    assert_eq!(host.adapter().hard_resets(), 0);
    assert_eq!(completion(recv).result, ScsiResult::host(HostStatus::Reset));
    assert_eq!(host.adapter().free_frames(), 16);

    // The late reply has no waiter and leaves the frame alone.
    let tm = host
        .adapter()
        .wait_for_post(ReplyContext::TaskMgmt, WAIT)
        .unwrap();
    let reply = tm_reply(&host, tm.index, IocStatus::SUCCESS, 0);
    assert_eq!(
        deliver(&host, ReplyContext::TaskMgmt, tm.index, Some(reply.as_bytes())),
        FrameRelease::Retain
    );
    host.queue_command(&read(&device, 1)).unwrap();
}

#[test]
fn host_reset_escalates_to_hard_reset() {
    let host = host(BusType::Spi);
    host.adapter().fail_soft_reset(true);
    host.host_reset().unwrap();
    assert_eq!(host.adapter().soft_resets(), 1);
    assert_eq!(host.adapter().hard_resets(), 1);

    host.adapter().fail_hard_reset(true);
    assert!(matches!(host.host_reset(), Err(RecoveryError::Reset(_))));
}

#[test]
fn ioc_reset_flushes_outstanding_commands() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(1));
    let device = disk(&target, 0);
    let cmds: Vec<_> = (0..3).map(|_| read(&device, 12)).collect();
    let recvs: Vec<_> = cmds
        .iter()
        .map(|cmd| host.queue_command(cmd).unwrap())
        .collect();
    assert_eq!(host.chain_pool().free_count(), 5);

    host.host_reset().unwrap();
    for recv in recvs {
        assert_eq!(completion(recv).result, ScsiResult::host(HostStatus::Reset));
    }
    assert_eq!(host.lookup().outstanding(), 0);
    assert_eq!(host.adapter().free_frames(), 16);
    assert_eq!(host.chain_pool().free_count(), 8);
    assert_eq!(host.adapter().dma_unmaps(), 3);
    assert!(cmds.iter().all(|cmd| cmd.frame_index().is_none()));
}

#[test]
fn internal_command_completes() {
    let host = host(BusType::Spi);
    let mut io = InternalCmd::new(ScsiOp::INQUIRY, 0, 2, 0);
    io.size = 36;
    io.data_dma = 0x20_0000;

    let completion = std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::Internal, WAIT)
                .unwrap();
            let request: ScsiIoRequest = host.adapter().frame(post.index).mem().read_obj(0);
            assert_eq!(request.function, Function::SCSI_IO_REQUEST);
            assert_eq!(request.target_id, 2);
            assert_eq!(&request.cdb[..6], &[0x12, 0, 0, 0, 36, 0]);
            assert_eq!(request.data_length, 36);
            assert_eq!(
                deliver(&host, ReplyContext::Internal, post.index, None),
                FrameRelease::Free
            );
        });
        host.do_cmd(&io).unwrap()
    });
    assert_eq!(completion.outcome, InternalOutcome::Good);
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn internal_command_returns_sense() {
    let host = host(BusType::Spi);
    let io = InternalCmd::new(ScsiOp::TEST_UNIT_READY, 0, 2, 0);

    let completion = std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::Internal, WAIT)
                .unwrap();
            host.adapter()
                .sense_buffer(post.index)
                .write_at(0, &[0x70, 0, 0x02]);
            let mut reply = io_reply(&host, post.index);
            reply.scsi_status = ScsiStatus::CHECK_CONDITION;
            reply.scsi_state = ScsiState::new().with_autosense_valid(true);
            deliver(&host, ReplyContext::Internal, post.index, Some(reply.as_bytes()));
        });
        host.do_cmd(&io).unwrap()
    });
    assert_eq!(completion.outcome, InternalOutcome::Sense);
    assert_eq!(completion.sense().len(), 64);
    assert_eq!(&completion.sense()[..3], &[0x70, 0, 0x02]);
}

#[test]
fn internal_command_timeout_resets_bus() {
    // Long enough for the test to answer the bus reset.
    let host = host_with(
        IocConfig {
            bus_type: BusType::Fc,
            ..Default::default()
        },
        Duration::from_millis(50),
    );
    let io = InternalCmd::new(ScsiOp::TEST_UNIT_READY, 0, 2, 0);

    let completion = std::thread::scope(|s| {
        s.spawn(|| {
            host.adapter()
                .wait_for_post(ReplyContext::Internal, WAIT)
                .unwrap();
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::TaskMgmt, WAIT)
                .unwrap();
            let request: ScsiTaskMgmt = host.adapter().frame(post.index).mem().read_obj(0);
            assert_eq!(request.task_type, TaskType::RESET_BUS);
            assert_eq!(request.bus, 0);
            let reply = tm_reply(&host, post.index, IocStatus::SUCCESS, 0);
            deliver(&host, ReplyContext::TaskMgmt, post.index, Some(reply.as_bytes()));
        });
        host.do_cmd(&io).unwrap()
    });
    assert_eq!(completion.outcome, InternalOutcome::DidReset);
    assert_eq!(host.adapter().soft_resets(), 0);
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn internal_command_timeout_resets_ioc_when_bus_reset_fails() {
    let host = host_with(IocConfig::default(), Duration::from_millis(5));
    let io = InternalCmd::new(ScsiOp::TEST_UNIT_READY, 0, 2, 0);
    let completion = host.do_cmd(&io).unwrap();
    assert_eq!(completion.outcome, InternalOutcome::DidReset);
    assert_eq!(host.adapter().soft_resets(), 1);
    assert_eq!(host.adapter().free_frames(), 16);
}

#[test]
fn unsupported_internal_command_sends_nothing() {
    let host = host(BusType::Spi);
    let io = InternalCmd::new(ScsiOp::READ, 0, 2, 0);
    assert!(host.do_cmd(&io).is_err());
    assert!(host.adapter().posted().is_empty());
}

#[test]
fn raid_quiesce_round_trip() {
    let host = host(BusType::Spi);
    let outcome = std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::Internal, WAIT)
                .unwrap();
            deliver(&host, ReplyContext::Internal, post.index, None);
        });
        host.quiesce_raid(true, 0, 1).unwrap()
    });
    assert_eq!(outcome, InternalOutcome::Good);
}

#[test]
fn device_removal_fails_its_commands_and_flushes_cache() {
    let host = host(BusType::Spi);
    let target = ScsiTarget::new(target(5));
    let lun0 = disk(&target, 0);
    let lun1 = disk(&target, 1);
    let a = read(&lun0, 1);
    let b = read(&lun0, 1);
    let other = read(&lun1, 1);
    let recv_a = host.queue_command(&a).unwrap();
    let recv_b = host.queue_command(&b).unwrap();
    let _recv_other = host.queue_command(&other).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            let post = host
                .adapter()
                .wait_for_post(ReplyContext::Internal, WAIT)
                .unwrap();
            let request: ScsiIoRequest = host.adapter().frame(post.index).mem().read_obj(0);
            assert_eq!(request.cdb[0], 0x35);
            assert_eq!(request.target_id, 5);
            deliver(&host, ReplyContext::Internal, post.index, None);
        });
        host.device_removed(&lun0);
    });

    assert_eq!(completion(recv_a).result, ScsiResult::host(HostStatus::NoConnect));
    assert_eq!(completion(recv_b).result, ScsiResult::host(HostStatus::NoConnect));
    assert_eq!(host.lookup().outstanding(), 1);
    assert_eq!(other.frame_index(), Some(2));
    assert_eq!(host.adapter().free_frames(), 15);
}

#[test]
fn removal_of_deleted_target_skips_cache_flush() {
    let host = host(BusType::Sas);
    let target = ScsiTarget::new(target(5));
    let device = disk(&target, 0);
    host.target_removed(&target);
    host.device_removed(&device);
    assert!(host.adapter().posted().is_empty());
}

#[test]
fn queue_depth_limits() {
    let spi = host(BusType::Spi);
    let fast = ScsiTarget::new(target(1));
    let slow = ScsiTarget::new(TargetConfig {
        min_sync_factor: 0x0a,
        ..target(2)
    });
    let device = disk(&fast, 0);
    assert_eq!(spi.change_queue_depth(&device, 100), 64);
    assert!(device.tagged());
    assert_eq!(spi.change_queue_depth(&disk(&slow, 0), 100), 32);
    assert_eq!(spi.change_queue_depth(&device, 0), 1);
    assert!(!device.tagged());

    let untagged = ScsiDevice::new(
        fast.clone(),
        DeviceConfig {
            tagged_supported: false,
            ..Default::default()
        },
    );
    assert_eq!(spi.change_queue_depth(&untagged, 16), 1);

    let fc = host(BusType::Fc);
    assert_eq!(fc.change_queue_depth(&device, 100), 16);
    assert_eq!(device.queue_depth(), 16);
}

#[test]
fn bus_reset_events_are_counted_on_parallel_scsi() {
    let event = |event: Event| EventNotificationReply {
        function: Function::EVENT_NOTIFICATION,
        event: event.0.into(),
        ..EventNotificationReply::new_zeroed()
    };

    let spi = host(BusType::Spi);
    spi.handle_event(event(Event::IOC_BUS_RESET).as_bytes());
    spi.handle_event(event(Event::EXT_BUS_RESET).as_bytes());
    spi.handle_event(event(Event::RESCAN).as_bytes());
    spi.handle_event(&[0; 4]);
    assert_eq!(spi.stats().soft_resets, 2);

    let sas = host(BusType::Sas);
    sas.handle_event(event(Event::IOC_BUS_RESET).as_bytes());
    assert_eq!(sas.stats().soft_resets, 0);
}
